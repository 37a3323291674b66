//! Power-of-two-choices policy — pick two hosts, take the less loaded

use super::{Balancer, Node, NodeSet};
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

const SALT: &str = "p2c-salt";

#[derive(Debug)]
struct P2cState {
    set: NodeSet,
    load: HashMap<String, u64>,
}

/// P2C balancer. For a non-empty key the two candidates are
/// `crc32(key) % n` and `crc32(key + salt) % n`; for an empty key they are
/// uniform random picks. The host with the lower in-flight load wins.
#[derive(Debug)]
pub struct P2c {
    name: String,
    algo: String,
    state: RwLock<P2cState>,
}

impl P2c {
    pub(crate) fn build(name: &str, algo: &str, nodes: Vec<Node>) -> Arc<dyn Balancer> {
        let set = NodeSet::new(nodes);
        let load = set.nodes().iter().map(|n| (n.host(), 0)).collect();
        Arc::new(Self {
            name: name.to_string(),
            algo: algo.to_string(),
            state: RwLock::new(P2cState { set, load }),
        })
    }

    fn pick_pair(state: &P2cState, key: &str) -> (usize, usize) {
        let n = state.set.len() as u32;
        if key.is_empty() {
            let mut rng = rand::thread_rng();
            (
                rng.gen_range(0..n as usize),
                rng.gen_range(0..n as usize),
            )
        } else {
            let first = crc32fast::hash(key.as_bytes()) % n;
            let salted = format!("{}{}", key, SALT);
            let second = crc32fast::hash(salted.as_bytes()) % n;
            (first as usize, second as usize)
        }
    }
}

impl Balancer for P2c {
    fn add(&self, node: Node) {
        let mut state = self.state.write().unwrap();
        let host = node.host();
        if state.set.add(node) {
            state.load.entry(host).or_insert(0);
        }
    }

    fn remove(&self, node: &Node) {
        let mut state = self.state.write().unwrap();
        if state.set.remove(node) {
            state.load.remove(&node.host());
        }
    }

    fn balance(&self, key: &str) -> Option<Node> {
        let state = self.state.read().unwrap();
        if state.set.is_empty() {
            return None;
        }
        let (i, j) = Self::pick_pair(&state, key);
        let n1 = &state.set.nodes()[i];
        let n2 = &state.set.nodes()[j];
        let l1 = state.load.get(&n1.host()).copied().unwrap_or(0);
        let l2 = state.load.get(&n2.host()).copied().unwrap_or(0);
        Some(if l1 <= l2 { n1.clone() } else { n2.clone() })
    }

    fn inc(&self, host: &str) {
        let mut state = self.state.write().unwrap();
        if let Some(load) = state.load.get_mut(host) {
            *load += 1;
        }
    }

    fn done(&self, host: &str) {
        let mut state = self.state.write().unwrap();
        if let Some(load) = state.load.get_mut(host) {
            *load = load.saturating_sub(1);
        }
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn algo(&self) -> &str {
        &self.algo
    }

    fn hosts(&self) -> Vec<Node> {
        self.state.read().unwrap().set.nodes().to_vec()
    }

    fn is_alive(&self, host: &str) -> bool {
        self.state.read().unwrap().set.is_alive(host)
    }

    fn set_alive(&self, host: &str, alive: bool) {
        self.state.write().unwrap().set.set_alive(host, alive);
    }
}
