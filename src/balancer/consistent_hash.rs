//! Consistent-hash policy — stable key-to-host mapping over a hash ring

use super::{Balancer, Node, NodeSet};
use hashring::HashRing;
use std::sync::{Arc, RwLock};

#[derive(Debug)]
struct RingState {
    set: NodeSet,
    ring: HashRing<String>,
}

/// Consistent-hash balancer. The ring holds the host strings of the current
/// node set; `balance(key)` returns the first host clockwise from the key's
/// hash, so removing a host migrates only the keys that mapped to it.
#[derive(Debug)]
pub struct ConsistentHash {
    name: String,
    algo: String,
    state: RwLock<RingState>,
}

impl ConsistentHash {
    pub(crate) fn build(name: &str, algo: &str, nodes: Vec<Node>) -> Arc<dyn Balancer> {
        let set = NodeSet::new(nodes);
        let mut ring = HashRing::new();
        for node in set.nodes() {
            ring.add(node.host());
        }
        Arc::new(Self {
            name: name.to_string(),
            algo: algo.to_string(),
            state: RwLock::new(RingState { set, ring }),
        })
    }
}

impl Balancer for ConsistentHash {
    fn add(&self, node: Node) {
        let mut state = self.state.write().unwrap();
        let host = node.host();
        if state.set.add(node) {
            state.ring.add(host);
        }
    }

    fn remove(&self, node: &Node) {
        let mut state = self.state.write().unwrap();
        if state.set.remove(node) {
            let _ = state.ring.remove(&node.host());
        }
    }

    fn balance(&self, key: &str) -> Option<Node> {
        let state = self.state.read().unwrap();
        let host = state.ring.get(&key)?.clone();
        state
            .set
            .nodes()
            .iter()
            .find(|n| n.host() == host)
            .cloned()
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
