//! Load balancing — node selection for one upstream under a stable contract
//!
//! Each upstream owns a balancer: a node set plus a selection algorithm.
//! Policies register themselves in a process-wide factory map and are built
//! by algorithm name from the routing-table compiler.

mod consistent_hash;
mod p2c;
mod round_robin;

pub mod health;

pub use consistent_hash::ConsistentHash;
pub use p2c::P2c;
pub use round_robin::RoundRobin;

use crate::error::{GatewayError, Result};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::Arc;
use url::Url;

pub const ROUND_ROBIN: &str = "round_robin";
pub const CONSISTENT_HASH: &str = "consistent_hash";
pub const P2C: &str = "p2c";

/// A resolved upstream endpoint. Identified within a balancer by its
/// `host:port` authority string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub url: Url,
}

impl Node {
    pub fn new(url: Url) -> Self {
        Self { url }
    }

    /// The `host:port` identity of this node.
    pub fn host(&self) -> String {
        match self.url.port() {
            Some(port) => format!("{}:{}", self.url.host_str().unwrap_or_default(), port),
            None => self.url.host_str().unwrap_or_default().to_string(),
        }
    }
}

/// Selection contract implemented by every policy.
///
/// `add`/`remove` are idempotent on node identity and serialized with
/// respect to `balance`. `balance` returns `None` iff the policy has no
/// selectable node. `inc`/`done` are no-ops for policies that do not track
/// in-flight load.
pub trait Balancer: Send + Sync + std::fmt::Debug {
    fn add(&self, node: Node);
    fn remove(&self, node: &Node);
    fn balance(&self, key: &str) -> Option<Node>;

    fn inc(&self, _host: &str) {}
    fn done(&self, _host: &str) {}

    fn name(&self) -> &str;
    fn algo(&self) -> &str;
    fn hosts(&self) -> Vec<Node>;

    /// Most recent probe outcome for a host.
    fn is_alive(&self, host: &str) -> bool;
    fn set_alive(&self, host: &str, alive: bool);
}

/// Shared node/alive bookkeeping embedded by every policy. Callers hold the
/// policy's own lock around mutation so no node ever appears twice.
#[derive(Debug, Default)]
pub(crate) struct NodeSet {
    nodes: Vec<Node>,
    alive: HashMap<String, bool>,
}

impl NodeSet {
    pub(crate) fn new(nodes: Vec<Node>) -> Self {
        let mut set = Self::default();
        for node in nodes {
            set.add(node);
        }
        set
    }

    /// Add a node unless a node with the same host is already present.
    /// Returns whether the set changed.
    pub(crate) fn add(&mut self, node: Node) -> bool {
        let host = node.host();
        if self.nodes.iter().any(|n| n.host() == host) {
            return false;
        }
        self.alive.insert(host, true);
        self.nodes.push(node);
        true
    }

    /// Remove the node with the same host, if present. Returns whether the
    /// set changed.
    pub(crate) fn remove(&mut self, node: &Node) -> bool {
        let host = node.host();
        if let Some(idx) = self.nodes.iter().position(|n| n.host() == host) {
            self.nodes.remove(idx);
            return true;
        }
        false
    }

    pub(crate) fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub(crate) fn is_alive(&self, host: &str) -> bool {
        self.alive.get(host).copied().unwrap_or(false)
    }

    pub(crate) fn set_alive(&mut self, host: &str, alive: bool) {
        self.alive.insert(host.to_string(), alive);
    }
}

type Factory = fn(name: &str, algo: &str, nodes: Vec<Node>) -> Arc<dyn Balancer>;

static FACTORIES: Lazy<HashMap<&'static str, Factory>> = Lazy::new(|| {
    let mut m: HashMap<&'static str, Factory> = HashMap::new();
    m.insert(ROUND_ROBIN, RoundRobin::build);
    m.insert(CONSISTENT_HASH, ConsistentHash::build);
    m.insert(P2C, P2c::build);
    m
});

/// Build a balancer for the named algorithm.
pub fn build(name: &str, algo: &str, nodes: Vec<Node>) -> Result<Arc<dyn Balancer>> {
    let factory = FACTORIES
        .get(algo)
        .ok_or_else(|| GatewayError::UnsupportedAlgorithm(algo.to_string()))?;
    Ok(factory(name, algo, nodes))
}

#[cfg(test)]
pub(crate) fn test_nodes(hosts: &[&str]) -> Vec<Node> {
    hosts
        .iter()
        .map(|h| Node::new(Url::parse(&format!("http://{}", h)).unwrap()))
        .collect()
}
