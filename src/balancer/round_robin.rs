//! Round-robin policy — selects hosts in turn, ignoring the key

use super::{Balancer, Node, NodeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Round-robin balancer with a monotonically increasing atomic counter.
#[derive(Debug)]
pub struct RoundRobin {
    name: String,
    algo: String,
    counter: AtomicU64,
    set: RwLock<NodeSet>,
}

impl RoundRobin {
    pub(crate) fn build(name: &str, algo: &str, nodes: Vec<Node>) -> Arc<dyn Balancer> {
        Arc::new(Self {
            name: name.to_string(),
            algo: algo.to_string(),
            counter: AtomicU64::new(0),
            set: RwLock::new(NodeSet::new(nodes)),
        })
    }
}

impl Balancer for RoundRobin {
    fn add(&self, node: Node) {
        self.set.write().unwrap().add(node);
    }

    fn remove(&self, node: &Node) {
        self.set.write().unwrap().remove(node);
    }

    fn balance(&self, _key: &str) -> Option<Node> {
        let set = self.set.read().unwrap();
        if set.is_empty() {
            return None;
        }
        let idx = self.counter.fetch_add(1, Ordering::Relaxed) as usize % set.len();
        Some(set.nodes()[idx].clone())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn algo(&self) -> &str {
        &self.algo
    }

    fn hosts(&self) -> Vec<Node> {
        self.set.read().unwrap().nodes().to_vec()
    }

    fn is_alive(&self, host: &str) -> bool {
        self.set.read().unwrap().is_alive(host)
    }

    fn set_alive(&self, host: &str, alive: bool) {
        self.set.write().unwrap().set_alive(host, alive);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balancer::test_nodes;

    #[test]
    fn test_round_robin_cycles() {
        let rr = RoundRobin::build("svc", "round_robin", test_nodes(&["a:1", "b:2", "c:3"]));
        let hosts: Vec<String> = (0..6)
            .map(|_| rr.balance("").unwrap().host())
            .collect();
        assert_eq!(hosts, vec!["a:1", "b:2", "c:3", "a:1", "b:2", "c:3"]);
    }

    #[test]
    fn test_round_robin_ignores_key() {
        let rr = RoundRobin::build("svc", "round_robin", test_nodes(&["a:1", "b:2"]));
        let first = rr.balance("key-x").unwrap().host();
        let second = rr.balance("key-x").unwrap().host();
        assert_ne!(first, second);
    }

    #[test]
    fn test_round_robin_empty_returns_none() {
        let rr = RoundRobin::build("svc", "round_robin", vec![]);
        assert!(rr.balance("").is_none());
    }

    #[test]
    fn test_round_robin_fair_distribution() {
        let rr = RoundRobin::build("svc", "round_robin", test_nodes(&["a:1", "b:2", "c:3"]));
        let mut counts = std::collections::HashMap::new();
        for _ in 0..31 {
            *counts.entry(rr.balance("").unwrap().host()).or_insert(0u32) += 1;
        }
        // 31 requests over 3 nodes: each selected 10 or 11 times.
        for (_, count) in counts {
            assert!(count == 10 || count == 11);
        }
    }

    #[test]
    fn test_round_robin_remove_then_balance() {
        let rr = RoundRobin::build("svc", "round_robin", test_nodes(&["a:1", "b:2"]));
        rr.remove(&test_nodes(&["a:1"]).pop().unwrap());
        for _ in 0..4 {
            assert_eq!(rr.balance("").unwrap().host(), "b:2");
        }
    }

    #[test]
    fn test_round_robin_add_is_idempotent() {
        let rr = RoundRobin::build("svc", "round_robin", test_nodes(&["a:1"]));
        rr.add(test_nodes(&["a:1"]).pop().unwrap());
        assert_eq!(rr.hosts().len(), 1);
    }

    #[test]
    fn test_concurrent_balance_no_duplicates() {
        use std::sync::Arc;
        let rr = RoundRobin::build("svc", "round_robin", test_nodes(&["a:1", "b:2", "c:3"]));
        let mut handles = Vec::new();
        for i in 0..4 {
            let rr = Arc::clone(&rr);
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    if i % 2 == 0 {
                        let _ = rr.balance("");
                    } else {
                        rr.add(test_nodes(&["d:4"]).pop().unwrap());
                        rr.remove(&test_nodes(&["d:4"]).pop().unwrap());
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let hosts = rr.hosts();
        let unique: std::collections::HashSet<String> =
            hosts.iter().map(|n| n.host()).collect();
        assert_eq!(unique.len(), hosts.len());
    }
}
