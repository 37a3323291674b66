//! Health supervisor — one probe worker per active balancer
//!
//! `reconcile` installs the worker set for the balancers of the table being
//! published: existing workers are stopped and a fresh worker is spawned per
//! balancer, so retired tables never keep probes alive. Each worker probes
//! all hosts of its balancer concurrently every interval and flips node
//! membership on alive-state transitions.

use super::{Balancer, Node};
use crate::util::is_backend_alive;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;

/// Maintains exactly one background probe worker per balancer name.
pub struct HealthSupervisor {
    interval: Duration,
    workers: Mutex<HashMap<String, watch::Sender<()>>>,
}

impl HealthSupervisor {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            workers: Mutex::new(HashMap::new()),
        }
    }

    /// Reconcile the worker set to `balancers`. Stop-all + respawn: every
    /// new worker is bound to the balancer instance it was given, so a
    /// worker never outlives its table.
    pub fn reconcile(&self, balancers: &[Arc<dyn Balancer>]) {
        let mut workers = self.workers.lock().unwrap();

        for (name, stop) in workers.drain() {
            tracing::debug!(balancer = %name, "stopping health worker");
            drop(stop);
        }

        for balancer in balancers {
            let (stop_tx, stop_rx) = watch::channel(());
            let name = balancer.name().to_string();
            workers.insert(name.clone(), stop_tx);
            let balancer = Arc::clone(balancer);
            let interval = self.interval;
            tokio::spawn(async move {
                run_worker(balancer, interval, stop_rx).await;
                tracing::debug!(balancer = %name, "health worker exited");
            });
        }
    }

    /// Number of live workers (for tests and introspection).
    pub fn worker_count(&self) -> usize {
        self.workers.lock().unwrap().len()
    }

    /// Stop every worker.
    pub fn shutdown(&self) {
        self.workers.lock().unwrap().clear();
    }
}

async fn run_worker(
    balancer: Arc<dyn Balancer>,
    interval: Duration,
    mut stop: watch::Receiver<()>,
) {
    // The configured node set, captured at spawn. Dead nodes leave the
    // balancer's selection set but keep being probed so they can recover.
    let nodes = balancer.hosts();
    let start = tokio::time::Instant::now() + interval;
    let mut ticker = tokio::time::interval_at(start, interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => probe_round(&balancer, &nodes).await,
            _ = stop.changed() => return,
        }
    }
}

/// Probe every configured host concurrently and apply transitions against
/// the balancer. All probes complete before the round returns.
async fn probe_round(balancer: &Arc<dyn Balancer>, nodes: &[Node]) {
    let mut probes = JoinSet::new();
    for node in nodes.iter().cloned() {
        let balancer = Arc::clone(balancer);
        probes.spawn(async move {
            let alive = is_backend_alive(&node.host()).await;
            apply_transition(&balancer, node, alive);
        });
    }
    while let Some(result) = probes.join_next().await {
        if let Err(e) = result {
            // A panicking probe must not take down the worker.
            tracing::error!(error = %e, "health probe task failed");
        }
    }
}

fn apply_transition(balancer: &Arc<dyn Balancer>, node: Node, alive: bool) {
    let host = node.host();
    let was_alive = balancer.is_alive(&host);
    if was_alive && !alive {
        tracing::warn!(
            balancer = balancer.name(),
            host = %host,
            "backend unreachable, removing from balancer"
        );
        balancer.set_alive(&host, false);
        balancer.remove(&node);
    } else if !was_alive && alive {
        tracing::info!(
            balancer = balancer.name(),
            host = %host,
            "backend reachable again, adding to balancer"
        );
        balancer.set_alive(&host, true);
        balancer.add(node);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balancer::{build, test_nodes};

    #[tokio::test]
    async fn test_reconcile_spawns_one_worker_per_balancer() {
        let supervisor = HealthSupervisor::new(Duration::from_secs(60));
        let b1 = build("svc-a", "round_robin", test_nodes(&["127.0.0.1:1"])).unwrap();
        let b2 = build("svc-b", "round_robin", test_nodes(&["127.0.0.1:2"])).unwrap();
        supervisor.reconcile(&[b1, b2]);
        assert_eq!(supervisor.worker_count(), 2);
    }

    #[tokio::test]
    async fn test_reconcile_replaces_worker_set() {
        let supervisor = HealthSupervisor::new(Duration::from_secs(60));
        let b1 = build("svc-a", "round_robin", test_nodes(&["127.0.0.1:1"])).unwrap();
        supervisor.reconcile(&[b1]);
        assert_eq!(supervisor.worker_count(), 1);

        let b2 = build("svc-b", "round_robin", test_nodes(&["127.0.0.1:2"])).unwrap();
        supervisor.reconcile(&[b2]);
        assert_eq!(supervisor.worker_count(), 1);

        supervisor.reconcile(&[]);
        assert_eq!(supervisor.worker_count(), 0);
    }

    #[tokio::test]
    async fn test_dead_host_is_removed_and_recovers() {
        // Reserve a port with a listener, then drop it to simulate death.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let host = addr.to_string();

        let balancer = build("svc", "round_robin", test_nodes(&[&host])).unwrap();
        let configured = balancer.hosts();

        drop(listener);
        probe_round(&balancer, &configured).await;
        assert!(balancer.balance("").is_none());
        assert!(!balancer.is_alive(&host));

        // Bring the backend back on the same port and probe again.
        let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
        probe_round(&balancer, &configured).await;
        assert_eq!(balancer.balance("").unwrap().host(), host);
        assert!(balancer.is_alive(&host));
        drop(listener);
    }

    #[tokio::test]
    async fn test_probe_round_is_noop_on_steady_state() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let host = listener.local_addr().unwrap().to_string();
        let balancer = build("svc", "round_robin", test_nodes(&[&host])).unwrap();
        let configured = balancer.hosts();

        probe_round(&balancer, &configured).await;
        probe_round(&balancer, &configured).await;
        assert_eq!(balancer.hosts().len(), 1);
        drop(listener);
    }
}
