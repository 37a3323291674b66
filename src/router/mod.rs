//! Routing table — longest-prefix matching with atomic table replacement
//!
//! A table is compiled from the upstream config: balancers, normalized
//! route prefixes sorted longest-first, and compiled route-local middleware
//! chains. Published tables are immutable; updates build a new table off to
//! the side and install it with a single atomic store, so readers take one
//! load per request and never observe a torn table.

use crate::balancer::{self, health::HealthSupervisor, Balancer, Node};
use crate::config::UpstreamConfig;
use crate::middleware::Chain;
use arc_swap::ArcSwap;
use std::collections::HashSet;
use std::sync::Arc;
use url::Url;

/// Compiled form of one configured route.
pub struct RouteEntry {
    pub balancer_idx: usize,
    /// Normalized prefix, always ending in '/' (or the catch-all "/")
    pub prefix: String,
    /// Uppercased method filter; empty admits any method
    methods: HashSet<String>,
    pub rewrite: Option<String>,
    /// Route-local middleware chain
    pub middlewares: Chain,
}

impl RouteEntry {
    pub fn admits(&self, method: &str) -> bool {
        self.methods.is_empty() || self.methods.contains(&method.to_ascii_uppercase())
    }

    pub fn matches(&self, path: &str) -> bool {
        prefix_matches(path, &self.prefix)
    }
}

/// Immutable compiled routing state.
pub struct RoutingTable {
    pub balancers: Vec<Arc<dyn Balancer>>,
    pub routes: Vec<RouteEntry>,
}

impl RoutingTable {
    /// Compile a table from upstream configs. Upstreams without valid
    /// hosts or with an unknown balancing algorithm are skipped with a
    /// warning so the rest of the table still builds.
    pub fn build(upstreams: &[UpstreamConfig]) -> Self {
        let mut balancers: Vec<Arc<dyn Balancer>> = Vec::new();
        let mut routes: Vec<RouteEntry> = Vec::new();

        for up in upstreams {
            let scheme = if up.scheme.is_empty() { "http" } else { &up.scheme };

            let mut nodes = Vec::new();
            for host in &up.hosts {
                match parse_host(host, scheme) {
                    Some(url) => nodes.push(Node::new(url)),
                    None => {
                        tracing::warn!(upstream = %up.name, host = %host, "skipping invalid upstream host")
                    }
                }
            }
            if nodes.is_empty() {
                tracing::warn!(upstream = %up.name, "upstream has no valid hosts, skipping");
                continue;
            }

            let algo = if up.load_balancing.is_empty() {
                balancer::ROUND_ROBIN.to_string()
            } else {
                up.load_balancing.to_ascii_lowercase()
            };
            let built = match balancer::build(&up.name, &algo, nodes) {
                Ok(b) => b,
                Err(e) => {
                    tracing::warn!(upstream = %up.name, error = %e, "failed to build balancer, skipping upstream");
                    continue;
                }
            };
            balancers.push(built);

            for route in &up.routes {
                let prefix = normalize_prefix(&route.path);
                let methods = route
                    .methods
                    .iter()
                    .map(|m| m.to_ascii_uppercase())
                    .collect();
                routes.push(RouteEntry {
                    balancer_idx: balancers.len() - 1,
                    middlewares: Chain::route_local(&route.middlewares, &prefix),
                    prefix,
                    methods,
                    rewrite: route.rewrite.clone().filter(|r| !r.is_empty()),
                });
            }
        }

        // Longest prefix first; config order breaks ties.
        routes.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));

        Self { balancers, routes }
    }

    /// First route (in longest-prefix order) whose prefix matches the path
    /// and whose method set admits the method.
    pub fn lookup(&self, method: &str, path: &str) -> Option<&RouteEntry> {
        self.routes
            .iter()
            .find(|r| r.matches(path) && r.admits(method))
    }

    pub fn balancer(&self, idx: usize) -> Option<&Arc<dyn Balancer>> {
        self.balancers.get(idx)
    }
}

/// Holds the active table and swaps in new ones on config events.
pub struct RouterManager {
    table: ArcSwap<RoutingTable>,
    health: Arc<HealthSupervisor>,
}

impl RouterManager {
    /// Build the initial table and start its health workers.
    pub fn new(upstreams: &[UpstreamConfig], health: Arc<HealthSupervisor>) -> Self {
        let table = RoutingTable::build(upstreams);
        health.reconcile(&table.balancers);
        Self {
            table: ArcSwap::from_pointee(table),
            health,
        }
    }

    /// Single entry point for installing new upstream configuration:
    /// build, reconcile health workers, then atomically publish.
    pub fn update_upstreams(&self, upstreams: &[UpstreamConfig]) {
        let table = RoutingTable::build(upstreams);
        self.health.reconcile(&table.balancers);
        self.table.store(Arc::new(table));
        tracing::info!(upstreams = upstreams.len(), "routing table updated");
    }

    /// Snapshot of the current table. A request keeps using its snapshot
    /// even if a newer table is published mid-flight.
    pub fn snapshot(&self) -> Arc<RoutingTable> {
        self.table.load_full()
    }

    /// Read-only matching pass used to annotate `route.prefix` before the
    /// global middleware chain runs. Never short-circuits the request.
    pub fn pre_match(&self, method: &str, path: &str) -> Option<String> {
        let table = self.table.load();
        table.lookup(method, path).map(|r| r.prefix.clone())
    }
}

/// Normalize a configured path pattern to its matching prefix: strip a
/// trailing `/**` and make sure the prefix ends with '/'.
pub fn normalize_prefix(pattern: &str) -> String {
    let mut p = pattern.trim_end_matches("/**").to_string();
    if p.is_empty() {
        p.push('/');
    }
    if !p.ends_with('/') {
        p.push('/');
    }
    p
}

/// A prefix matches the path itself, or the path equal to the prefix with
/// its trailing slash removed. "/" matches everything.
pub fn prefix_matches(path: &str, prefix: &str) -> bool {
    if prefix == "/" {
        return true;
    }
    if path == prefix.trim_end_matches('/') {
        return true;
    }
    path.starts_with(prefix)
}

/// Replace the matched prefix with the rewrite target, once. An exact
/// base-path hit maps to the rewrite with its trailing slash removed.
pub fn rewrite_path(path: &str, prefix: &str, rewrite: &str) -> String {
    if path == prefix.trim_end_matches('/') {
        return rewrite.trim_end_matches('/').to_string();
    }
    path.replacen(prefix, rewrite, 1)
}

fn parse_host(host: &str, scheme: &str) -> Option<Url> {
    let url = if host.starts_with("http://") || host.starts_with("https://") {
        Url::parse(host).ok()?
    } else {
        Url::parse(&format!("{}://{}", scheme, host)).ok()?
    };
    url.host_str()?;
    Some(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RouteConfig, RouteMiddlewareConfig};
    use std::time::Duration;

    fn upstream(name: &str, hosts: &[&str], routes: Vec<RouteConfig>) -> UpstreamConfig {
        UpstreamConfig {
            name: name.to_string(),
            scheme: String::new(),
            hosts: hosts.iter().map(|h| h.to_string()).collect(),
            load_balancing: String::new(),
            routes,
        }
    }

    fn route(path: &str) -> RouteConfig {
        RouteConfig {
            path: path.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_normalize_prefix() {
        assert_eq!(normalize_prefix("/api/users/**"), "/api/users/");
        assert_eq!(normalize_prefix("/api/users/"), "/api/users/");
        assert_eq!(normalize_prefix("/health"), "/health/");
        assert_eq!(normalize_prefix("/"), "/");
        assert_eq!(normalize_prefix("/**"), "/");
    }

    #[test]
    fn test_prefix_matches() {
        assert!(prefix_matches("/api/users/42", "/api/users/"));
        assert!(prefix_matches("/api/users/", "/api/users/"));
        // Exact base path without trailing slash also matches.
        assert!(prefix_matches("/api/users", "/api/users/"));
        assert!(!prefix_matches("/api/usersextra", "/api/users/"));
        assert!(!prefix_matches("/api/orders/1", "/api/users/"));
        // Catch-all.
        assert!(prefix_matches("/anything", "/"));
    }

    #[test]
    fn test_rewrite_path() {
        assert_eq!(
            rewrite_path("/api/users/42", "/api/users/", "/users/"),
            "/users/42"
        );
        assert_eq!(rewrite_path("/api/users", "/api/users/", "/users/"), "/users");
        // Identity rewrite preserves the path.
        assert_eq!(
            rewrite_path("/api/users/42", "/api/users/", "/api/users/"),
            "/api/users/42"
        );
    }

    #[test]
    fn test_build_sorts_longest_prefix_first() {
        let table = RoutingTable::build(&[
            upstream("u1", &["127.0.0.1:9001"], vec![route("/api/**")]),
            upstream("u2", &["127.0.0.1:9002"], vec![route("/api/users/**")]),
        ]);
        assert_eq!(table.routes[0].prefix, "/api/users/");
        assert_eq!(table.routes[1].prefix, "/api/");
    }

    #[test]
    fn test_lookup_longest_prefix_wins() {
        let table = RoutingTable::build(&[
            upstream("u1", &["127.0.0.1:9001"], vec![route("/api/**")]),
            upstream("u2", &["127.0.0.1:9002"], vec![route("/api/users/**")]),
        ]);
        let hit = table.lookup("GET", "/api/users/42").unwrap();
        assert_eq!(table.balancers[hit.balancer_idx].name(), "u2");
        let hit = table.lookup("GET", "/api/orders/7").unwrap();
        assert_eq!(table.balancers[hit.balancer_idx].name(), "u1");
        assert!(table.lookup("GET", "/other").is_none());
    }

    #[test]
    fn test_lookup_method_filter() {
        let mut r = route("/api/**");
        r.methods = vec!["get".to_string(), "POST".to_string()];
        let table = RoutingTable::build(&[upstream("u1", &["127.0.0.1:9001"], vec![r])]);
        assert!(table.lookup("GET", "/api/x").is_some());
        assert!(table.lookup("post", "/api/x").is_some());
        assert!(table.lookup("DELETE", "/api/x").is_none());
    }

    #[test]
    fn test_empty_methods_admit_any() {
        let table = RoutingTable::build(&[upstream(
            "u1",
            &["127.0.0.1:9001"],
            vec![route("/api/**")],
        )]);
        for method in ["GET", "POST", "PUT", "DELETE", "PATCH"] {
            assert!(table.lookup(method, "/api/x").is_some());
        }
    }

    #[test]
    fn test_invalid_hosts_skip_upstream() {
        let table = RoutingTable::build(&[
            upstream("bad", &["not a host"], vec![route("/bad/**")]),
            upstream("good", &["127.0.0.1:9001"], vec![route("/good/**")]),
        ]);
        assert_eq!(table.balancers.len(), 1);
        assert_eq!(table.balancers[0].name(), "good");
        assert!(table.lookup("GET", "/bad/x").is_none());
    }

    #[test]
    fn test_unknown_algorithm_skips_upstream() {
        let mut up = upstream("u1", &["127.0.0.1:9001"], vec![route("/api/**")]);
        up.load_balancing = "least_conn".to_string();
        let table = RoutingTable::build(&[up]);
        assert!(table.balancers.is_empty());
        assert!(table.routes.is_empty());
    }

    #[test]
    fn test_full_url_hosts_keep_their_scheme() {
        let table = RoutingTable::build(&[upstream(
            "u1",
            &["https://10.0.0.1:8443", "10.0.0.2:8080"],
            vec![route("/api/**")],
        )]);
        let hosts = table.balancers[0].hosts();
        assert_eq!(hosts[0].url.scheme(), "https");
        assert_eq!(hosts[1].url.scheme(), "http");
    }

    #[test]
    fn test_route_local_chain_is_compiled() {
        let mut r = route("/api/**");
        r.middlewares = vec![RouteMiddlewareConfig {
            name: "acl".to_string(),
            config: serde_json::json!({"whitelist": ["127.0.0.1/32"]})
                .as_object()
                .cloned()
                .unwrap(),
        }];
        let table = RoutingTable::build(&[upstream("u1", &["127.0.0.1:9001"], vec![r])]);
        assert_eq!(table.routes[0].middlewares.len(), 1);
    }

    #[tokio::test]
    async fn test_manager_swaps_table_atomically() {
        let health = Arc::new(HealthSupervisor::new(Duration::from_secs(600)));
        let manager = RouterManager::new(
            &[upstream("u1", &["127.0.0.1:9001"], vec![route("/api/**")])],
            health.clone(),
        );
        let old = manager.snapshot();
        assert_eq!(old.balancers[0].name(), "u1");

        manager.update_upstreams(&[upstream(
            "u2",
            &["127.0.0.1:9002"],
            vec![route("/api/**")],
        )]);
        let new = manager.snapshot();
        assert_eq!(new.balancers[0].name(), "u2");
        // The retired snapshot is still intact for in-flight requests.
        assert_eq!(old.balancers[0].name(), "u1");
        health.shutdown();
    }

    #[tokio::test]
    async fn test_manager_pre_match() {
        let health = Arc::new(HealthSupervisor::new(Duration::from_secs(600)));
        let manager = RouterManager::new(
            &[upstream("u1", &["127.0.0.1:9001"], vec![route("/api/**")])],
            health.clone(),
        );
        assert_eq!(manager.pre_match("GET", "/api/x").as_deref(), Some("/api/"));
        assert!(manager.pre_match("GET", "/nope").is_none());
        health.shutdown();
    }
}
