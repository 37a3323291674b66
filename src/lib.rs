//! # Prism Gateway
//!
//! A reverse-proxy API gateway: requests are matched against an atomically
//! swappable routing table, a healthy backend is selected by a pluggable
//! load-balancing policy, the path is optionally rewritten, and the request
//! is proxied with an ordered chain of middlewares applied around it.
//!
//! ## Architecture
//!
//! ```text
//! Listener → Pre-match → Global middlewares → Route match
//!          → Route middlewares → Balancer → Reverse proxy → Backend
//! ```
//!
//! ## Core features
//!
//! - **Routing**: longest-prefix matching with method filters and prefix
//!   rewrite; tables swap atomically on config updates
//! - **Load balancing**: round-robin, consistent hashing, power-of-two-choices
//! - **Health checks**: per-balancer TCP probes with automatic node
//!   removal and recovery
//! - **Middlewares**: ACL, JWT auth, CORS, token-bucket rate limiting,
//!   structured request logging, Prometheus metrics
//! - **Dynamic config**: file reload on SIGHUP, or etcd fetch + watch

pub mod balancer;
pub mod config;
pub mod error;
pub mod middleware;
pub mod observability;
pub mod proxy;
pub mod router;
pub mod server;
pub mod util;

pub use config::GatewayConfig;
pub use error::{GatewayError, Result};
pub use router::RouterManager;
pub use server::Gateway;
