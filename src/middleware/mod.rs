//! Middleware pipeline — composable request/response processing
//!
//! Middlewares run in order before the request is proxied and in reverse
//! order on the way out. Factories live in a process-wide registry keyed by
//! name; the global chain is assembled from config at startup and
//! route-local chains are compiled into the routing table.

mod acl;
mod auth_jwt;
mod cors;
mod metrics;
mod rate_limit;
mod request_logger;

pub use acl::AclMiddleware;
pub use auth_jwt::JwtAuthMiddleware;
pub use cors::CorsMiddleware;
pub use metrics::MetricsMiddleware;
pub use rate_limit::RateLimitMiddleware;
pub use request_logger::RequestLoggerMiddleware;

use crate::config::{MiddlewareConfig, RouteMiddlewareConfig};
use crate::error::Result;
use crate::util::ConfigMap;
use async_trait::async_trait;
use http::Response;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// Per-request context threaded through the pipeline. Middlewares annotate
/// it and later stages (proxy, logger, metrics) read the annotations.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Client IP, honoring X-Forwarded-For only from trusted proxies;
    /// used for balancing keys and access logging
    pub client_ip: String,
    /// Client IP honoring X-Forwarded-For unconditionally (first hop,
    /// else the peer address); ACL and rate limiting key on this
    pub forwarded_ip: String,
    /// HTTP method of the inbound request
    pub method: String,
    /// Raw inbound path
    pub path: String,
    /// Inbound Host header
    pub host: Option<String>,
    /// Inbound Origin header (for CORS response headers)
    pub origin: Option<String>,
    /// Inbound User-Agent header
    pub user_agent: Option<String>,
    /// When the gateway started handling the request
    pub started_at: Instant,
    /// Assigned by the request logger, echoed as X-Request-ID
    pub request_id: Option<String>,
    /// Matched route prefix from the pre-match pass
    pub route_prefix: Option<String>,
    /// Name of the balancer that served the request
    pub upstream_name: Option<String>,
    /// URL of the node the request was proxied to
    pub upstream_host: Option<String>,
    /// Status returned by the upstream
    pub upstream_status: Option<u16>,
    /// Transport error talking to the upstream
    pub upstream_error: Option<String>,
    /// Verified JWT subject
    pub auth_sub: Option<String>,
}

impl RequestContext {
    pub fn new(client_ip: String, method: String, path: String) -> Self {
        Self {
            forwarded_ip: client_ip.clone(),
            client_ip,
            method,
            path,
            host: None,
            origin: None,
            user_agent: None,
            started_at: Instant::now(),
            request_id: None,
            route_prefix: None,
            upstream_name: None,
            upstream_host: None,
            upstream_status: None,
            upstream_error: None,
            auth_sub: None,
        }
    }
}

/// Middleware trait — process a request and optionally short-circuit
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Process the request. Return Ok(None) to continue the pipeline, or
    /// Ok(Some(response)) to short-circuit with an immediate response.
    async fn handle_request(
        &self,
        req: &mut http::request::Parts,
        ctx: &mut RequestContext,
    ) -> Result<Option<Response<Vec<u8>>>>;

    /// Process the outgoing response (default is pass-through).
    async fn handle_response(
        &self,
        _resp: &mut http::response::Parts,
        _ctx: &mut RequestContext,
    ) -> Result<()> {
        Ok(())
    }

    /// Middleware name for logging
    fn name(&self) -> &str;
}

/// Factory: build a middleware from its free-form config map.
pub type MiddlewareFactory = fn(&ConfigMap) -> Result<Arc<dyn Middleware>>;

/// Name→factory registry. Populated once at startup; duplicate registration
/// of a name is a programmer error and panics.
pub struct Registry {
    factories: HashMap<String, MiddlewareFactory>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn register(&mut self, name: &str, factory: MiddlewareFactory) {
        if self
            .factories
            .insert(name.to_string(), factory)
            .is_some()
        {
            panic!("middleware {} is already registered", name);
        }
    }

    pub fn get(&self, name: &str) -> Option<MiddlewareFactory> {
        self.factories.get(name).copied()
    }

    fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register("acl", AclMiddleware::factory);
        registry.register("auth_jwt", JwtAuthMiddleware::factory);
        registry.register("cors", CorsMiddleware::factory);
        registry.register("rate_limiter", RateLimitMiddleware::factory);
        registry.register("request_logger", RequestLoggerMiddleware::factory);
        registry.register("metrics", MetricsMiddleware::factory);
        registry
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::builtin);

/// The process-wide registry with all built-in middlewares.
pub fn registry() -> &'static Registry {
    &REGISTRY
}

/// An ordered middleware chain.
pub struct Chain {
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl Chain {
    pub fn new(middlewares: Vec<Arc<dyn Middleware>>) -> Self {
        Self { middlewares }
    }

    pub fn empty() -> Self {
        Self {
            middlewares: Vec::new(),
        }
    }

    /// Assemble the global chain: enabled entries only, unregistered names
    /// skipped with a warning, factory errors fatal, sorted ascending by
    /// `order`.
    pub fn global(configs: &HashMap<String, MiddlewareConfig>) -> Result<Self> {
        let mut entries: Vec<(i32, Arc<dyn Middleware>)> = Vec::new();
        for (name, conf) in configs {
            if !conf.enabled {
                continue;
            }
            let Some(factory) = registry().get(name) else {
                tracing::warn!(middleware = %name, "middleware not registered, skipping");
                continue;
            };
            let mw = factory(&conf.config)?;
            entries.push((conf.order, mw));
        }
        entries.sort_by_key(|(order, _)| *order);
        Ok(Self::new(entries.into_iter().map(|(_, mw)| mw).collect()))
    }

    /// Compile a route-local chain. Unregistered names and factory errors
    /// skip the middleware with a warning so one bad route declaration does
    /// not poison the table build.
    pub fn route_local(declared: &[RouteMiddlewareConfig], route: &str) -> Self {
        let mut middlewares = Vec::new();
        for decl in declared {
            if decl.name.is_empty() {
                tracing::warn!(route = %route, "skipping middleware with empty name");
                continue;
            }
            let Some(factory) = registry().get(&decl.name) else {
                tracing::warn!(
                    middleware = %decl.name,
                    route = %route,
                    "unregistered middleware on route, skipping"
                );
                continue;
            };
            match factory(&decl.config) {
                Ok(mw) => middlewares.push(mw),
                Err(e) => tracing::warn!(
                    middleware = %decl.name,
                    route = %route,
                    error = %e,
                    "failed to create route middleware, skipping"
                ),
            }
        }
        Self::new(middlewares)
    }

    /// Run the request passes in order. Returns the short-circuit response
    /// (if any) and the number of middlewares that ran, so the caller can
    /// unwind exactly those in the response pass.
    pub async fn run_request(
        &self,
        parts: &mut http::request::Parts,
        ctx: &mut RequestContext,
    ) -> Result<(Option<Response<Vec<u8>>>, usize)> {
        for (i, mw) in self.middlewares.iter().enumerate() {
            if let Some(response) = mw.handle_request(parts, ctx).await? {
                tracing::debug!(middleware = mw.name(), "middleware short-circuited request");
                return Ok((Some(response), i + 1));
            }
        }
        Ok((None, self.middlewares.len()))
    }

    /// Run the response passes of the first `ran` middlewares, in reverse.
    pub async fn run_response(
        &self,
        ran: usize,
        resp: &mut http::response::Parts,
        ctx: &mut RequestContext,
    ) -> Result<()> {
        for mw in self.middlewares[..ran].iter().rev() {
            mw.handle_response(resp, ctx).await?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub fn ctx() -> RequestContext {
        RequestContext::new("127.0.0.1".to_string(), "GET".to_string(), "/test".to_string())
    }

    pub fn request_parts(builder: http::request::Builder) -> http::request::Parts {
        let (parts, _) = builder.body(()).unwrap().into_parts();
        parts
    }

    pub fn get_parts(uri: &str) -> http::request::Parts {
        request_parts(http::Request::builder().uri(uri))
    }

    pub fn cfg(value: serde_json::Value) -> ConfigMap {
        value.as_object().cloned().unwrap_or_default()
    }
}
