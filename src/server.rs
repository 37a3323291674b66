//! Gateway server — accept loop and per-request orchestration
//!
//! Request flow: health/metrics endpoints short-circuit first, then the
//! pre-match annotation, the global middleware chain, route lookup, the
//! route-local chain, balancer selection and the proxy hand-off. Response
//! passes unwind route-local then global middlewares in reverse order.

use crate::balancer::health::HealthSupervisor;
use crate::config::GatewayConfig;
use crate::error::Result;
use crate::middleware::{Chain, RequestContext};
use crate::observability::metrics;
use crate::proxy::ProxyEngine;
use crate::router::{rewrite_path, RouterManager};
use crate::util::{self, CidrMatcher};
use bytes::Bytes;
use http::{Method, Response};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);
const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(30);

/// The gateway: listener, compiled global chain, routing and proxy engine.
pub struct Gateway {
    listen_addr: String,
    read_timeout: Option<Duration>,
    trusted: CidrMatcher,
    router: Arc<RouterManager>,
    globals: Chain,
    engine: ProxyEngine,
}

impl Gateway {
    /// Build the gateway. A global middleware factory error is fatal.
    pub fn new(config: &GatewayConfig, router: Arc<RouterManager>) -> Result<Self> {
        let globals = Chain::global(&config.middlewares)?;
        let trusted = CidrMatcher::new(&config.global.trusted_proxies)?;
        let read_timeout = config
            .global
            .read_timeout
            .as_deref()
            .map(|s| util::parse_duration(s, Duration::from_secs(10)));
        Ok(Self {
            listen_addr: config.global.listen_addr.clone(),
            read_timeout,
            trusted,
            router,
            globals,
            engine: ProxyEngine::new()?,
        })
    }

    /// Health-check probe interval from the global config.
    pub fn health_interval(config: &GatewayConfig) -> Duration {
        util::parse_duration(
            &config.global.health_check_interval,
            DEFAULT_HEALTH_INTERVAL,
        )
    }

    /// Convenience: supervisor + router manager from a config.
    pub fn build_router(
        config: &GatewayConfig,
        upstreams: &[crate::config::UpstreamConfig],
    ) -> Arc<RouterManager> {
        let supervisor = Arc::new(HealthSupervisor::new(Self::health_interval(config)));
        Arc::new(RouterManager::new(upstreams, supervisor))
    }

    /// Serve until `shutdown` fires, then drain in-flight connections for
    /// up to ten seconds.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(&self.listen_addr).await?;
        tracing::info!(addr = %self.listen_addr, "gateway listening");

        let tracker = TaskTracker::new();
        loop {
            let (stream, remote_addr) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::error!(error = %e, "failed to accept connection");
                        continue;
                    }
                },
            };

            let gateway = Arc::clone(&self);
            let read_timeout = self.read_timeout;
            tracker.spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |req| {
                    let gateway = Arc::clone(&gateway);
                    async move {
                        Ok::<_, Infallible>(gateway.handle(req, remote_addr).await)
                    }
                });

                let mut builder = http1::Builder::new();
                if let Some(timeout) = read_timeout {
                    builder.timer(TokioTimer::new()).header_read_timeout(timeout);
                }
                let result = builder.serve_connection(io, service).with_upgrades().await;
                if let Err(e) = result {
                    tracing::debug!(error = %e, "connection closed");
                }
            });
        }

        drop(listener);
        tracker.close();
        tracing::info!("shutdown signal received, draining in-flight requests");
        if tokio::time::timeout(SHUTDOWN_GRACE, tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!("grace period elapsed, forcing shutdown");
        }
        tracing::info!("gateway stopped");
        Ok(())
    }

    /// Handle one request end to end.
    async fn handle(
        self: Arc<Self>,
        req: hyper::Request<Incoming>,
        remote_addr: SocketAddr,
    ) -> Response<Full<Bytes>> {
        let (mut parts, body) = req.into_parts();

        // Gateway-owned endpoints sit outside routing and middlewares.
        if parts.method == Method::GET && parts.uri.path() == "/healthz" {
            return full_response(json_response(200, r#"{"status":"ok"}"#));
        }
        if parts.method == Method::GET && parts.uri.path() == "/metrics" {
            return full_response(text_response(200, &metrics::render()));
        }

        let body_bytes = match BodyExt::collect(body).await {
            Ok(collected) => collected.to_bytes(),
            Err(_) => Bytes::new(),
        };

        let remote_ip = remote_addr.ip().to_string();
        let client_ip = util::client_ip(&parts.headers, remote_addr, &self.trusted);
        let mut ctx = RequestContext::new(
            client_ip,
            parts.method.to_string(),
            parts.uri.path().to_string(),
        );
        ctx.forwarded_ip = util::forwarded_client_ip(&parts.headers, remote_addr);
        ctx.host = header_str(&parts.headers, http::header::HOST);
        ctx.origin = header_str(&parts.headers, http::header::ORIGIN);
        ctx.user_agent = header_str(&parts.headers, http::header::USER_AGENT);

        // Pre-match annotation so early middlewares can key on the route.
        ctx.route_prefix = self.router.pre_match(&ctx.method, &ctx.path);

        let (short, global_ran) = match self.globals.run_request(&mut parts, &mut ctx).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(error = %e, "global middleware failed");
                return full_response(json_response(500, r#"{"error":"internal server error"}"#));
            }
        };

        let table = self.router.snapshot();
        let mut route_chain = None;
        let mut route_ran = 0;

        let response = 'dispatch: {
            if let Some(resp) = short {
                break 'dispatch resp;
            }

            let Some(entry) = table.lookup(&ctx.method, &ctx.path) else {
                break 'dispatch json_response(404, r#"{"error":"no route matched"}"#);
            };
            ctx.route_prefix = Some(entry.prefix.clone());

            match entry.middlewares.run_request(&mut parts, &mut ctx).await {
                Ok((route_short, ran)) => {
                    route_chain = Some(&entry.middlewares);
                    route_ran = ran;
                    if let Some(resp) = route_short {
                        break 'dispatch resp;
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, route = %entry.prefix, "route middleware failed");
                    break 'dispatch json_response(500, r#"{"error":"internal server error"}"#);
                }
            }

            let Some(balancer) = table.balancer(entry.balancer_idx) else {
                break 'dispatch json_response(404, r#"{"error":"no route matched"}"#);
            };
            let Some(node) = balancer.balance(&ctx.client_ip) else {
                tracing::warn!(upstream = balancer.name(), "no healthy upstream node");
                break 'dispatch json_response(
                    502,
                    r#"{"error":"no healthy upstream node available"}"#,
                );
            };

            let outgoing_path = match entry.rewrite.as_deref() {
                Some(rewrite) => rewrite_path(&ctx.path, &entry.prefix, rewrite),
                None => ctx.path.clone(),
            };
            let host = node.host();
            ctx.upstream_name = Some(balancer.name().to_string());
            ctx.upstream_host = Some(format!("{}://{}", node.url.scheme(), host));

            balancer.inc(&host);
            let result = self
                .engine
                .forward(&node, &parts, body_bytes, &outgoing_path, &remote_ip, &ctx)
                .await;
            balancer.done(&host);

            match result {
                Ok(resp) => {
                    ctx.upstream_status = Some(resp.status().as_u16());
                    resp
                }
                Err(e) => {
                    tracing::error!(
                        error = %e,
                        upstream = balancer.name(),
                        host = %host,
                        "upstream request failed"
                    );
                    ctx.upstream_error = Some(e.to_string());
                    if e.is_upstream_timeout() {
                        text_response(504, "upstream timeout")
                    } else {
                        text_response(502, "bad gateway")
                    }
                }
            }
        };

        // Unwind: route-local chain first, then the global chain.
        let (mut resp_parts, resp_body) = response.into_parts();
        if let Some(chain) = route_chain {
            if let Err(e) = chain.run_response(route_ran, &mut resp_parts, &mut ctx).await {
                tracing::error!(error = %e, "route middleware response pass failed");
            }
        }
        if let Err(e) = self
            .globals
            .run_response(global_ran, &mut resp_parts, &mut ctx)
            .await
        {
            tracing::error!(error = %e, "global middleware response pass failed");
        }

        Response::from_parts(resp_parts, Full::new(Bytes::from(resp_body)))
    }
}

fn header_str(headers: &http::HeaderMap, name: http::header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

fn json_response(status: u16, body: &str) -> Response<Vec<u8>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(body.as_bytes().to_vec())
        .unwrap()
}

fn text_response(status: u16, body: &str) -> Response<Vec<u8>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "text/plain; charset=utf-8")
        .body(body.as_bytes().to_vec())
        .unwrap()
}

fn full_response(resp: Response<Vec<u8>>) -> Response<Full<Bytes>> {
    let (parts, body) = resp.into_parts();
    Response::from_parts(parts, Full::new(Bytes::from(body)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UpstreamConfig;

    #[test]
    fn test_json_response_shape() {
        let resp = json_response(404, r#"{"error":"no route matched"}"#);
        assert_eq!(resp.status(), 404);
        assert_eq!(resp.headers()["Content-Type"], "application/json");
        assert_eq!(resp.body(), br#"{"error":"no route matched"}"#);
    }

    #[test]
    fn test_text_response_shape() {
        let resp = text_response(504, "upstream timeout");
        assert_eq!(resp.status(), 504);
        assert_eq!(resp.body(), b"upstream timeout");
    }

    #[test]
    fn test_health_interval_parsing() {
        let mut config = GatewayConfig::default();
        config.global.health_check_interval = "5s".to_string();
        assert_eq!(Gateway::health_interval(&config), Duration::from_secs(5));
        config.global.health_check_interval = "bogus".to_string();
        assert_eq!(Gateway::health_interval(&config), DEFAULT_HEALTH_INTERVAL);
    }

    #[tokio::test]
    async fn test_gateway_new_rejects_bad_trusted_proxies() {
        let mut config = GatewayConfig::default();
        config.global.trusted_proxies = vec!["not-an-ip".to_string()];
        let router = Gateway::build_router(&config, &[] as &[UpstreamConfig]);
        assert!(Gateway::new(&config, router).is_err());
    }

    #[tokio::test]
    async fn test_gateway_new_with_defaults() {
        let config = GatewayConfig::default();
        let router = Gateway::build_router(&config, &[] as &[UpstreamConfig]);
        assert!(Gateway::new(&config, router).is_ok());
    }
}
