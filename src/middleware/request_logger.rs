//! Request logger middleware — request ids and structured log finalization
//!
//! Assigns a UUID request id on the way in (echoed as `X-Request-ID`) and,
//! once the response is ready, derives a severity level and hands the
//! finished entry to the async log sink.

use crate::error::Result;
use crate::middleware::{Middleware, RequestContext};
use crate::observability::access_log::{AccessLogService, Entry, DEFAULT_BUFFER_SIZE};
use crate::util::{bool_or, i64_or, ConfigMap};
use async_trait::async_trait;
use http::header::HeaderValue;
use http::Response;
use std::sync::Arc;
use uuid::Uuid;

const DEFAULT_LATENCY_WARN_MS: i64 = 1000;

pub struct RequestLoggerMiddleware {
    service: AccessLogService,
    client_error_as_warn: bool,
    latency_warn_ms: i64,
}

impl RequestLoggerMiddleware {
    pub fn factory(cfg: &ConfigMap) -> Result<Arc<dyn Middleware>> {
        let buffer_size = i64_or(cfg, "buffer_size", DEFAULT_BUFFER_SIZE as i64).max(0) as usize;
        let latency_warn_ms = if cfg.contains_key("latency_warn_ms") {
            i64_or(cfg, "latency_warn_ms", DEFAULT_LATENCY_WARN_MS)
        } else {
            i64_or(cfg, "warn_latency_ms", DEFAULT_LATENCY_WARN_MS)
        };
        Ok(Arc::new(Self {
            service: AccessLogService::start(buffer_size),
            client_error_as_warn: bool_or(cfg, "client_error_as_warn", false),
            latency_warn_ms,
        }))
    }

    /// Severity for a finished request. Errors dominate, then upstream
    /// status, then latency.
    fn level(&self, ctx: &RequestContext, status: u16, latency_ms: u64) -> &'static str {
        if ctx.upstream_error.is_some() {
            return "error";
        }
        let effective = ctx.upstream_status.unwrap_or(status);
        if effective >= 500 {
            return "error";
        }
        if (400..500).contains(&effective) && self.client_error_as_warn {
            return "warn";
        }
        if latency_ms as i64 >= self.latency_warn_ms {
            return "warn";
        }
        "info"
    }
}

#[async_trait]
impl Middleware for RequestLoggerMiddleware {
    async fn handle_request(
        &self,
        _req: &mut http::request::Parts,
        ctx: &mut RequestContext,
    ) -> Result<Option<Response<Vec<u8>>>> {
        ctx.request_id = Some(Uuid::new_v4().to_string());
        Ok(None)
    }

    async fn handle_response(
        &self,
        resp: &mut http::response::Parts,
        ctx: &mut RequestContext,
    ) -> Result<()> {
        let request_id = ctx.request_id.clone().unwrap_or_default();
        if let Ok(v) = HeaderValue::from_str(&request_id) {
            resp.headers.insert("X-Request-ID", v);
        }

        let latency_ms = ctx.started_at.elapsed().as_millis() as u64;
        let status = resp.status.as_u16();
        let entry = Entry {
            timestamp: chrono::Utc::now(),
            level: self.level(ctx, status, latency_ms).to_string(),
            client_ip: ctx.client_ip.clone(),
            http_method: ctx.method.clone(),
            http_path: ctx.path.clone(),
            http_status: status,
            latency_ms,
            user_agent: ctx.user_agent.clone(),
            request_id,
            route_prefix: ctx.route_prefix.clone(),
            upstream_name: ctx.upstream_name.clone(),
            upstream_node: ctx.upstream_host.clone(),
            user_id: ctx.auth_sub.clone(),
            error: ctx.upstream_error.clone(),
        };
        self.service.log(entry);
        Ok(())
    }

    fn name(&self) -> &str {
        "request_logger"
    }
}
