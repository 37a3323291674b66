//! Metrics middleware — per-request counter and latency observation

use crate::error::Result;
use crate::middleware::{Middleware, RequestContext};
use crate::observability::metrics::record_request;
use crate::util::ConfigMap;
use async_trait::async_trait;
use http::Response;
use std::sync::Arc;

pub struct MetricsMiddleware;

impl MetricsMiddleware {
    pub fn factory(_cfg: &ConfigMap) -> Result<Arc<dyn Middleware>> {
        Ok(Arc::new(Self))
    }
}

#[async_trait]
impl Middleware for MetricsMiddleware {
    async fn handle_request(
        &self,
        _req: &mut http::request::Parts,
        _ctx: &mut RequestContext,
    ) -> Result<Option<Response<Vec<u8>>>> {
        Ok(None)
    }

    async fn handle_response(
        &self,
        resp: &mut http::response::Parts,
        ctx: &mut RequestContext,
    ) -> Result<()> {
        // The matched route prefix keeps cardinality bounded; unmatched
        // requests fall back to the raw path.
        let path = ctx.route_prefix.as_deref().unwrap_or(&ctx.path);
        let duration = ctx.started_at.elapsed().as_secs_f64();
        record_request(&ctx.method, path, resp.status.as_u16(), duration);
        Ok(())
    }

    fn name(&self) -> &str {
        "metrics"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::testing::{cfg, ctx, get_parts};
    use crate::observability::metrics::HTTP_REQUESTS_TOTAL;
    use serde_json::json;

    #[tokio::test]
    async fn test_records_with_route_prefix_label() {
        let mw = MetricsMiddleware::factory(&cfg(json!({}))).unwrap();
        let mut c = ctx();
        c.route_prefix = Some("/mw-metrics-test/".to_string());

        let before = HTTP_REQUESTS_TOTAL
            .with_label_values(&["GET", "/mw-metrics-test/", "200"])
            .get();

        let mut parts = get_parts("/mw-metrics-test/42");
        assert!(mw.handle_request(&mut parts, &mut c).await.unwrap().is_none());
        let (mut resp_parts, _) = Response::builder().status(200).body(()).unwrap().into_parts();
        mw.handle_response(&mut resp_parts, &mut c).await.unwrap();

        let after = HTTP_REQUESTS_TOTAL
            .with_label_values(&["GET", "/mw-metrics-test/", "200"])
            .get();
        assert_eq!(after, before + 1);
    }

    #[tokio::test]
    async fn test_falls_back_to_raw_path() {
        let mw = MetricsMiddleware::factory(&cfg(json!({}))).unwrap();
        let mut c = ctx();
        c.path = "/mw-metrics-raw".to_string();

        let before = HTTP_REQUESTS_TOTAL
            .with_label_values(&["GET", "/mw-metrics-raw", "404"])
            .get();

        let (mut resp_parts, _) = Response::builder().status(404).body(()).unwrap().into_parts();
        mw.handle_response(&mut resp_parts, &mut c).await.unwrap();

        let after = HTTP_REQUESTS_TOTAL
            .with_label_values(&["GET", "/mw-metrics-raw", "404"])
            .get();
        assert_eq!(after, before + 1);
    }
}
