//! CORS middleware — Cross-Origin Resource Sharing
//!
//! Preflight requests are answered directly and never proxied. Simple
//! requests pass through and receive their CORS headers on the response.
//! Origins may be exact, `*`, or wildcard patterns like
//! `https://*.example.com`.

use crate::error::Result;
use crate::middleware::{Middleware, RequestContext};
use crate::util::{bool_or, i64_or, string_list, ConfigMap};
use async_trait::async_trait;
use http::header::HeaderValue;
use http::{HeaderMap, Method, Response};
use regex::Regex;
use std::sync::Arc;

pub struct CorsMiddleware {
    origins: Vec<OriginPattern>,
    global_star: bool,
    allow_methods: String,
    allow_headers: String,
    expose_headers: String,
    allow_credentials: bool,
    max_age: i64,
}

enum OriginPattern {
    Exact(String),
    Any,
    Wildcard(Regex),
}

impl CorsMiddleware {
    pub fn factory(cfg: &ConfigMap) -> Result<Arc<dyn Middleware>> {
        let mut configured = string_list(cfg, "allow_origins");
        if configured.is_empty() {
            configured = string_list(cfg, "allow_origin");
        }

        let global_star = configured.is_empty() || configured.iter().any(|o| o == "*");
        let origins = configured
            .iter()
            .filter_map(|o| {
                if o == "*" {
                    Some(OriginPattern::Any)
                } else if o.contains('*') {
                    let pattern = format!("^{}$", regex::escape(o).replace(r"\*", ".*"));
                    match Regex::new(&pattern) {
                        Ok(re) => Some(OriginPattern::Wildcard(re)),
                        Err(_) => {
                            tracing::warn!(origin = %o, "invalid origin pattern, skipping");
                            None
                        }
                    }
                } else {
                    Some(OriginPattern::Exact(o.clone()))
                }
            })
            .collect();

        let methods = string_list(cfg, "allow_methods");
        let allow_methods = if methods.is_empty() {
            "GET, POST, PUT, DELETE, OPTIONS".to_string()
        } else {
            methods.join(", ")
        };

        Ok(Arc::new(Self {
            origins,
            global_star,
            allow_methods,
            allow_headers: string_list(cfg, "allow_headers").join(", "),
            expose_headers: string_list(cfg, "expose_headers").join(", "),
            allow_credentials: bool_or(cfg, "allow_credentials", false),
            max_age: i64_or(cfg, "max_age", 600),
        }))
    }

    fn origin_matches(&self, origin: &str) -> bool {
        self.origins.iter().any(|p| match p {
            OriginPattern::Any => true,
            OriginPattern::Exact(o) => o == origin,
            OriginPattern::Wildcard(re) => re.is_match(origin),
        })
    }

    /// The Access-Control-Allow-Origin value for a request origin, or None
    /// when the origin is not allowed.
    fn resolve_origin(&self, origin: &str) -> Option<String> {
        if self.global_star {
            // '*' cannot be combined with credentials; echo the origin.
            if self.allow_credentials {
                Some(origin.to_string())
            } else {
                Some("*".to_string())
            }
        } else if self.origin_matches(origin) {
            Some(origin.to_string())
        } else {
            None
        }
    }

    fn apply_common_headers(&self, headers: &mut HeaderMap, allow_origin: &str) {
        if let Ok(v) = HeaderValue::from_str(allow_origin) {
            headers.insert("Access-Control-Allow-Origin", v);
        }
        if self.allow_credentials {
            headers.insert(
                "Access-Control-Allow-Credentials",
                HeaderValue::from_static("true"),
            );
        }
        headers.append("Vary", HeaderValue::from_static("Origin"));
        if !self.expose_headers.is_empty() {
            if let Ok(v) = HeaderValue::from_str(&self.expose_headers) {
                headers.insert("Access-Control-Expose-Headers", v);
            }
        }
    }
}

#[async_trait]
impl Middleware for CorsMiddleware {
    async fn handle_request(
        &self,
        req: &mut http::request::Parts,
        ctx: &mut RequestContext,
    ) -> Result<Option<Response<Vec<u8>>>> {
        let Some(origin) = ctx.origin.clone() else {
            // Not a CORS request.
            return Ok(None);
        };

        let Some(allow_origin) = self.resolve_origin(&origin) else {
            // Origin not allowed: continue without CORS headers.
            return Ok(None);
        };

        if req.method == Method::OPTIONS {
            let mut response = Response::builder().status(204).body(Vec::new()).unwrap();
            let headers = response.headers_mut();
            self.apply_common_headers(headers, &allow_origin);
            if let Ok(v) = HeaderValue::from_str(&self.allow_methods) {
                headers.insert("Access-Control-Allow-Methods", v);
            }
            let allow_headers = if !self.allow_headers.is_empty() {
                Some(self.allow_headers.clone())
            } else {
                req.headers
                    .get("Access-Control-Request-Headers")
                    .and_then(|v| v.to_str().ok())
                    .map(|s| s.to_string())
            };
            if let Some(allowed) = allow_headers {
                if let Ok(v) = HeaderValue::from_str(&allowed) {
                    headers.insert("Access-Control-Allow-Headers", v);
                }
            }
            if let Ok(v) = HeaderValue::from_str(&self.max_age.to_string()) {
                headers.insert("Access-Control-Max-Age", v);
            }
            return Ok(Some(response));
        }

        Ok(None)
    }

    async fn handle_response(
        &self,
        resp: &mut http::response::Parts,
        ctx: &mut RequestContext,
    ) -> Result<()> {
        // The preflight response carries its headers already.
        if resp.headers.contains_key("Access-Control-Allow-Origin") {
            return Ok(());
        }
        let Some(origin) = ctx.origin.as_deref() else {
            return Ok(());
        };
        if let Some(allow_origin) = self.resolve_origin(origin) {
            self.apply_common_headers(&mut resp.headers, &allow_origin);
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "cors"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::testing::{cfg, ctx, request_parts};
    use serde_json::json;

    fn mw(value: serde_json::Value) -> Arc<dyn Middleware> {
        CorsMiddleware::factory(&cfg(value)).unwrap()
    }

    fn cors_ctx(origin: Option<&str>) -> RequestContext {
        let mut c = ctx();
        c.origin = origin.map(String::from);
        c
    }

    fn options_parts() -> http::request::Parts {
        request_parts(
            http::Request::builder()
                .method("OPTIONS")
                .uri("/api/data")
                .header("Access-Control-Request-Headers", "X-Custom"),
        )
    }

    #[tokio::test]
    async fn test_preflight_allowed_origin() {
        let mw = mw(json!({"allow_origins": ["https://example.com"]}));
        let mut parts = options_parts();
        let mut c = cors_ctx(Some("https://example.com"));
        let resp = mw.handle_request(&mut parts, &mut c).await.unwrap().unwrap();
        assert_eq!(resp.status(), 204);
        assert_eq!(
            resp.headers()["Access-Control-Allow-Origin"],
            "https://example.com"
        );
        assert!(resp.headers().contains_key("Access-Control-Allow-Methods"));
        assert_eq!(resp.headers()["Access-Control-Max-Age"], "600");
        // allow_headers empty → echo of Access-Control-Request-Headers
        assert_eq!(resp.headers()["Access-Control-Allow-Headers"], "X-Custom");
        assert_eq!(resp.headers()["Vary"], "Origin");
    }

    #[tokio::test]
    async fn test_preflight_disallowed_origin_passes_through() {
        let mw = mw(json!({"allow_origins": ["https://example.com"]}));
        let mut parts = options_parts();
        let mut c = cors_ctx(Some("https://evil.com"));
        assert!(mw.handle_request(&mut parts, &mut c).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_non_cors_request_untouched() {
        let mw = mw(json!({}));
        let mut parts = options_parts();
        let mut c = cors_ctx(None);
        assert!(mw.handle_request(&mut parts, &mut c).await.unwrap().is_none());

        let (mut resp_parts, _) = Response::builder().body(()).unwrap().into_parts();
        mw.handle_response(&mut resp_parts, &mut c).await.unwrap();
        assert!(!resp_parts.headers.contains_key("Access-Control-Allow-Origin"));
    }

    #[tokio::test]
    async fn test_wildcard_pattern_origin() {
        let mw = mw(json!({"allow_origins": ["https://*.example.com"]}));
        let mut parts = options_parts();
        let mut c = cors_ctx(Some("https://app.example.com"));
        let resp = mw.handle_request(&mut parts, &mut c).await.unwrap().unwrap();
        assert_eq!(
            resp.headers()["Access-Control-Allow-Origin"],
            "https://app.example.com"
        );

        let mut c = cors_ctx(Some("https://example.org"));
        let mut parts = options_parts();
        assert!(mw.handle_request(&mut parts, &mut c).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_star_without_credentials() {
        let mw = mw(json!({}));
        let mut c = cors_ctx(Some("https://anywhere.dev"));
        let (mut resp_parts, _) = Response::builder().body(()).unwrap().into_parts();
        mw.handle_response(&mut resp_parts, &mut c).await.unwrap();
        assert_eq!(resp_parts.headers["Access-Control-Allow-Origin"], "*");
    }

    #[tokio::test]
    async fn test_star_with_credentials_echoes_origin() {
        let mw = mw(json!({"allow_credentials": true}));
        let mut c = cors_ctx(Some("https://anywhere.dev"));
        let (mut resp_parts, _) = Response::builder().body(()).unwrap().into_parts();
        mw.handle_response(&mut resp_parts, &mut c).await.unwrap();
        assert_eq!(
            resp_parts.headers["Access-Control-Allow-Origin"],
            "https://anywhere.dev"
        );
        assert_eq!(resp_parts.headers["Access-Control-Allow-Credentials"], "true");
        assert_eq!(resp_parts.headers["Vary"], "Origin");
    }

    #[tokio::test]
    async fn test_simple_request_response_headers() {
        let mw = mw(json!({
            "allow_origins": ["https://example.com"],
            "expose_headers": ["X-Request-ID"],
        }));
        let mut c = cors_ctx(Some("https://example.com"));
        let (mut resp_parts, _) = Response::builder().body(()).unwrap().into_parts();
        mw.handle_response(&mut resp_parts, &mut c).await.unwrap();
        assert_eq!(
            resp_parts.headers["Access-Control-Allow-Origin"],
            "https://example.com"
        );
        assert_eq!(
            resp_parts.headers["Access-Control-Expose-Headers"],
            "X-Request-ID"
        );
    }

    #[tokio::test]
    async fn test_configured_allow_headers_override_echo() {
        let mw = mw(json!({
            "allow_origins": ["https://example.com"],
            "allow_methods": ["GET", "POST"],
            "allow_headers": ["Content-Type", "Authorization"],
        }));
        let mut parts = options_parts();
        let mut c = cors_ctx(Some("https://example.com"));
        let resp = mw.handle_request(&mut parts, &mut c).await.unwrap().unwrap();
        assert_eq!(resp.headers()["Access-Control-Allow-Methods"], "GET, POST");
        assert_eq!(
            resp.headers()["Access-Control-Allow-Headers"],
            "Content-Type, Authorization"
        );
    }
}
