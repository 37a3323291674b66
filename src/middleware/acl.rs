//! IP ACL middleware — CIDR whitelist and blacklist
//!
//! Blacklist always denies; a non-empty whitelist requires membership.
//! Entries are CIDR blocks or bare IPs. The checked address is the first
//! `X-Forwarded-For` hop when present, else the peer address.

use crate::error::Result;
use crate::middleware::{Middleware, RequestContext};
use crate::util::{string_list, CidrMatcher, ConfigMap};
use async_trait::async_trait;
use http::Response;
use std::sync::Arc;

pub struct AclMiddleware {
    whitelist: CidrMatcher,
    blacklist: CidrMatcher,
}

impl AclMiddleware {
    pub fn factory(cfg: &ConfigMap) -> Result<Arc<dyn Middleware>> {
        Ok(Arc::new(Self {
            whitelist: CidrMatcher::lenient(&string_list(cfg, "whitelist")),
            blacklist: CidrMatcher::lenient(&string_list(cfg, "blacklist")),
        }))
    }
}

fn deny(body: &str) -> Response<Vec<u8>> {
    Response::builder()
        .status(403)
        .header("Content-Type", "application/json")
        .body(body.as_bytes().to_vec())
        .unwrap()
}

#[async_trait]
impl Middleware for AclMiddleware {
    async fn handle_request(
        &self,
        _req: &mut http::request::Parts,
        ctx: &mut RequestContext,
    ) -> Result<Option<Response<Vec<u8>>>> {
        if ctx.forwarded_ip.parse::<std::net::IpAddr>().is_err() {
            return Ok(Some(deny(r#"{"error":"forbidden"}"#)));
        }
        if self.blacklist.contains(&ctx.forwarded_ip) {
            tracing::debug!(client_ip = %ctx.forwarded_ip, "client is blacklisted");
            return Ok(Some(deny(r#"{"error":"blocked"}"#)));
        }
        if !self.whitelist.is_empty() && !self.whitelist.contains(&ctx.forwarded_ip) {
            tracing::debug!(client_ip = %ctx.forwarded_ip, "client not in whitelist");
            return Ok(Some(deny(r#"{"error":"not allowed"}"#)));
        }
        Ok(None)
    }

    fn name(&self) -> &str {
        "acl"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::testing::{cfg, get_parts};
    use serde_json::json;

    fn ctx_with_ip(ip: &str) -> RequestContext {
        RequestContext::new(ip.to_string(), "GET".to_string(), "/test".to_string())
    }

    async fn run(acl: &Arc<dyn Middleware>, ip: &str) -> Option<Response<Vec<u8>>> {
        let mut parts = get_parts("/test");
        let mut ctx = ctx_with_ip(ip);
        acl.handle_request(&mut parts, &mut ctx).await.unwrap()
    }

    #[tokio::test]
    async fn test_no_lists_allows_everyone() {
        let acl = AclMiddleware::factory(&cfg(json!({}))).unwrap();
        assert!(run(&acl, "203.0.113.9").await.is_none());
    }

    #[tokio::test]
    async fn test_blacklist_denies() {
        let acl =
            AclMiddleware::factory(&cfg(json!({"blacklist": ["192.168.1.100/32"]}))).unwrap();
        let resp = run(&acl, "192.168.1.100").await.unwrap();
        assert_eq!(resp.status(), 403);
        assert_eq!(resp.body(), br#"{"error":"blocked"}"#);
        assert!(run(&acl, "192.168.1.101").await.is_none());
    }

    #[tokio::test]
    async fn test_whitelist_requires_membership() {
        let acl = AclMiddleware::factory(&cfg(json!({"whitelist": ["10.0.0.0/8"]}))).unwrap();
        assert!(run(&acl, "10.1.2.3").await.is_none());
        let resp = run(&acl, "172.16.0.1").await.unwrap();
        assert_eq!(resp.status(), 403);
        assert_eq!(resp.body(), br#"{"error":"not allowed"}"#);
    }

    #[tokio::test]
    async fn test_blacklist_wins_over_whitelist() {
        let acl = AclMiddleware::factory(&cfg(json!({
            "whitelist": ["10.0.0.0/8"],
            "blacklist": ["10.0.0.5"],
        })))
        .unwrap();
        let resp = run(&acl, "10.0.0.5").await.unwrap();
        assert_eq!(resp.body(), br#"{"error":"blocked"}"#);
    }

    #[tokio::test]
    async fn test_unparsable_ip_is_forbidden() {
        let acl = AclMiddleware::factory(&cfg(json!({}))).unwrap();
        let resp = run(&acl, "not-an-ip").await.unwrap();
        assert_eq!(resp.status(), 403);
        assert_eq!(resp.body(), br#"{"error":"forbidden"}"#);
    }

    #[tokio::test]
    async fn test_csv_list_form() {
        let acl = AclMiddleware::factory(&cfg(json!({"whitelist": "10.0.0.1, 10.0.0.2"})))
            .unwrap();
        assert!(run(&acl, "10.0.0.2").await.is_none());
        assert!(run(&acl, "10.0.0.3").await.is_some());
    }
}
