//! Rate limiting middleware — keyed token buckets with CAS refill
//!
//! One bucket per key; the key derives from the configured strategy (client
//! IP, matched route prefix, or both). Refill and admission go through
//! compare-and-swap loops on atomic cells, so the hot path takes no lock.
//! Buckets are never evicted.

use crate::error::Result;
use crate::middleware::{Middleware, RequestContext};
use crate::util::{f64_or, i64_or, str_or, ConfigMap};
use async_trait::async_trait;
use dashmap::DashMap;
use http::Response;
use serde_json::Value;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

const DEFAULT_RATE: f64 = 100.0;
const DEFAULT_BURST: i64 = 50;

/// A single token bucket. `tokens` stays within `[0, burst]`: refill only
/// raises it toward `burst`, admission only lowers it, and every mutation is
/// a CAS on one cell.
pub(crate) struct TokenBucket {
    rate: f64,
    burst: i64,
    tokens: AtomicI64,
    /// Nanoseconds since `origin` at the last refill
    last_refill: AtomicU64,
    origin: Instant,
}

impl TokenBucket {
    pub(crate) fn new(rate: f64, burst: i64) -> Self {
        Self {
            rate,
            burst,
            tokens: AtomicI64::new(burst),
            last_refill: AtomicU64::new(0),
            origin: Instant::now(),
        }
    }

    pub(crate) fn allow(&self, n: i64) -> bool {
        let now = self.origin.elapsed().as_nanos() as u64;
        let last = self.last_refill.load(Ordering::Acquire);
        let dt = now.saturating_sub(last) as f64 / 1e9;
        if dt > 0.0 {
            let add = (dt * self.rate) as i64;
            if add > 0
                && self
                    .last_refill
                    .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                loop {
                    let cur = self.tokens.load(Ordering::Acquire);
                    let next = (cur + add).min(self.burst);
                    if self
                        .tokens
                        .compare_exchange(cur, next, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        break;
                    }
                }
            }
        }
        loop {
            let cur = self.tokens.load(Ordering::Acquire);
            if cur < n {
                return false;
            }
            if self
                .tokens
                .compare_exchange(cur, cur - n, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }
}

enum Strategy {
    Ip,
    Route,
    Combined,
}

pub struct RateLimitMiddleware {
    strategy: Strategy,
    rate: f64,
    burst: i64,
    buckets: DashMap<String, Arc<TokenBucket>>,
}

impl RateLimitMiddleware {
    pub fn factory(cfg: &ConfigMap) -> Result<Arc<dyn Middleware>> {
        let strategy = match str_or(cfg, "strategy", "ip").to_ascii_lowercase().as_str() {
            "route" => Strategy::Route,
            "combined" => Strategy::Combined,
            _ => Strategy::Ip,
        };

        let mut rate = f64_or(cfg, "requests_per_second", DEFAULT_RATE);
        let mut burst = i64_or(cfg, "burst", DEFAULT_BURST);
        // Nested shape overrides the flat keys.
        if let Some(Value::Object(global)) = cfg.get("global") {
            rate = f64_or(global, "requests_per_second", rate);
            burst = i64_or(global, "burst", burst);
        }

        Ok(Arc::new(Self {
            strategy,
            rate,
            burst,
            buckets: DashMap::new(),
        }))
    }

    fn key(&self, ctx: &RequestContext) -> String {
        let prefix = ctx.route_prefix.as_deref().unwrap_or("");
        match self.strategy {
            Strategy::Ip => format!("ip:{}", ctx.forwarded_ip),
            Strategy::Route => format!("route:{}", prefix),
            Strategy::Combined => format!("comb:{}:{}", prefix, ctx.forwarded_ip),
        }
    }

    /// Fetch or lazily create the bucket for a key. The map's entry lock
    /// makes creation single-flight per key.
    fn bucket(&self, key: String) -> Arc<TokenBucket> {
        self.buckets
            .entry(key)
            .or_insert_with(|| Arc::new(TokenBucket::new(self.rate, self.burst)))
            .clone()
    }
}

#[async_trait]
impl Middleware for RateLimitMiddleware {
    async fn handle_request(
        &self,
        _req: &mut http::request::Parts,
        ctx: &mut RequestContext,
    ) -> Result<Option<Response<Vec<u8>>>> {
        let bucket = self.bucket(self.key(ctx));
        if bucket.allow(1) {
            Ok(None)
        } else {
            Ok(Some(
                Response::builder()
                    .status(429)
                    .header("Content-Type", "application/json")
                    .body(r#"{"error":"rate limit exceeded"}"#.as_bytes().to_vec())
                    .unwrap(),
            ))
        }
    }

    fn name(&self) -> &str {
        "rate_limiter"
    }
}
