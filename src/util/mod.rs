//! Shared utilities — client IP extraction, CIDR matching, liveness probe,
//! duration parsing and helpers for free-form middleware config maps.

use crate::error::{GatewayError, Result};
use http::HeaderMap;
use ipnet::IpNet;
use serde_json::Value;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// TCP connect timeout for the backend liveness probe.
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(3);

/// IP matcher over CIDR ranges. Bare IPs become /32 (or /128) host networks.
pub struct CidrMatcher {
    networks: Vec<IpNet>,
}

impl CidrMatcher {
    /// Parse a list of CIDR/IP entries. Errors on the first invalid entry.
    pub fn new(entries: &[String]) -> Result<Self> {
        let mut networks = Vec::with_capacity(entries.len());
        for entry in entries {
            let trimmed = entry.trim();
            if trimmed.is_empty() {
                continue;
            }
            let net = parse_entry(trimmed).ok_or_else(|| {
                GatewayError::Config(format!("Invalid CIDR or IP '{}'", trimmed))
            })?;
            networks.push(net);
        }
        Ok(Self { networks })
    }

    /// Parse leniently: invalid entries are skipped with a warning.
    pub fn lenient(entries: &[String]) -> Self {
        let mut networks = Vec::with_capacity(entries.len());
        for entry in entries {
            let trimmed = entry.trim();
            if trimmed.is_empty() {
                continue;
            }
            match parse_entry(trimmed) {
                Some(net) => networks.push(net),
                None => tracing::warn!(entry = trimmed, "skipping invalid CIDR entry"),
            }
        }
        Self { networks }
    }

    /// Check membership of an IP address string.
    pub fn contains(&self, ip: &str) -> bool {
        let parsed: IpAddr = match ip.parse() {
            Ok(addr) => addr,
            Err(_) => return false,
        };
        self.networks.iter().any(|net| net.contains(&parsed))
    }

    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }
}

fn parse_entry(entry: &str) -> Option<IpNet> {
    if entry.contains('/') {
        entry.parse().ok()
    } else {
        entry.parse::<IpAddr>().ok().map(IpNet::from)
    }
}

/// Client IP for a request. The first `X-Forwarded-For` hop is honored only
/// when the immediate peer is a trusted proxy; otherwise the peer address
/// itself is the client. Used for balancing keys and access logging.
pub fn client_ip(headers: &HeaderMap, remote_addr: SocketAddr, trusted: &CidrMatcher) -> String {
    let remote_ip = remote_addr.ip().to_string();
    if trusted.contains(&remote_ip) {
        if let Some(first) = first_forwarded_hop(headers) {
            return first;
        }
    }
    remote_ip
}

/// Client IP honoring `X-Forwarded-For` unconditionally: the first hop when
/// the header is present, else the peer address. ACL and rate limiting key
/// on this value.
pub fn forwarded_client_ip(headers: &HeaderMap, remote_addr: SocketAddr) -> String {
    first_forwarded_hop(headers).unwrap_or_else(|| remote_addr.ip().to_string())
}

fn first_forwarded_hop(headers: &HeaderMap) -> Option<String> {
    let xff = headers.get("x-forwarded-for")?.to_str().ok()?;
    let first = xff.split(',').next()?.trim();
    if first.is_empty() {
        return None;
    }
    Some(first.to_string())
}

/// Probe a backend with a TCP connect. True iff the connection succeeded
/// within [`CONNECTION_TIMEOUT`].
pub async fn is_backend_alive(host: &str) -> bool {
    matches!(
        tokio::time::timeout(CONNECTION_TIMEOUT, tokio::net::TcpStream::connect(host)).await,
        Ok(Ok(_))
    )
}

/// Parse a duration string like "10s", "500ms", "1m". A bare number is
/// seconds; garbage falls back to `default`.
pub fn parse_duration(s: &str, default: Duration) -> Duration {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.parse().map(Duration::from_millis).unwrap_or(default)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.parse().map(Duration::from_secs).unwrap_or(default)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>()
            .map(|m| Duration::from_secs(m * 60))
            .unwrap_or(default)
    } else {
        s.parse().map(Duration::from_secs).unwrap_or(default)
    }
}

/// Free-form middleware config map, as declared under `config:` in YAML.
pub type ConfigMap = serde_json::Map<String, Value>;

/// String value at `key`, or `default` when absent/empty/not a string.
pub fn str_or(cfg: &ConfigMap, key: &str, default: &str) -> String {
    match cfg.get(key) {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        _ => default.to_string(),
    }
}

/// Float value at `key`, accepting numbers or numeric strings.
pub fn f64_or(cfg: &ConfigMap, key: &str, default: f64) -> f64 {
    match cfg.get(key) {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(default),
        Some(Value::String(s)) => s.parse().unwrap_or(default),
        _ => default,
    }
}

/// Integer value at `key`, accepting numbers or numeric strings.
pub fn i64_or(cfg: &ConfigMap, key: &str, default: i64) -> i64 {
    match cfg.get(key) {
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .unwrap_or(default),
        Some(Value::String(s)) => s.parse().unwrap_or(default),
        _ => default,
    }
}

/// Bool value at `key`, accepting bools or "true"/"false" strings.
pub fn bool_or(cfg: &ConfigMap, key: &str, default: bool) -> bool {
    match cfg.get(key) {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
        _ => default,
    }
}

/// String list at `key`: a JSON array of strings, or a comma-separated
/// string. Blank items are dropped.
pub fn string_list(cfg: &ConfigMap, key: &str) -> Vec<String> {
    match cfg.get(key) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        Some(Value::String(s)) => s
            .split(',')
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect(),
        _ => Vec::new(),
    }
}
