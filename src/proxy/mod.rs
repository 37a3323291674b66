//! Reverse-proxy engine — forwards requests to upstream nodes
//!
//! One shared client carries every upstream request. The director step
//! stamps forwarded headers, rewrites scheme/host/path to the target node
//! and drops hop-by-hop headers in both directions.

use crate::balancer::Node;
use crate::error::Result;
use crate::middleware::RequestContext;
use bytes::Bytes;
use http::header::HeaderValue;
use http::{HeaderMap, Response};
use std::time::Duration;

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const KEEPALIVE: Duration = Duration::from_secs(30);
const MAX_IDLE_CONNS: usize = 100;
const IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// HTTP reverse proxy over a shared transport.
pub struct ProxyEngine {
    client: reqwest::Client,
}

impl ProxyEngine {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(DIAL_TIMEOUT)
            .tcp_keepalive(KEEPALIVE)
            .pool_max_idle_per_host(MAX_IDLE_CONNS)
            .pool_idle_timeout(IDLE_TIMEOUT)
            .build()?;
        Ok(Self { client })
    }

    /// Forward the request to `node` with `outgoing_path` (already
    /// rewritten). The original query string is preserved.
    pub async fn forward(
        &self,
        node: &Node,
        req: &http::request::Parts,
        body: Bytes,
        outgoing_path: &str,
        remote_ip: &str,
        ctx: &RequestContext,
    ) -> Result<Response<Vec<u8>>> {
        let path = if outgoing_path.starts_with('/') {
            outgoing_path.to_string()
        } else {
            format!("/{}", outgoing_path)
        };
        let url = match req.uri.query() {
            Some(query) => format!("{}://{}{}?{}", node.url.scheme(), node.host(), path, query),
            None => format!("{}://{}{}", node.url.scheme(), node.host(), path),
        };

        let headers = self.direct_headers(&req.headers, remote_ip, ctx);

        let response = self
            .client
            .request(req.method.clone(), &url)
            .headers(headers)
            .body(body)
            .send()
            .await?;

        let status = response.status();
        let mut builder = Response::builder().status(status);
        if let Some(headers) = builder.headers_mut() {
            for (name, value) in response.headers() {
                if !is_hop_by_hop(name.as_str()) && name != http::header::CONTENT_LENGTH {
                    headers.append(name.clone(), value.clone());
                }
            }
        }
        let bytes = response.bytes().await?;
        Ok(builder
            .body(bytes.to_vec())
            .unwrap_or_else(|_| Response::new(Vec::new())))
    }

    /// Director: copy end-to-end headers and stamp the forwarded set. The
    /// Host header is dropped so the client derives it from the target URL.
    fn direct_headers(
        &self,
        inbound: &HeaderMap,
        remote_ip: &str,
        ctx: &RequestContext,
    ) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in inbound {
            if is_hop_by_hop(name.as_str()) || name == http::header::HOST {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }

        if !headers.contains_key("x-forwarded-host") {
            if let Some(host) = ctx.host.as_deref() {
                if let Ok(v) = HeaderValue::from_str(host) {
                    headers.insert("x-forwarded-host", v);
                }
            }
        }
        if !headers.contains_key("x-forwarded-proto") {
            // The gateway itself only terminates plain HTTP.
            headers.insert("x-forwarded-proto", HeaderValue::from_static("http"));
        }
        if !remote_ip.is_empty() {
            let forwarded = match headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
                Some(prior) if !prior.is_empty() => format!("{}, {}", prior, remote_ip),
                _ => remote_ip.to_string(),
            };
            if let Ok(v) = HeaderValue::from_str(&forwarded) {
                headers.insert("x-forwarded-for", v);
            }
        }
        if let Some(request_id) = ctx.request_id.as_deref() {
            if let Ok(v) = HeaderValue::from_str(request_id) {
                headers.insert("x-request-id", v);
            }
        }

        headers
    }
}

/// Hop-by-hop headers are consumed by each hop and never forwarded.
fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}
