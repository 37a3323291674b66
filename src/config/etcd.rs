//! Etcd-backed upstream configuration — initial fetch plus watch.
//!
//! The key holds a JSON payload of the shape
//! `{"upstreams": [ <UpstreamConfig>, ... ]}`.

use crate::config::UpstreamConfig;
use crate::error::{GatewayError, Result};
use etcd_client::{Client, ConnectOptions, WatchOptions};
use serde::Deserialize;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const DIAL_TIMEOUT: Duration = Duration::from_secs(5);
const FETCH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct UpstreamsPayload {
    upstreams: Vec<UpstreamConfig>,
}

/// Wraps an etcd client for fetching and watching gateway upstreams.
#[derive(Clone)]
pub struct EtcdSource {
    client: Client,
}

impl EtcdSource {
    /// Connect to the etcd cluster.
    pub async fn connect(endpoints: &[String]) -> Result<Self> {
        let options = ConnectOptions::new().with_connect_timeout(DIAL_TIMEOUT);
        let client = Client::connect(endpoints, Some(options)).await?;
        Ok(Self { client })
    }

    /// Read the upstreams payload at `key`. Bounded by a 5 s timeout;
    /// callers treat any failure at startup as fatal.
    pub async fn fetch_upstreams(&mut self, key: &str) -> Result<Vec<UpstreamConfig>> {
        let resp = tokio::time::timeout(FETCH_TIMEOUT, self.client.get(key, None))
            .await
            .map_err(|_| GatewayError::Other(format!("etcd: fetch of {} timed out", key)))??;
        let kv = resp
            .kvs()
            .first()
            .ok_or_else(|| GatewayError::Other(format!("etcd: key {} not found", key)))?;
        parse_payload(kv.value())
    }

    /// Watch `key` and call `on_update` with each valid payload. Returns
    /// when the watch stream ends or `cancel` fires; the caller keeps
    /// serving on the last installed table either way.
    pub async fn watch_upstreams<F>(
        mut self,
        key: String,
        cancel: CancellationToken,
        on_update: F,
    ) -> Result<()>
    where
        F: Fn(Vec<UpstreamConfig>),
    {
        let (_watcher, mut stream) = self
            .client
            .watch(key.as_str(), Some(WatchOptions::new()))
            .await?;

        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                msg = stream.message() => msg?,
            };
            let Some(resp) = message else {
                return Err(GatewayError::Other("etcd watch closed".to_string()));
            };
            for event in resp.events() {
                let Some(kv) = event.kv() else { continue };
                if kv.value().is_empty() {
                    continue;
                }
                match parse_payload(kv.value()) {
                    Ok(upstreams) => on_update(upstreams),
                    Err(e) => {
                        tracing::warn!(key = %key, error = %e, "ignoring malformed etcd payload")
                    }
                }
            }
        }
    }
}

fn parse_payload(raw: &[u8]) -> Result<Vec<UpstreamConfig>> {
    let payload: UpstreamsPayload = serde_json::from_slice(raw)?;
    Ok(payload.upstreams)
}
