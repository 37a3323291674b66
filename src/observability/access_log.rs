//! Structured access log — JSON entries through a bounded async sink
//!
//! Producers hand finished entries to a bounded channel without blocking;
//! when the channel is full the entry is dropped and counted. A single
//! consumer serializes entries as JSON lines.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

pub const DEFAULT_BUFFER_SIZE: usize = 1024;

/// A single structured request log entry. Optional fields are omitted from
/// the JSON output when unset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub client_ip: String,
    pub http_method: String,
    pub http_path: String,
    pub http_status: u16,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route_prefix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream_node: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Async log sink: bounded channel, non-blocking producer, one consumer.
#[derive(Clone)]
pub struct AccessLogService {
    tx: mpsc::Sender<Entry>,
    dropped: Arc<AtomicU64>,
}

impl AccessLogService {
    /// Start the consumer task and return the producer handle.
    pub fn start(buffer_size: usize) -> Self {
        let size = if buffer_size == 0 {
            DEFAULT_BUFFER_SIZE
        } else {
            buffer_size
        };
        let (tx, mut rx) = mpsc::channel::<Entry>(size);
        tokio::spawn(async move {
            while let Some(entry) = rx.recv().await {
                match serde_json::to_string(&entry) {
                    Ok(line) => tracing::info!(target: "access_log", "{}", line),
                    Err(e) => tracing::error!(error = %e, "failed to serialize log entry"),
                }
            }
        });
        Self {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Enqueue an entry without blocking. A full channel drops the entry.
    pub fn log(&self, entry: Entry) {
        if let Err(mpsc::error::TrySendError::Full(_)) = self.tx.try_send(entry) {
            let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::warn!(dropped_total = total, "log channel full, dropping entry");
        }
    }

    /// Number of entries dropped because the channel was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(status: u16) -> Entry {
        Entry {
            timestamp: Utc::now(),
            level: "info".to_string(),
            client_ip: "127.0.0.1".to_string(),
            http_method: "GET".to_string(),
            http_path: "/api/x".to_string(),
            http_status: status,
            latency_ms: 3,
            user_agent: None,
            request_id: "req-1".to_string(),
            route_prefix: None,
            upstream_name: None,
            upstream_node: None,
            user_id: None,
            error: None,
        }
    }

    #[test]
    fn test_entry_omits_unset_optionals() {
        let json = serde_json::to_string(&entry(200)).unwrap();
        assert!(json.contains("\"http_status\":200"));
        assert!(json.contains("\"request_id\":\"req-1\""));
        assert!(!json.contains("route_prefix"));
        assert!(!json.contains("upstream_name"));
        assert!(!json.contains("error"));
    }

    #[test]
    fn test_entry_includes_set_optionals() {
        let mut e = entry(502);
        e.route_prefix = Some("/api/".to_string());
        e.upstream_name = Some("users".to_string());
        e.error = Some("connect refused".to_string());
        let json = serde_json::to_string(&e).unwrap();
        assert!(json.contains("\"route_prefix\":\"/api/\""));
        assert!(json.contains("\"upstream_name\":\"users\""));
        assert!(json.contains("\"error\":\"connect refused\""));
    }

    #[tokio::test]
    async fn test_log_accepts_entries() {
        let service = AccessLogService::start(4);
        service.log(entry(200));
        assert_eq!(service.dropped(), 0);
    }

    #[tokio::test]
    async fn test_full_channel_drops_and_counts() {
        // No consumer attached, so the channel stays full after one send.
        let (tx, _rx) = mpsc::channel::<Entry>(1);
        let service = AccessLogService {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        };
        service.log(entry(200));
        service.log(entry(200));
        service.log(entry(200));
        assert_eq!(service.dropped(), 2);
    }
}
