//! Centralized error types for the gateway

use thiserror::Error;

/// Gateway error types
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Configuration file parsing or validation failed
    #[error("Configuration error: {0}")]
    Config(String),

    /// Requested load-balancing algorithm has no registered factory
    #[error("algorithm not supported: {0}")]
    UnsupportedAlgorithm(String),

    /// Middleware construction failed
    #[error("Middleware error: {0}")]
    Middleware(String),

    /// HTTP request to an upstream failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Etcd client error
    #[error("Etcd error: {0}")]
    Etcd(#[from] etcd_client::Error),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl GatewayError {
    /// Whether the error is an upstream timeout (maps to 504 at the proxy).
    pub fn is_upstream_timeout(&self) -> bool {
        matches!(self, GatewayError::Http(e) if e.is_timeout())
    }
}

/// Convenience Result type alias
pub type Result<T> = std::result::Result<T, GatewayError>;
