//! Configuration types for the gateway
//!
//! Defines the global / middlewares / upstreams / config_source schema and
//! file loading. YAML is the primary format; TOML is accepted by extension.

pub mod etcd;

use crate::error::{GatewayError, Result};
use crate::util::ConfigMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Top-level gateway configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Listener and process-wide settings
    #[serde(default)]
    pub global: GlobalConfig,

    /// Global middlewares, keyed by registered name
    #[serde(default)]
    pub middlewares: HashMap<String, MiddlewareConfig>,

    /// Upstream services with their routes
    #[serde(default)]
    pub upstreams: Vec<UpstreamConfig>,

    /// Where upstream configuration comes from
    #[serde(default)]
    pub config_source: ConfigSource,
}

/// Process-wide settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// Address the gateway listens on
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Duration string, applied as the HTTP/1 header read timeout
    #[serde(default)]
    pub read_timeout: Option<String>,

    /// Duration string; retained for symmetry with read_timeout
    #[serde(default)]
    pub write_timeout: Option<String>,

    /// Peers whose X-Forwarded-For is honored
    #[serde(default = "default_trusted_proxies")]
    pub trusted_proxies: Vec<String>,

    /// Duration string between health-check probe rounds
    #[serde(default = "default_health_interval")]
    pub health_check_interval: String,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            read_timeout: None,
            write_timeout: None,
            trusted_proxies: default_trusted_proxies(),
            health_check_interval: default_health_interval(),
        }
    }
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_trusted_proxies() -> Vec<String> {
    vec!["127.0.0.1".to_string(), "::1".to_string()]
}

fn default_health_interval() -> String {
    "30s".to_string()
}

/// A global middleware declaration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MiddlewareConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Position in the global chain; lower runs first
    #[serde(default)]
    pub order: i32,

    /// Free-form settings handed to the middleware factory
    #[serde(default)]
    pub config: ConfigMap,
}

/// A single route under an upstream
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Path pattern, e.g. "/api/users/**" or "/health"
    pub path: String,

    /// Allowed methods; empty means any
    #[serde(default)]
    pub methods: Vec<String>,

    /// Optional prefix replacement for the outgoing path
    #[serde(default)]
    pub rewrite: Option<String>,

    /// Route-local middleware declarations, in execution order
    #[serde(default)]
    pub middlewares: Vec<RouteMiddlewareConfig>,
}

/// A route-local middleware declaration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouteMiddlewareConfig {
    pub name: String,
    #[serde(default)]
    pub config: ConfigMap,
}

/// An upstream service
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub name: String,

    /// "http" or "https"; host-only entries inherit this
    #[serde(default)]
    pub scheme: String,

    /// "host:port" or full URLs
    #[serde(default)]
    pub hosts: Vec<String>,

    /// round_robin | consistent_hash | p2c
    #[serde(default)]
    pub load_balancing: String,

    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

/// Where upstream configuration is sourced from
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSource {
    /// "file" or "etcd"
    #[serde(rename = "type", default = "default_source_type")]
    pub source_type: String,

    #[serde(default)]
    pub file_path: String,

    #[serde(default)]
    pub etcd: EtcdConfig,
}

impl Default for ConfigSource {
    fn default() -> Self {
        Self {
            source_type: default_source_type(),
            file_path: String::new(),
            etcd: EtcdConfig::default(),
        }
    }
}

fn default_source_type() -> String {
    "file".to_string()
}

/// Etcd connection settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EtcdConfig {
    #[serde(default)]
    pub endpoints: Vec<String>,

    /// Key holding the JSON upstreams payload
    #[serde(default)]
    pub key: String,

    /// Keep a watch on the key after the initial fetch
    #[serde(default)]
    pub watch: bool,
}

impl GatewayConfig {
    /// Load configuration from a file, auto-detecting format by extension.
    ///
    /// `.yaml`/`.yml` parse as YAML (the default for unknown extensions),
    /// `.toml` as TOML.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Self::from_toml(&content),
            _ => Self::from_yaml(&content),
        }
    }

    /// Parse configuration from a YAML string
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| GatewayError::Config(format!("YAML parse error: {}", e)))
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| GatewayError::Config(format!("TOML parse error: {}", e)))
    }
}
