//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the server.
//! All types derive Serde traits for deserialization from config files.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration for the RPC server.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    /// Listener configuration (bind address, limits).
    pub listener: ListenerConfig,

    /// TLS settings. Cleartext HTTP/2 when absent.
    pub tls: Option<TlsConfig>,

    /// Message size and buffering limits.
    pub limits: LimitsConfig,

    /// Message compression.
    pub compression: CompressionConfig,

    /// Health reporting.
    pub health: HealthConfig,

    /// Shutdown behaviour.
    pub shutdown: ShutdownConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Interceptor chain, in configuration order.
    pub interceptors: Vec<InterceptorConfig>,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:9001").
    pub bind_address: String,

    /// Maximum concurrent connections (backpressure).
    pub max_connections: usize,

    /// Maximum concurrently open streams per connection.
    pub max_concurrent_streams: u32,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:9001".to_string(),
            max_connections: 10_000,
            max_concurrent_streams: 10,
        }
    }
}

/// Lowest TLS protocol version accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
pub enum TlsVersion {
    #[serde(rename = "1.2")]
    #[default]
    Tls12,
    #[serde(rename = "1.3")]
    Tls13,
}

/// Client certificate policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ClientAuth {
    /// Never ask for a client certificate.
    #[default]
    None,
    /// Verify a certificate when the client sends one.
    VerifyIfGiven,
    /// Refuse clients without a valid certificate.
    Require,
}

/// TLS configuration for the listener.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Path to certificate chain file (PEM).
    pub cert_path: PathBuf,

    /// Path to private key file (PEM).
    pub key_path: PathBuf,

    /// CA bundle used to verify client certificates (PEM).
    #[serde(default)]
    pub root_ca_path: Option<PathBuf>,

    #[serde(default)]
    pub client_auth: ClientAuth,

    #[serde(default)]
    pub min_version: TlsVersion,

    /// Allowed cipher suites by IANA-style name (e.g.
    /// "TLS13_AES_128_GCM_SHA256"). Empty means the provider defaults.
    #[serde(default)]
    pub cipher_suites: Vec<String>,

    /// Handshake timeout in seconds.
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
}

fn default_handshake_timeout() -> u64 {
    10
}

impl TlsConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

/// Per-message limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Largest inbound message in bytes (after decompression).
    pub max_recv_msg_size: usize,

    /// Largest outbound message in bytes (after compression).
    pub max_send_msg_size: usize,

    /// Outbound messages buffered per stream before handlers wait.
    pub outbound_buffer: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_recv_msg_size: 4 * 1024 * 1024,
            max_send_msg_size: 4 * 1024 * 1024,
            outbound_buffer: 16,
        }
    }
}

/// Message compression codecs.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// Codecs accepted and offered, in preference order.
    pub enabled: Vec<crate::rpc::Encoding>,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: vec![crate::rpc::Encoding::Gzip, crate::rpc::Encoding::Deflate],
        }
    }
}

/// How a reset is reflected in health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResetHealthPolicy {
    /// No observable gap: services stay SERVING across the swap.
    #[default]
    Atomic,
    /// Services report NOT_SERVING while the swap is in progress.
    TransientNotServing,
}

/// Health reporting configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct HealthConfig {
    pub reset_policy: ResetHealthPolicy,
}

/// Shutdown configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Time in-flight streams get to finish before they are cancelled.
    pub grace_period_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self { grace_period_secs: 30 }
    }
}

impl ShutdownConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}

/// Built-in interceptor types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InterceptorKind {
    RequestId,
    Logging,
    Metrics,
    Deadline,
    Auth,
}

impl InterceptorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InterceptorKind::RequestId => "request_id",
            InterceptorKind::Logging => "logging",
            InterceptorKind::Metrics => "metrics",
            InterceptorKind::Deadline => "deadline",
            InterceptorKind::Auth => "auth",
        }
    }
}

/// One entry of the interceptor chain.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InterceptorConfig {
    pub kind: InterceptorKind,

    /// Registry name; defaults to the kind.
    #[serde(default)]
    pub name: Option<String>,

    /// Lower runs earlier (outermost). Ties keep configuration order.
    #[serde(default)]
    pub priority: i32,

    /// Bearer token for `auth`.
    #[serde(default)]
    pub token: Option<String>,

    /// Deadline applied by `deadline` when the client sent none.
    #[serde(default)]
    pub default_timeout_ms: Option<u64>,
}

impl InterceptorConfig {
    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or(self.kind.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_uses_defaults() {
        let config: ServerConfig = toml::from_str("").unwrap();
        assert_eq!(config.listener.bind_address, "127.0.0.1:9001");
        assert_eq!(config.listener.max_concurrent_streams, 10);
        assert!(config.tls.is_none());
        assert_eq!(config.health.reset_policy, ResetHealthPolicy::Atomic);
        assert_eq!(config.compression.enabled.len(), 2);
    }

    #[test]
    fn full_config_parses() {
        let config: ServerConfig = toml::from_str(
            r#"
            [listener]
            bind_address = "0.0.0.0:50051"
            max_concurrent_streams = 100

            [tls]
            cert_path = "server.pem"
            key_path = "server.key"
            root_ca_path = "ca.pem"
            client_auth = "require"
            min_version = "1.3"
            cipher_suites = ["TLS13_AES_256_GCM_SHA384"]

            [compression]
            enabled = ["gzip"]

            [health]
            reset_policy = "transient_not_serving"

            [observability]
            log_format = "json"

            [[interceptors]]
            kind = "auth"
            token = "secret"
            priority = -1

            [[interceptors]]
            kind = "logging"
            "#,
        )
        .unwrap();

        let tls = config.tls.unwrap();
        assert_eq!(tls.client_auth, ClientAuth::Require);
        assert_eq!(tls.min_version, TlsVersion::Tls13);
        assert_eq!(tls.handshake_timeout_secs, 10);
        assert_eq!(config.health.reset_policy, ResetHealthPolicy::TransientNotServing);
        assert_eq!(config.observability.log_format, LogFormat::Json);
        assert_eq!(config.interceptors.len(), 2);
        assert_eq!(config.interceptors[0].name(), "auth");
        assert_eq!(config.interceptors[0].priority, -1);
    }
}
