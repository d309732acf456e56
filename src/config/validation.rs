//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (limits > 0, addresses parse)
//! - Check TLS settings are coherent (client auth needs a CA bundle)
//! - Detect interceptor name clashes
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ServerConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system
//! - File existence is left to TLS loading, which reports the path

use std::collections::HashSet;
use std::net::SocketAddr;

use crate::config::schema::{ClientAuth, InterceptorKind, ServerConfig};

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Check a parsed configuration.
pub fn validate_config(config: &ServerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "listener.bind_address",
            format!("not a socket address: {}", config.listener.bind_address),
        ));
    }
    if config.listener.max_connections == 0 {
        errors.push(ValidationError::new("listener.max_connections", "must be greater than 0"));
    }
    if config.listener.max_concurrent_streams == 0 {
        errors.push(ValidationError::new(
            "listener.max_concurrent_streams",
            "must be greater than 0",
        ));
    }

    if let Some(tls) = &config.tls {
        if tls.client_auth != ClientAuth::None && tls.root_ca_path.is_none() {
            errors.push(ValidationError::new(
                "tls.root_ca_path",
                "required when client_auth is verify_if_given or require",
            ));
        }
        if tls.handshake_timeout_secs == 0 {
            errors.push(ValidationError::new("tls.handshake_timeout_secs", "must be greater than 0"));
        }
    }

    if config.limits.max_recv_msg_size == 0 {
        errors.push(ValidationError::new("limits.max_recv_msg_size", "must be greater than 0"));
    }
    if config.limits.max_send_msg_size == 0 {
        errors.push(ValidationError::new("limits.max_send_msg_size", "must be greater than 0"));
    }
    if config.limits.outbound_buffer == 0 {
        errors.push(ValidationError::new("limits.outbound_buffer", "must be greater than 0"));
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("not a socket address: {}", config.observability.metrics_address),
        ));
    }

    let mut names = HashSet::new();
    for (index, interceptor) in config.interceptors.iter().enumerate() {
        let field = format!("interceptors[{}]", index);
        if !names.insert(interceptor.name()) {
            errors.push(ValidationError::new(
                &field,
                format!("duplicate interceptor name {}", interceptor.name()),
            ));
        }
        match interceptor.kind {
            InterceptorKind::Auth if interceptor.token.as_deref().unwrap_or("").is_empty() => {
                errors.push(ValidationError::new(format!("{}.token", field), "required for auth"));
            }
            InterceptorKind::Deadline if interceptor.default_timeout_ms == Some(0) => {
                errors.push(ValidationError::new(
                    format!("{}.default_timeout_ms", field),
                    "must be greater than 0",
                ));
            }
            _ => {}
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
