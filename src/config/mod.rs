//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML/JSON)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → ServerConfig (validated, immutable)
//!     → RpcServer::new
//!
//! On reload signal (SIGHUP):
//!     loader.rs loads the file again
//!     → validation.rs validates
//!     → interceptors recomposed, routing table reset
//!     → listener settings keep their startup values
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require full reload
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, ConfigError};
pub use schema::{
    ClientAuth, CompressionConfig, HealthConfig, InterceptorConfig, InterceptorKind, LimitsConfig,
    ListenerConfig, LogFormat, ObservabilityConfig, ResetHealthPolicy, ServerConfig, ShutdownConfig,
    TlsConfig, TlsVersion,
};
