//! Health reporting subsystem.
//!
//! # Data Flow
//! ```text
//! Status producers:
//!     ResetController (services appear, disappear, swap window)
//!     ServerHandle::health().set_status(..) (operators)
//!     shutdown → everything NOT_SERVING
//!         → registry.rs (status map, overall status, subscriber queues)
//!
//! Status consumers:
//!     grpc.health.v1.Health/Check → service.rs → registry.check
//!     grpc.health.v1.Health/Watch → service.rs → registry.watch
//!         → one queue per subscriber, current status first
//! ```
//!
//! # Design Decisions
//! - Status is per service name; the empty name is the overall server
//! - Unknown names report UNKNOWN instead of an error
//! - Health routes are built in and survive every reset

pub mod proto;
pub mod registry;
pub mod service;

pub use registry::{HealthRegistry, HealthWatch, ServingStatus, OVERALL};

/// Fully-qualified name of the health service.
pub const HEALTH_SERVICE: &str = "grpc.health.v1.Health";
