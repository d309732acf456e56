//! Routing reset subsystem.
//!
//! # Data Flow
//! ```text
//! ServerHandle::reset(builder) / SIGHUP reload
//!     → controller.rs
//!         → build table out of band (failure: nothing changes)
//!         → [transient_not_serving] affected services NOT_SERVING
//!         → Dispatcher::publish (ArcSwap, epoch + 1)
//!         → new services SERVING, removed services UNKNOWN
//!
//! In-flight calls:
//!     ResolvedRoute holds Arc<RoutingGeneration> until the call ends
//! ```

pub mod controller;

pub use controller::{ResetController, ResetError};
