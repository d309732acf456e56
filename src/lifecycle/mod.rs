//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Shutdown (shutdown.rs):
//!     ServerHandle::shutdown(mode)
//!     → drain: stop accepting, GOAWAY, wait for streams
//!     → terminate: cancel calls, abort connections
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → graceful shutdown (second one → hard)
//!     SIGHUP → reload config and reset the routing table
//!
//! Cancellation (cancel.rs):
//!     per-call latch, fired by peer reset, deadline or terminate
//! ```
//!
//! # Design Decisions
//! - Ordered shutdown: stop accept, drain, close
//! - Shutdown has timeout: forced termination after deadline

pub mod cancel;
pub mod shutdown;
pub mod signals;

pub use cancel::CancelSignal;
pub use shutdown::{ShutdownCoordinator, ShutdownMode};
