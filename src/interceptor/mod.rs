//! Interceptor subsystem.
//!
//! # Data Flow
//! ```text
//! [[interceptors]] config ──→ builtin.rs ──┐
//! RpcServer::interceptor(..) ──────────────┤
//!                                          ▼
//!                      registry.rs (ordered by priority, then sequence)
//!                                          │ compose
//!                                          ▼
//!     chain.rs: first ─→ second ─→ ... ─→ Dispatcher (terminal)
//!                                          │
//!                      CallPipeline (ArcSwap, replaced on recompose)
//! ```
//!
//! # Design Decisions
//! - Ordering never depends on map iteration order
//! - In-flight calls keep the chain they entered

pub mod builtin;
pub mod chain;
pub mod registry;

pub use chain::{compose, interceptor_fn, CallPipeline, Interceptor};
pub use registry::InterceptorRegistry;
