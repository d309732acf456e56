//! Call dispatch subsystem.
//!
//! # Data Flow
//! ```text
//! Decoded stream (Call + MessageSink)
//!     → interceptor chain
//!     → dispatcher.rs (resolve against the live generation)
//!         → builtin health table, then the published table
//!         → miss: NOT_FOUND, no handler runs
//!     → handler.rs (backend handler, panic-isolated)
//!     → MessageSink → response frames → trailers
//! ```
//!
//! # Design Decisions
//! - Tables are immutable; changing routes means publishing a new generation
//! - Cardinality of unary and half-streaming calls is enforced here, not by handlers

pub mod call;
pub mod dispatcher;
pub mod handler;
pub mod table;

pub use call::{Call, MessageReceiver, MessageSink, Outbound, RequestContext, ResetEpoch};
pub use dispatcher::{Dispatcher, ResolvedRoute, RoutingGeneration};
pub use handler::{handler_fn, BoxHandler, Handler};
pub use table::{CallKind, Route, RouteIssue, RoutingError, RoutingTable, RoutingTableBuilder};
