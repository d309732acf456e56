//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept loop, connection limits)
//!     → tls.rs (optional TLS handshake, ALPN h2)
//!     → connection.rs (tracking, peer info, stream admission)
//!     → Hand off to HTTP/2 layer
//! ```
//!
//! # Design Decisions
//! - Bounded accept queue prevents resource exhaustion
//! - Each connection tracked for graceful shutdown
//! - TLS is optional; cleartext uses HTTP/2 prior knowledge

pub mod connection;
pub mod listener;
pub mod tls;

pub use connection::{
    ConnectionGuard, ConnectionId, ConnectionTracker, PeerInfo, SecurityMode, StreamLimiter, StreamPermit,
    TlsSession,
};
pub use listener::{Listener, ListenerError};
pub use tls::TlsError;
