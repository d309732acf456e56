//! HTTP/2 protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP/TLS connection
//!     → server.rs (accept loop, TLS, hyper HTTP/2 connection)
//!     → TraceLayer (HTTP-level span)
//!     → service.rs (405/415, stream admission, encoding, deadline)
//!     → spawned call task → interceptor pipeline → dispatcher
//!     → body.rs (frame responses, grpc-status trailers)
//!     → Send to client
//! ```

pub mod body;
pub mod server;
pub mod service;

pub use body::RpcBody;
pub use server::{RpcServer, ServerError, ServerFault, ServerHandle};
pub use service::{RpcService, ServiceSettings};
