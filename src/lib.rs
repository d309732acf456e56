//! HTTP/2 RPC server library.
//!
//! Accepts cleartext or TLS HTTP/2 connections, runs every call through an
//! ordered interceptor chain into a dispatcher whose routing table can be
//! replaced while the server keeps serving, and reports serving status over
//! the standard health service.

pub mod client;
pub mod config;
pub mod dispatch;
pub mod echo;
pub mod health;
pub mod http;
pub mod interceptor;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod reset;
pub mod rpc;

pub use config::schema::ServerConfig;
pub use dispatch::{RoutingTable, RoutingTableBuilder};
pub use health::{HealthRegistry, ServingStatus};
pub use http::{RpcServer, ServerHandle};
pub use lifecycle::ShutdownMode;
pub use rpc::{Code, Status};
