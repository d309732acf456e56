//! RPC server setup and connection handling.
//!
//! # Responsibilities
//! - Build the routing table, dispatcher and interceptor pipeline
//! - Bind the listener and run the accept loop
//! - Negotiate TLS (with a handshake timeout) or cleartext HTTP/2
//! - Serve each connection with its own stream limit
//! - Report transport faults and coordinate shutdown
//!
//! # Design Decisions
//! - One task per connection; hyper drives the streams of a connection and
//!   every call runs in its own task
//! - The handle owns every control surface (reset, recompose, shutdown), so
//!   the accept loop never needs to be reached directly

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::service::TowerToHyperService;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tower::Layer;
use tower_http::trace::TraceLayer;

use crate::config::ServerConfig;
use crate::dispatch::{BoxHandler, Dispatcher, ResetEpoch, RoutingError, RoutingTable, RoutingTableBuilder};
use crate::health::{self, HealthRegistry};
use crate::interceptor::builtin::{registry_from_config, BuiltinError};
use crate::interceptor::{CallPipeline, Interceptor, InterceptorRegistry};
use crate::lifecycle::{ShutdownCoordinator, ShutdownMode};
use crate::net::listener::ConnectionPermit;
use crate::net::{
    tls, ConnectionGuard, ConnectionTracker, Listener, ListenerError, PeerInfo, SecurityMode, StreamLimiter, TlsError,
};
use crate::observability::metrics;
use crate::reset::{ResetController, ResetError};

use super::service::{RpcService, ServiceSettings};

/// Faults kept for `take_faults` before new ones are dropped.
const FAULT_BUFFER: usize = 256;

/// Streams a connection may open beyond its admission limit.
///
/// Peers must be able to open the excess stream so `StreamLimiter` can
/// answer it with `RESOURCE_EXHAUSTED`; h2 would refuse it otherwise.
const STREAM_SETTINGS_HEADROOM: u32 = 32;

/// `SETTINGS_MAX_CONCURRENT_STREAMS` for a connection admitting `max_streams`.
fn advertised_streams(max_streams: u32) -> u32 {
    max_streams.saturating_add(STREAM_SETTINGS_HEADROOM)
}

/// Error starting the server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("invalid routing table: {0}")]
    Routing(#[from] RoutingError),

    #[error("invalid interceptor configuration: {0}")]
    Interceptor(#[from] BuiltinError),

    #[error("TLS setup failed: {0}")]
    Tls(#[from] TlsError),

    #[error(transparent)]
    Listener(#[from] ListenerError),
}

/// A transport or lifecycle fault observed while serving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerFault {
    /// `accept` failed; the loop keeps running.
    Accept(String),
    /// TLS negotiation failed or timed out; the connection was closed.
    Handshake { peer: SocketAddr, reason: String },
    /// An established connection ended with a protocol or I/O error.
    Connection { peer: SocketAddr, reason: String },
}

impl std::fmt::Display for ServerFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerFault::Accept(reason) => write!(f, "accept failed: {}", reason),
            ServerFault::Handshake { peer, reason } => write!(f, "handshake with {} failed: {}", peer, reason),
            ServerFault::Connection { peer, reason } => write!(f, "connection {} failed: {}", peer, reason),
        }
    }
}

/// Builder for an RPC server.
pub struct RpcServer {
    config: ServerConfig,
    routes: RoutingTableBuilder,
    interceptors: Vec<(String, i32, Arc<dyn Interceptor>)>,
    health: HealthRegistry,
}

impl RpcServer {
    /// Create a server with the given configuration and no routes.
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            routes: RoutingTable::builder(),
            interceptors: Vec::new(),
            health: HealthRegistry::new(),
        }
    }

    /// Initial routing table.
    pub fn routes(mut self, routes: RoutingTableBuilder) -> Self {
        self.routes = routes;
        self
    }

    /// Register an interceptor next to the configured ones.
    pub fn interceptor(mut self, name: impl Into<String>, priority: i32, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push((name.into(), priority, interceptor));
        self
    }

    /// Health registry the server will report through.
    pub fn health(&self) -> HealthRegistry {
        self.health.clone()
    }

    /// Bind and start serving.
    ///
    /// Returns once the socket is bound; connections are handled in the
    /// background until `ServerHandle::shutdown`.
    pub async fn listen(self) -> Result<ServerHandle, ServerError> {
        let RpcServer {
            config,
            routes,
            interceptors,
            health,
        } = self;

        let table = routes.build()?;
        let mut registry = registry_from_config(&config.interceptors)?;
        for (name, priority, interceptor) in interceptors {
            registry.register(name, priority, interceptor);
        }
        let acceptor = config.tls.as_ref().map(tls::build_acceptor).transpose()?;
        let listener = Listener::bind(&config.listener).await?;
        let local_addr = listener.local_addr().map_err(ListenerError::Bind)?;

        let dispatcher = Dispatcher::new(health::service::routes(health.clone()), table);
        let reset = ResetController::new(dispatcher.clone(), health.clone(), config.health.reset_policy);
        let terminal: BoxHandler = Arc::new(dispatcher);
        let pipeline = CallPipeline::new(registry.compose(Arc::clone(&terminal)));

        let shutdown = ShutdownCoordinator::new();
        let tracker = ConnectionTracker::new();
        let (faults_tx, faults_rx) = mpsc::channel(FAULT_BUFFER);

        let connections = Arc::new(ConnectionContext {
            settings: Arc::new(ServiceSettings::from_config(&config, shutdown.terminate_signal().clone())),
            pipeline: pipeline.clone(),
            acceptor,
            handshake_timeout: config.tls.as_ref().map(|t| t.handshake_timeout()).unwrap_or_default(),
            max_concurrent_streams: config.listener.max_concurrent_streams,
            shutdown: shutdown.clone(),
            tracker: tracker.clone(),
            faults: faults_tx,
        });

        tracing::info!(
            address = %local_addr,
            tls = connections.acceptor.is_some(),
            max_concurrent_streams = config.listener.max_concurrent_streams,
            interceptors = ?registry.names(),
            services = ?reset_services(&reset),
            "RPC server listening"
        );

        let accept_task = tokio::spawn(accept_loop(listener, connections));

        Ok(ServerHandle {
            local_addr,
            reset,
            health,
            pipeline,
            terminal,
            shutdown,
            tracker,
            grace_period: config.shutdown.grace_period(),
            faults: Mutex::new(Some(faults_rx)),
            accept_task: Mutex::new(Some(accept_task)),
        })
    }
}

fn reset_services(reset: &ResetController) -> Vec<String> {
    reset.dispatcher().current().table().services().into_iter().map(String::from).collect()
}

/// Control surface of a running server.
pub struct ServerHandle {
    local_addr: SocketAddr,
    reset: ResetController,
    health: HealthRegistry,
    pipeline: CallPipeline,
    terminal: BoxHandler,
    shutdown: ShutdownCoordinator,
    tracker: ConnectionTracker,
    grace_period: Duration,
    faults: Mutex<Option<mpsc::Receiver<ServerFault>>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn health(&self) -> &HealthRegistry {
        &self.health
    }

    pub fn reset_controller(&self) -> &ResetController {
        &self.reset
    }

    /// Replace the routing table without closing the listener.
    pub fn reset(&self, routes: RoutingTableBuilder) -> Result<ResetEpoch, ResetError> {
        self.reset.reset(routes)
    }

    pub fn epoch(&self) -> ResetEpoch {
        self.reset.epoch()
    }

    /// Swap the interceptor chain for calls that start from now on.
    pub fn recompose(&self, registry: &InterceptorRegistry) {
        self.pipeline.replace(registry.compose(Arc::clone(&self.terminal)));
        tracing::info!(interceptors = ?registry.names(), "Interceptor chain recomposed");
    }

    /// Fault stream; `None` after the first call.
    pub fn take_faults(&self) -> Option<mpsc::Receiver<ServerFault>> {
        self.faults.lock().take()
    }

    pub fn active_connections(&self) -> u64 {
        self.tracker.active_count()
    }

    /// Configured grace period for `ShutdownMode::Graceful`.
    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    /// Stop serving.
    ///
    /// Graceful shutdown stops accepting, sends GOAWAY and waits for open
    /// streams, escalating to a hard stop when `timeout` runs out.
    pub async fn shutdown(&self, mode: ShutdownMode) {
        tracing::info!(mode = ?mode, connections = self.tracker.active_count(), "Shutting down");
        // Ends Watch streams, which would otherwise hold connections open.
        self.health.shutdown();

        match mode {
            ShutdownMode::Graceful { timeout } => {
                self.shutdown.drain();
                if tokio::time::timeout(timeout, self.tracker.wait_until_idle()).await.is_err() {
                    tracing::warn!(
                        timeout_secs = timeout.as_secs_f64(),
                        remaining = self.tracker.active_count(),
                        "Grace period elapsed, terminating remaining connections"
                    );
                    self.shutdown.terminate();
                }
            }
            ShutdownMode::Hard => self.shutdown.terminate(),
        }

        let accept_task = self.accept_task.lock().take();
        if let Some(task) = accept_task {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Accept loop ended abnormally");
            }
        }
        self.tracker.wait_until_idle().await;
        tracing::info!("Server stopped");
    }
}

impl std::fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerHandle")
            .field("local_addr", &self.local_addr)
            .field("epoch", &self.reset.epoch())
            .field("active_connections", &self.tracker.active_count())
            .finish()
    }
}

/// Everything a connection task needs.
struct ConnectionContext {
    settings: Arc<ServiceSettings>,
    pipeline: CallPipeline,
    acceptor: Option<TlsAcceptor>,
    handshake_timeout: Duration,
    max_concurrent_streams: u32,
    shutdown: ShutdownCoordinator,
    tracker: ConnectionTracker,
    faults: mpsc::Sender<ServerFault>,
}

impl ConnectionContext {
    fn report(&self, fault: ServerFault) {
        // Lossy when nobody drains the channel.
        let _ = self.faults.try_send(fault);
    }
}

async fn accept_loop(listener: Listener, ctx: Arc<ConnectionContext>) {
    let drain = ctx.shutdown.drain_signal().clone();
    loop {
        let accepted = tokio::select! {
            _ = drain.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, remote_addr, permit)) => {
                let guard = ctx.tracker.track();
                metrics::set_active_connections(ctx.tracker.active_count());
                tokio::spawn(handle_connection(Arc::clone(&ctx), stream, remote_addr, permit, guard));
            }
            Err(ListenerError::Closed) => break,
            Err(e) => {
                tracing::warn!(error = %e, "Accept failed");
                ctx.report(ServerFault::Accept(e.to_string()));
                // Usually descriptor exhaustion; give open connections a moment.
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
    tracing::info!("Listener closed, no longer accepting connections");
}

async fn handle_connection(
    ctx: Arc<ConnectionContext>,
    stream: TcpStream,
    remote_addr: SocketAddr,
    _permit: ConnectionPermit,
    guard: ConnectionGuard,
) {
    let connection_id = guard.id();
    match &ctx.acceptor {
        None => {
            let peer = PeerInfo {
                remote_addr,
                connection_id,
                security: SecurityMode::Cleartext,
            };
            serve_http2(&ctx, stream, peer).await;
        }
        Some(acceptor) => {
            let handshake = tokio::time::timeout(ctx.handshake_timeout, acceptor.accept(stream)).await;
            let reason = match handshake {
                Ok(Ok(tls_stream)) => {
                    let session = tls::session_info(tls_stream.get_ref().1);
                    tracing::debug!(
                        connection_id = %connection_id,
                        protocol = %session.protocol_version,
                        cipher_suite = %session.cipher_suite,
                        client_authenticated = session.is_mutually_authenticated(),
                        "TLS handshake complete"
                    );
                    let peer = PeerInfo {
                        remote_addr,
                        connection_id,
                        security: SecurityMode::Tls(session),
                    };
                    serve_http2(&ctx, tls_stream, peer).await;
                    None
                }
                Ok(Err(e)) => Some(e.to_string()),
                Err(_) => Some("handshake timed out".to_string()),
            };
            if let Some(reason) = reason {
                tracing::warn!(connection_id = %connection_id, peer_addr = %remote_addr, reason = %reason, "TLS handshake failed");
                ctx.report(ServerFault::Handshake {
                    peer: remote_addr,
                    reason,
                });
            }
        }
    }

    drop(guard);
    metrics::set_active_connections(ctx.tracker.active_count());
}

async fn serve_http2<I>(ctx: &ConnectionContext, io: I, peer: PeerInfo)
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let connection_id = peer.connection_id;
    let remote_addr = peer.remote_addr;
    let streams = StreamLimiter::new(ctx.max_concurrent_streams as usize);
    let service = RpcService::new(Arc::clone(&ctx.settings), ctx.pipeline.clone(), peer, streams);
    let service = TowerToHyperService::new(TraceLayer::new_for_grpc().layer(service));

    let mut builder = hyper::server::conn::http2::Builder::new(TokioExecutor::new());
    builder
        .timer(TokioTimer::new())
        .max_concurrent_streams(advertised_streams(ctx.max_concurrent_streams));
    let connection = builder.serve_connection(TokioIo::new(io), service);
    tokio::pin!(connection);

    let drain = ctx.shutdown.drain_signal();
    let terminate = ctx.shutdown.terminate_signal();

    let result = tokio::select! {
        result = connection.as_mut() => Some(result),
        _ = drain.cancelled() => {
            tracing::debug!(connection_id = %connection_id, "Draining connection");
            connection.as_mut().graceful_shutdown();
            tokio::select! {
                result = connection.as_mut() => Some(result),
                _ = terminate.cancelled() => None,
            }
        }
    };

    match result {
        Some(Ok(())) => tracing::debug!(connection_id = %connection_id, "Connection finished"),
        Some(Err(e)) => {
            tracing::debug!(connection_id = %connection_id, error = %e, "Connection error");
            ctx.report(ServerFault::Connection {
                peer: remote_addr,
                reason: e.to_string(),
            });
        }
        None => tracing::debug!(connection_id = %connection_id, "Connection aborted by hard shutdown"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_leave_room_above_the_admission_limit() {
        assert_eq!(advertised_streams(1), 1 + STREAM_SETTINGS_HEADROOM);
        assert!(advertised_streams(10) > 10);
        assert_eq!(advertised_streams(u32::MAX), u32::MAX);
    }
}
