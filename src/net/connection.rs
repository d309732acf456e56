//! Connection lifecycle tracking and per-connection stream admission.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing
//! - Track open connections so shutdown can wait for them to drain
//! - Bound the number of concurrently open streams per connection
//! - Describe the peer (address, negotiated security, client identity)

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use rustls::pki_types::CertificateDer;
use tokio::sync::watch;

/// Global atomic counter for connection IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Negotiated transport security of a connection.
#[derive(Debug, Clone)]
pub enum SecurityMode {
    /// HTTP/2 over cleartext TCP (prior knowledge).
    Cleartext,
    /// HTTP/2 over TLS.
    Tls(TlsSession),
}

/// Parameters of an established TLS session.
#[derive(Debug, Clone)]
pub struct TlsSession {
    /// e.g. `TLSv1_3`.
    pub protocol_version: String,
    /// e.g. `TLS13_AES_128_GCM_SHA256`.
    pub cipher_suite: String,
    /// Client certificate chain, leaf first. Empty unless the client authenticated.
    pub peer_certificates: Arc<Vec<CertificateDer<'static>>>,
}

impl TlsSession {
    /// True when the client presented a verified certificate.
    pub fn is_mutually_authenticated(&self) -> bool {
        !self.peer_certificates.is_empty()
    }
}

/// Who is on the other end of a stream.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub remote_addr: SocketAddr,
    pub connection_id: ConnectionId,
    pub security: SecurityMode,
}

impl PeerInfo {
    /// Verified client certificate chain, when mutually authenticated.
    pub fn identity(&self) -> Option<&[CertificateDer<'static>]> {
        match &self.security {
            SecurityMode::Tls(session) if session.is_mutually_authenticated() => {
                Some(session.peer_certificates.as_slice())
            }
            _ => None,
        }
    }
}

/// Tracks active connections for graceful shutdown.
///
/// The count is published on a watch channel so waiters wake on every change.
#[derive(Debug, Clone)]
pub struct ConnectionTracker {
    active: Arc<watch::Sender<u64>>,
}

impl ConnectionTracker {
    /// Create a new connection tracker.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Self { active: Arc::new(tx) }
    }

    /// Record a new active connection. Returns a guard that decrements on drop.
    pub fn track(&self) -> ConnectionGuard {
        self.active.send_modify(|count| *count += 1);
        ConnectionGuard {
            active: Arc::clone(&self.active),
            id: ConnectionId::new(),
        }
    }

    /// Get current active connection count.
    pub fn active_count(&self) -> u64 {
        *self.active.borrow()
    }

    /// Wait until all connections are closed.
    pub async fn wait_until_idle(&self) {
        let mut rx = self.active.subscribe();
        let _ = rx.wait_for(|count| *count == 0).await;
    }
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard that tracks a connection's lifetime.
/// Decrements active count when dropped.
#[derive(Debug)]
pub struct ConnectionGuard {
    active: Arc<watch::Sender<u64>>,
    id: ConnectionId,
}

impl ConnectionGuard {
    /// Get this connection's ID.
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.active.send_modify(|count| *count = count.saturating_sub(1));
        tracing::trace!(connection_id = %self.id, "Connection closed");
    }
}

/// Admission control for concurrently open streams on one connection.
#[derive(Debug, Clone)]
pub struct StreamLimiter {
    active: Arc<AtomicUsize>,
    max_streams: usize,
}

impl StreamLimiter {
    pub fn new(max_streams: usize) -> Self {
        Self {
            active: Arc::new(AtomicUsize::new(0)),
            max_streams,
        }
    }

    /// Claim a stream slot, or `None` when the connection is at its limit.
    ///
    /// The compare-and-swap loop keeps the bound exact under concurrent opens.
    pub fn try_acquire(&self) -> Option<StreamPermit> {
        let mut current = self.active.load(Ordering::Acquire);
        loop {
            if current >= self.max_streams {
                return None;
            }
            match self.active.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
        Some(StreamPermit {
            active: Arc::clone(&self.active),
        })
    }

    pub fn active_streams(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn max_streams(&self) -> usize {
        self.max_streams
    }
}

/// An open stream slot; released on drop.
#[derive(Debug)]
pub struct StreamPermit {
    active: Arc<AtomicUsize>,
}

impl Drop for StreamPermit {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}
