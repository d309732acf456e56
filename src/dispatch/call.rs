//! Per-call state handed to interceptors and handlers.
//!
//! # Responsibilities
//! - Carry the request context (route, metadata, peer, deadline, cancellation)
//! - Expose the inbound message sequence of the stream
//! - Provide the outbound `MessageSink`, bounded by the stream's buffer

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use http::HeaderMap;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::lifecycle::CancelSignal;
use crate::net::connection::PeerInfo;
use crate::rpc::{Status, Streaming};

/// Generation number of a published routing table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ResetEpoch(u64);

impl ResetEpoch {
    pub const INITIAL: ResetEpoch = ResetEpoch(0);

    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for ResetEpoch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Everything known about a call besides its messages.
#[derive(Debug)]
pub struct RequestContext {
    service: String,
    method: String,
    metadata: HeaderMap,
    peer: Option<PeerInfo>,
    deadline: Option<Instant>,
    epoch: Option<ResetEpoch>,
    cancel: CancelSignal,
    extensions: http::Extensions,
}

impl RequestContext {
    pub fn new(service: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            method: method.into(),
            metadata: HeaderMap::new(),
            peer: None,
            deadline: None,
            epoch: None,
            cancel: CancelSignal::new(),
            extensions: http::Extensions::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: HeaderMap) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_peer(mut self, peer: PeerInfo) -> Self {
        self.peer = Some(peer);
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_cancel_signal(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// `/service/method`, as it appears on the wire.
    pub fn path(&self) -> String {
        format!("/{}/{}", self.service, self.method)
    }

    /// Request headers, minus HTTP/2 pseudo-headers.
    pub fn metadata(&self) -> &HeaderMap {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut HeaderMap {
        &mut self.metadata
    }

    pub fn peer(&self) -> Option<&PeerInfo> {
        self.peer.as_ref()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Tighten the deadline. A later deadline than the current one is ignored.
    pub fn set_deadline(&mut self, deadline: Instant) {
        self.deadline = Some(match self.deadline {
            Some(current) => current.min(deadline),
            None => deadline,
        });
    }

    /// Epoch of the routing generation serving this call. Set on resolution.
    pub fn epoch(&self) -> Option<ResetEpoch> {
        self.epoch
    }

    pub(crate) fn set_epoch(&mut self, epoch: ResetEpoch) {
        self.epoch = Some(epoch);
    }

    /// Fires when the peer resets the stream, the deadline passes or the
    /// server terminates.
    pub fn cancel_signal(&self) -> &CancelSignal {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn extensions(&self) -> &http::Extensions {
        &self.extensions
    }

    pub fn extensions_mut(&mut self) -> &mut http::Extensions {
        &mut self.extensions
    }
}

/// An inbound call: context plus the request message sequence.
#[derive(Debug)]
pub struct Call {
    context: RequestContext,
    inbound: Streaming,
}

impl Call {
    pub fn new(context: RequestContext, inbound: Streaming) -> Self {
        Self { context, inbound }
    }

    pub fn context(&self) -> &RequestContext {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut RequestContext {
        &mut self.context
    }

    pub fn inbound_mut(&mut self) -> &mut Streaming {
        &mut self.inbound
    }

    pub(crate) fn replace_inbound(&mut self, inbound: Streaming) -> Streaming {
        std::mem::replace(&mut self.inbound, inbound)
    }

    pub fn into_parts(self) -> (RequestContext, Streaming) {
        (self.context, self.inbound)
    }
}

/// One item on a stream's outbound queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// A response message, not yet framed.
    Message(Bytes),
    /// Terminal status; nothing follows it.
    Close(Status),
}

/// Outbound half of a stream as seen by a handler.
///
/// `send` waits while the stream's buffer is full, which is how slow readers
/// push back on handlers.
#[derive(Debug)]
pub struct MessageSink {
    tx: mpsc::Sender<Outbound>,
    limit: Option<usize>,
    sent: Arc<AtomicUsize>,
}

impl MessageSink {
    /// A sink and the receiving end of its queue.
    pub fn channel(capacity: usize) -> (MessageSink, MessageReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let sink = MessageSink {
            tx,
            limit: None,
            sent: Arc::new(AtomicUsize::new(0)),
        };
        (sink, MessageReceiver { rx })
    }

    /// Queue one response message.
    pub async fn send(&mut self, message: impl Into<Bytes>) -> Result<(), Status> {
        if let Some(limit) = self.limit {
            if self.sent.load(Ordering::Acquire) >= limit {
                return Err(Status::internal(format!(
                    "call permits only {} response message(s)",
                    limit
                )));
            }
        }
        self.tx
            .send(Outbound::Message(message.into()))
            .await
            .map_err(|_| Status::cancelled("stream closed by peer"))?;
        self.sent.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Number of messages queued so far.
    pub fn sent(&self) -> usize {
        self.sent.load(Ordering::Acquire)
    }

    /// True once the receiving side is gone.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub(crate) fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub(crate) fn sent_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.sent)
    }

    /// A handle that can terminate the stream after the handler is done.
    pub(crate) fn closer(&self) -> StreamCloser {
        StreamCloser { tx: self.tx.clone() }
    }
}

/// Sends the terminal status once the pipeline for a stream has finished.
#[derive(Debug, Clone)]
pub(crate) struct StreamCloser {
    tx: mpsc::Sender<Outbound>,
}

impl StreamCloser {
    pub(crate) async fn close(self, status: Status) {
        // A closed receiver means the peer is gone; nobody is left to tell.
        let _ = self.tx.send(Outbound::Close(status)).await;
    }
}

/// Receiving end of a `MessageSink`.
#[derive(Debug)]
pub struct MessageReceiver {
    rx: mpsc::Receiver<Outbound>,
}

impl MessageReceiver {
    pub async fn recv(&mut self) -> Option<Outbound> {
        self.rx.recv().await
    }

    pub(crate) fn poll_recv(&mut self, cx: &mut std::task::Context<'_>) -> std::task::Poll<Option<Outbound>> {
        self.rx.poll_recv(cx)
    }

    /// Drain queued items until `Close`, returning messages and status.
    pub async fn collect(mut self) -> (Vec<Bytes>, Option<Status>) {
        let mut messages = Vec::new();
        while let Some(item) = self.rx.recv().await {
            match item {
                Outbound::Message(message) => messages.push(message),
                Outbound::Close(status) => return (messages, Some(status)),
            }
        }
        (messages, None)
    }
}
