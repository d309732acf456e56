//! Per-connection tower service that turns HTTP/2 requests into calls.
//!
//! # Responsibilities
//! - Reject non-RPC requests at the HTTP level (405, 415)
//! - Admit streams against the connection's concurrency limit
//! - Negotiate message compression and the call deadline
//! - Run each call in its own task and stream the outcome back
//!
//! # Design Decisions
//! - The service answers immediately; the call runs in a spawned task that
//!   feeds the response body through a bounded queue
//! - Rejections before dispatch are trailers-only responses

use std::convert::Infallible;
use std::future::{ready, Ready};
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use http::header::{ALLOW, CONTENT_TYPE, TE};
use http::{HeaderMap, HeaderValue, Method, Request, Response, StatusCode};
use http_body::Body;
use tokio::time::Instant;

use crate::config::ServerConfig;
use crate::dispatch::{Call, MessageSink, RequestContext};
use crate::interceptor::CallPipeline;
use crate::lifecycle::CancelSignal;
use crate::net::{PeerInfo, StreamLimiter};
use crate::rpc::codec::BoxError;
use crate::rpc::compression::{GRPC_ACCEPT_ENCODING, GRPC_ENCODING};
use crate::rpc::timeout::{request_timeout, GRPC_TIMEOUT};
use crate::rpc::{is_rpc_content_type, EncodingSet, Status, Streaming, CONTENT_TYPE as RPC_CONTENT_TYPE};

use super::body::RpcBody;

/// Request headers that describe the transport rather than the call.
const TRANSPORT_HEADERS: [&str; 3] = [GRPC_ENCODING, GRPC_ACCEPT_ENCODING, GRPC_TIMEOUT];

/// Settings shared by every stream of every connection.
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub encodings: EncodingSet,
    pub max_recv_msg_size: usize,
    pub max_send_msg_size: usize,
    pub outbound_buffer: usize,
    /// Fired on hard shutdown; running calls end with `UNAVAILABLE`.
    pub terminate: CancelSignal,
}

impl ServiceSettings {
    pub fn from_config(config: &ServerConfig, terminate: CancelSignal) -> Self {
        Self {
            encodings: EncodingSet::new(config.compression.enabled.iter().copied()),
            max_recv_msg_size: config.limits.max_recv_msg_size,
            max_send_msg_size: config.limits.max_send_msg_size,
            outbound_buffer: config.limits.outbound_buffer,
            terminate,
        }
    }
}

/// Serves the streams of one connection.
#[derive(Clone)]
pub struct RpcService {
    settings: Arc<ServiceSettings>,
    pipeline: CallPipeline,
    peer: PeerInfo,
    streams: StreamLimiter,
}

impl RpcService {
    pub fn new(settings: Arc<ServiceSettings>, pipeline: CallPipeline, peer: PeerInfo, streams: StreamLimiter) -> Self {
        Self {
            settings,
            pipeline,
            peer,
            streams,
        }
    }

    fn handle<B>(&self, request: Request<B>) -> Response<RpcBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        if request.method() != Method::POST {
            let mut response = plain(StatusCode::METHOD_NOT_ALLOWED);
            response.headers_mut().insert(ALLOW, HeaderValue::from_static("POST"));
            return response;
        }

        let content_type = request
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if !is_rpc_content_type(content_type) {
            return plain(StatusCode::UNSUPPORTED_MEDIA_TYPE);
        }

        let Some(permit) = self.streams.try_acquire() else {
            tracing::debug!(
                connection_id = %self.peer.connection_id,
                max_streams = self.streams.max_streams(),
                "Stream rejected, connection at its limit"
            );
            crate::observability::metrics::record_stream_rejected();
            return trailers_only(Status::resource_exhausted(format!(
                "connection allows at most {} concurrent streams",
                self.streams.max_streams()
            )));
        };

        let Some((service, method)) = parse_path(request.uri().path()).map(|(s, m)| (s.to_owned(), m.to_owned())) else {
            return trailers_only(Status::not_found(format!("malformed method path {}", request.uri().path())));
        };

        let request_encoding = match self.settings.encodings.request_encoding(request.headers()) {
            Ok(encoding) => encoding,
            Err(status) => {
                let mut response = trailers_only(status);
                self.advertise_encodings(response.headers_mut());
                return response;
            }
        };
        let response_encoding = self
            .settings
            .encodings
            .response_encoding(request_encoding, request.headers());
        let deadline = request_timeout(request.headers()).map(|timeout| Instant::now() + timeout);

        let (parts, body) = request.into_parts();
        let mut metadata = parts.headers;
        metadata.remove(CONTENT_TYPE);
        metadata.remove(TE);
        for name in TRANSPORT_HEADERS {
            metadata.remove(name);
        }

        let cancel = CancelSignal::new();
        let mut context = RequestContext::new(service, method)
            .with_metadata(metadata)
            .with_peer(self.peer.clone())
            .with_cancel_signal(cancel.clone());
        if let Some(deadline) = deadline {
            context = context.with_deadline(deadline);
        }

        let inbound = Streaming::from_body(body, request_encoding, self.settings.max_recv_msg_size);
        let (sink, rx) = MessageSink::channel(self.settings.outbound_buffer);

        tokio::spawn(run_call(
            self.pipeline.clone(),
            Call::new(context, inbound),
            sink,
            self.settings.terminate.clone(),
            deadline,
        ));

        let mut response = Response::new(RpcBody::streaming(
            rx,
            response_encoding,
            self.settings.max_send_msg_size,
            cancel,
            Some(permit),
        ));
        let headers = response.headers_mut();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(RPC_CONTENT_TYPE));
        if let Some(encoding) = response_encoding {
            headers.insert(GRPC_ENCODING, HeaderValue::from_static(encoding.as_str()));
        }
        self.advertise_encodings(headers);
        response
    }

    fn advertise_encodings(&self, headers: &mut HeaderMap) {
        if let Ok(value) = HeaderValue::from_str(&self.settings.encodings.accept_header()) {
            headers.insert(GRPC_ACCEPT_ENCODING, value);
        }
    }
}

impl<B> tower::Service<Request<B>> for RpcService
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    type Response = Response<RpcBody>;
    type Error = Infallible;
    type Future = Ready<Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: Request<B>) -> Self::Future {
        ready(Ok(self.handle(request)))
    }
}

/// Drive one call to its terminal status and hand that to the body.
async fn run_call(pipeline: CallPipeline, call: Call, sink: MessageSink, terminate: CancelSignal, deadline: Option<Instant>) {
    let cancel = call.context().cancel_signal().clone();
    let closer = sink.closer();
    let handler = pipeline.handler();

    let expired = async move {
        match deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    };

    let status = tokio::select! {
        biased;
        result = handler.call(call, sink) => match result {
            Ok(()) => Status::ok(),
            Err(status) => status,
        },
        _ = terminate.cancelled() => Status::unavailable("server is shutting down"),
        _ = cancel.cancelled() => Status::cancelled("call cancelled"),
        _ = expired => Status::deadline_exceeded("deadline exceeded"),
    };

    // Anything the handler spawned observes the end of the call.
    cancel.cancel();
    closer.close(status).await;
}

/// `/package.Service/Method` into its two parts.
fn parse_path(path: &str) -> Option<(&str, &str)> {
    let (service, method) = path.strip_prefix('/')?.split_once('/')?;
    if service.is_empty() || method.is_empty() || method.contains('/') {
        return None;
    }
    Some((service, method))
}

fn plain(status: StatusCode) -> Response<RpcBody> {
    let mut response = Response::new(RpcBody::empty());
    *response.status_mut() = status;
    response
}

/// A response whose headers carry the status and whose body is empty.
fn trailers_only(status: Status) -> Response<RpcBody> {
    let mut response = Response::new(RpcBody::empty());
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(RPC_CONTENT_TYPE));
    headers.extend(status.to_header_map());
    response
}
