//! Minimal HTTP/2 RPC client.
//!
//! Used by the `rpc-cli` binary and the integration tests. Transport
//! security is the caller's business: hand `RpcClient::handshake` any
//! established byte stream (plain TCP or a TLS session).

use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use http::header::{CONTENT_TYPE, TE};
use http::{HeaderMap, HeaderValue, Request, StatusCode, Uri};
use http_body::Frame;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::Incoming;
use hyper::client::conn::http2::SendRequest;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::rpc::compression::{GRPC_ACCEPT_ENCODING, GRPC_ENCODING};
use crate::rpc::timeout::GRPC_TIMEOUT;
use crate::rpc::{encode_frame, Encoding, FrameDecoder, Status, CONTENT_TYPE as RPC_CONTENT_TYPE};

/// Request body type sent by the client.
pub type ClientBody = UnsyncBoxBody<Bytes, Infallible>;

/// Largest response message the client accepts.
const MAX_RESPONSE_MESSAGE: usize = 16 * 1024 * 1024;

/// Error establishing a client connection.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("connect failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP/2 handshake failed: {0}")]
    Http(#[from] hyper::Error),
}

/// Per-call settings.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Extra request metadata.
    pub metadata: HeaderMap,
    /// Codec for request messages; responses may use any codec the client knows.
    pub encoding: Option<Encoding>,
    /// Sent as `grpc-timeout`.
    pub timeout: Option<Duration>,
}

impl CallOptions {
    pub fn with_encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = Some(encoding);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_metadata(mut self, name: &'static str, value: HeaderValue) -> Self {
        self.metadata.insert(name, value);
        self
    }
}

/// One HTTP/2 connection to an RPC server. Clones share the connection.
#[derive(Clone)]
pub struct RpcClient {
    sender: SendRequest<ClientBody>,
    authority: String,
}

impl RpcClient {
    /// Connect over cleartext HTTP/2 (prior knowledge).
    pub async fn connect(addr: SocketAddr) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Self::handshake(stream, addr.to_string()).await
    }

    /// Run the HTTP/2 handshake over an established stream.
    pub async fn handshake<I>(io: I, authority: impl Into<String>) -> Result<Self, ClientError>
    where
        I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sender, connection) = hyper::client::conn::http2::Builder::new(TokioExecutor::new())
            .timer(TokioTimer::new())
            .handshake(TokioIo::new(io))
            .await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::debug!(error = %e, "Client connection closed");
            }
        });
        Ok(Self {
            sender,
            authority: authority.into(),
        })
    }

    /// True while the connection can carry new streams.
    pub fn is_ready(&self) -> bool {
        self.sender.is_ready()
    }

    pub async fn unary(&self, path: &str, message: impl Into<Bytes>) -> Result<Bytes, Status> {
        self.unary_with(path, message, &CallOptions::default()).await
    }

    /// One request, exactly one response.
    pub async fn unary_with(&self, path: &str, message: impl Into<Bytes>, options: &CallOptions) -> Result<Bytes, Status> {
        let mut response = self.server_streaming(path, message, options).await?;
        let first = response
            .message()
            .await?
            .ok_or_else(|| Status::internal("response carried no message"))?;
        if response.message().await?.is_some() {
            return Err(Status::internal("response carried more than one message"));
        }
        Ok(first)
    }

    /// One request, a stream of responses.
    pub async fn server_streaming(
        &self,
        path: &str,
        message: impl Into<Bytes>,
        options: &CallOptions,
    ) -> Result<ResponseStream, Status> {
        let frame = encode_frame(&message.into(), options.encoding, usize::MAX)?;
        let body = Full::new(frame).map_err(|never| match never {}).boxed_unsync();
        self.start(path, options, body).await
    }

    /// Open a stream whose request messages are sent through the returned sender.
    pub async fn streaming(&self, path: &str, options: &CallOptions) -> Result<(RequestSender, ResponseStream), Status> {
        let (tx, rx) = mpsc::channel::<Bytes>(16);
        let frames = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv()
                .await
                .map(|frame| (Ok::<_, Infallible>(Frame::data(frame)), rx))
        });
        let response = self.start(path, options, StreamBody::new(frames).boxed_unsync()).await?;
        let sender = RequestSender {
            tx,
            encoding: options.encoding,
        };
        Ok((sender, response))
    }

    async fn start(&self, path: &str, options: &CallOptions, body: ClientBody) -> Result<ResponseStream, Status> {
        let uri = Uri::builder()
            .scheme("http")
            .authority(self.authority.as_str())
            .path_and_query(path)
            .build()
            .map_err(|e| Status::invalid_argument(format!("invalid method path: {}", e)))?;

        let mut request = Request::post(uri)
            .body(body)
            .map_err(|e| Status::internal(format!("failed to build request: {}", e)))?;
        let headers = request.headers_mut();
        headers.extend(options.metadata.clone());
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(RPC_CONTENT_TYPE));
        headers.insert(TE, HeaderValue::from_static("trailers"));
        headers.insert(GRPC_ACCEPT_ENCODING, HeaderValue::from_static("gzip,deflate,identity"));
        if let Some(encoding) = options.encoding {
            headers.insert(GRPC_ENCODING, HeaderValue::from_static(encoding.as_str()));
        }
        if let Some(timeout) = options.timeout {
            if let Ok(value) = HeaderValue::from_str(&format!("{}m", timeout.as_millis().min(99_999_999))) {
                headers.insert(GRPC_TIMEOUT, value);
            }
        }

        let mut sender = self.sender.clone();
        sender
            .ready()
            .await
            .map_err(|e| Status::unavailable(format!("connection unavailable: {}", e)))?;
        let response = sender
            .send_request(request)
            .await
            .map_err(|e| Status::unavailable(format!("request failed: {}", e)))?;
        ResponseStream::from_response(response)
    }
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient").field("authority", &self.authority).finish()
    }
}

/// Request half of a client stream. Dropping it half-closes the stream.
#[derive(Debug)]
pub struct RequestSender {
    tx: mpsc::Sender<Bytes>,
    encoding: Option<Encoding>,
}

impl RequestSender {
    pub async fn send(&self, message: impl Into<Bytes>) -> Result<(), Status> {
        let frame = encode_frame(&message.into(), self.encoding, usize::MAX)?;
        self.tx
            .send(frame)
            .await
            .map_err(|_| Status::cancelled("stream closed"))
    }

    /// Half-close the request side.
    pub fn close(self) {}
}

/// Response half of a client stream. Dropping it before the end resets the stream.
#[derive(Debug)]
pub struct ResponseStream {
    headers: HeaderMap,
    body: Option<Incoming>,
    decoder: FrameDecoder,
    status: Option<Status>,
}

impl ResponseStream {
    fn from_response(response: http::Response<Incoming>) -> Result<Self, Status> {
        let (parts, body) = response.into_parts();
        if parts.status != StatusCode::OK {
            return Err(Status::new(
                crate::rpc::Code::Unknown,
                format!("unexpected HTTP status {}", parts.status),
            ));
        }

        // Trailers-only: the status already arrived with the headers.
        let status = Status::from_header_map(&parts.headers);
        let encoding = parts
            .headers
            .get(GRPC_ENCODING)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| Encoding::parse(v).ok().flatten());
        Ok(Self {
            body: if status.is_some() { None } else { Some(body) },
            headers: parts.headers,
            decoder: FrameDecoder::new(encoding, MAX_RESPONSE_MESSAGE),
            status,
        })
    }

    /// Response headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Next response message; `Ok(None)` at an OK end, `Err` for any other status.
    pub async fn message(&mut self) -> Result<Option<Bytes>, Status> {
        loop {
            if let Some(message) = self.decoder.decode()? {
                return Ok(Some(message));
            }
            let Some(body) = self.body.as_mut() else {
                return match &self.status {
                    Some(status) if !status.is_ok() => Err(status.clone()),
                    _ => Ok(None),
                };
            };
            match body.frame().await {
                Some(Ok(frame)) => match frame.into_data() {
                    Ok(data) => self.decoder.push(&data),
                    Err(frame) => {
                        if let Ok(trailers) = frame.into_trailers() {
                            self.status = Status::from_header_map(&trailers);
                        }
                    }
                },
                Some(Err(e)) => {
                    self.body = None;
                    self.status = Some(Status::unavailable(format!("stream failed: {}", e)));
                }
                None => {
                    self.body = None;
                    if self.status.is_none() {
                        self.status = Some(Status::internal("stream ended without grpc-status"));
                    }
                }
            }
        }
    }

    /// Read to the end: every message and the terminal status.
    pub async fn collect(mut self) -> (Vec<Bytes>, Status) {
        let mut messages = Vec::new();
        loop {
            match self.message().await {
                Ok(Some(message)) => messages.push(message),
                Ok(None) => return (messages, Status::ok()),
                Err(status) => return (messages, status),
            }
        }
    }
}
