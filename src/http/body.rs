//! Response body of an RPC stream.

use std::convert::Infallible;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use http_body::{Body, Frame, SizeHint};

use crate::dispatch::{MessageReceiver, Outbound};
use crate::lifecycle::CancelSignal;
use crate::net::StreamPermit;
use crate::rpc::{encode_frame, Encoding, Status};

/// Frames handler output as HTTP/2 data and ends with status trailers.
///
/// Dropping the body before the trailers were produced means the peer reset
/// the stream; the call's cancellation signal fires so the handler stops.
#[derive(Debug)]
pub struct RpcBody {
    stream: Option<OpenStream>,
}

#[derive(Debug)]
struct OpenStream {
    rx: MessageReceiver,
    encoding: Option<Encoding>,
    max_send: usize,
    cancel: CancelSignal,
    _permit: Option<StreamPermit>,
}

impl RpcBody {
    /// A body that is already finished (trailers-only or plain HTTP error).
    pub fn empty() -> Self {
        Self { stream: None }
    }

    pub(crate) fn streaming(
        rx: MessageReceiver,
        encoding: Option<Encoding>,
        max_send: usize,
        cancel: CancelSignal,
        permit: Option<StreamPermit>,
    ) -> Self {
        Self {
            stream: Some(OpenStream {
                rx,
                encoding,
                max_send,
                cancel,
                _permit: permit,
            }),
        }
    }

    /// Produce the trailers and release the stream slot.
    fn finish(&mut self, status: Status) -> Poll<Option<Result<Frame<Bytes>, Infallible>>> {
        if let Some(stream) = self.stream.take() {
            if !status.is_ok() {
                // Stops a handler that is still producing after a send failure.
                stream.cancel.cancel();
            }
        }
        Poll::Ready(Some(Ok(Frame::trailers(status.to_header_map()))))
    }
}

impl Body for RpcBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = &mut *self;
        let Some(stream) = this.stream.as_mut() else {
            return Poll::Ready(None);
        };

        match stream.rx.poll_recv(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(Outbound::Message(message))) => {
                match encode_frame(&message, stream.encoding, stream.max_send) {
                    Ok(frame) => Poll::Ready(Some(Ok(Frame::data(frame)))),
                    Err(status) => this.finish(status),
                }
            }
            Poll::Ready(Some(Outbound::Close(status))) => this.finish(status),
            // Every sender is gone without a status: the call task died.
            Poll::Ready(None) => this.finish(Status::internal("call ended without a status")),
        }
    }

    fn is_end_stream(&self) -> bool {
        self.stream.is_none()
    }

    fn size_hint(&self) -> SizeHint {
        match self.stream {
            None => SizeHint::with_exact(0),
            Some(_) => SizeHint::default(),
        }
    }
}

impl Drop for RpcBody {
    fn drop(&mut self) {
        if let Some(stream) = self.stream.take() {
            tracing::debug!("Stream closed before completion, cancelling call");
            stream.cancel.cancel();
        }
    }
}
