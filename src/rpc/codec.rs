//! Length-prefixed message framing.
//!
//! Every message on a stream is `[compressed flag: u8][length: u32 BE][payload]`.
//!
//! # Responsibilities
//! - Encode outbound messages (compressing with the negotiated codec)
//! - Reassemble inbound messages from arbitrary body chunking
//! - Expose the inbound side of a stream as an ordered `Streaming` sequence

use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures_util::Stream;
use http_body::Body;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::BodyExt;

use crate::rpc::compression::Encoding;
use crate::rpc::status::Status;

pub const HEADER_LEN: usize = 5;

/// Boxed error type of inbound request bodies.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Type-erased inbound request body.
pub type RequestBody = UnsyncBoxBody<Bytes, BoxError>;

/// Frame one outbound message.
pub fn encode_frame(message: &[u8], encoding: Option<Encoding>, max_len: usize) -> Result<Bytes, Status> {
    let (flag, payload) = match encoding {
        Some(encoding) => {
            let compressed = encoding
                .compress(message)
                .map_err(|e| Status::internal(format!("failed to compress message: {}", e)))?;
            (1u8, compressed)
        }
        None => (0u8, Bytes::copy_from_slice(message)),
    };

    if payload.len() > max_len || payload.len() > u32::MAX as usize {
        return Err(Status::resource_exhausted(format!(
            "outbound message of {} bytes exceeds limit of {} bytes",
            payload.len(),
            max_len
        )));
    }

    let mut frame = BytesMut::with_capacity(HEADER_LEN + payload.len());
    frame.put_u8(flag);
    frame.put_u32(payload.len() as u32);
    frame.extend_from_slice(&payload);
    Ok(frame.freeze())
}

/// Incremental decoder for inbound frames.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    encoding: Option<Encoding>,
    max_len: usize,
}

impl FrameDecoder {
    pub fn new(encoding: Option<Encoding>, max_len: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            encoding,
            max_len,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// True when a partial frame is buffered.
    pub fn has_remaining(&self) -> bool {
        !self.buf.is_empty()
    }

    /// Pop the next complete message, if one is buffered.
    pub fn decode(&mut self) -> Result<Option<Bytes>, Status> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let compressed = match self.buf[0] {
            0 => false,
            1 => true,
            flag => {
                return Err(Status::internal(format!("invalid compression flag {}", flag)));
            }
        };
        let len = u32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]) as usize;
        if len > self.max_len {
            return Err(Status::resource_exhausted(format!(
                "inbound message of {} bytes exceeds limit of {} bytes",
                len, self.max_len
            )));
        }
        if self.buf.len() < HEADER_LEN + len {
            self.buf.reserve(HEADER_LEN + len - self.buf.len());
            return Ok(None);
        }

        self.buf.advance(HEADER_LEN);
        let payload = self.buf.split_to(len).freeze();

        if !compressed {
            return Ok(Some(payload));
        }
        match self.encoding {
            Some(encoding) => encoding.decompress(&payload, self.max_len).map(Some),
            None => Err(Status::internal(
                "compressed message received without grpc-encoding",
            )),
        }
    }
}

enum Source {
    Body {
        body: RequestBody,
        decoder: FrameDecoder,
        finished: bool,
    },
    Buffered(VecDeque<Bytes>),
}

/// Inbound message sequence of one stream, in arrival order.
pub struct Streaming {
    source: Source,
}

impl Streaming {
    /// Decode messages from an HTTP request body.
    pub fn from_body<B>(body: B, encoding: Option<Encoding>, max_len: usize) -> Self
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        Self {
            source: Source::Body {
                body: body.map_err(Into::<BoxError>::into).boxed_unsync(),
                decoder: FrameDecoder::new(encoding, max_len),
                finished: false,
            },
        }
    }

    /// A sequence over already-decoded messages.
    pub fn from_messages(messages: impl IntoIterator<Item = Bytes>) -> Self {
        Self {
            source: Source::Buffered(messages.into_iter().collect()),
        }
    }

    pub fn empty() -> Self {
        Self::from_messages(Vec::new())
    }

    /// Next inbound message; `Ok(None)` once the peer half-closed.
    pub async fn message(&mut self) -> Result<Option<Bytes>, Status> {
        futures_util::future::poll_fn(|cx| self.poll_message(cx)).await
    }

    /// Read exactly one message, rejecting zero or more than one.
    pub async fn single(&mut self) -> Result<Bytes, Status> {
        let first = self
            .message()
            .await?
            .ok_or_else(|| Status::internal("missing request message"))?;
        if self.message().await?.is_some() {
            return Err(Status::internal("expected exactly one request message"));
        }
        Ok(first)
    }

    fn poll_message(&mut self, cx: &mut Context<'_>) -> Poll<Result<Option<Bytes>, Status>> {
        match &mut self.source {
            Source::Buffered(queue) => Poll::Ready(Ok(queue.pop_front())),
            Source::Body {
                body,
                decoder,
                finished,
            } => loop {
                if let Some(message) = decoder.decode()? {
                    return Poll::Ready(Ok(Some(message)));
                }
                if *finished {
                    if decoder.has_remaining() {
                        return Poll::Ready(Err(Status::internal("stream ended inside a message frame")));
                    }
                    return Poll::Ready(Ok(None));
                }
                match Pin::new(&mut *body).poll_frame(cx) {
                    Poll::Ready(Some(Ok(frame))) => {
                        if let Ok(data) = frame.into_data() {
                            decoder.push(&data);
                        }
                    }
                    Poll::Ready(Some(Err(e))) => {
                        *finished = true;
                        return Poll::Ready(Err(Status::cancelled(format!("inbound stream failed: {}", e))));
                    }
                    Poll::Ready(None) => *finished = true,
                    Poll::Pending => return Poll::Pending,
                }
            },
        }
    }
}

impl Stream for Streaming {
    type Item = Result<Bytes, Status>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().poll_message(cx).map(Result::transpose)
    }
}

impl std::fmt::Debug for Streaming {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.source {
            Source::Body { finished, .. } => f.debug_struct("Streaming").field("finished", finished).finish(),
            Source::Buffered(queue) => f.debug_struct("Streaming").field("buffered", &queue.len()).finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::status::Code;
    use futures_util::StreamExt;
    use http_body_util::{Full, StreamBody};
    use http_body::Frame;
    use std::convert::Infallible;

    #[test]
    fn decoder_reassembles_split_frames() {
        let first = encode_frame(b"TOST", None, 1024).unwrap();
        let second = encode_frame(b"second message", None, 1024).unwrap();
        let mut wire = first.to_vec();
        wire.extend_from_slice(&second);

        let mut decoder = FrameDecoder::new(None, 1024);
        decoder.push(&wire[..3]);
        assert_eq!(decoder.decode().unwrap(), None);
        decoder.push(&wire[3..12]);
        assert_eq!(decoder.decode().unwrap().unwrap(), Bytes::from_static(b"TOST"));
        assert_eq!(decoder.decode().unwrap(), None);
        decoder.push(&wire[12..]);
        assert_eq!(decoder.decode().unwrap().unwrap(), Bytes::from_static(b"second message"));
        assert!(!decoder.has_remaining());
    }

    #[test]
    fn oversized_frames_are_rejected() {
        let frame = encode_frame(&[7u8; 64], None, 1024).unwrap();
        let mut decoder = FrameDecoder::new(None, 16);
        decoder.push(&frame);
        assert_eq!(decoder.decode().unwrap_err().code(), Code::ResourceExhausted);

        let err = encode_frame(&[7u8; 64], None, 16).unwrap_err();
        assert_eq!(err.code(), Code::ResourceExhausted);
    }

    #[test]
    fn compressed_flag_requires_an_encoding() {
        let frame = encode_frame(b"TOST", Some(Encoding::Gzip), 1024).unwrap();
        assert_eq!(frame[0], 1);

        let mut plain = FrameDecoder::new(None, 1024);
        plain.push(&frame);
        assert_eq!(plain.decode().unwrap_err().code(), Code::Internal);

        let mut gzip = FrameDecoder::new(Some(Encoding::Gzip), 1024);
        gzip.push(&frame);
        assert_eq!(gzip.decode().unwrap().unwrap(), Bytes::from_static(b"TOST"));
    }

    #[tokio::test]
    async fn streaming_yields_messages_in_order_across_chunks() {
        let mut wire = Vec::new();
        for msg in ["one", "two", "three"] {
            wire.extend_from_slice(&encode_frame(msg.as_bytes(), Some(Encoding::Deflate), 1024).unwrap());
        }
        let chunks: Vec<Result<Frame<Bytes>, Infallible>> = wire
            .chunks(4)
            .map(|c| Ok(Frame::data(Bytes::copy_from_slice(c))))
            .collect();
        let body = StreamBody::new(futures_util::stream::iter(chunks));

        let streaming = Streaming::from_body(body, Some(Encoding::Deflate), 1024);
        let messages: Vec<Bytes> = streaming.map(|m| m.unwrap()).collect().await;
        assert_eq!(messages, vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn single_rejects_zero_and_many() {
        assert_eq!(Streaming::empty().single().await.unwrap_err().code(), Code::Internal);

        let mut two = Streaming::from_messages([Bytes::from_static(b"a"), Bytes::from_static(b"b")]);
        assert_eq!(two.single().await.unwrap_err().code(), Code::Internal);

        let body = Full::new(encode_frame(b"TOST", None, 1024).unwrap());
        let mut one = Streaming::from_body(body, None, 1024);
        assert_eq!(one.single().await.unwrap(), Bytes::from_static(b"TOST"));
    }

    #[tokio::test]
    async fn truncated_frame_is_an_error() {
        let frame = encode_frame(b"TOST", None, 1024).unwrap();
        let body = Full::new(frame.slice(..frame.len() - 1));
        let mut streaming = Streaming::from_body(body, None, 1024);
        assert_eq!(streaming.message().await.unwrap_err().code(), Code::Internal);
    }
}
