//! Per-message compression codecs and their negotiation.
//!
//! # Responsibilities
//! - Parse `grpc-encoding` / `grpc-accept-encoding` request headers
//! - Pick the outbound codec for a stream
//! - Compress and decompress individual messages
//!
//! # Design Decisions
//! - `gzip` and `deflate` (zlib) via flate2; `identity` is the absence of a codec
//! - Decompression is bounded by the receive limit so a small compressed frame
//!   cannot expand without limit

use std::io::{Read, Write};

use bytes::Bytes;
use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;
use http::HeaderMap;

use crate::rpc::status::Status;

pub const GRPC_ENCODING: &str = "grpc-encoding";
pub const GRPC_ACCEPT_ENCODING: &str = "grpc-accept-encoding";

/// A message compression codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    Gzip,
    Deflate,
}

impl Encoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            Encoding::Gzip => "gzip",
            Encoding::Deflate => "deflate",
        }
    }

    /// Parse a single codec token. `identity` maps to `Ok(None)`.
    pub fn parse(token: &str) -> Result<Option<Self>, String> {
        match token.trim() {
            "" | "identity" => Ok(None),
            "gzip" => Ok(Some(Encoding::Gzip)),
            "deflate" => Ok(Some(Encoding::Deflate)),
            other => Err(other.to_string()),
        }
    }

    pub fn compress(&self, data: &[u8]) -> std::io::Result<Bytes> {
        let out = Vec::with_capacity(data.len() / 2 + 16);
        let out = match self {
            Encoding::Gzip => {
                let mut encoder = GzEncoder::new(out, Compression::default());
                encoder.write_all(data)?;
                encoder.finish()?
            }
            Encoding::Deflate => {
                let mut encoder = ZlibEncoder::new(out, Compression::default());
                encoder.write_all(data)?;
                encoder.finish()?
            }
        };
        Ok(Bytes::from(out))
    }

    /// Decompress, failing with `RESOURCE_EXHAUSTED` past `limit` bytes.
    pub fn decompress(&self, data: &[u8], limit: usize) -> Result<Bytes, Status> {
        let mut out = Vec::with_capacity(data.len() * 2);
        let cap = (limit as u64).saturating_add(1);
        let read = match self {
            Encoding::Gzip => GzDecoder::new(data).take(cap).read_to_end(&mut out),
            Encoding::Deflate => ZlibDecoder::new(data).take(cap).read_to_end(&mut out),
        };
        read.map_err(|e| Status::internal(format!("failed to decompress {} message: {}", self.as_str(), e)))?;
        if out.len() > limit {
            return Err(Status::resource_exhausted(format!(
                "decompressed message larger than {} bytes",
                limit
            )));
        }
        Ok(Bytes::from(out))
    }
}

/// Codecs a server instance is willing to use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodingSet {
    enabled: Vec<Encoding>,
}

impl EncodingSet {
    pub fn new(enabled: impl IntoIterator<Item = Encoding>) -> Self {
        let mut list = Vec::new();
        for encoding in enabled {
            if !list.contains(&encoding) {
                list.push(encoding);
            }
        }
        Self { enabled: list }
    }

    pub fn contains(&self, encoding: Encoding) -> bool {
        self.enabled.contains(&encoding)
    }

    /// Value for `grpc-accept-encoding` response headers.
    pub fn accept_header(&self) -> String {
        let mut tokens: Vec<&str> = self.enabled.iter().map(Encoding::as_str).collect();
        tokens.push("identity");
        tokens.join(",")
    }

    /// Codec of the inbound messages on this stream.
    ///
    /// An unsupported codec is an `UNIMPLEMENTED` error.
    pub fn request_encoding(&self, headers: &HeaderMap) -> Result<Option<Encoding>, Status> {
        let Some(value) = headers.get(GRPC_ENCODING) else {
            return Ok(None);
        };
        let token = value
            .to_str()
            .map_err(|_| Status::invalid_argument("malformed grpc-encoding header"))?;
        match Encoding::parse(token) {
            Ok(Some(encoding)) if self.contains(encoding) => Ok(Some(encoding)),
            Ok(None) => Ok(None),
            Ok(Some(encoding)) => Err(Status::unimplemented(format!(
                "message encoding {} is not enabled",
                encoding.as_str()
            ))),
            Err(token) => Err(Status::unimplemented(format!(
                "message encoding {} is not supported",
                token
            ))),
        }
    }

    /// Codec for outbound messages: mirror the request codec, otherwise the
    /// first enabled codec the peer advertises.
    pub fn response_encoding(&self, request: Option<Encoding>, headers: &HeaderMap) -> Option<Encoding> {
        if request.is_some() {
            return request;
        }
        let accepted = headers.get(GRPC_ACCEPT_ENCODING)?.to_str().ok()?;
        accepted
            .split(',')
            .filter_map(|token| Encoding::parse(token).ok().flatten())
            .find(|encoding| self.contains(*encoding))
    }
}

impl Default for EncodingSet {
    fn default() -> Self {
        Self::new([Encoding::Gzip, Encoding::Deflate])
    }
}
