//! RPC wire plumbing.
//!
//! # Data Flow
//! ```text
//! HTTP/2 request body
//!     → codec.rs (5-byte prefix framing, reassembly)
//!     → compression.rs (decompress with negotiated codec)
//!     → Streaming (ordered inbound messages)
//!
//! Handler output
//!     → codec.rs (compress + frame)
//!     → HTTP/2 data frames
//!     → status.rs (grpc-status / grpc-message trailers)
//! ```
//!
//! # Design Decisions
//! - Message encoding is opaque bytes; handlers own serialization
//! - Limits are enforced while decoding, before a message reaches a handler

pub mod codec;
pub mod compression;
pub mod status;
pub mod timeout;

pub use codec::{encode_frame, FrameDecoder, Streaming};
pub use compression::{Encoding, EncodingSet};
pub use status::{Code, Status};

/// Content type of RPC requests and responses.
pub const CONTENT_TYPE: &str = "application/grpc";

/// True for `application/grpc` and its `+proto`/`+json` style variants.
pub fn is_rpc_content_type(value: &str) -> bool {
    value == CONTENT_TYPE
        || value
            .strip_prefix(CONTENT_TYPE)
            .map(|rest| rest.starts_with('+') || rest.starts_with(';'))
            .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_type_variants() {
        assert!(is_rpc_content_type("application/grpc"));
        assert!(is_rpc_content_type("application/grpc+proto"));
        assert!(!is_rpc_content_type("application/grpc-web"));
        assert!(!is_rpc_content_type("application/json"));
    }
}
