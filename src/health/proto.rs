//! Wire messages of `grpc.health.v1`.
//!
//! ```text
//! message HealthCheckRequest  { string service = 1; }
//! message HealthCheckResponse { ServingStatus status = 1; }
//! enum ServingStatus { UNKNOWN = 0; SERVING = 1; NOT_SERVING = 2; SERVICE_UNKNOWN = 3; }
//! ```

use bytes::Bytes;
use protobuf::{CodedInputStream, CodedOutputStream, UnknownFields};

use crate::health::registry::ServingStatus;
use crate::rpc::Status;

const SERVICE_TAG: u32 = (1 << 3) | 2;
const STATUS_TAG: u32 = 1 << 3;

impl ServingStatus {
    pub fn to_wire(self) -> i32 {
        match self {
            ServingStatus::Unknown => 0,
            ServingStatus::Serving => 1,
            ServingStatus::NotServing => 2,
        }
    }

    /// SERVICE_UNKNOWN and unrecognised values read as `Unknown`.
    pub fn from_wire(value: i32) -> Self {
        match value {
            1 => ServingStatus::Serving,
            2 => ServingStatus::NotServing,
            _ => ServingStatus::Unknown,
        }
    }
}

/// Decode `HealthCheckRequest` and return its service name.
pub fn decode_request(message: &[u8]) -> Result<String, Status> {
    let mut service = String::new();
    let mut is = CodedInputStream::from_bytes(message);
    let mut unknown = UnknownFields::new();
    while let Some(tag) = is.read_raw_tag_or_eof().map_err(malformed)? {
        match tag {
            SERVICE_TAG => service = is.read_string().map_err(malformed)?,
            tag => protobuf::rt::read_unknown_or_skip_group(tag, &mut is, &mut unknown).map_err(malformed)?,
        }
    }
    Ok(service)
}

pub fn encode_request(service: &str) -> Bytes {
    encode(|os| {
        if !service.is_empty() {
            os.write_string(1, service)?;
        }
        Ok(())
    })
}

/// Encode `HealthCheckResponse`.
pub fn encode_response(status: ServingStatus) -> Bytes {
    encode(|os| {
        let value = status.to_wire();
        if value != 0 {
            os.write_enum(1, value)?;
        }
        Ok(())
    })
}

pub fn decode_response(message: &[u8]) -> Result<ServingStatus, Status> {
    let mut status = 0;
    let mut is = CodedInputStream::from_bytes(message);
    let mut unknown = UnknownFields::new();
    while let Some(tag) = is.read_raw_tag_or_eof().map_err(malformed)? {
        match tag {
            STATUS_TAG => status = is.read_int32().map_err(malformed)?,
            tag => protobuf::rt::read_unknown_or_skip_group(tag, &mut is, &mut unknown).map_err(malformed)?,
        }
    }
    Ok(ServingStatus::from_wire(status))
}

fn encode<F>(write: F) -> Bytes
where
    F: FnOnce(&mut CodedOutputStream<'_>) -> protobuf::Result<()>,
{
    let mut buf = Vec::new();
    {
        let mut os = CodedOutputStream::vec(&mut buf);
        // Writes into a Vec do not fail.
        let _ = write(&mut os).and_then(|_| os.flush());
    }
    Bytes::from(buf)
}

fn malformed(e: protobuf::Error) -> Status {
    Status::invalid_argument(format!("malformed health message: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::Code;

    #[test]
    fn request_wire_format() {
        let encoded = encode_request("service.Echo");
        assert_eq!(encoded[0], 0x0a);
        assert_eq!(encoded[1] as usize, "service.Echo".len());
        assert_eq!(decode_request(&encoded).unwrap(), "service.Echo");
    }

    #[test]
    fn empty_request_is_overall_server() {
        assert!(encode_request("").is_empty());
        assert_eq!(decode_request(&[]).unwrap(), "");
    }

    #[test]
    fn response_wire_format() {
        assert_eq!(&encode_response(ServingStatus::Serving)[..], &[0x08, 0x01]);
        assert_eq!(&encode_response(ServingStatus::NotServing)[..], &[0x08, 0x02]);
        assert!(encode_response(ServingStatus::Unknown).is_empty());
        assert_eq!(decode_response(&[0x08, 0x03]).unwrap(), ServingStatus::Unknown);
        assert_eq!(decode_response(&[]).unwrap(), ServingStatus::Unknown);
    }

    #[test]
    fn unknown_fields_are_skipped() {
        // field 2 varint 7, then service = "a"
        let message = [0x10, 0x07, 0x0a, 0x01, b'a'];
        assert_eq!(decode_request(&message).unwrap(), "a");
    }

    #[test]
    fn truncated_request_is_invalid_argument() {
        let err = decode_request(&[0x0a, 0x05, b'a']).unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
    }
}
