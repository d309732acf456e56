//! `grpc-timeout` header parsing.

use std::time::Duration;

use http::HeaderMap;

pub const GRPC_TIMEOUT: &str = "grpc-timeout";

/// Parse a `grpc-timeout` value: at most 8 digits followed by one unit of
/// `H`, `M`, `S`, `m`, `u` or `n`.
pub fn parse_timeout(value: &str) -> Option<Duration> {
    if value.len() < 2 || value.len() > 9 {
        return None;
    }
    let (digits, unit) = value.split_at(value.len() - 1);
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let amount: u64 = digits.parse().ok()?;
    let duration = match unit {
        "H" => Duration::from_secs(amount.saturating_mul(3600)),
        "M" => Duration::from_secs(amount.saturating_mul(60)),
        "S" => Duration::from_secs(amount),
        "m" => Duration::from_millis(amount),
        "u" => Duration::from_micros(amount),
        "n" => Duration::from_nanos(amount),
        _ => return None,
    };
    Some(duration)
}

/// Timeout requested by the peer, if any. Malformed values are ignored.
pub fn request_timeout(headers: &HeaderMap) -> Option<Duration> {
    let raw = headers.get(GRPC_TIMEOUT)?.to_str().ok()?;
    let parsed = parse_timeout(raw);
    if parsed.is_none() {
        tracing::debug!(value = %raw, "Ignoring malformed grpc-timeout header");
    }
    parsed
}
