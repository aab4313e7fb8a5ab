//! Sync and cursor token codec
//!
//! Tokens are opaque to clients: base64 of the UTF-8 text
//! `"<version>:<payload>"`. Two versions are accepted on decode:
//!
//! - version 1: payload is an RFC 3339 date string
//! - version 2: payload is a decimal number of seconds since epoch
//!
//! Only version 2 is ever produced. A *sync token* encodes the instant one
//! microsecond past the newest delivered item, paired with a strict `>`
//! comparison on the next request. A *cursor token* encodes the last
//! delivered item's timestamp exactly, paired with `>=` so a write landing
//! on the boundary is re-read rather than lost.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::clock::micros_from_date_string;
use crate::error::SyncError;

const VERSION_1: &str = "1";
const VERSION_2: &str = "2";

/// Encode an instant as a version-2 token.
pub fn encode(micros: i64) -> String {
    let seconds = micros.div_euclid(1_000_000);
    let fraction = micros.rem_euclid(1_000_000);
    let plain = format!("{}:{}.{:06}", VERSION_2, seconds, fraction);
    STANDARD.encode(plain.as_bytes())
}

/// Encode the sync token for a response whose newest item carries
/// `max_updated_at` (adds the boundary-excluding microsecond).
pub fn encode_sync_token(max_updated_at: i64) -> String {
    encode(max_updated_at + 1)
}

/// Decode a token of either version into microseconds since epoch.
pub fn decode(token: &str) -> Result<i64, SyncError> {
    let raw = STANDARD
        .decode(token.trim())
        .map_err(|e| SyncError::BadToken(format!("not base64: {}", e)))?;
    let plain = String::from_utf8(raw)
        .map_err(|e| SyncError::BadToken(format!("not utf-8: {}", e)))?;

    let (version, payload) = plain
        .split_once(':')
        .ok_or_else(|| SyncError::BadToken("missing version prefix".into()))?;

    match version {
        VERSION_1 => micros_from_date_string(payload),
        VERSION_2 => micros_from_seconds_decimal(payload),
        other => Err(SyncError::BadToken(format!(
            "unrecognized token version '{}'",
            other
        ))),
    }
}

/// Parse a decimal seconds string into microseconds without going through
/// floating point, so the round trip is exact.
fn micros_from_seconds_decimal(payload: &str) -> Result<i64, SyncError> {
    let (whole, fraction) = match payload.split_once('.') {
        Some((w, f)) => (w, f),
        None => (payload, ""),
    };

    let seconds: i64 = whole
        .parse()
        .map_err(|e| SyncError::BadToken(format!("bad seconds '{}': {}", payload, e)))?;

    // Pad or truncate the fraction to microsecond precision
    let mut digits = String::from(fraction);
    digits.truncate(6);
    while digits.len() < 6 {
        digits.push('0');
    }
    let micros_part: i64 = digits
        .parse()
        .map_err(|e| SyncError::BadToken(format!("bad fraction '{}': {}", payload, e)))?;

    Ok(seconds * 1_000_000 + micros_part)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::date_string_from_micros;

    #[test]
    fn test_round_trip_v2() {
        for micros in [0i64, 1, 999_999, 1_000_000, 1_726_500_123_456_789] {
            assert_eq!(decode(&encode(micros)).unwrap(), micros);
        }
    }

    #[test]
    fn test_sync_token_excludes_boundary() {
        let boundary = 1_726_500_123_456_789i64;
        assert_eq!(decode(&encode_sync_token(boundary)).unwrap(), boundary + 1);
    }

    #[test]
    fn test_decode_v1_date_string() {
        let micros = 1_700_000_123_456_789i64;
        let plain = format!("1:{}", date_string_from_micros(micros));
        let token = STANDARD.encode(plain.as_bytes());
        assert_eq!(decode(&token).unwrap(), micros);
    }

    #[test]
    fn test_v1_reencodes_as_v2_same_instant() {
        let micros = 1_700_000_000_000_000i64;
        let plain = format!("1:{}", date_string_from_micros(micros));
        let v1_token = STANDARD.encode(plain.as_bytes());
        let decoded = decode(&v1_token).unwrap();
        let v2_token = encode(decoded);
        assert!((decode(&v2_token).unwrap() - micros).abs() <= 1);
    }

    #[test]
    fn test_missing_version_prefix() {
        let token = STANDARD.encode("1726500123.456".as_bytes());
        assert!(matches!(decode(&token), Err(SyncError::BadToken(_))));
    }

    #[test]
    fn test_unknown_version() {
        let token = STANDARD.encode("7:123.456".as_bytes());
        assert!(matches!(decode(&token), Err(SyncError::BadToken(_))));
    }

    #[test]
    fn test_not_base64() {
        assert!(matches!(decode("%%%"), Err(SyncError::BadToken(_))));
    }

    #[test]
    fn test_short_fraction_padded() {
        let token = STANDARD.encode("2:10.5".as_bytes());
        assert_eq!(decode(&token).unwrap(), 10_500_000);
    }

    #[test]
    fn test_whole_seconds_accepted() {
        let token = STANDARD.encode("2:42".as_bytes());
        assert_eq!(decode(&token).unwrap(), 42_000_000);
    }
}
