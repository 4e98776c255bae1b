//! On-disk record encoding.
//!
//! Every record, loose or archived, is a 4-byte little-endian header length,
//! a bincode header (magic bytes, format version, payload checksum), then the
//! bincode payload. Decoding validates all three header fields and that the
//! payload is consumed exactly.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tessera_common::{CacheKey, Checksum};

use crate::error::StoreError;

/// Magic bytes identifying a Tessera record.
const RECORD_MAGIC: [u8; 4] = *b"TSRA";

/// Current record format version. Increment on breaking changes to the
/// header or payload encoding.
const RECORD_FORMAT_VERSION: u32 = 1;

/// Header prepended to every stored record.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RecordHeader {
    magic: [u8; 4],
    format_version: u32,
    checksum: Checksum,
}

/// Serializes a value into its stored form.
///
/// Encoding is deterministic for a given value, which is what lets
/// [`RecordStore::put`](crate::RecordStore::put) skip rewriting identical
/// entries.
pub fn encode_record<V: Serialize>(key: &CacheKey, value: &V) -> Result<Vec<u8>, StoreError> {
    let encode_err = |e: bincode::error::EncodeError| StoreError::Encode {
        key: key.clone(),
        reason: e.to_string(),
    };

    let payload =
        bincode::serde::encode_to_vec(value, bincode::config::standard()).map_err(encode_err)?;
    let header = RecordHeader {
        magic: RECORD_MAGIC,
        format_version: RECORD_FORMAT_VERSION,
        checksum: Checksum::of(&payload),
    };
    let header_bytes =
        bincode::serde::encode_to_vec(&header, bincode::config::standard()).map_err(encode_err)?;

    let header_len = header_bytes.len() as u32;
    let mut output = Vec::with_capacity(4 + header_bytes.len() + payload.len());
    output.extend_from_slice(&header_len.to_le_bytes());
    output.extend_from_slice(&header_bytes);
    output.extend_from_slice(&payload);
    Ok(output)
}

/// Decodes a stored record. `origin` names the source in error messages.
pub fn decode_record<V: DeserializeOwned>(raw: &[u8], origin: &str) -> Result<V, StoreError> {
    let fail = |reason: String| StoreError::Decode {
        origin: origin.to_string(),
        reason,
    };

    if raw.len() < 4 {
        return Err(fail(format!("truncated record ({} bytes)", raw.len())));
    }
    let header_len = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize;
    if raw.len() < 4 + header_len {
        return Err(fail(format!(
            "truncated header: need {header_len} bytes, have {}",
            raw.len() - 4
        )));
    }

    let (header, _): (RecordHeader, usize) =
        bincode::serde::decode_from_slice(&raw[4..4 + header_len], bincode::config::standard())
            .map_err(|e| fail(format!("invalid header: {e}")))?;

    if header.magic != RECORD_MAGIC {
        return Err(fail(format!("bad magic bytes {:?}", header.magic)));
    }
    if header.format_version != RECORD_FORMAT_VERSION {
        return Err(fail(format!(
            "unsupported format version {} (expected {RECORD_FORMAT_VERSION})",
            header.format_version
        )));
    }

    let payload = &raw[4 + header_len..];
    let actual = Checksum::of(payload);
    if actual != header.checksum {
        return Err(fail(format!(
            "checksum mismatch: expected {}, got {actual}",
            header.checksum
        )));
    }

    let (value, used): (V, usize) =
        bincode::serde::decode_from_slice(payload, bincode::config::standard())
            .map_err(|e| fail(format!("invalid payload: {e}")))?;
    if used != payload.len() {
        return Err(fail(format!(
            "{} trailing bytes after payload",
            payload.len() - used
        )));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> CacheKey {
        CacheKey::from_digest([0x42; 32])
    }

    fn frame(header: &RecordHeader, payload: &[u8]) -> Vec<u8> {
        let header_bytes =
            bincode::serde::encode_to_vec(header, bincode::config::standard()).unwrap();
        let mut out = Vec::new();
        out.extend_from_slice(&(header_bytes.len() as u32).to_le_bytes());
        out.extend_from_slice(&header_bytes);
        out.extend_from_slice(payload);
        out
    }

    fn payload_of(value: &Vec<f64>) -> Vec<u8> {
        bincode::serde::encode_to_vec(value, bincode::config::standard()).unwrap()
    }

    #[test]
    fn encode_is_deterministic() {
        let v = vec![vec![1.5_f64, 2.25], vec![]];
        assert_eq!(
            encode_record(&key(), &v).unwrap(),
            encode_record(&key(), &v).unwrap()
        );
    }

    #[test]
    fn decode_returns_encoded_value() {
        let v = vec![0.1_f64, f64::MIN_POSITIVE, -3.0e300];
        let raw = encode_record(&key(), &v).unwrap();
        let back: Vec<f64> = decode_record(&raw, "test").unwrap();
        assert_eq!(back, v);
    }

    #[test]
    fn truncated_record_is_decode_error() {
        let err = decode_record::<Vec<f64>>(b"AB", "loose/x").unwrap_err();
        assert!(matches!(err, StoreError::Decode { .. }));
        assert!(err.to_string().contains("loose/x"));
    }

    #[test]
    fn truncated_header_is_decode_error() {
        let raw = [200u8, 0, 0, 0, 1, 2, 3];
        let err = decode_record::<Vec<f64>>(&raw, "x").unwrap_err();
        assert!(err.to_string().contains("truncated header"));
    }

    #[test]
    fn wrong_magic_is_decode_error() {
        let payload = payload_of(&vec![1.0]);
        let header = RecordHeader {
            magic: *b"BAAD",
            format_version: RECORD_FORMAT_VERSION,
            checksum: Checksum::of(&payload),
        };
        let err = decode_record::<Vec<f64>>(&frame(&header, &payload), "x").unwrap_err();
        assert!(err.to_string().contains("bad magic"));
    }

    #[test]
    fn wrong_version_is_decode_error() {
        let payload = payload_of(&vec![1.0]);
        let header = RecordHeader {
            magic: RECORD_MAGIC,
            format_version: 999,
            checksum: Checksum::of(&payload),
        };
        let err = decode_record::<Vec<f64>>(&frame(&header, &payload), "x").unwrap_err();
        assert!(err.to_string().contains("unsupported format version 999"));
    }

    #[test]
    fn tampered_payload_is_decode_error() {
        let payload = payload_of(&vec![1.0]);
        let header = RecordHeader {
            magic: RECORD_MAGIC,
            format_version: RECORD_FORMAT_VERSION,
            checksum: Checksum::of(b"something else"),
        };
        let err = decode_record::<Vec<f64>>(&frame(&header, &payload), "x").unwrap_err();
        assert!(err.to_string().contains("checksum mismatch"));
    }

    #[test]
    fn type_mismatch_is_decode_error() {
        let raw = encode_record(&key(), &"a string").unwrap();
        let err = decode_record::<Vec<f64>>(&raw, "x").unwrap_err();
        assert!(matches!(err, StoreError::Decode { .. }));
    }
}
