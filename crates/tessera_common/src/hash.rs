//! Payload checksums for stored records.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A 128-bit XXH3 checksum over a serialized payload.
///
/// Stored in every record header so that a truncated or tampered entry is
/// reported as a decode failure instead of being handed back as a value.
/// This is an integrity check, not an identity: cache keys come from
/// [`KeyHasher`](crate::KeyHasher).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Checksum([u8; 16]);

impl Checksum {
    /// Computes the checksum of a byte slice.
    pub fn of(data: &[u8]) -> Self {
        let hash = xxhash_rust::xxh3::xxh3_128(data);
        Self(hash.to_le_bytes())
    }

    /// Returns the raw checksum bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Checksum({:02x}{:02x}..)", self.0[0], self.0[1])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_payload_same_checksum() {
        assert_eq!(Checksum::of(b"payload"), Checksum::of(b"payload"));
    }

    #[test]
    fn single_byte_change_is_detected() {
        assert_ne!(Checksum::of(b"payload"), Checksum::of(b"paylaod"));
    }

    #[test]
    fn display_is_32_hex_chars() {
        let s = Checksum::of(b"x").to_string();
        assert_eq!(s.len(), 32);
        assert!(s.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn debug_is_abbreviated() {
        let s = format!("{:?}", Checksum::of(b"x"));
        assert!(s.starts_with("Checksum("));
        assert!(s.ends_with("..)"));
    }
}
