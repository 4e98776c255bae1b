//! The content-derived cache key.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Number of hex characters in a cache key (a SHA-256 digest).
pub const KEY_LEN: usize = 64;

/// A content-derived identity for an item, used as the record name on disk.
///
/// Always exactly [`KEY_LEN`] lowercase hexadecimal characters. Because only
/// validated strings can become keys, a key is always a safe file name and a
/// safe archive member name.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CacheKey(String);

/// Error returned when a string is not a well-formed cache key.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid cache key '{0}': expected {KEY_LEN} lowercase hex characters")]
pub struct InvalidKey(pub String);

impl CacheKey {
    /// Wraps a raw 32-byte digest, hex-encoding it.
    pub fn from_digest(digest: impl AsRef<[u8]>) -> Self {
        let digest = digest.as_ref();
        debug_assert_eq!(digest.len() * 2, KEY_LEN);
        Self(hex::encode(digest))
    }

    /// Parses and validates a key string.
    pub fn parse(s: &str) -> Result<Self, InvalidKey> {
        let valid = s.len() == KEY_LEN
            && s
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if valid {
            Ok(Self(s.to_string()))
        } else {
            Err(InvalidKey(s.to_string()))
        }
    }

    /// Returns the key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns a short prefix for log output.
    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

impl FromStr for CacheKey {
    type Err = InvalidKey;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for CacheKey {
    type Error = InvalidKey;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<CacheKey> for String {
    fn from(key: CacheKey) -> Self {
        key.0
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({}..)", self.short())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

    #[test]
    fn parse_valid_key() {
        let key = CacheKey::parse(VALID).unwrap();
        assert_eq!(key.as_str(), VALID);
        assert_eq!(key.short(), "0123456789ab");
    }

    #[test]
    fn reject_wrong_length() {
        assert!(CacheKey::parse("abc").is_err());
        assert!(CacheKey::parse(&format!("{VALID}0")).is_err());
    }

    #[test]
    fn reject_uppercase_and_path_chars() {
        assert!(CacheKey::parse(&VALID.to_uppercase()).is_err());
        let traversal = format!("../{}", &VALID[3..]);
        assert!(CacheKey::parse(&traversal).is_err());
    }

    #[test]
    fn reject_temp_file_names() {
        assert!(CacheKey::parse(&format!(".{}.tmp", &VALID[..59])).is_err());
    }

    #[test]
    fn from_digest_is_hex() {
        let key = CacheKey::from_digest([0xab; 32]);
        assert_eq!(key.as_str(), "ab".repeat(32));
    }

    #[test]
    fn serde_roundtrip_and_validation() {
        let key = CacheKey::parse(VALID).unwrap();
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, format!("\"{VALID}\""));
        let back: CacheKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
        assert!(serde_json::from_str::<CacheKey>("\"nope\"").is_err());
    }

    #[test]
    fn invalid_key_display() {
        let err = CacheKey::parse("zz").unwrap_err();
        assert!(err.to_string().contains("invalid cache key 'zz'"));
    }
}
