//! Content-addressed blob keys.

use crate::error::BlobError;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use sha1::{Digest, Sha1};
use std::fmt;
use std::str::FromStr;

/// The SHA-1 digest length in bytes.
pub(crate) const KEY_LENGTH: usize = 20;

/// A blob's identity: the SHA-1 digest of its content.
///
/// Keys render as 40-character uppercase hex (the on-disk filename stem)
/// and as `"sha1-<base64>"` digest strings (the form stored in attachment
/// metadata).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlobKey([u8; KEY_LENGTH]);

impl BlobKey {
    /// Creates a key from raw digest bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; KEY_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Computes the key for a piece of content.
    #[must_use]
    pub fn for_content(data: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    /// Returns the raw digest bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.0
    }

    /// Returns the `"sha1-<base64>"` digest string used in attachment
    /// metadata.
    #[must_use]
    pub fn digest_string(&self) -> String {
        format!("sha1-{}", BASE64.encode(self.0))
    }

    /// Parses a `"sha1-<base64>"` digest string.
    pub fn from_digest_string(s: &str) -> Result<Self, BlobError> {
        let b64 = s
            .strip_prefix("sha1-")
            .ok_or_else(|| BlobError::MalformedKey {
                input: s.to_string(),
            })?;
        let bytes = BASE64.decode(b64).map_err(|_| BlobError::MalformedKey {
            input: s.to_string(),
        })?;
        let digest: [u8; KEY_LENGTH] =
            bytes.try_into().map_err(|_| BlobError::MalformedKey {
                input: s.to_string(),
            })?;
        Ok(Self(digest))
    }
}

impl fmt::Display for BlobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02X}")?;
        }
        Ok(())
    }
}

impl FromStr for BlobKey {
    type Err = BlobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != KEY_LENGTH * 2 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(BlobError::MalformedKey {
                input: s.to_string(),
            });
        }
        let mut bytes = [0u8; KEY_LENGTH];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let high = (chunk[0] as char).to_digit(16).unwrap_or(0) as u8;
            let low = (chunk[1] as char).to_digit(16).unwrap_or(0) as u8;
            bytes[i] = (high << 4) | low;
        }
        Ok(Self(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_addressing_is_deterministic() {
        let a = BlobKey::for_content(b"hello");
        let b = BlobKey::for_content(b"hello");
        let c = BlobKey::for_content(b"world");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn hex_round_trip() {
        let key = BlobKey::for_content(b"round trip");
        let hex = key.to_string();
        assert_eq!(hex.len(), 40);
        assert_eq!(hex.parse::<BlobKey>().unwrap(), key);
    }

    #[test]
    fn digest_string_round_trip() {
        let key = BlobKey::for_content(b"digest");
        let s = key.digest_string();
        assert!(s.starts_with("sha1-"));
        assert_eq!(BlobKey::from_digest_string(&s).unwrap(), key);
    }

    #[test]
    fn known_sha1_vector() {
        // SHA1("abc") = A9993E364706816ABA3E25717850C26C9CD0D89D
        let key = BlobKey::for_content(b"abc");
        assert_eq!(key.to_string(), "A9993E364706816ABA3E25717850C26C9CD0D89D");
    }

    #[test]
    fn malformed_inputs_rejected() {
        assert!("short".parse::<BlobKey>().is_err());
        assert!("zz".repeat(20).parse::<BlobKey>().is_err());
        assert!(BlobKey::from_digest_string("md5-abcd").is_err());
        assert!(BlobKey::from_digest_string("sha1-@@@").is_err());
    }
}
