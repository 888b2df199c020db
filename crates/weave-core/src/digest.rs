//! Content digests
//!
//! Every trie node and stored value is addressed by the SHA-256 of its
//! serialized form. Digests render as URL-safe unpadded base64 wherever
//! they appear as text (byte-store keys, the persisted head pointer).

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::fmt;

use crate::error::WeaveError;

/// A 32-byte SHA-256 digest identifying a node or value by content.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Digest([u8; 32]);

impl Digest {
    /// Hash a byte sequence.
    pub fn of(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self(hasher.finalize().into())
    }

    /// Wrap raw digest bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// URL-safe unpadded base64 text form.
    pub fn to_base64(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.0)
    }

    /// Parse the text form produced by [`to_base64`](Self::to_base64).
    pub fn from_base64(s: &str) -> Result<Self, WeaveError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(s)
            .map_err(|e| WeaveError::InvalidArgument(format!("Invalid digest encoding: {}", e)))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| WeaveError::InvalidArgument("Digest must be 32 bytes".to_string()))?;
        Ok(Self(arr))
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base64())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", &self.to_base64()[..8])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_stable() {
        let a = Digest::of(b"hello");
        let b = Digest::of(b"hello");
        assert_eq!(a, b);
        assert_ne!(a, Digest::of(b"world"));
    }

    #[test]
    fn test_base64_roundtrip() {
        let d = Digest::of(b"some content");
        let text = d.to_base64();
        // URL-safe unpadded: no '=', '+' or '/'
        assert!(!text.contains('='));
        assert!(!text.contains('+'));
        assert!(!text.contains('/'));
        assert_eq!(Digest::from_base64(&text).unwrap(), d);
    }

    #[test]
    fn test_from_base64_rejects_wrong_length() {
        assert!(Digest::from_base64("c2hvcnQ").is_err());
        assert!(Digest::from_base64("not base64 at all!").is_err());
    }
}
