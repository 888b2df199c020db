//! Ed25519 signing keypair
//!
//! Every write is signed with the author's Ed25519 key. Public keys
//! render as URL-safe unpadded base64 of the 32 raw bytes, the same
//! textual scheme digests use, so `user/<pk>/...` paths stay in one
//! alphabet.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{WeaveError, WeaveResult};

/// Length of a serialized signature in bytes.
pub const SIGNATURE_LENGTH: usize = 64;

/// An Ed25519 signing keypair.
pub struct Keypair {
    signing: SigningKey,
}

impl Keypair {
    /// Generate a new random keypair.
    ///
    /// Uses getrandom directly for the seed to avoid rand version
    /// conflicts with ed25519-dalek.
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        getrandom::getrandom(&mut seed).expect("system RNG is available");
        Self {
            signing: SigningKey::from_bytes(&seed),
        }
    }

    /// Deterministic keypair from a 32-byte seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(seed),
        }
    }

    /// The 32-byte secret seed.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.signing.to_bytes()
    }

    /// Reconstruct a keypair from its secret seed.
    pub fn from_bytes(bytes: &[u8]) -> WeaveResult<Self> {
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| WeaveError::Crypto("Keypair seed must be 32 bytes".to_string()))?;
        Ok(Self::from_seed(&seed))
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            verifying: self.signing.verifying_key(),
        }
    }

    /// Sign a message, returning the 64 signature bytes.
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing.sign(message).to_bytes().to_vec()
    }
}

impl Clone for Keypair {
    fn clone(&self) -> Self {
        Self {
            signing: SigningKey::from_bytes(&self.signing.to_bytes()),
        }
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("public", &self.public_key().to_base64())
            .finish_non_exhaustive()
    }
}

/// An Ed25519 public key.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey {
    verifying: VerifyingKey,
}

impl PublicKey {
    /// Verify `signature` over `message`.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        let signature = match Signature::from_slice(signature) {
            Ok(sig) => sig,
            Err(_) => return false,
        };
        self.verifying.verify(message, &signature).is_ok()
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        self.verifying.as_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> WeaveResult<Self> {
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| WeaveError::Crypto("Public key must be 32 bytes".to_string()))?;
        let verifying = VerifyingKey::from_bytes(&arr)
            .map_err(|e| WeaveError::Crypto(format!("Invalid public key: {}", e)))?;
        Ok(Self { verifying })
    }

    /// URL-safe unpadded base64 text form.
    pub fn to_base64(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.as_bytes())
    }

    /// Parse the text form produced by [`to_base64`](Self::to_base64).
    pub fn from_base64(s: &str) -> WeaveResult<Self> {
        let bytes = URL_SAFE_NO_PAD
            .decode(s)
            .map_err(|e| WeaveError::Crypto(format!("Invalid public key encoding: {}", e)))?;
        Self::from_bytes(&bytes)
    }
}

impl std::fmt::Display for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_base64())
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({})", &self.to_base64()[..8])
    }
}

impl std::hash::Hash for PublicKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.as_bytes().hash(state);
    }
}

impl Serialize for PublicKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_base64(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify_roundtrip() {
        let keypair = Keypair::generate();
        let message = b"peer-replicated bytes";
        let signature = keypair.sign(message);
        assert_eq!(signature.len(), SIGNATURE_LENGTH);
        assert!(keypair.public_key().verify(message, &signature));
    }

    #[test]
    fn test_wrong_key_fails_verification() {
        let a = Keypair::generate();
        let b = Keypair::generate();
        let signature = a.sign(b"msg");
        assert!(!b.public_key().verify(b"msg", &signature));
    }

    #[test]
    fn test_wrong_message_fails_verification() {
        let keypair = Keypair::generate();
        let signature = keypair.sign(b"original");
        assert!(!keypair.public_key().verify(b"modified", &signature));
    }

    #[test]
    fn test_garbage_signature_fails() {
        let keypair = Keypair::generate();
        assert!(!keypair.public_key().verify(b"msg", &[0u8; 10]));
        assert!(!keypair.public_key().verify(b"msg", &[0u8; 64]));
    }

    #[test]
    fn test_seed_determinism() {
        let seed = [7u8; 32];
        let a = Keypair::from_seed(&seed);
        let b = Keypair::from_seed(&seed);
        assert_eq!(a.public_key(), b.public_key());
        assert_eq!(a.to_bytes(), b.to_bytes());
    }

    #[test]
    fn test_public_key_base64_roundtrip() {
        let pk = Keypair::generate().public_key();
        let text = pk.to_base64();
        assert_eq!(PublicKey::from_base64(&text).unwrap(), pk);
    }

    #[test]
    fn test_keypair_bytes_roundtrip() {
        let keypair = Keypair::generate();
        let restored = Keypair::from_bytes(&keypair.to_bytes()).unwrap();
        assert_eq!(restored.public_key(), keypair.public_key());
    }
}
