//! Password-based key wrapping
//!
//! Secrets at rest (the private signing key and the symmetric data key)
//! are wrapped with AES-256-GCM under a key derived from the password
//! with PBKDF2-HMAC-SHA-256. The KDF parameters travel inside the blob
//! so older blobs stay readable when the defaults change.
//!
//! ## Blob Format
//!
//! ```text
//! +-----------------+----------+--------+----------+--------------------+
//! | iterations (4B) | salt len | salt   | iv (12B) | ciphertext + tag   |
//! | big-endian      | (1 byte) |        |          |                    |
//! +-----------------+----------+--------+----------+--------------------+
//! ```

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::Aes256Gcm;
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;

use crate::error::{WeaveError, WeaveResult};

/// AES-GCM nonce size in bytes.
pub const IV_SIZE: usize = 12;

/// Default PBKDF2 iteration count.
pub const DEFAULT_KDF_ITERATIONS: u32 = 100_000;

/// Default salt length in bytes.
pub const DEFAULT_SALT_LENGTH: usize = 16;

/// Tunable key-derivation parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfOptions {
    /// PBKDF2 iteration count.
    pub iterations: u32,
    /// Random salt length in bytes.
    pub salt_length: usize,
}

impl Default for KdfOptions {
    fn default() -> Self {
        Self {
            iterations: DEFAULT_KDF_ITERATIONS,
            salt_length: DEFAULT_SALT_LENGTH,
        }
    }
}

fn derive_key(password: &str, salt: &[u8], iterations: u32) -> [u8; 32] {
    let mut key = [0u8; 32];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations, &mut key);
    key
}

/// Wrap a secret under a password.
pub fn wrap(secret: &[u8], password: &str, options: &KdfOptions) -> WeaveResult<Vec<u8>> {
    if options.iterations == 0 || options.salt_length == 0 || options.salt_length > 255 {
        return Err(WeaveError::InvalidArgument(
            "KDF options out of range".to_string(),
        ));
    }

    let mut salt = vec![0u8; options.salt_length];
    rand::rng().fill_bytes(&mut salt);
    let mut iv = [0u8; IV_SIZE];
    rand::rng().fill_bytes(&mut iv);

    let key = derive_key(password, &salt, options.iterations);
    let cipher = Aes256Gcm::new(GenericArray::from_slice(&key));
    let ciphertext = cipher
        .encrypt(GenericArray::from_slice(&iv), secret)
        .map_err(|e| WeaveError::Crypto(format!("Key wrap failed: {}", e)))?;

    let mut blob = Vec::with_capacity(4 + 1 + salt.len() + IV_SIZE + ciphertext.len());
    blob.extend_from_slice(&options.iterations.to_be_bytes());
    blob.push(options.salt_length as u8);
    blob.extend_from_slice(&salt);
    blob.extend_from_slice(&iv);
    blob.extend_from_slice(&ciphertext);
    Ok(blob)
}

/// Unwrap a secret. Fails with [`WeaveError::WrongPassword`] when the
/// password does not authenticate the blob.
pub fn unwrap(blob: &[u8], password: &str) -> WeaveResult<Vec<u8>> {
    if blob.len() < 5 {
        return Err(WeaveError::WrongPassword);
    }
    let iterations = u32::from_be_bytes([blob[0], blob[1], blob[2], blob[3]]);
    let salt_length = blob[4] as usize;
    let body = &blob[5..];
    if body.len() < salt_length + IV_SIZE {
        return Err(WeaveError::WrongPassword);
    }
    let salt = &body[..salt_length];
    let iv = &body[salt_length..salt_length + IV_SIZE];
    let ciphertext = &body[salt_length + IV_SIZE..];

    let key = derive_key(password, salt, iterations);
    let cipher = Aes256Gcm::new(GenericArray::from_slice(&key));
    cipher
        .decrypt(GenericArray::from_slice(iv), ciphertext)
        .map_err(|_| WeaveError::WrongPassword)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Tests run with a low iteration count; the default stays at 100k
    // for real identities.
    fn fast_kdf() -> KdfOptions {
        KdfOptions {
            iterations: 10,
            salt_length: 16,
        }
    }

    #[test]
    fn test_wrap_unwrap_roundtrip() {
        let secret = [42u8; 32];
        let blob = wrap(&secret, "hunter2", &fast_kdf()).unwrap();
        assert_eq!(unwrap(&blob, "hunter2").unwrap(), secret.to_vec());
    }

    #[test]
    fn test_wrong_password_fails() {
        let blob = wrap(b"secret", "correct", &fast_kdf()).unwrap();
        assert!(matches!(
            unwrap(&blob, "incorrect"),
            Err(WeaveError::WrongPassword)
        ));
    }

    #[test]
    fn test_blob_embeds_parameters() {
        let options = KdfOptions {
            iterations: 25,
            salt_length: 24,
        };
        let blob = wrap(b"secret", "pw", &options).unwrap();
        assert_eq!(u32::from_be_bytes([blob[0], blob[1], blob[2], blob[3]]), 25);
        assert_eq!(blob[4] as usize, 24);
        // Readable without knowing the options used to write it.
        assert_eq!(unwrap(&blob, "pw").unwrap(), b"secret".to_vec());
    }

    #[test]
    fn test_fresh_salt_and_iv_every_wrap() {
        let a = wrap(b"secret", "pw", &fast_kdf()).unwrap();
        let b = wrap(b"secret", "pw", &fast_kdf()).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_truncated_blob_fails() {
        let blob = wrap(b"secret", "pw", &fast_kdf()).unwrap();
        assert!(unwrap(&blob[..4], "pw").is_err());
        assert!(unwrap(&blob[..10], "pw").is_err());
    }

    #[test]
    fn test_tampered_blob_fails() {
        let mut blob = wrap(b"secret", "pw", &fast_kdf()).unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0xFF;
        assert!(matches!(unwrap(&blob, "pw"), Err(WeaveError::WrongPassword)));
    }

    #[test]
    fn test_zero_iterations_rejected() {
        let options = KdfOptions {
            iterations: 0,
            salt_length: 16,
        };
        assert!(matches!(
            wrap(b"s", "pw", &options),
            Err(WeaveError::InvalidArgument(_))
        ));
    }
}
