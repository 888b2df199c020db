//! Identity: keys, handles, password wrapping
//!
//! An identity is an Ed25519 keypair plus a 256-bit symmetric data key
//! for user-space values, both wrapped under the user's password. The
//! persisted record never contains unwrapped key material; the runtime
//! [`Identity`] holds the unwrapped keys in memory only.
//!
//! A handle is `display_name + "#" + suffix` where the suffix is a
//! deterministic function of the public key, which is what makes handle
//! claims unforgeable (a claimed suffix that does not match the claiming
//! key is rejected at admission).

mod keypair;
mod wrap;

pub use keypair::{Keypair, PublicKey, SIGNATURE_LENGTH};
pub use wrap::{KdfOptions, DEFAULT_KDF_ITERATIONS, DEFAULT_SALT_LENGTH, IV_SIZE};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::error::{WeaveError, WeaveResult};

/// Byte-store key the identity record persists under.
pub const IDENTITY_KEY: &str = "_identity";

/// Number of digits in a handle suffix.
pub const SUFFIX_DIGITS: u32 = 4;

/// Persisted identity record. Wrapped blobs are hex strings inside the
/// JSON encoding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub public_key: PublicKey,
    pub display_name: String,
    pub wrapped_private_key: String,
    pub wrapped_data_key: String,
}

impl IdentityRecord {
    pub fn to_json(&self) -> WeaveResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| WeaveError::Serialization(e.to_string()))
    }

    pub fn from_json(bytes: &[u8]) -> WeaveResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| WeaveError::Serialization(e.to_string()))
    }

    /// The record as a single backup string.
    pub fn to_backup(&self) -> WeaveResult<String> {
        Ok(URL_SAFE_NO_PAD.encode(self.to_json()?))
    }

    /// Parse a backup string produced by [`to_backup`](Self::to_backup).
    pub fn from_backup(backup: &str) -> WeaveResult<Self> {
        let bytes = URL_SAFE_NO_PAD
            .decode(backup.trim())
            .map_err(|e| WeaveError::InvalidArgument(format!("Invalid backup encoding: {}", e)))?;
        Self::from_json(&bytes)
    }
}

/// A logged-in identity: the persisted record plus unwrapped runtime
/// keys. Never persisted as a whole.
pub struct Identity {
    record: IdentityRecord,
    keypair: Keypair,
    data_key: [u8; 32],
}

impl Identity {
    /// Create a fresh identity wrapped under `password`.
    pub fn create(display_name: &str, password: &str, kdf: &KdfOptions) -> WeaveResult<Self> {
        Self::create_with_keypair(Keypair::generate(), display_name, password, kdf)
    }

    /// Create an identity around an existing keypair (used by the
    /// custom-suffix signup search).
    pub fn create_with_keypair(
        keypair: Keypair,
        display_name: &str,
        password: &str,
        kdf: &KdfOptions,
    ) -> WeaveResult<Self> {
        if display_name.is_empty() || display_name.contains('#') {
            return Err(WeaveError::InvalidArgument(
                "Display name must be non-empty and must not contain '#'".to_string(),
            ));
        }

        let mut data_key = [0u8; 32];
        getrandom::getrandom(&mut data_key)
            .map_err(|e| WeaveError::Crypto(format!("RNG failure: {}", e)))?;

        let wrapped_private_key = hex::encode(wrap::wrap(&keypair.to_bytes(), password, kdf)?);
        let wrapped_data_key = hex::encode(wrap::wrap(&data_key, password, kdf)?);

        let record = IdentityRecord {
            public_key: keypair.public_key(),
            display_name: display_name.to_string(),
            wrapped_private_key,
            wrapped_data_key,
        };

        Ok(Self {
            record,
            keypair,
            data_key,
        })
    }

    /// Unwrap a persisted record with `password`.
    ///
    /// Fails with `WrongPassword` if the password does not authenticate
    /// the blobs, and with `IdentityIntegrity` if the unwrapped private
    /// key does not derive the recorded public key.
    pub fn unlock(record: IdentityRecord, password: &str) -> WeaveResult<Self> {
        let wrapped_private = hex::decode(&record.wrapped_private_key)
            .map_err(|e| WeaveError::Serialization(format!("Bad wrapped key hex: {}", e)))?;
        let wrapped_data = hex::decode(&record.wrapped_data_key)
            .map_err(|e| WeaveError::Serialization(format!("Bad wrapped key hex: {}", e)))?;

        let seed = wrap::unwrap(&wrapped_private, password)?;
        let keypair = Keypair::from_bytes(&seed)?;
        if keypair.public_key() != record.public_key {
            return Err(WeaveError::IdentityIntegrity(
                "Unwrapped private key does not match the recorded public key".to_string(),
            ));
        }

        let data_key_bytes = wrap::unwrap(&wrapped_data, password)?;
        let data_key: [u8; 32] = data_key_bytes
            .try_into()
            .map_err(|_| WeaveError::IdentityIntegrity("Data key must be 32 bytes".to_string()))?;

        Ok(Self {
            record,
            keypair,
            data_key,
        })
    }

    /// Re-wrap both keys under a new password, returning the record to
    /// persist. The keys themselves do not change.
    pub fn rewrap(&self, new_password: &str, kdf: &KdfOptions) -> WeaveResult<IdentityRecord> {
        let wrapped_private_key =
            hex::encode(wrap::wrap(&self.keypair.to_bytes(), new_password, kdf)?);
        let wrapped_data_key = hex::encode(wrap::wrap(&self.data_key, new_password, kdf)?);
        Ok(IdentityRecord {
            public_key: self.record.public_key,
            display_name: self.record.display_name.clone(),
            wrapped_private_key,
            wrapped_data_key,
        })
    }

    pub fn record(&self) -> &IdentityRecord {
        &self.record
    }

    /// The same runtime keys under a replacement record, for use after
    /// a password change rewraps the blobs.
    pub(crate) fn with_record(&self, record: IdentityRecord) -> Identity {
        Identity {
            record,
            keypair: self.keypair.clone(),
            data_key: self.data_key,
        }
    }

    pub fn public_key(&self) -> PublicKey {
        self.record.public_key
    }

    pub fn display_name(&self) -> &str {
        &self.record.display_name
    }

    /// `display_name + "#" + suffix`.
    pub fn handle(&self) -> String {
        handle_for(&self.record.display_name, &self.record.public_key)
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.keypair.sign(message)
    }

    /// The unwrapped symmetric key for user-space values.
    pub fn data_key(&self) -> &[u8; 32] {
        &self.data_key
    }
}

impl Clone for Identity {
    fn clone(&self) -> Self {
        Self {
            record: self.record.clone(),
            keypair: self.keypair.clone(),
            data_key: self.data_key,
        }
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("handle", &self.handle())
            .finish_non_exhaustive()
    }
}

/// Deterministic handle suffix: the first 4 bytes of `SHA-256(pk)` as a
/// big-endian u32, modulo `10^n`, zero-padded to `n` digits.
pub fn deterministic_suffix_n(public_key: &PublicKey, n: u32) -> String {
    let hash = Sha256::digest(public_key.as_bytes());
    let word = u32::from_be_bytes([hash[0], hash[1], hash[2], hash[3]]);
    let modulus = 10u32.pow(n);
    format!("{:0width$}", word % modulus, width = n as usize)
}

/// The standard 4-digit suffix.
pub fn deterministic_suffix(public_key: &PublicKey) -> String {
    deterministic_suffix_n(public_key, SUFFIX_DIGITS)
}

/// Render a handle for a display name and key.
pub fn handle_for(display_name: &str, public_key: &PublicKey) -> String {
    format!("{}#{}", display_name, deterministic_suffix(public_key))
}

/// Split a handle into its name and suffix.
pub fn split_handle(handle: &str) -> Option<(&str, &str)> {
    handle.rsplit_once('#')
}

/// Search for a keypair whose suffix begins with `target`.
///
/// Generates keypairs in batches, invoking `progress` with the attempt
/// count after each batch; progress delivery never delays completion.
/// Returns the matching keypair and the number of attempts, or `None`
/// when `max_attempts` is exhausted.
pub fn search_keypair_with_suffix(
    target: &str,
    max_attempts: u64,
    batch_size: u64,
    mut progress: impl FnMut(u64),
) -> WeaveResult<Option<(Keypair, u64)>> {
    if target.is_empty()
        || target.len() > SUFFIX_DIGITS as usize
        || !target.bytes().all(|b| b.is_ascii_digit())
    {
        return Err(WeaveError::InvalidArgument(format!(
            "Suffix target must be 1-{} digits",
            SUFFIX_DIGITS
        )));
    }

    let mut attempts = 0u64;
    while attempts < max_attempts {
        let batch_end = (attempts + batch_size.max(1)).min(max_attempts);
        while attempts < batch_end {
            attempts += 1;
            let keypair = Keypair::generate();
            if deterministic_suffix(&keypair.public_key()).starts_with(target) {
                return Ok(Some((keypair, attempts)));
            }
        }
        progress(attempts);
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_kdf() -> KdfOptions {
        KdfOptions {
            iterations: 10,
            salt_length: 16,
        }
    }

    #[test]
    fn test_suffix_is_deterministic() {
        let keypair = Keypair::from_seed(&[1u8; 32]);
        let again = Keypair::from_seed(&[1u8; 32]);
        assert_eq!(
            deterministic_suffix(&keypair.public_key()),
            deterministic_suffix(&again.public_key())
        );
    }

    #[test]
    fn test_suffix_shape() {
        let suffix = deterministic_suffix(&Keypair::generate().public_key());
        assert_eq!(suffix.len(), 4);
        assert!(suffix.bytes().all(|b| b.is_ascii_digit()));
    }

    #[test]
    fn test_different_keys_usually_differ() {
        // Flipping the seed changes the key and, overwhelmingly, the
        // suffix; assert on the key-dependence rather than inequality.
        let a = Keypair::from_seed(&[2u8; 32]).public_key();
        let b = Keypair::from_seed(&[3u8; 32]).public_key();
        assert_ne!(a, b);
        let hash_a = Sha256::digest(a.as_bytes());
        let hash_b = Sha256::digest(b.as_bytes());
        assert_ne!(hash_a, hash_b);
    }

    #[test]
    fn test_handle_rendering() {
        let keypair = Keypair::generate();
        let identity = Identity::create_with_keypair(keypair, "carol", "pw", &fast_kdf()).unwrap();
        let handle = identity.handle();
        let (name, suffix) = split_handle(&handle).unwrap();
        assert_eq!(name, "carol");
        assert_eq!(suffix, deterministic_suffix(&identity.public_key()));
    }

    #[test]
    fn test_create_unlock_roundtrip() {
        let identity = Identity::create("carol", "hunter2", &fast_kdf()).unwrap();
        let record = identity.record().clone();

        let unlocked = Identity::unlock(record, "hunter2").unwrap();
        assert_eq!(unlocked.public_key(), identity.public_key());
        assert_eq!(unlocked.data_key(), identity.data_key());

        let message = b"same signer";
        assert!(identity
            .public_key()
            .verify(message, &unlocked.sign(message)));
    }

    #[test]
    fn test_unlock_wrong_password() {
        let identity = Identity::create("carol", "hunter2", &fast_kdf()).unwrap();
        let result = Identity::unlock(identity.record().clone(), "hunter3");
        assert!(matches!(result, Err(WeaveError::WrongPassword)));
    }

    #[test]
    fn test_unlock_detects_identity_tampering() {
        let identity = Identity::create("carol", "pw", &fast_kdf()).unwrap();
        let mut record = identity.record().clone();
        record.public_key = Keypair::generate().public_key();
        let result = Identity::unlock(record, "pw");
        assert!(matches!(result, Err(WeaveError::IdentityIntegrity(_))));
    }

    #[test]
    fn test_rewrap_changes_password_not_keys() {
        let identity = Identity::create("carol", "old", &fast_kdf()).unwrap();
        let record = identity.rewrap("new", &fast_kdf()).unwrap();

        assert!(matches!(
            Identity::unlock(record.clone(), "old"),
            Err(WeaveError::WrongPassword)
        ));
        let unlocked = Identity::unlock(record, "new").unwrap();
        assert_eq!(unlocked.public_key(), identity.public_key());
        assert_eq!(unlocked.data_key(), identity.data_key());
    }

    #[test]
    fn test_backup_roundtrip() {
        let identity = Identity::create("carol", "pw", &fast_kdf()).unwrap();
        let backup = identity.record().to_backup().unwrap();
        let restored = IdentityRecord::from_backup(&backup).unwrap();
        assert_eq!(restored.public_key, identity.public_key());
        assert!(Identity::unlock(restored, "pw").is_ok());
    }

    #[test]
    fn test_display_name_validation() {
        assert!(Identity::create("", "pw", &fast_kdf()).is_err());
        assert!(Identity::create("has#hash", "pw", &fast_kdf()).is_err());
    }

    #[test]
    fn test_suffix_search_single_digit() {
        // A single-digit prefix matches 1 in 10 keys; 5000 attempts make
        // failure astronomically unlikely.
        let mut progress_calls = 0;
        let found = search_keypair_with_suffix("7", 5000, 100, |_| progress_calls += 1)
            .unwrap()
            .expect("a matching keypair within the bound");
        let (keypair, attempts) = found;
        assert!(deterministic_suffix(&keypair.public_key()).starts_with('7'));
        assert!(attempts >= 1);
    }

    #[test]
    fn test_suffix_search_rejects_bad_target() {
        assert!(search_keypair_with_suffix("", 10, 10, |_| {}).is_err());
        assert!(search_keypair_with_suffix("12345", 10, 10, |_| {}).is_err());
        assert!(search_keypair_with_suffix("12a", 10, 10, |_| {}).is_err());
    }

    #[test]
    fn test_suffix_search_respects_bound() {
        // Prefix "0000" requires an exact 4-digit match; 3 attempts will
        // all but certainly miss, exercising the bound path.
        let result = search_keypair_with_suffix("0000", 3, 1, |_| {}).unwrap();
        if let Some((keypair, _)) = result {
            assert!(deterministic_suffix(&keypair.public_key()).starts_with("0000"));
        }
    }
}
