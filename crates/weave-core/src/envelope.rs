//! Authenticated write envelopes
//!
//! Every leaf the trie stores is an envelope: a payload naming the full
//! storage path, the value, the author and a wall-clock timestamp, plus
//! the author's signature over the canonical serialization of the
//! payload. User-space values are encrypted under the author's data key
//! before they enter the payload, so the envelope that replicates to
//! peers carries only ciphertext.

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::Aes256Gcm;
use rand::RngCore;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::canonical::{canonical_bytes, to_canonical_json};
use crate::codec::Value;
use crate::error::{WeaveError, WeaveResult};
use crate::identity::PublicKey;
use crate::space::Space;

/// AES-GCM nonce size for user-space value encryption.
const IV_SIZE: usize = 12;

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is after the epoch")
        .as_millis() as u64
}

/// The signed portion of an envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Payload {
    /// Full storage path, space tag included.
    pub key: String,
    /// The user's value; a hex ciphertext string when `is_encrypted`.
    pub value: Value,
    /// Millisecond wall-clock at the author.
    pub timestamp: u64,
    /// The author's public key.
    pub author: PublicKey,
    /// Whether `value` is a ciphertext.
    pub is_encrypted: bool,
    /// The data space the write targets.
    pub space: Space,
}

impl Payload {
    /// The exact byte sequence the signature covers: canonical JSON with
    /// lexicographic keys and no insignificant whitespace.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let as_value = Value::Map(vec![
            ("author".to_string(), Value::Text(self.author.to_base64())),
            ("is_encrypted".to_string(), Value::Bool(self.is_encrypted)),
            ("key".to_string(), Value::Text(self.key.clone())),
            ("space".to_string(), Value::Text(self.space.tag().to_string())),
            ("timestamp".to_string(), Value::Int(self.timestamp as i64)),
            ("value".to_string(), self.value.clone()),
        ]);
        canonical_bytes(&to_canonical_json(&as_value))
    }
}

/// A signed write: the unit of storage and sync.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub payload: Payload,
    /// Signature over `payload.canonical_bytes()`.
    pub signature: Vec<u8>,
}

impl Envelope {
    /// Sign a payload. `sign_fn` receives the canonical payload bytes.
    pub fn seal(payload: Payload, sign_fn: impl Fn(&[u8]) -> Vec<u8>) -> Self {
        let signature = sign_fn(&payload.canonical_bytes());
        Self { payload, signature }
    }

    /// Verify the signature against the payload's author.
    pub fn verify(&self) -> bool {
        self.payload
            .author
            .verify(&self.payload.canonical_bytes(), &self.signature)
    }

    /// Convert to the codec value stored at the trie leaf.
    pub fn to_value(&self) -> Value {
        Value::Map(vec![
            (
                "payload".to_string(),
                Value::Map(vec![
                    ("key".to_string(), Value::Text(self.payload.key.clone())),
                    ("value".to_string(), self.payload.value.clone()),
                    ("timestamp".to_string(), Value::Int(self.payload.timestamp as i64)),
                    (
                        "author".to_string(),
                        Value::Text(self.payload.author.to_base64()),
                    ),
                    (
                        "is_encrypted".to_string(),
                        Value::Bool(self.payload.is_encrypted),
                    ),
                    (
                        "space".to_string(),
                        Value::Text(self.payload.space.tag().to_string()),
                    ),
                ]),
            ),
            ("signature".to_string(), Value::Bytes(self.signature.clone())),
        ])
    }

    /// Parse the codec value stored at a trie leaf.
    pub fn from_value(value: &Value) -> WeaveResult<Self> {
        let payload = value
            .get("payload")
            .ok_or_else(|| WeaveError::InvalidEncoding("Envelope missing payload".to_string()))?;
        let signature = value
            .get("signature")
            .and_then(Value::as_bytes)
            .ok_or_else(|| WeaveError::InvalidEncoding("Envelope missing signature".to_string()))?
            .to_vec();

        let key = payload
            .get("key")
            .and_then(Value::as_text)
            .ok_or_else(|| WeaveError::InvalidEncoding("Payload missing key".to_string()))?
            .to_string();
        let inner = payload
            .get("value")
            .ok_or_else(|| WeaveError::InvalidEncoding("Payload missing value".to_string()))?
            .clone();
        let timestamp = payload
            .get("timestamp")
            .and_then(Value::as_int)
            .filter(|t| *t >= 0)
            .ok_or_else(|| WeaveError::InvalidEncoding("Payload missing timestamp".to_string()))?
            as u64;
        let author = payload
            .get("author")
            .and_then(Value::as_text)
            .ok_or_else(|| WeaveError::InvalidEncoding("Payload missing author".to_string()))
            .and_then(PublicKey::from_base64)?;
        let is_encrypted = payload
            .get("is_encrypted")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let space = payload
            .get("space")
            .and_then(Value::as_text)
            .and_then(Space::from_tag)
            .ok_or_else(|| WeaveError::InvalidEncoding("Payload missing space".to_string()))?;

        Ok(Self {
            payload: Payload {
                key,
                value: inner,
                timestamp,
                author,
                is_encrypted,
                space,
            },
            signature,
        })
    }

    /// Encoded byte form, for the wire and for dedup keys.
    pub fn encode(&self) -> Vec<u8> {
        self.to_value().encode()
    }

    /// Decode the byte form produced by [`encode`](Self::encode).
    pub fn decode(bytes: &[u8]) -> WeaveResult<Self> {
        Self::from_value(&Value::decode(bytes)?)
    }
}

/// Encrypt a value for the user space: the codec encoding is sealed with
/// AES-256-GCM under the author's data key, a fresh 12-byte IV prepended,
/// and the whole rendered as a hex string.
pub fn encrypt_value(value: &Value, data_key: &[u8; 32]) -> WeaveResult<Value> {
    let plaintext = value.encode();

    let mut iv = [0u8; IV_SIZE];
    rand::rng().fill_bytes(&mut iv);

    let cipher = Aes256Gcm::new(GenericArray::from_slice(data_key));
    let ciphertext = cipher
        .encrypt(GenericArray::from_slice(&iv), plaintext.as_slice())
        .map_err(|e| WeaveError::Crypto(format!("Value encryption failed: {}", e)))?;

    let mut sealed = iv.to_vec();
    sealed.extend_from_slice(&ciphertext);
    Ok(Value::Text(hex::encode(sealed)))
}

/// Reverse [`encrypt_value`]. Fails with a crypto error for the wrong
/// key or tampered ciphertext.
pub fn decrypt_value(sealed: &Value, data_key: &[u8; 32]) -> WeaveResult<Value> {
    let hex_str = sealed
        .as_text()
        .ok_or_else(|| WeaveError::Crypto("Encrypted value must be a hex string".to_string()))?;
    let bytes = hex::decode(hex_str)
        .map_err(|e| WeaveError::Crypto(format!("Bad ciphertext hex: {}", e)))?;
    if bytes.len() < IV_SIZE {
        return Err(WeaveError::Crypto("Ciphertext too short".to_string()));
    }

    let cipher = Aes256Gcm::new(GenericArray::from_slice(data_key));
    let plaintext = cipher
        .decrypt(GenericArray::from_slice(&bytes[..IV_SIZE]), &bytes[IV_SIZE..])
        .map_err(|e| WeaveError::Crypto(format!("Value decryption failed: {}", e)))?;

    Value::decode(&plaintext)
}
