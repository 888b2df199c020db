//! Canonical serialization for signed bytes
//!
//! Signatures must be stable across peers regardless of local map
//! iteration order, so everything that goes under a signature is first
//! rendered as deterministic JSON: lexicographically ordered object keys,
//! no insignificant whitespace, standard scalar encodings. Binary values
//! are rendered as URL-safe unpadded base64 strings.
//!
//! This is distinct from the storage codec in [`crate::codec`]: the codec
//! preserves insertion order and binary payloads, while the canonical form
//! exists only to produce the exact byte sequence a signature covers.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde_json::{Map, Number};

use crate::codec::Value;

/// Render a codec value as a canonical JSON value.
///
/// `serde_json`'s default object map is ordered lexicographically, so
/// serializing the result yields the canonical byte form directly.
pub fn to_canonical_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Int(n) => serde_json::Value::Number(Number::from(*n)),
        Value::Float(f) => Number::from_f64(*f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::Text(s) => serde_json::Value::String(s.clone()),
        Value::Bytes(b) => serde_json::Value::String(URL_SAFE_NO_PAD.encode(b)),
        Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(to_canonical_json).collect())
        }
        Value::Map(entries) => {
            let mut map = Map::new();
            for (key, val) in entries {
                map.insert(key.clone(), to_canonical_json(val));
            }
            serde_json::Value::Object(map)
        }
    }
}

/// Serialize a canonical JSON value to the bytes that get signed.
pub fn canonical_bytes(value: &serde_json::Value) -> Vec<u8> {
    // serde_json emits no insignificant whitespace and iterates object
    // keys in lexicographic order (BTreeMap-backed).
    serde_json::to_vec(value).expect("canonical JSON value is always serializable")
}
