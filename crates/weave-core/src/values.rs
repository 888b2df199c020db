//! Content-addressed value store
//!
//! Leaf payloads live outside the trie nodes, keyed by the digest of
//! their encoded form under a `v:` prefix. Storing the same value twice
//! hits the same key, so payloads deduplicate for free. Decoded values
//! are held in an LRU cache keyed by ref key; entries are immutable, so
//! cached values never go stale.

use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;

use crate::codec::Value;
use crate::digest::Digest;
use crate::error::WeaveResult;
use crate::store::ByteStore;

/// Default capacity of the decoded-value cache.
pub const DEFAULT_VALUE_CACHE: usize = 500;

/// Prefix distinguishing value entries from trie nodes in the byte store.
const VALUE_PREFIX: &str = "v:";

/// Deduplicating blob container mapping `"v:" + digest` to encoded bytes.
pub struct ValueStore {
    store: Arc<dyn ByteStore>,
    cache: Mutex<LruCache<String, Value>>,
}

impl ValueStore {
    pub fn new(store: Arc<dyn ByteStore>, cache_capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(cache_capacity.max(1)).unwrap();
        Self {
            store,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Store a value, returning its ref key. Idempotent: an already
    /// present value is not rewritten.
    pub fn put(&self, value: &Value) -> WeaveResult<String> {
        let encoded = value.encode();
        let ref_key = format!("{}{}", VALUE_PREFIX, Digest::of(&encoded).to_base64());

        if self.store.get(&ref_key)?.is_none() {
            self.store.put(&ref_key, &encoded)?;
        }
        self.cache.lock().put(ref_key.clone(), value.clone());

        Ok(ref_key)
    }

    /// Resolve a ref key to its decoded value.
    pub fn get(&self, ref_key: &str) -> WeaveResult<Option<Value>> {
        if let Some(value) = self.cache.lock().get(ref_key) {
            return Ok(Some(value.clone()));
        }

        match self.store.get(ref_key)? {
            Some(bytes) => {
                let value = Value::decode(&bytes)?;
                self.cache.lock().put(ref_key.to_string(), value.clone());
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Raw encoded bytes for a ref key, for serving sync requests.
    pub fn raw(&self, ref_key: &str) -> WeaveResult<Option<Vec<u8>>> {
        self.store.get(ref_key)
    }

    /// Store raw bytes received from a peer under their ref key, after
    /// checking that the content matches the advertised digest.
    pub fn put_raw(&self, ref_key: &str, bytes: &[u8]) -> WeaveResult<bool> {
        let expected = match ref_key.strip_prefix(VALUE_PREFIX) {
            Some(digest) => digest,
            None => return Ok(false),
        };
        if Digest::of(bytes).to_base64() != expected {
            return Ok(false);
        }
        // Decode strictly before storing so a malformed blob never
        // becomes resolvable.
        Value::decode(bytes)?;
        self.store.put(ref_key, bytes)?;
        Ok(true)
    }
}
