//! Byte-store adapter contract and built-in backends
//!
//! The core only ever sees opaque bytes keyed by strings. Anything that
//! can honor `get`/`put` (plus the optional batched and coalescing-bypass
//! writes) can hold a replica: the shipped backends are an ACID redb file
//! and a process-local in-memory map.
//!
//! Key layout at this level:
//! - `head` → current root digest (ASCII)
//! - `_identity` → JSON-encoded identity record
//! - `<digest>` (base64) → trie-node bytes
//! - `v:<digest>` → codec-encoded value bytes

use parking_lot::RwLock;
use redb::{Database, TableDefinition};
use std::collections::HashMap;
use std::path::Path;

use crate::error::WeaveResult;

const BLOCKS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("blocks");

/// Storage adapter consumed by the core.
///
/// Implementations must serialize concurrent access themselves; the engine
/// treats every call as a suspension boundary and never assumes more than
/// read-your-writes on a single instance.
pub trait ByteStore: Send + Sync {
    /// Read the bytes stored under `key`, if any.
    fn get(&self, key: &str) -> WeaveResult<Option<Vec<u8>>>;

    /// Store `value` under `key`, overwriting any previous bytes.
    fn put(&self, key: &str, value: &[u8]) -> WeaveResult<()>;

    /// Store several entries at once. The default writes them one by one;
    /// backends with transactions should override this.
    fn batch_put(&self, entries: &[(String, Vec<u8>)]) -> WeaveResult<()> {
        for (key, value) in entries {
            self.put(key, value)?;
        }
        Ok(())
    }

    /// Write bypassing any coalescing the adapter performs. Used only for
    /// identity persistence, where losing the write is not acceptable.
    fn force_put(&self, key: &str, value: &[u8]) -> WeaveResult<()> {
        self.put(key, value)
    }

    /// Flush pending writes. The engine calls this exactly once, from
    /// `close()`.
    fn close(&self) -> WeaveResult<()> {
        Ok(())
    }
}

/// In-memory byte store for tests and ephemeral replicas.
#[derive(Default)]
pub struct MemoryStore {
    map: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }
}

impl ByteStore for MemoryStore {
    fn get(&self, key: &str) -> WeaveResult<Option<Vec<u8>>> {
        Ok(self.map.read().get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> WeaveResult<()> {
        self.map.write().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn batch_put(&self, entries: &[(String, Vec<u8>)]) -> WeaveResult<()> {
        let mut map = self.map.write();
        for (key, value) in entries {
            map.insert(key.clone(), value.clone());
        }
        Ok(())
    }
}

/// Persistent byte store backed by redb.
pub struct RedbStore {
    db: Database,
}

impl RedbStore {
    /// Open or create a database file at `path`, creating parent
    /// directories as needed.
    pub fn new(path: impl AsRef<Path>) -> WeaveResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path)?;

        // Make sure the table exists so reads on a fresh file succeed.
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(BLOCKS_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self { db })
    }
}

impl ByteStore for RedbStore {
    fn get(&self, key: &str) -> WeaveResult<Option<Vec<u8>>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(BLOCKS_TABLE)?;
        Ok(table.get(key)?.map(|v| v.value().to_vec()))
    }

    fn put(&self, key: &str, value: &[u8]) -> WeaveResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(BLOCKS_TABLE)?;
            table.insert(key, value)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn batch_put(&self, entries: &[(String, Vec<u8>)]) -> WeaveResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(BLOCKS_TABLE)?;
            for (key, value) in entries {
                table.insert(key.as_str(), value.as_slice())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }
}
