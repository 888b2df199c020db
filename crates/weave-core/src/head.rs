//! Head-pointer persistence
//!
//! The `head` cell tracks the current local root digest. Writes to it
//! are coalesced: the pointer is persisted after a batch of operations
//! or once the engine goes idle, whichever comes first. `flush` is the
//! only correctness-critical point and the engine calls it from
//! `close()`.

use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::warn;

use crate::digest::Digest;
use crate::error::WeaveResult;
use crate::store::ByteStore;

/// Byte-store key of the head pointer.
pub const HEAD_KEY: &str = "head";

/// Persist after this many recorded roots by default.
pub const DEFAULT_HEAD_BATCH: usize = 5;

/// Persist after this much idle time by default.
pub const DEFAULT_HEAD_IDLE: Duration = Duration::from_millis(50);

struct State {
    pending: Option<Digest>,
    ops: usize,
    generation: u64,
}

/// Write coalescer for the head pointer.
pub struct HeadCoalescer {
    store: Arc<dyn ByteStore>,
    state: Arc<Mutex<State>>,
    batch: usize,
    idle: Duration,
}

impl HeadCoalescer {
    pub fn new(store: Arc<dyn ByteStore>, batch: usize, idle: Duration) -> Self {
        Self {
            store,
            state: Arc::new(Mutex::new(State {
                pending: None,
                ops: 0,
                generation: 0,
            })),
            batch: batch.max(1),
            idle,
        }
    }

    /// Load the persisted head, if any.
    pub fn load(store: &dyn ByteStore) -> WeaveResult<Option<Digest>> {
        match store.get(HEAD_KEY)? {
            Some(bytes) => {
                let text = String::from_utf8(bytes).map_err(|_| {
                    crate::error::WeaveError::Storage("Head pointer is not ASCII".to_string())
                })?;
                Ok(Some(Digest::from_base64(text.trim())?))
            }
            None => Ok(None),
        }
    }

    /// Record a new root. Persists immediately once `batch` roots have
    /// accumulated, otherwise schedules an idle flush.
    pub fn record(&self, root: Digest) {
        let generation;
        {
            let mut state = self.state.lock();
            state.pending = Some(root);
            state.ops += 1;
            state.generation += 1;
            generation = state.generation;
            if state.ops >= self.batch {
                Self::flush_locked(&self.store, &mut state);
                return;
            }
        }

        // Idle flush: fires only if no newer record superseded this one.
        // Weak references so a sleeping flusher never keeps the store
        // (and its file lock) alive past the engine.
        let store: Weak<dyn ByteStore> = Arc::downgrade(&self.store);
        let state = Arc::downgrade(&self.state);
        let idle = self.idle;
        tokio::spawn(async move {
            tokio::time::sleep(idle).await;
            let (Some(store), Some(state)) = (store.upgrade(), state.upgrade()) else {
                return;
            };
            let mut state = state.lock();
            if state.generation == generation {
                Self::flush_locked(&store, &mut state);
            }
        });
    }

    /// Persist any pending head immediately.
    pub fn flush(&self) -> WeaveResult<()> {
        let mut state = self.state.lock();
        if let Some(root) = state.pending.take() {
            state.ops = 0;
            self.store.put(HEAD_KEY, root.to_base64().as_bytes())?;
        }
        Ok(())
    }

    fn flush_locked(store: &Arc<dyn ByteStore>, state: &mut State) {
        if let Some(root) = state.pending.take() {
            state.ops = 0;
            if let Err(e) = store.put(HEAD_KEY, root.to_base64().as_bytes()) {
                warn!(error = %e, "Failed to persist head pointer");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn coalescer(batch: usize, idle_ms: u64) -> (Arc<MemoryStore>, HeadCoalescer) {
        let store = Arc::new(MemoryStore::new());
        let head = HeadCoalescer::new(store.clone(), batch, Duration::from_millis(idle_ms));
        (store, head)
    }

    #[tokio::test]
    async fn test_batch_persists_immediately() {
        let (store, head) = coalescer(2, 10_000);
        let root1 = Digest::of(b"r1");
        let root2 = Digest::of(b"r2");

        head.record(root1);
        assert_eq!(store.get(HEAD_KEY).unwrap(), None);

        head.record(root2);
        assert_eq!(
            store.get(HEAD_KEY).unwrap(),
            Some(root2.to_base64().into_bytes())
        );
    }

    #[tokio::test]
    async fn test_idle_flush_fires() {
        let (store, head) = coalescer(100, 20);
        let root = Digest::of(b"r");
        head.record(root);

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(
            store.get(HEAD_KEY).unwrap(),
            Some(root.to_base64().into_bytes())
        );
    }

    #[tokio::test]
    async fn test_flush_on_close_path() {
        let (store, head) = coalescer(100, 10_000);
        let root = Digest::of(b"r");
        head.record(root);

        head.flush().unwrap();
        assert_eq!(
            store.get(HEAD_KEY).unwrap(),
            Some(root.to_base64().into_bytes())
        );
        assert_eq!(HeadCoalescer::load(store.as_ref()).unwrap(), Some(root));
    }

    #[tokio::test]
    async fn test_load_empty_store() {
        let store = MemoryStore::new();
        assert_eq!(HeadCoalescer::load(&store).unwrap(), None);
    }
}
