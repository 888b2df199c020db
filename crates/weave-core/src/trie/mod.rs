//! Path-indexed persistent trie
//!
//! The trie indexes storage paths byte by byte. Updates are
//! copy-on-write: `put` clones the touched spine, recomputes digests from
//! the leaf up and writes all fresh nodes in one batch, returning the new
//! root digest. Old roots stay readable for as long as their nodes remain
//! in the byte store, which is what `diff` relies on.
//!
//! Two caches accelerate reads: an LRU of decoded nodes keyed by digest
//! and a single-entry root cache. Both are keyed by content digest, so
//! entries are immutable and never go stale.

mod node;

pub use node::TrieNode;

use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;

use crate::codec::Value;
use crate::digest::Digest;
use crate::error::WeaveResult;
use crate::store::ByteStore;
use crate::values::ValueStore;

/// Default capacity of the decoded-node cache.
pub const DEFAULT_NODE_CACHE: usize = 1000;

/// Character-addressed persistent trie over a byte store.
pub struct Trie {
    store: Arc<dyn ByteStore>,
    values: ValueStore,
    nodes: Mutex<LruCache<Digest, TrieNode>>,
    root_cache: Mutex<Option<(Digest, TrieNode)>>,
}

impl Trie {
    pub fn new(store: Arc<dyn ByteStore>, values: ValueStore, node_cache: usize) -> Self {
        let capacity = NonZeroUsize::new(node_cache.max(1)).unwrap();
        Self {
            store,
            values,
            nodes: Mutex::new(LruCache::new(capacity)),
            root_cache: Mutex::new(None),
        }
    }

    /// The value store holding leaf payloads.
    pub fn values(&self) -> &ValueStore {
        &self.values
    }

    /// Whether a node with this digest is present locally.
    pub fn has_node(&self, digest: &Digest) -> WeaveResult<bool> {
        if self.nodes.lock().contains(digest) {
            return Ok(true);
        }
        Ok(self.store.get(&digest.to_base64())?.is_some())
    }

    /// Raw serialized bytes of a node, for serving sync requests.
    pub fn node_bytes(&self, digest: &Digest) -> WeaveResult<Option<Vec<u8>>> {
        self.store.get(&digest.to_base64())
    }

    /// Store raw node bytes received from a peer, verifying the content
    /// hashes to the advertised digest. Returns the decoded node.
    pub fn put_node_bytes(&self, digest: &Digest, bytes: &[u8]) -> WeaveResult<Option<TrieNode>> {
        if Digest::of(bytes) != *digest {
            return Ok(None);
        }
        let node = TrieNode::deserialize(bytes)?;
        self.store.put(&digest.to_base64(), bytes)?;
        self.nodes.lock().put(*digest, node.clone());
        Ok(Some(node))
    }

    /// Load and decode a node, consulting the caches first.
    pub fn load_node(&self, digest: &Digest) -> WeaveResult<Option<TrieNode>> {
        {
            let root_cache = self.root_cache.lock();
            if let Some((cached_digest, node)) = root_cache.as_ref() {
                if cached_digest == digest {
                    return Ok(Some(node.clone()));
                }
            }
        }
        if let Some(node) = self.nodes.lock().get(digest) {
            return Ok(Some(node.clone()));
        }

        match self.store.get(&digest.to_base64())? {
            Some(bytes) => {
                let node = TrieNode::deserialize(&bytes)?;
                self.nodes.lock().put(*digest, node.clone());
                Ok(Some(node))
            }
            None => Ok(None),
        }
    }

    /// Walk from `root` along `path`, returning the decoded leaf value.
    pub fn get(&self, root: Option<&Digest>, path: &str) -> WeaveResult<Option<Value>> {
        let node = match self.node_at(root, path)? {
            Some(node) => node,
            None => return Ok(None),
        };
        match node.value_ref {
            Some(ref_key) => self.values.get(&ref_key),
            None => Ok(None),
        }
    }

    /// The node sitting at `path`, if the whole path exists.
    pub fn node_at(&self, root: Option<&Digest>, path: &str) -> WeaveResult<Option<TrieNode>> {
        let root = match root {
            Some(root) => root,
            None => return Ok(None),
        };
        let mut node = match self.load_node(root)? {
            Some(node) => node,
            None => return Ok(None),
        };
        for byte in path.bytes() {
            let child = match node.children.get(&byte) {
                Some(child) => *child,
                None => return Ok(None),
            };
            node = match self.load_node(&child)? {
                Some(node) => node,
                None => return Ok(None),
            };
        }
        Ok(Some(node))
    }

    /// Copy-on-write path update. Stores `value` through the value store,
    /// rebuilds the spine from the leaf up and persists every fresh node
    /// in one batch. Returns the new root digest.
    pub fn put(&self, root: Option<&Digest>, path: &str, value: &Value) -> WeaveResult<Digest> {
        // Descend along existing nodes, collecting the spine. A missing
        // sub-node is an empty node.
        let mut spine: Vec<TrieNode> = Vec::with_capacity(path.len() + 1);
        let mut current = match root {
            Some(root) => self.load_node(root)?.unwrap_or_default(),
            None => TrieNode::new(),
        };
        for byte in path.bytes() {
            let next = match current.children.get(&byte) {
                Some(child) => self.load_node(child)?.unwrap_or_default(),
                None => TrieNode::new(),
            };
            spine.push(current);
            current = next;
        }

        // Leaf: write the payload through the value store.
        current.value_ref = Some(self.values.put(value)?);

        // Recompute digests leaf-up, fixing each parent's child entry.
        let mut batch: Vec<(String, Vec<u8>)> = Vec::with_capacity(spine.len() + 1);
        let mut fresh: Vec<(Digest, TrieNode)> = Vec::with_capacity(spine.len() + 1);
        let mut child = current;
        for byte in path.bytes().rev() {
            let bytes = child.serialize();
            let digest = Digest::of(&bytes);
            batch.push((digest.to_base64(), bytes));
            fresh.push((digest, child));

            let mut parent = spine.pop().expect("spine has one node per path byte");
            parent.children.insert(byte, digest);
            child = parent;
        }
        let root_bytes = child.serialize();
        let new_root = Digest::of(&root_bytes);
        batch.push((new_root.to_base64(), root_bytes));
        fresh.push((new_root, child));

        self.store.batch_put(&batch)?;

        let mut nodes = self.nodes.lock();
        for (digest, node) in &fresh {
            nodes.put(*digest, node.clone());
        }
        drop(nodes);
        let (root_digest, root_node) = fresh.pop().expect("root is always present");
        *self.root_cache.lock() = Some((root_digest, root_node));

        Ok(new_root)
    }

    /// Enumerate `(path, value)` pairs present under `new` that are
    /// absent or different under `old`. A missing sub-node is treated as
    /// an empty node.
    pub fn diff(
        &self,
        old: Option<&Digest>,
        new: Option<&Digest>,
    ) -> WeaveResult<Vec<(String, Value)>> {
        let mut out = Vec::new();
        self.diff_nodes(old, new, &mut Vec::new(), &mut out)?;
        Ok(out)
    }

    fn diff_nodes(
        &self,
        old: Option<&Digest>,
        new: Option<&Digest>,
        path: &mut Vec<u8>,
        out: &mut Vec<(String, Value)>,
    ) -> WeaveResult<()> {
        if old == new {
            return Ok(());
        }
        let new = match new {
            Some(new) => new,
            None => return Ok(()),
        };
        let new_node = match self.load_node(new)? {
            Some(node) => node,
            // Pending fetch; the next sync picks the subtree up.
            None => return Ok(()),
        };
        let old_node = match old {
            Some(old) => self.load_node(old)?.unwrap_or_default(),
            None => TrieNode::new(),
        };

        if let Some(new_ref) = &new_node.value_ref {
            if old_node.value_ref.as_ref() != Some(new_ref) {
                if let Some(value) = self.values.get(new_ref)? {
                    let path_str = String::from_utf8_lossy(path).into_owned();
                    out.push((path_str, value));
                }
            }
        }

        for (byte, new_child) in &new_node.children {
            let old_child = old_node.children.get(byte);
            path.push(*byte);
            self.diff_nodes(old_child, Some(new_child), path, out)?;
            path.pop();
        }
        Ok(())
    }
}
