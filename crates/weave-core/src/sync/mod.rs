//! Peer synchronization plumbing
//!
//! The [`SyncManager`] tracks connected peers and correlates
//! request/response pairs over the abstract link: each outstanding
//! `RequestNode`/`RequestValue`/`Request` holds a oneshot completion
//! that either resolves with the peer's bytes or times out to
//! "unavailable" without aborting the surrounding sync. The engine owns
//! the pull/merge algorithm itself and drives this layer.

mod link;
mod protocol;

pub use link::{memory_link_pair, PeerLink};
pub use protocol::{SyncMessage, WireMessage};

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::digest::Digest;
use crate::events::Matcher;

/// Default per-request timeout before a fetch resolves to unavailable.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

type Pending = Mutex<HashMap<String, Vec<oneshot::Sender<Option<Vec<u8>>>>>>;

/// Per-connection state for one peer.
#[derive(Default)]
pub struct PeerState {
    /// The root the peer last advertised.
    pub remote_root: Mutex<Option<Digest>>,
    /// The peer's public key, learned in the handshake.
    pub remote_key: Mutex<Option<String>>,
    /// Subscription patterns the peer advertised.
    pub remote_subs: Mutex<HashMap<u64, Matcher>>,
    /// Held while a pull from this peer runs, so reconciliations do not
    /// interleave.
    pub pulling: tokio::sync::Mutex<()>,
    pending_nodes: Pending,
    pending_values: Pending,
    pending_paths: Pending,
}

struct Peer {
    tx: mpsc::UnboundedSender<WireMessage>,
    state: Arc<PeerState>,
}

/// Registry of live peer connections.
pub struct SyncManager {
    peers: RwLock<HashMap<u64, Peer>>,
    next_id: AtomicU64,
    timeout: Duration,
}

impl SyncManager {
    pub fn new(timeout: Duration) -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            timeout,
        }
    }

    /// Register a peer's outbound channel, returning its id and state.
    pub fn register(&self, tx: mpsc::UnboundedSender<WireMessage>) -> (u64, Arc<PeerState>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let state = Arc::new(PeerState::default());
        self.peers.write().insert(
            id,
            Peer {
                tx,
                state: state.clone(),
            },
        );
        (id, state)
    }

    /// Drop a peer; outstanding requests against it resolve to
    /// unavailable as their senders are dropped.
    pub fn remove(&self, id: u64) {
        self.peers.write().remove(&id);
    }

    pub fn peer_ids(&self) -> Vec<u64> {
        self.peers.read().keys().copied().collect()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    pub fn state(&self, id: u64) -> Option<Arc<PeerState>> {
        self.peers.read().get(&id).map(|p| p.state.clone())
    }

    /// Send a message to one peer. Returns false when the peer is gone.
    pub fn send(&self, id: u64, msg: SyncMessage) -> bool {
        match self.peers.read().get(&id) {
            Some(peer) => peer.tx.send(WireMessage::new(msg)).is_ok(),
            None => false,
        }
    }

    /// Send a message to every connected peer.
    pub fn broadcast(&self, msg: &SyncMessage) -> usize {
        let peers = self.peers.read();
        let mut sent = 0;
        for peer in peers.values() {
            if peer.tx.send(WireMessage::new(msg.clone())).is_ok() {
                sent += 1;
            }
        }
        sent
    }

    /// Fetch a node's bytes from a peer, or `None` on timeout/absence.
    pub async fn request_node(&self, id: u64, digest: &Digest) -> Option<Vec<u8>> {
        let key = digest.to_base64();
        let msg = SyncMessage::RequestNode { digest: *digest };
        self.request(id, key, msg, |state| &state.pending_nodes).await
    }

    /// Fetch a value's bytes from a peer, or `None` on timeout/absence.
    pub async fn request_value(&self, id: u64, ref_key: &str) -> Option<Vec<u8>> {
        let msg = SyncMessage::RequestValue {
            ref_key: ref_key.to_string(),
        };
        self.request(id, ref_key.to_string(), msg, |state| &state.pending_values)
            .await
    }

    /// Fetch the envelope at a path from a peer.
    pub async fn request_path(&self, id: u64, path: &str) -> Option<Vec<u8>> {
        let msg = SyncMessage::Request {
            path: path.to_string(),
        };
        self.request(id, path.to_string(), msg, |state| &state.pending_paths)
            .await
    }

    async fn request(
        &self,
        id: u64,
        key: String,
        msg: SyncMessage,
        table: impl Fn(&PeerState) -> &Pending,
    ) -> Option<Vec<u8>> {
        let state = self.state(id)?;
        let (tx, rx) = oneshot::channel();
        table(&state).lock().entry(key.clone()).or_default().push(tx);

        if !self.send(id, msg) {
            return None;
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(bytes)) => bytes,
            // Timeout or dropped sender: unavailable, never fatal.
            _ => {
                debug!(peer = id, key = %key, "Request timed out");
                table(&state)
                    .lock()
                    .entry(key)
                    .or_default()
                    .retain(|tx| !tx.is_closed());
                None
            }
        }
    }

    /// Complete outstanding node requests for a digest.
    pub fn resolve_node(&self, id: u64, digest: &Digest, bytes: Option<Vec<u8>>) {
        if let Some(state) = self.state(id) {
            Self::resolve(&state.pending_nodes, &digest.to_base64(), bytes);
        }
    }

    /// Complete outstanding value requests for a ref key.
    pub fn resolve_value(&self, id: u64, ref_key: &str, bytes: Option<Vec<u8>>) {
        if let Some(state) = self.state(id) {
            Self::resolve(&state.pending_values, ref_key, bytes);
        }
    }

    /// Complete outstanding path requests.
    pub fn resolve_path(&self, id: u64, path: &str, bytes: Option<Vec<u8>>) {
        if let Some(state) = self.state(id) {
            Self::resolve(&state.pending_paths, path, bytes);
        }
    }

    fn resolve(pending: &Pending, key: &str, bytes: Option<Vec<u8>>) {
        let waiters = pending.lock().remove(key).unwrap_or_default();
        for waiter in waiters {
            let _ = waiter.send(bytes.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> SyncManager {
        SyncManager::new(Duration::from_millis(100))
    }

    #[tokio::test]
    async fn test_register_and_send() {
        let manager = manager();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (id, _) = manager.register(tx);

        assert!(manager.send(id, SyncMessage::RequestSync { root: None }));
        assert!(matches!(
            rx.recv().await.unwrap().into_inner(),
            SyncMessage::RequestSync { root: None }
        ));

        manager.remove(id);
        assert!(!manager.send(id, SyncMessage::RequestSync { root: None }));
    }

    #[tokio::test]
    async fn test_request_resolves_with_response() {
        let manager = Arc::new(manager());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (id, _) = manager.register(tx);
        let digest = Digest::of(b"node");

        let requester = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.request_node(id, &digest).await })
        };

        // The "peer": read the request, answer it.
        match rx.recv().await.unwrap().into_inner() {
            SyncMessage::RequestNode { digest: d } => assert_eq!(d, digest),
            other => panic!("wrong message: {:?}", other),
        }
        manager.resolve_node(id, &digest, Some(vec![1, 2, 3]));

        assert_eq!(requester.await.unwrap(), Some(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn test_request_times_out_to_unavailable() {
        let manager = manager();
        let (tx, _rx) = mpsc::unbounded_channel();
        let (id, _) = manager.register(tx);

        let digest = Digest::of(b"never-answered");
        assert_eq!(manager.request_node(id, &digest).await, None);
    }

    #[tokio::test]
    async fn test_request_against_unknown_peer() {
        let manager = manager();
        assert_eq!(manager.request_node(99, &Digest::of(b"x")).await, None);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_all_peers() {
        let manager = manager();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        manager.register(tx1);
        manager.register(tx2);

        assert_eq!(manager.broadcast(&SyncMessage::RequestSync { root: None }), 2);
        assert!(rx1.recv().await.is_some());
        assert!(rx2.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_resolve_without_request_is_harmless() {
        let manager = manager();
        let (tx, _rx) = mpsc::unbounded_channel();
        let (id, _) = manager.register(tx);
        manager.resolve_value(id, "v:abc", Some(vec![1]));
    }
}
