//! Abstract peer link
//!
//! The engine consumes an ordered, reliable, best-effort message pipe
//! between two identified peers; WebRTC or WebSocket transports live
//! outside the core and plug in by constructing a [`PeerLink`] around
//! their own channels. Duplicated delivery is harmless because merge is
//! idempotent.

use tokio::sync::mpsc;

use super::protocol::WireMessage;
use crate::error::{WeaveError, WeaveResult};

/// One end of an ordered message pipe between two peers.
pub struct PeerLink {
    outbound: mpsc::UnboundedSender<WireMessage>,
    inbound: mpsc::UnboundedReceiver<WireMessage>,
}

impl PeerLink {
    /// Build a link from transport-provided channels.
    pub fn from_channels(
        outbound: mpsc::UnboundedSender<WireMessage>,
        inbound: mpsc::UnboundedReceiver<WireMessage>,
    ) -> Self {
        Self { outbound, inbound }
    }

    /// Send a message to the peer.
    pub fn send(&self, msg: WireMessage) -> WeaveResult<()> {
        self.outbound
            .send(msg)
            .map_err(|_| WeaveError::Network("Peer link is closed".to_string()))
    }

    /// Receive the next message; `None` when the peer is gone.
    pub async fn recv(&mut self) -> Option<WireMessage> {
        self.inbound.recv().await
    }

    pub(crate) fn into_parts(
        self,
    ) -> (
        mpsc::UnboundedSender<WireMessage>,
        mpsc::UnboundedReceiver<WireMessage>,
    ) {
        (self.outbound, self.inbound)
    }
}

/// A connected pair of in-process links, for tests and local peers.
pub fn memory_link_pair() -> (PeerLink, PeerLink) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    (
        PeerLink::from_channels(a_tx, a_rx),
        PeerLink::from_channels(b_tx, b_rx),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::protocol::SyncMessage;

    #[tokio::test]
    async fn test_memory_pair_is_bidirectional() {
        let (a, mut b) = memory_link_pair();

        a.send(WireMessage::new(SyncMessage::Request {
            path: "all/k".to_string(),
        }))
        .unwrap();

        match b.recv().await.unwrap().into_inner() {
            SyncMessage::Request { path } => assert_eq!(path, "all/k"),
            other => panic!("wrong message: {:?}", other),
        }

        b.send(WireMessage::new(SyncMessage::Response {
            path: "all/k".to_string(),
            envelope: None,
        }))
        .unwrap();
        drop(b);

        let mut a = a;
        assert!(matches!(
            a.recv().await.unwrap().into_inner(),
            SyncMessage::Response { .. }
        ));
        // Counterparty dropped: the pipe reports closure.
        assert!(a.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_ordering_preserved() {
        let (a, mut b) = memory_link_pair();
        for i in 0..5u64 {
            a.send(WireMessage::new(SyncMessage::Unsubscribe { id: i }))
                .unwrap();
        }
        for i in 0..5u64 {
            match b.recv().await.unwrap().into_inner() {
                SyncMessage::Unsubscribe { id } => assert_eq!(id, i),
                other => panic!("wrong message: {:?}", other),
            }
        }
    }
}
