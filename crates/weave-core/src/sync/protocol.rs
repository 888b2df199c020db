//! Sync wire protocol
//!
//! Messages are serialized with postcard and exchanged over the abstract
//! peer link. Envelopes travel as their codec byte form so the wire
//! layer never re-interprets signed content.
//!
//! ## Message Flow
//!
//! ```text
//! Peer A                                Peer B
//!   |                                      |
//!   |--- Handshake {root, pk} ------------>|
//!   |<-- Handshake {root, pk} -------------|
//!   |                                      |
//!   |      (roots differ, pull!)           |
//!   |                                      |
//!   |--- RequestNode {digest} ------------>|
//!   |<-- ResponseNode {digest, bytes} -----|
//!   |--- RequestValue {ref_key} ---------->|
//!   |<-- ResponseValue {ref_key, bytes} ---|
//!   |                                      |
//!   |--- SyncComplete {new root} --------->|
//!   |                                      |
//!   |<-- PushEnvelope {envelope} ----------|   (live writes)
//! ```

use serde::{Deserialize, Serialize};

use crate::digest::Digest;

/// Messages exchanged between two peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SyncMessage {
    /// Opening advertisement: local root digest and public key.
    Handshake {
        root: Option<Digest>,
        public_key: Option<String>,
    },

    /// Re-advertise the sender's root to trigger reconciliation.
    RequestSync { root: Option<Digest> },

    /// Ask for the raw bytes of a trie node.
    RequestNode { digest: Digest },

    /// Answer to `RequestNode`; `bytes` is `None` when the node is
    /// unknown to the responder.
    ResponseNode {
        digest: Digest,
        bytes: Option<Vec<u8>>,
    },

    /// Ask for the raw bytes of a stored value.
    RequestValue { ref_key: String },

    /// Answer to `RequestValue`.
    ResponseValue {
        ref_key: String,
        bytes: Option<Vec<u8>>,
    },

    /// Broadcast of a freshly written envelope (codec byte form).
    /// `volatile` envelopes are delivered but never persisted.
    PushEnvelope { envelope: Vec<u8>, volatile: bool },

    /// The sender finished pulling and adopted a new root.
    SyncComplete { root: Option<Digest> },

    /// Advertise a subscription so the counterparty forwards events.
    Subscribe {
        id: u64,
        pattern: String,
        is_regex: bool,
    },

    /// Withdraw an advertised subscription.
    Unsubscribe { id: u64 },

    /// Notification that a path changed on the sender's side.
    Event {
        path: String,
        space: String,
        author: String,
        timestamp: u64,
    },

    /// Ask for the envelope stored at a single path.
    Request { path: String },

    /// Answer to `Request`; the envelope in codec byte form, if present.
    Response {
        path: String,
        envelope: Option<Vec<u8>>,
    },
}

/// Versioned wrapper so the protocol can evolve without breaking
/// existing peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WireMessage {
    V1(SyncMessage),
}

impl WireMessage {
    pub fn new(msg: SyncMessage) -> Self {
        WireMessage::V1(msg)
    }

    /// Encode to bytes using postcard.
    pub fn encode(&self) -> Result<Vec<u8>, postcard::Error> {
        postcard::to_allocvec(self)
    }

    /// Decode from bytes using postcard.
    pub fn decode(data: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(data)
    }

    /// Unwrap the inner message.
    pub fn into_inner(self) -> SyncMessage {
        match self {
            WireMessage::V1(msg) => msg,
        }
    }
}
