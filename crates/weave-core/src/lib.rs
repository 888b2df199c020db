//! Weave Core Library
//!
//! A decentralized, peer-replicated key-value store. Every write is
//! signed by its author, every piece of data is addressed by the
//! SHA-256 of its serialized form, and peers converge by exchanging
//! root digests and pulling missing content-addressed blocks.
//!
//! ## Overview
//!
//! Keys live in one of three *spaces*: `all` (public, mutable,
//! last-write-wins), `frozen` (public, immutable, first-write-wins) and
//! `user` (private, encrypted under the author's data key). A
//! character-addressed persistent trie indexes the storage paths;
//! updates are copy-on-write, so every state of the database is a root
//! digest and two peers with the same root hold identical data.
//!
//! ## Quick Start
//!
//! ```ignore
//! use weave_core::{EngineOptions, GetOptions, PutOptions, WeaveEngine};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = WeaveEngine::create(EngineOptions::default()).await?;
//!
//!     engine.signup("carol", "correct horse battery").await?;
//!     engine.put("greeting", "hello".into(), PutOptions::default()).await?;
//!
//!     let value = engine.get("greeting", GetOptions::default()).await?;
//!     println!("{:?}", value);
//!
//!     engine.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! Peers connect over any ordered message pipe by wrapping its ends in
//! a [`PeerLink`] and calling [`WeaveEngine::attach_peer`]; the engines
//! handshake, pull each other's missing blocks and converge.

pub mod canonical;
pub mod claims;
pub mod codec;
pub mod digest;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod events;
pub mod head;
pub mod identity;
pub mod merge;
pub mod space;
pub mod store;
pub mod sync;
pub mod trie;
pub mod values;

// Re-exports
pub use codec::Value;
pub use digest::Digest;
pub use engine::{
    EngineOptions, GetOptions, PutOptions, SignupResult, SuffixSignupOptions, SuffixSignupResult,
    WeaveEngine,
};
pub use envelope::{Envelope, Payload};
pub use error::{WeaveError, WeaveResult};
pub use events::{Event, EventDispatcher, Pattern};
pub use identity::{deterministic_suffix, handle_for, Identity, Keypair, PublicKey};
pub use merge::MAX_CLAIM_AGE_MS;
pub use space::Space;
pub use store::{ByteStore, MemoryStore, RedbStore};
pub use sync::{memory_link_pair, PeerLink, SyncMessage, WireMessage};
pub use trie::{Trie, TrieNode};
