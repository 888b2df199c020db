//! Main WeaveEngine - the primary entry point for Weave
//!
//! WeaveEngine ties identity, the content-addressed trie, envelope
//! admission, synchronization and events together behind the public
//! `put`/`get`/`sync` operations.
//!
//! All mutating operations are sequenced through a single async lock
//! over the engine core (trie root and identity), which realizes the
//! single-writer discipline the trie and head pointer require on a
//! multi-threaded runtime. Peer traffic is handled by one task per
//! attached link; pulls run in their own tasks so a peer's
//! request/response stream keeps draining while a reconciliation is in
//! flight.
//!
//! # Example
//!
//! ```ignore
//! use weave_core::{EngineOptions, PutOptions, Space, WeaveEngine};
//!
//! let engine = WeaveEngine::create(EngineOptions::default()).await?;
//! engine.signup("carol", "hunter2").await?;
//! engine.put("greeting", "hello".into(), PutOptions::default()).await?;
//! ```

use lru::LruCache;
use parking_lot::Mutex as SyncMutex;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::codec::Value;
use crate::digest::Digest;
use crate::envelope::{self, Envelope, Payload};
use crate::error::{WeaveError, WeaveResult};
use crate::events::{Event, EventDispatcher, Pattern};
use crate::head::{HeadCoalescer, DEFAULT_HEAD_BATCH, DEFAULT_HEAD_IDLE};
use crate::claims::{self, UsernameClaim};
use crate::identity::{self, Identity, IdentityRecord, KdfOptions, PublicKey, IDENTITY_KEY};
use crate::merge::{self, Admission, MAX_CLAIM_AGE_MS};
use crate::space::{self, Space};
use crate::store::{ByteStore, MemoryStore, RedbStore};
use crate::sync::{PeerLink, SyncManager, SyncMessage, DEFAULT_REQUEST_TIMEOUT};
use crate::trie::{Trie, DEFAULT_NODE_CACHE};
use crate::values::{ValueStore, DEFAULT_VALUE_CACHE};

/// Default wait for `get` with `wait_for_sync` before reading locally.
pub const DEFAULT_GET_TIMEOUT: Duration = Duration::from_secs(2);

/// Capacity of the seen-envelope dedup cache.
const SEEN_CACHE: usize = 1024;

/// Configuration for [`WeaveEngine::create`].
pub struct EngineOptions {
    /// Directory for the on-disk store. Ignored when `store` is set;
    /// when both are absent the engine runs on an in-memory store.
    pub data_dir: Option<PathBuf>,
    /// Inject a byte-store adapter directly.
    pub store: Option<Arc<dyn ByteStore>>,
    /// Decoded trie-node cache capacity.
    pub node_cache: usize,
    /// Decoded value cache capacity.
    pub value_cache: usize,
    /// Password-derivation parameters for identity wrapping.
    pub kdf: KdfOptions,
    /// Head coalescer: persist after this many writes.
    pub head_batch: usize,
    /// Head coalescer: persist after this much idle time.
    pub head_idle: Duration,
    /// Per-request network timeout.
    pub request_timeout: Duration,
    /// Replay barrier for frozen writes, in milliseconds.
    pub max_claim_age: u64,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            data_dir: None,
            store: None,
            node_cache: DEFAULT_NODE_CACHE,
            value_cache: DEFAULT_VALUE_CACHE,
            kdf: KdfOptions::default(),
            head_batch: DEFAULT_HEAD_BATCH,
            head_idle: DEFAULT_HEAD_IDLE,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_claim_age: MAX_CLAIM_AGE_MS,
        }
    }
}

/// Options for [`WeaveEngine::put`].
#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    pub space: Space,
    /// Broadcast only; the write never touches the trie.
    pub volatile: bool,
    /// Persist but suppress local event emission and peer broadcast.
    pub silent: bool,
}

/// Options for [`WeaveEngine::get`].
#[derive(Debug, Clone)]
pub struct GetOptions {
    pub space: Space,
    /// Wait for a matching event before reading the local trie.
    pub wait_for_sync: bool,
    pub timeout: Duration,
}

impl Default for GetOptions {
    fn default() -> Self {
        Self {
            space: Space::All,
            wait_for_sync: false,
            timeout: DEFAULT_GET_TIMEOUT,
        }
    }
}

/// Result of a successful signup.
#[derive(Debug, Clone)]
pub struct SignupResult {
    pub public_key: PublicKey,
    pub handle: String,
}

/// Result of a custom-suffix signup.
#[derive(Debug, Clone)]
pub struct SuffixSignupResult {
    pub public_key: PublicKey,
    pub handle: String,
    /// Keypairs generated before one matched.
    pub attempts: u64,
}

/// Bounds for the custom-suffix keypair search.
#[derive(Debug, Clone)]
pub struct SuffixSignupOptions {
    pub max_attempts: u64,
    pub batch_size: u64,
    /// Retries with a fresh matching keypair when the handle is taken.
    pub max_taken_retries: u32,
}

impl Default for SuffixSignupOptions {
    fn default() -> Self {
        Self {
            max_attempts: 1_000_000,
            batch_size: 1_000,
            max_taken_retries: 5,
        }
    }
}

/// Trie root and identity; everything the single writer guards.
struct Core {
    root: Option<Digest>,
    identity: Option<Identity>,
}

struct EngineInner {
    store: Arc<dyn ByteStore>,
    trie: Trie,
    dispatcher: EventDispatcher,
    sync: SyncManager,
    head: HeadCoalescer,
    core: Mutex<Core>,
    /// Dedup of envelopes by (author, timestamp, path) for the case
    /// where direct pipe and room broadcast deliver the same write.
    seen: SyncMutex<LruCache<(String, u64, String), ()>>,
    peer_tasks: SyncMutex<HashMap<u64, JoinHandle<()>>>,
    /// Local subscriptions advertised to peers: id -> (pattern, is_regex).
    advertised_subs: SyncMutex<HashMap<u64, (String, bool)>>,
    closed: AtomicBool,
    kdf: KdfOptions,
    max_claim_age: u64,
}

/// Main entry point for Weave.
pub struct WeaveEngine {
    inner: Arc<EngineInner>,
}

impl WeaveEngine {
    /// Create an engine over the configured byte store, loading the
    /// persisted head pointer if one exists.
    pub async fn create(options: EngineOptions) -> WeaveResult<Self> {
        let store: Arc<dyn ByteStore> = match (options.store, &options.data_dir) {
            (Some(store), _) => store,
            (None, Some(dir)) => Arc::new(RedbStore::new(dir.join("weave.redb"))?),
            (None, None) => Arc::new(MemoryStore::new()),
        };

        let root = HeadCoalescer::load(store.as_ref())?;
        info!(head = ?root, "Initializing WeaveEngine");

        let values = ValueStore::new(store.clone(), options.value_cache);
        let trie = Trie::new(store.clone(), values, options.node_cache);
        let head = HeadCoalescer::new(store.clone(), options.head_batch, options.head_idle);

        let inner = Arc::new(EngineInner {
            store,
            trie,
            dispatcher: EventDispatcher::new(),
            sync: SyncManager::new(options.request_timeout),
            head,
            core: Mutex::new(Core {
                root,
                identity: None,
            }),
            seen: SyncMutex::new(LruCache::new(NonZeroUsize::new(SEEN_CACHE).unwrap())),
            peer_tasks: SyncMutex::new(HashMap::new()),
            advertised_subs: SyncMutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            kdf: options.kdf,
            max_claim_age: options.max_claim_age,
        });

        Ok(Self { inner })
    }

    /// Flush pending state and tear the engine down. Every subsequent
    /// operation fails with [`WeaveError::Closed`].
    pub async fn close(&self) -> WeaveResult<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        for (_, task) in self.inner.peer_tasks.lock().drain() {
            task.abort();
        }
        self.inner.head.flush()?;
        self.inner.store.close()?;
        info!("WeaveEngine closed");
        Ok(())
    }

    fn ensure_open(&self) -> WeaveResult<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(WeaveError::Closed);
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Identity Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Create a fresh identity, persist it and register its handle in
    /// the frozen registry. Fails with `HandleTaken` when the handle is
    /// already claimed by a different key.
    pub async fn signup(&self, display_name: &str, password: &str) -> WeaveResult<SignupResult> {
        self.ensure_open()?;
        if self.inner.store.get(IDENTITY_KEY)?.is_some() {
            return Err(WeaveError::InvalidArgument(
                "An identity already exists in this store".to_string(),
            ));
        }
        let identity = self
            .derive_identity(identity::Keypair::generate(), display_name, password)
            .await?;
        self.install_identity(identity).await
    }

    /// Signup that searches for a keypair whose handle suffix starts
    /// with `target`. Progress is logged; the search runs on a blocking
    /// thread and never delays completion once a match is found.
    pub async fn signup_with_suffix(
        &self,
        display_name: &str,
        password: &str,
        target: &str,
        options: SuffixSignupOptions,
    ) -> WeaveResult<SuffixSignupResult> {
        self.ensure_open()?;
        if self.inner.store.get(IDENTITY_KEY)?.is_some() {
            return Err(WeaveError::InvalidArgument(
                "An identity already exists in this store".to_string(),
            ));
        }

        let mut total_attempts = 0u64;
        for round in 0..=options.max_taken_retries {
            let target_owned = target.to_string();
            let max_attempts = options.max_attempts;
            let batch_size = options.batch_size;
            let found = tokio::task::spawn_blocking(move || {
                identity::search_keypair_with_suffix(
                    &target_owned,
                    max_attempts,
                    batch_size,
                    |attempts| debug!(attempts, "Suffix search progress"),
                )
            })
            .await
            .map_err(|e| WeaveError::Crypto(format!("Suffix search task failed: {}", e)))??;

            let (keypair, attempts) = match found {
                Some(found) => found,
                None => {
                    return Err(WeaveError::Unavailable(format!(
                        "No keypair with suffix {} within {} attempts",
                        target, options.max_attempts
                    )))
                }
            };
            total_attempts += attempts;

            let identity = self.derive_identity(keypair, display_name, password).await?;
            match self.install_identity(identity).await {
                Ok(result) => {
                    return Ok(SuffixSignupResult {
                        public_key: result.public_key,
                        handle: result.handle,
                        attempts: total_attempts,
                    })
                }
                Err(WeaveError::HandleTaken(handle)) if round < options.max_taken_retries => {
                    debug!(%handle, "Handle taken, retrying with a fresh keypair");
                }
                Err(e) => return Err(e),
            }
        }
        Err(WeaveError::HandleTaken(format!("{}#{}…", display_name, target)))
    }

    async fn derive_identity(
        &self,
        keypair: identity::Keypair,
        display_name: &str,
        password: &str,
    ) -> WeaveResult<Identity> {
        let display_name = display_name.to_string();
        let password = password.to_string();
        let kdf = self.inner.kdf;
        tokio::task::spawn_blocking(move || {
            Identity::create_with_keypair(keypair, &display_name, &password, &kdf)
        })
        .await
        .map_err(|e| WeaveError::Crypto(format!("Key derivation task failed: {}", e)))?
    }

    /// Claim the handle, persist the record and log the identity in.
    async fn install_identity(&self, identity: Identity) -> WeaveResult<SignupResult> {
        self.claim_handle(&identity).await?;

        self.inner
            .store
            .force_put(IDENTITY_KEY, &identity.record().to_json()?)?;

        let result = SignupResult {
            public_key: identity.public_key(),
            handle: identity.handle(),
        };
        self.inner.core.lock().await.identity = Some(identity);
        info!(handle = %result.handle, "Signed up");
        Ok(result)
    }

    /// Write the handle claim into `frozen/handles/<normalized_handle>`.
    async fn claim_handle(&self, identity: &Identity) -> WeaveResult<()> {
        let handle = identity.handle();
        let path = format!("{}{}", space::HANDLES_PREFIX, space::normalize_key(&handle));
        let now = envelope::now_ms();

        let mut core = self.inner.core.lock().await;
        if let Some(existing) = self.read_envelope(core.root.as_ref(), &path)? {
            if existing.payload.author == identity.public_key() {
                // Same key re-claiming its own handle is a no-op.
                return Ok(());
            }
            return Err(WeaveError::HandleTaken(handle));
        }

        let claim = claims::HandleClaim::seal(&handle, identity.public_key(), now, |data| {
            identity.sign(data)
        });
        let payload = Payload {
            key: path,
            value: claim.to_value(),
            timestamp: now,
            author: identity.public_key(),
            is_encrypted: false,
            space: Space::Frozen,
        };
        let sealed = Envelope::seal(payload, |data| identity.sign(data));
        self.commit_envelope(&mut core, sealed.clone())?;
        drop(core);

        self.announce(&sealed, false);
        Ok(())
    }

    /// Unlock the persisted identity with `password`.
    pub async fn login(&self, password: &str) -> WeaveResult<PublicKey> {
        self.ensure_open()?;
        let record_bytes = self
            .inner
            .store
            .get(IDENTITY_KEY)?
            .ok_or_else(|| WeaveError::InvalidArgument("No identity to log in to".to_string()))?;
        let record = IdentityRecord::from_json(&record_bytes)?;

        let password = password.to_string();
        let identity = tokio::task::spawn_blocking(move || Identity::unlock(record, &password))
            .await
            .map_err(|e| WeaveError::Crypto(format!("Unlock task failed: {}", e)))??;

        let public_key = identity.public_key();
        self.inner.core.lock().await.identity = Some(identity);
        info!("Logged in");
        Ok(public_key)
    }

    /// Drop the runtime keys.
    pub async fn logout(&self) {
        self.inner.core.lock().await.identity = None;
    }

    pub async fn is_logged_in(&self) -> bool {
        self.inner.core.lock().await.identity.is_some()
    }

    /// The logged-in identity's public key.
    pub async fn public_key(&self) -> Option<PublicKey> {
        self.inner
            .core
            .lock()
            .await
            .identity
            .as_ref()
            .map(|i| i.public_key())
    }

    /// The logged-in identity's handle.
    pub async fn handle(&self) -> Option<String> {
        self.inner
            .core
            .lock()
            .await
            .identity
            .as_ref()
            .map(|i| i.handle())
    }

    /// Re-wrap the identity keys under a new password.
    pub async fn change_password(&self, old: &str, new: &str) -> WeaveResult<()> {
        self.ensure_open()?;
        let record_bytes = self
            .inner
            .store
            .get(IDENTITY_KEY)?
            .ok_or_else(|| WeaveError::InvalidArgument("No identity stored".to_string()))?;
        let record = IdentityRecord::from_json(&record_bytes)?;

        let old = old.to_string();
        let new = new.to_string();
        let kdf = self.inner.kdf;
        let (identity, new_record) = tokio::task::spawn_blocking(move || {
            let identity = Identity::unlock(record, &old)?;
            let new_record = identity.rewrap(&new, &kdf)?;
            Ok::<_, WeaveError>((identity, new_record))
        })
        .await
        .map_err(|e| WeaveError::Crypto(format!("Rewrap task failed: {}", e)))??;

        self.inner
            .store
            .force_put(IDENTITY_KEY, &new_record.to_json()?)?;
        self.inner.core.lock().await.identity = Some(identity.with_record(new_record));
        info!("Password changed");
        Ok(())
    }

    /// Export the identity record as a backup string. The password is
    /// required to prove the caller can actually use the backup.
    pub async fn export_identity(&self, password: &str) -> WeaveResult<String> {
        self.ensure_open()?;
        let record_bytes = self
            .inner
            .store
            .get(IDENTITY_KEY)?
            .ok_or_else(|| WeaveError::InvalidArgument("No identity stored".to_string()))?;
        let record = IdentityRecord::from_json(&record_bytes)?;

        let password = password.to_string();
        let check = record.clone();
        tokio::task::spawn_blocking(move || Identity::unlock(check, &password))
            .await
            .map_err(|e| WeaveError::Crypto(format!("Unlock task failed: {}", e)))??;

        record.to_backup()
    }

    /// Import a backup produced by [`export_identity`](Self::export_identity),
    /// verifying the password and the key integrity before persisting.
    pub async fn import_identity(&self, backup: &str, password: &str) -> WeaveResult<PublicKey> {
        self.ensure_open()?;
        let record = IdentityRecord::from_backup(backup)?;

        let password = password.to_string();
        let check = record.clone();
        let identity = tokio::task::spawn_blocking(move || Identity::unlock(check, &password))
            .await
            .map_err(|e| WeaveError::Crypto(format!("Unlock task failed: {}", e)))??;

        self.inner.store.force_put(IDENTITY_KEY, &record.to_json()?)?;
        let public_key = identity.public_key();
        self.inner.core.lock().await.identity = Some(identity);
        info!("Identity imported");
        Ok(public_key)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Data Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Write a value. Returns the new root digest, or `None` for
    /// volatile writes.
    pub async fn put(
        &self,
        key: &str,
        value: Value,
        options: PutOptions,
    ) -> WeaveResult<Option<Digest>> {
        self.ensure_open()?;
        let mut core = self.inner.core.lock().await;
        let identity = core
            .identity
            .as_ref()
            .ok_or(WeaveError::NotAuthenticated)?
            .clone();

        let path = space::storage_path(options.space, key, Some(&identity.public_key()))?;

        let (stored_value, is_encrypted) = match options.space {
            Space::User => (envelope::encrypt_value(&value, identity.data_key())?, true),
            _ => (value.clone(), false),
        };

        if options.space == Space::Frozen
            && self.read_envelope(core.root.as_ref(), &path)?.is_some()
        {
            return Err(WeaveError::Immutable(path));
        }

        let payload = Payload {
            key: path.clone(),
            value: stored_value,
            timestamp: envelope::now_ms(),
            author: identity.public_key(),
            is_encrypted,
            space: options.space,
        };
        let sealed = Envelope::seal(payload, |data| identity.sign(data));

        if options.volatile {
            drop(core);
            if !options.silent {
                self.broadcast_envelope(&sealed, true);
                self.emit_for(&sealed, false);
            }
            return Ok(None);
        }

        let new_root = self.commit_envelope(&mut core, sealed.clone())?;
        drop(core);

        if !options.silent {
            self.announce(&sealed, false);
        }
        Ok(Some(new_root))
    }

    /// Read a value. For the `user` space the path is the caller's own
    /// and the stored ciphertext is decrypted with the runtime data key.
    pub async fn get(&self, key: &str, options: GetOptions) -> WeaveResult<Option<Value>> {
        self.ensure_open()?;

        let (path, identity) = {
            let core = self.inner.core.lock().await;
            let identity = core.identity.clone();
            let author = identity.as_ref().map(|i| i.public_key());
            (
                space::storage_path(options.space, key, author.as_ref())?,
                identity,
            )
        };

        if options.wait_for_sync {
            self.wait_for_path(&path, identity.as_ref().map(|i| i.public_key()), options.timeout)
                .await;
        }

        let core = self.inner.core.lock().await;
        let envelope = match self.read_envelope(core.root.as_ref(), &path)? {
            Some(envelope) => envelope,
            None => return Ok(None),
        };
        drop(core);

        if envelope.payload.is_encrypted {
            let identity = identity.ok_or(WeaveError::NotAuthenticated)?;
            return Ok(Some(envelope::decrypt_value(
                &envelope.payload.value,
                identity.data_key(),
            )?));
        }
        Ok(Some(envelope.payload.value))
    }

    /// Subscribe to events matching `path`, ask every peer for it, and
    /// wait until something lands or the timeout passes.
    async fn wait_for_path(&self, path: &str, owner: Option<PublicKey>, timeout: Duration) {
        let subscribed = self
            .inner
            .dispatcher
            .subscribe(Pattern::Exact(path.to_string()), owner);
        let (sub_id, mut rx) = match subscribed {
            Ok(pair) => pair,
            Err(_) => return,
        };

        self.inner.sync.broadcast(&SyncMessage::Request {
            path: path.to_string(),
        });

        let _ = tokio::time::timeout(timeout, rx.recv()).await;
        self.inner.dispatcher.unsubscribe(sub_id);
    }

    /// The raw envelope stored at a full storage path, if any.
    pub async fn get_entry(&self, path: &str) -> WeaveResult<Option<Envelope>> {
        self.ensure_open()?;
        let core = self.inner.core.lock().await;
        self.read_envelope(core.root.as_ref(), path)
    }

    /// The current local root digest.
    pub async fn head(&self) -> Option<Digest> {
        self.inner.core.lock().await.root
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Username Claims
    // ═══════════════════════════════════════════════════════════════════════

    /// Add a signed claim on `name` to the shared claim set.
    pub async fn claim_username(&self, name: &str) -> WeaveResult<Option<Digest>> {
        self.write_username_claim(name, false).await
    }

    /// Insert a revocation claim for `name` by the logged-in identity.
    pub async fn revoke_username(&self, name: &str) -> WeaveResult<Option<Digest>> {
        self.write_username_claim(name, true).await
    }

    async fn write_username_claim(&self, name: &str, revoked: bool) -> WeaveResult<Option<Digest>> {
        self.ensure_open()?;
        let normalized = space::normalize_key(name);
        if normalized.is_empty() {
            return Err(WeaveError::InvalidArgument("Empty username".to_string()));
        }
        let path = format!("{}{}", space::USERNAME_CLAIMS_PREFIX, normalized);

        let mut core = self.inner.core.lock().await;
        let identity = core
            .identity
            .as_ref()
            .ok_or(WeaveError::NotAuthenticated)?
            .clone();

        let claim = UsernameClaim::seal(
            &normalized,
            identity.public_key(),
            envelope::now_ms(),
            revoked,
            |data| identity.sign(data),
        );

        // Claim sets merge by union, locally as well as remotely.
        let existing = self
            .read_envelope(core.root.as_ref(), &path)?
            .map(|e| e.payload.value)
            .unwrap_or(Value::Array(vec![]));
        let merged = claims::merge_claim_sets(&existing, &claims::claim_set_to_value(&[claim]));

        let payload = Payload {
            key: path,
            value: merged,
            timestamp: envelope::now_ms(),
            author: identity.public_key(),
            is_encrypted: false,
            space: Space::All,
        };
        let sealed = Envelope::seal(payload, |data| identity.sign(data));
        let new_root = self.commit_envelope(&mut core, sealed.clone())?;
        drop(core);

        self.announce(&sealed, false);
        Ok(Some(new_root))
    }

    /// Resolve the winning claim on `name`, if any.
    pub async fn whois(&self, name: &str) -> WeaveResult<Option<UsernameClaim>> {
        self.ensure_open()?;
        let path = format!(
            "{}{}",
            space::USERNAME_CLAIMS_PREFIX,
            space::normalize_key(name)
        );
        let core = self.inner.core.lock().await;
        let set = match self.read_envelope(core.root.as_ref(), &path)? {
            Some(envelope) => claims::claim_set_from_value(&envelope.payload.value),
            None => return Ok(None),
        };
        Ok(claims::resolve_winner(&set))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Subscriptions
    // ═══════════════════════════════════════════════════════════════════════

    /// Subscribe to writes matching a pattern. Events arrive on the
    /// returned channel; the subscription is also advertised to peers so
    /// they notify us about matching remote writes.
    pub async fn subscribe(
        &self,
        pattern: Pattern,
    ) -> WeaveResult<(u64, mpsc::UnboundedReceiver<Event>)> {
        self.ensure_open()?;
        let owner = self.public_key().await;
        let (id, rx) = self.inner.dispatcher.subscribe(pattern.clone(), owner)?;

        let (pattern_str, is_regex) = match pattern {
            Pattern::Exact(s) | Pattern::Glob(s) => (s, false),
            Pattern::Regex(s) => (s, true),
        };
        self.inner
            .advertised_subs
            .lock()
            .insert(id, (pattern_str.clone(), is_regex));
        self.inner.sync.broadcast(&SyncMessage::Subscribe {
            id,
            pattern: pattern_str,
            is_regex,
        });
        Ok((id, rx))
    }

    /// Cancel a subscription.
    pub fn unsubscribe(&self, id: u64) -> bool {
        let existed = self.inner.dispatcher.unsubscribe(id);
        if existed {
            self.inner.advertised_subs.lock().remove(&id);
            self.inner.sync.broadcast(&SyncMessage::Unsubscribe { id });
        }
        existed
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Synchronization
    // ═══════════════════════════════════════════════════════════════════════

    /// Attach a peer over an abstract link and start the handshake.
    /// Returns the peer id for [`detach_peer`](Self::detach_peer).
    pub async fn attach_peer(&self, link: PeerLink) -> WeaveResult<u64> {
        self.ensure_open()?;
        let (tx, mut rx) = link.into_parts();
        let (peer_id, _state) = self.inner.sync.register(tx);

        // Opening advertisement: our root and key, plus our live
        // subscriptions so the peer forwards matching events.
        let (root, public_key) = {
            let core = self.inner.core.lock().await;
            (
                core.root,
                core.identity.as_ref().map(|i| i.public_key().to_base64()),
            )
        };
        self.inner
            .sync
            .send(peer_id, SyncMessage::Handshake { root, public_key });
        for (id, (pattern, is_regex)) in self.inner.advertised_subs.lock().iter() {
            self.inner.sync.send(
                peer_id,
                SyncMessage::Subscribe {
                    id: *id,
                    pattern: pattern.clone(),
                    is_regex: *is_regex,
                },
            );
        }

        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                EngineInner::handle_message(&inner, peer_id, msg.into_inner()).await;
            }
            debug!(peer = peer_id, "Peer link closed");
            inner.sync.remove(peer_id);
        });
        self.inner.peer_tasks.lock().insert(peer_id, task);

        info!(peer = peer_id, "Peer attached");
        Ok(peer_id)
    }

    /// Detach a peer and stop its receive task.
    pub fn detach_peer(&self, peer_id: u64) {
        if let Some(task) = self.inner.peer_tasks.lock().remove(&peer_id) {
            task.abort();
        }
        self.inner.sync.remove(peer_id);
    }

    /// Number of attached peers.
    pub fn peer_count(&self) -> usize {
        self.inner.sync.peer_count()
    }

    /// Reconcile a single key with every peer: each is asked for the
    /// path's envelope and any answers run through merge.
    pub async fn sync(&self, key: &str, space: Space) -> WeaveResult<()> {
        self.ensure_open()?;
        let author = self.public_key().await;
        let path = space::storage_path(space, key, author.as_ref())?;
        for peer_id in self.inner.sync.peer_ids() {
            // The response handler merges; the await just bounds it.
            let _ = self.inner.sync.request_path(peer_id, &path).await;
        }
        Ok(())
    }

    /// Re-advertise our root to every peer and pull from every peer
    /// whose advertised root differs from ours.
    pub async fn sync_all(&self) -> WeaveResult<()> {
        self.ensure_open()?;
        let (root, public_key) = {
            let core = self.inner.core.lock().await;
            (
                core.root,
                core.identity.as_ref().map(|i| i.public_key().to_base64()),
            )
        };
        for peer_id in self.inner.sync.peer_ids() {
            self.inner
                .sync
                .send(peer_id, SyncMessage::Handshake { root, public_key: public_key.clone() });
            let remote_root = self
                .inner
                .sync
                .state(peer_id)
                .and_then(|s| *s.remote_root.lock());
            if let Some(remote_root) = remote_root {
                if Some(remote_root) != root {
                    EngineInner::spawn_pull(&self.inner, peer_id, remote_root);
                }
            }
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Internals
    // ═══════════════════════════════════════════════════════════════════════

    fn read_envelope(&self, root: Option<&Digest>, path: &str) -> WeaveResult<Option<Envelope>> {
        EngineInner::read_envelope_at(&self.inner, root, path)
    }

    /// Store an envelope in the trie and move the head.
    fn commit_envelope(&self, core: &mut Core, envelope: Envelope) -> WeaveResult<Digest> {
        let new_root = self
            .inner
            .trie
            .put(core.root.as_ref(), &envelope.payload.key, &envelope.to_value())?;
        core.root = Some(new_root);
        self.inner.head.record(new_root);
        self.mark_seen(&envelope);
        Ok(new_root)
    }

    fn mark_seen(&self, envelope: &Envelope) {
        EngineInner::mark_seen_on(&self.inner, envelope);
    }

    /// Local-event + peer-broadcast half of a successful write.
    fn announce(&self, envelope: &Envelope, remote: bool) {
        self.emit_for(envelope, remote);
        self.broadcast_envelope(envelope, false);
    }

    fn emit_for(&self, envelope: &Envelope, remote: bool) {
        EngineInner::emit_for_on(&self.inner, envelope, remote);
    }

    fn broadcast_envelope(&self, envelope: &Envelope, volatile: bool) {
        self.inner.sync.broadcast(&SyncMessage::PushEnvelope {
            envelope: envelope.encode(),
            volatile,
        });
    }
}

impl EngineInner {
    fn read_envelope_at(
        inner: &Arc<EngineInner>,
        root: Option<&Digest>,
        path: &str,
    ) -> WeaveResult<Option<Envelope>> {
        match inner.trie.get(root, path)? {
            Some(value) => Ok(Some(Envelope::from_value(&value)?)),
            None => Ok(None),
        }
    }

    fn mark_seen_on(inner: &Arc<EngineInner>, envelope: &Envelope) {
        inner.seen.lock().put(
            (
                envelope.payload.author.to_base64(),
                envelope.payload.timestamp,
                envelope.payload.key.clone(),
            ),
            (),
        );
    }

    fn already_seen(inner: &Arc<EngineInner>, envelope: &Envelope) -> bool {
        inner
            .seen
            .lock()
            .contains(&(
                envelope.payload.author.to_base64(),
                envelope.payload.timestamp,
                envelope.payload.key.clone(),
            ))
    }

    /// Emit to local subscribers and forward a notification to peers
    /// whose advertised subscriptions match.
    fn emit_for_on(inner: &Arc<EngineInner>, envelope: &Envelope, remote: bool) {
        let event = Event {
            path: envelope.payload.key.clone(),
            space: envelope.payload.space,
            author: envelope.payload.author,
            timestamp: envelope.payload.timestamp,
            remote,
            value: Some(envelope.payload.value.clone()),
        };
        inner.dispatcher.emit(&event);
        Self::forward_event(inner, envelope);
    }

    /// Wire-event notifications for peers with matching subscriptions.
    /// User-space notifications go only to the path owner.
    fn forward_event(inner: &Arc<EngineInner>, envelope: &Envelope) {
        let path = &envelope.payload.key;
        let owner = space::user_path_owner(path).map(str::to_string);
        for peer_id in inner.sync.peer_ids() {
            let Some(state) = inner.sync.state(peer_id) else {
                continue;
            };
            if envelope.payload.space == Space::User {
                let remote_key = state.remote_key.lock().clone();
                if remote_key.as_deref() != owner.as_deref() {
                    continue;
                }
            }
            let matched = state
                .remote_subs
                .lock()
                .values()
                .any(|matcher| matcher.matches(path));
            if matched {
                inner.sync.send(
                    peer_id,
                    SyncMessage::Event {
                        path: path.clone(),
                        space: envelope.payload.space.tag().to_string(),
                        author: envelope.payload.author.to_base64(),
                        timestamp: envelope.payload.timestamp,
                    },
                );
            }
        }
    }

    /// Admit one remote envelope: verify, merge, persist, emit.
    /// Admission errors reject the envelope (logged at warn) and never
    /// propagate.
    async fn merge_remote(inner: &Arc<EngineInner>, envelope: Envelope) -> WeaveResult<bool> {
        if Self::already_seen(inner, &envelope) {
            return Ok(false);
        }
        Self::mark_seen_on(inner, &envelope);

        let mut core = inner.core.lock().await;
        let path = envelope.payload.key.clone();
        let existing = Self::read_envelope_at(inner, core.root.as_ref(), &path)?;

        let admitted = match merge::admit(
            existing.as_ref(),
            envelope,
            envelope::now_ms(),
            inner.max_claim_age,
        ) {
            Ok(Admission::Store(envelope)) => envelope,
            Ok(Admission::Keep) => return Ok(false),
            Err(e) => {
                warn!(%path, error = %e, "Rejected remote envelope");
                return Ok(false);
            }
        };

        let new_root = inner
            .trie
            .put(core.root.as_ref(), &path, &admitted.to_value())?;
        core.root = Some(new_root);
        inner.head.record(new_root);
        drop(core);

        Self::emit_for_on(inner, &admitted, true);
        Ok(true)
    }

    fn spawn_pull(inner: &Arc<EngineInner>, peer_id: u64, remote_root: Digest) {
        let inner = inner.clone();
        tokio::spawn(async move {
            if let Err(e) = Self::pull_and_adopt(&inner, peer_id, remote_root).await {
                warn!(peer = peer_id, error = %e, "Sync pull failed");
            }
        });
    }

    /// `sync_from(remote_root)`: pull the missing subgraph, then adopt.
    async fn pull_and_adopt(
        inner: &Arc<EngineInner>,
        peer_id: u64,
        remote_root: Digest,
    ) -> WeaveResult<()> {
        let Some(state) = inner.sync.state(peer_id) else {
            return Ok(());
        };
        // One pull per peer at a time.
        let _guard = state.pulling.lock().await;

        let before = inner.core.lock().await.root;
        if before == Some(remote_root) {
            return Ok(());
        }

        Self::pull_tree(inner, peer_id, remote_root).await?;
        Self::apply_remote_root(inner, remote_root).await?;

        // Advertise the merged root only when adoption moved it; when
        // every change was rejected the peer knows our root already and
        // re-sending would bounce sync_completes back and forth forever.
        let after = inner.core.lock().await.root;
        if after != before {
            inner
                .sync
                .send(peer_id, SyncMessage::SyncComplete { root: after });
        }
        Ok(())
    }

    /// Breadth-first fetch of every node reachable from `root` that is
    /// not yet in the local store, one concurrent wave per depth. Nodes
    /// that time out are skipped; the walk continues best-effort.
    async fn pull_tree(
        inner: &Arc<EngineInner>,
        peer_id: u64,
        root: Digest,
    ) -> WeaveResult<()> {
        let mut frontier = vec![root];
        while !frontier.is_empty() {
            let mut wave = tokio::task::JoinSet::new();
            for digest in frontier.drain(..) {
                let inner = inner.clone();
                wave.spawn(async move { Self::fetch_node(&inner, peer_id, digest).await });
            }
            while let Some(joined) = wave.join_next().await {
                match joined {
                    Ok(Ok(children)) => frontier.extend(children),
                    Ok(Err(e)) => warn!(peer = peer_id, error = %e, "Node fetch failed"),
                    Err(e) => warn!(peer = peer_id, error = %e, "Fetch task panicked"),
                }
            }
        }
        Ok(())
    }

    /// Fetch one node (and its value, if any), returning the children
    /// still to visit. A digest already present locally stops the
    /// recursion for its subtree.
    async fn fetch_node(
        inner: &Arc<EngineInner>,
        peer_id: u64,
        digest: Digest,
    ) -> WeaveResult<Vec<Digest>> {
        if inner.trie.has_node(&digest)? {
            return Ok(Vec::new());
        }
        let Some(bytes) = inner.sync.request_node(peer_id, &digest).await else {
            debug!(peer = peer_id, %digest, "Node unavailable");
            return Ok(Vec::new());
        };
        let Some(node) = inner.trie.put_node_bytes(&digest, &bytes)? else {
            warn!(peer = peer_id, %digest, "Peer sent bytes with a different digest");
            return Ok(Vec::new());
        };

        if let Some(ref_key) = &node.value_ref {
            if inner.trie.values().raw(ref_key)?.is_none() {
                match inner.sync.request_value(peer_id, ref_key).await {
                    Some(value_bytes) => {
                        if !inner.trie.values().put_raw(ref_key, &value_bytes)? {
                            warn!(peer = peer_id, %ref_key, "Value bytes did not match ref");
                        }
                    }
                    None => debug!(peer = peer_id, %ref_key, "Value unavailable"),
                }
            }
        }

        Ok(node.children.values().copied().collect())
    }

    /// Adopt a pulled remote root: diff it against the local root and
    /// run every changed envelope through merge, so local LWW winners
    /// and frozen first-writes survive. Emits a remote event per
    /// admitted change.
    async fn apply_remote_root(inner: &Arc<EngineInner>, remote_root: Digest) -> WeaveResult<()> {
        let mut core = inner.core.lock().await;
        let old_root = core.root;
        if old_root == Some(remote_root) {
            return Ok(());
        }

        let changes = inner.trie.diff(old_root.as_ref(), Some(&remote_root))?;
        let now = envelope::now_ms();
        let mut admitted = Vec::new();

        for (path, value) in changes {
            let envelope = match Envelope::from_value(&value) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!(%path, error = %e, "Skipping malformed leaf");
                    continue;
                }
            };
            // A signed envelope binds to its own path; refuse grafts.
            if envelope.payload.key != path {
                warn!(%path, claimed = %envelope.payload.key, "Envelope path mismatch");
                continue;
            }
            let existing = Self::read_envelope_at(inner, core.root.as_ref(), &path)?;
            match merge::admit(existing.as_ref(), envelope, now, inner.max_claim_age) {
                Ok(Admission::Store(envelope)) => {
                    let new_root =
                        inner
                            .trie
                            .put(core.root.as_ref(), &path, &envelope.to_value())?;
                    core.root = Some(new_root);
                    admitted.push(envelope);
                }
                Ok(Admission::Keep) => {}
                Err(e) => warn!(%path, error = %e, "Rejected envelope during adoption"),
            }
        }

        if core.root != old_root {
            let root = core.root.expect("root was just set");
            inner.head.record(root);
            info!(admitted = admitted.len(), "Adopted remote root");
        }
        drop(core);

        for envelope in &admitted {
            Self::mark_seen_on(inner, envelope);
            Self::emit_for_on(inner, envelope, true);
        }
        Ok(())
    }

    /// Dispatch one inbound peer message.
    async fn handle_message(inner: &Arc<EngineInner>, peer_id: u64, msg: SyncMessage) {
        match msg {
            SyncMessage::Handshake { root, public_key } => {
                if let Some(state) = inner.sync.state(peer_id) {
                    *state.remote_key.lock() = public_key;
                    *state.remote_root.lock() = root;
                }
                Self::maybe_pull(inner, peer_id, root).await;
            }
            SyncMessage::RequestSync { root } => {
                if let Some(state) = inner.sync.state(peer_id) {
                    *state.remote_root.lock() = root;
                }
                Self::maybe_pull(inner, peer_id, root).await;
            }
            SyncMessage::SyncComplete { root } => {
                if let Some(state) = inner.sync.state(peer_id) {
                    *state.remote_root.lock() = root;
                }
                Self::maybe_pull(inner, peer_id, root).await;
            }
            SyncMessage::RequestNode { digest } => {
                let bytes = inner.trie.node_bytes(&digest).unwrap_or_default();
                inner
                    .sync
                    .send(peer_id, SyncMessage::ResponseNode { digest, bytes });
            }
            SyncMessage::ResponseNode { digest, bytes } => {
                inner.sync.resolve_node(peer_id, &digest, bytes);
            }
            SyncMessage::RequestValue { ref_key } => {
                let bytes = inner.trie.values().raw(&ref_key).unwrap_or_default();
                inner
                    .sync
                    .send(peer_id, SyncMessage::ResponseValue { ref_key, bytes });
            }
            SyncMessage::ResponseValue { ref_key, bytes } => {
                inner.sync.resolve_value(peer_id, &ref_key, bytes);
            }
            SyncMessage::PushEnvelope { envelope, volatile } => {
                let envelope = match Envelope::decode(&envelope) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        warn!(peer = peer_id, error = %e, "Undecodable pushed envelope");
                        return;
                    }
                };
                if volatile {
                    Self::handle_volatile(inner, envelope);
                } else if let Err(e) = Self::merge_remote(inner, envelope).await {
                    warn!(peer = peer_id, error = %e, "Merge failed");
                }
            }
            SyncMessage::Subscribe {
                id,
                pattern,
                is_regex,
            } => {
                let pattern = if is_regex {
                    Pattern::Regex(pattern)
                } else if pattern.contains('*') {
                    Pattern::Glob(pattern)
                } else {
                    Pattern::Exact(pattern)
                };
                match pattern.matcher() {
                    Ok(matcher) => {
                        if let Some(state) = inner.sync.state(peer_id) {
                            state.remote_subs.lock().insert(id, matcher);
                        }
                    }
                    Err(e) => warn!(peer = peer_id, error = %e, "Bad remote subscription"),
                }
            }
            SyncMessage::Unsubscribe { id } => {
                if let Some(state) = inner.sync.state(peer_id) {
                    state.remote_subs.lock().remove(&id);
                }
            }
            SyncMessage::Event { path, .. } => {
                // A notification without data: pull the path from the
                // notifying peer; the response merges on arrival.
                let inner = inner.clone();
                tokio::spawn(async move {
                    let _ = inner.sync.request_path(peer_id, &path).await;
                });
            }
            SyncMessage::Request { path } => {
                let envelope = {
                    let core = inner.core.lock().await;
                    Self::read_envelope_at(inner, core.root.as_ref(), &path)
                        .ok()
                        .flatten()
                        .map(|e| e.encode())
                };
                inner
                    .sync
                    .send(peer_id, SyncMessage::Response { path, envelope });
            }
            SyncMessage::Response { path, envelope } => {
                if let Some(bytes) = &envelope {
                    if let Ok(decoded) = Envelope::decode(bytes) {
                        if let Err(e) = Self::merge_remote(inner, decoded).await {
                            warn!(peer = peer_id, error = %e, "Merge of response failed");
                        }
                    }
                }
                inner.sync.resolve_path(peer_id, &path, envelope);
            }
        }
    }

    /// A volatile envelope is verified and delivered as an event but
    /// never persisted.
    fn handle_volatile(inner: &Arc<EngineInner>, envelope: Envelope) {
        if Self::already_seen(inner, &envelope) {
            return;
        }
        match merge::admit(None, envelope, envelope::now_ms(), inner.max_claim_age) {
            Ok(Admission::Store(envelope)) => {
                Self::mark_seen_on(inner, &envelope);
                Self::emit_for_on(inner, &envelope, true);
            }
            Ok(Admission::Keep) => {}
            Err(e) => warn!(error = %e, "Rejected volatile envelope"),
        }
    }

    /// Start a pull if the advertised root differs from ours.
    async fn maybe_pull(inner: &Arc<EngineInner>, peer_id: u64, remote_root: Option<Digest>) {
        let Some(remote_root) = remote_root else {
            // The peer is empty; it will pull from our handshake.
            return;
        };
        if inner.core.lock().await.root == Some(remote_root) {
            return;
        }
        Self::spawn_pull(inner, peer_id, remote_root);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn create_test_engine() -> WeaveEngine {
        let options = EngineOptions {
            kdf: KdfOptions {
                iterations: 10,
                salt_length: 16,
            },
            ..EngineOptions::default()
        };
        WeaveEngine::create(options).await.unwrap()
    }

    #[tokio::test]
    async fn test_engine_starts_empty() {
        let engine = create_test_engine().await;
        assert_eq!(engine.head().await, None);
        assert_eq!(engine.peer_count(), 0);
        assert!(!engine.is_logged_in().await);
    }

    #[tokio::test]
    async fn test_head_moves_with_each_write() {
        let engine = create_test_engine().await;
        engine.signup("carol", "pw").await.unwrap();

        // Signup already wrote the handle claim.
        let after_signup = engine.head().await;
        assert!(after_signup.is_some());

        engine
            .put("k", Value::Int(1), PutOptions::default())
            .await
            .unwrap();
        assert_ne!(engine.head().await, after_signup);
    }

    #[tokio::test]
    async fn test_get_entry_exposes_raw_envelope() {
        let engine = create_test_engine().await;
        engine.signup("carol", "pw").await.unwrap();
        engine
            .put("k", Value::Int(7), PutOptions::default())
            .await
            .unwrap();

        let entry = engine.get_entry("all/k").await.unwrap().unwrap();
        assert_eq!(entry.payload.key, "all/k");
        assert_eq!(entry.payload.value, Value::Int(7));
        assert!(entry.verify());
    }
}
