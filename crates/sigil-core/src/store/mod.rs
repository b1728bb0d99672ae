//! The protocol store.
//!
//! [`ProtocolStore`] owns the hydration caches, the zone coordinator and its
//! staged writes, and the per-peer job queues. Operations are split by record
//! family across the submodules; this module holds construction, the zone
//! commit path and the shared plumbing.
//!
//! # Zone Commit
//!
//! ```text
//! with_zone(Z) ── body ──► Ok  ── depth 1? ──► commit_decrypt_result(batch)
//!                    │                              │
//!                    │                              ▼
//!                    │                         apply batch to caches
//!                    │
//!                    └───► Err ── depth 1? ──► discard staged writes
//! ```
//!
//! # Locking
//!
//! Two short locks exist: the coordinator's (staged writes) and the cache
//! lock. They are never nested and never held across an await.

#![allow(clippy::disallowed_types, reason = "Short critical sections, never held across await")]

mod identity;
mod keys;
mod reset;
mod sender_keys;
mod sessions;
mod unprocessed;

use std::{
    collections::{BTreeMap, HashMap},
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

pub use keys::{MAX_KEY_ID, SignedPreKey};
pub use reset::{LightResetOutcome, NullMessageSender};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
pub use sessions::{OpenDevice, OpenDevices};
use sigil_crypto::{KeyPair, SenderKeyRecord, SessionRecord};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::{
    StoreError,
    cache::RecordCache,
    config::StoreConfig,
    env::Environment,
    events::{EventBus, EventKind, StoreEvent, Subscription},
    identity::IdentityKeyRecord,
    ids::{QualifiedAddress, ServiceId},
    queue::JobQueues,
    records::{
        CommitBatch, StoredIdentityKey, StoredItem, StoredPreKey, StoredSenderKey,
        StoredSession, StoredSignedPreKey, StoredUnprocessed,
    },
    storage::{Storage, decode, encode},
    zone::{Zone, ZoneCoordinator},
};

/// Item holding our identity key pairs, keyed by our service id.
const IDENTITY_KEY_MAP: &str = "identity_key_map";

/// Item holding our registration ids, keyed by our service id.
const REGISTRATION_ID_MAP: &str = "registration_id_map";

/// Writes staged by the active zone.
#[derive(Default)]
pub(crate) struct PendingWrites {
    sessions: HashMap<String, (StoredSession, SessionRecord)>,
    sender_keys: HashMap<String, (StoredSenderKey, SenderKeyRecord)>,
    unprocessed: HashMap<String, StoredUnprocessed>,
}

impl PendingWrites {
    fn is_empty(&self) -> bool {
        self.sessions.is_empty() && self.sender_keys.is_empty() && self.unprocessed.is_empty()
    }

    fn to_batch(&self) -> CommitBatch {
        CommitBatch {
            sender_keys: self.sender_keys.values().map(|(raw, _)| raw.clone()).collect(),
            sessions: self.sessions.values().map(|(raw, _)| raw.clone()).collect(),
            unprocessed: self.unprocessed.values().cloned().collect(),
        }
    }
}

/// Hydration caches, one per record family, plus our own identities.
#[derive(Default)]
struct Caches {
    identity_keys: RecordCache<StoredIdentityKey, IdentityKeyRecord>,
    sessions: RecordCache<StoredSession, SessionRecord>,
    pre_keys: RecordCache<StoredPreKey, KeyPair>,
    signed_pre_keys: RecordCache<StoredSignedPreKey, SignedPreKey>,
    sender_keys: RecordCache<StoredSenderKey, SenderKeyRecord>,
    our_identity_keys: HashMap<ServiceId, KeyPair>,
    our_registration_ids: HashMap<ServiceId, u32>,
}

/// Persisted form of one of our identity key pairs.
#[derive(Serialize, Deserialize)]
struct LocalIdentity {
    public_key: Vec<u8>,
    private_key: Vec<u8>,
}

/// Record counts, for tooling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Peer identity keys
    pub identity_keys: usize,
    /// Sessions, open or archived
    pub sessions: usize,
    /// One-time pre-keys
    pub pre_keys: usize,
    /// Signed pre-keys
    pub signed_pre_keys: usize,
    /// Sender keys
    pub sender_keys: usize,
    /// Our own identities
    pub local_identities: usize,
}

/// Protocol store over a storage adapter.
///
/// Cheap to share behind an `Arc`; every operation takes `&self`.
pub struct ProtocolStore<E: Environment, S: Storage> {
    env: E,
    storage: S,
    config: StoreConfig,
    zones: ZoneCoordinator<PendingWrites>,
    caches: Mutex<Caches>,
    session_queues: JobQueues<E>,
    sender_key_queues: JobQueues<E>,
    events: EventBus,
    resets: Mutex<()>,
}

impl<E: Environment, S: Storage> ProtocolStore<E, S> {
    /// Open a store over `storage`, loading every cache.
    ///
    /// # Errors
    ///
    /// - `StoreError::Config` if `config` is invalid
    /// - `StoreError::Storage` if the initial load fails
    /// - `StoreError::Crypto` if a stored local identity is malformed
    pub fn open(env: E, storage: S, config: StoreConfig) -> Result<Self, StoreError> {
        config.validate()?;

        let limiter = Arc::new(Semaphore::new(config.max_concurrent_jobs));
        let store = Self {
            session_queues: JobQueues::new(
                "sessions",
                env.clone(),
                config.job_timeout,
                limiter.clone(),
            ),
            sender_key_queues: JobQueues::new(
                "sender_keys",
                env.clone(),
                config.job_timeout,
                limiter,
            ),
            env,
            storage,
            config,
            zones: ZoneCoordinator::new(),
            caches: Mutex::new(Caches::default()),
            events: EventBus::new(),
            resets: Mutex::new(()),
        };
        store.hydrate_caches()?;
        Ok(store)
    }

    /// Environment the store reads time and randomness from.
    pub fn env(&self) -> &E {
        &self.env
    }

    /// Underlying storage adapter.
    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Active configuration.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Call `handler` for every event of `kind` until the subscription drops.
    pub fn subscribe(
        &self,
        kind: EventKind,
        handler: impl Fn(&StoreEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.events.subscribe(kind, handler)
    }

    /// Nesting depth of the active zone; 0 when idle.
    pub fn zone_depth(&self) -> usize {
        self.zones.depth()
    }

    /// Active zone, if any.
    pub fn current_zone(&self) -> Option<Zone> {
        self.zones.current_zone()
    }

    /// Record counts from the caches.
    pub fn stats(&self) -> StoreStats {
        let caches = self.lock_caches();
        StoreStats {
            identity_keys: caches.identity_keys.len(),
            sessions: caches.sessions.len(),
            pre_keys: caches.pre_keys.len(),
            signed_pre_keys: caches.signed_pre_keys.len(),
            sender_keys: caches.sender_keys.len(),
            local_identities: caches.our_identity_keys.len(),
        }
    }

    /// Run `body` inside `zone`.
    ///
    /// Waits while a different zone is active. When this is the outermost
    /// call of the zone, staged writes are committed on success and discarded
    /// on error.
    ///
    /// # Errors
    ///
    /// Returns the body's error, or the commit error if persisting the staged
    /// writes failed (in which case they are discarded too).
    pub async fn with_zone<T, F, Fut>(
        &self,
        zone: &Zone,
        name: &str,
        body: F,
    ) -> Result<T, StoreError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut guard = self.zones.enter(zone, name).await;
        let result = body().await;

        if guard.is_top_level() {
            match &result {
                Ok(_) => {
                    if let Err(err) = self.commit_zone_changes(name) {
                        guard.settle();
                        return Err(err);
                    }
                },
                Err(err) => self.revert_zone_changes(name, err),
            }
        }

        guard.settle();
        result
    }

    /// Flush staged writes in one atomic batch, then apply them to the caches.
    ///
    /// Staged writes are consumed either way.
    fn commit_zone_changes(&self, name: &str) -> Result<(), StoreError> {
        let pending = self.zones.take_pending();
        if pending.is_empty() {
            return Ok(());
        }

        info!(
            name,
            sessions = pending.sessions.len(),
            sender_keys = pending.sender_keys.len(),
            unprocessed = pending.unprocessed.len(),
            "committing zone changes"
        );
        self.storage.commit_decrypt_result(&pending.to_batch())?;

        let mut caches = self.lock_caches();
        for (id, (raw, live)) in pending.sessions {
            caches.sessions.insert_hydrated(id, raw, live);
        }
        for (id, (raw, live)) in pending.sender_keys {
            caches.sender_keys.insert_hydrated(id, raw, live);
        }
        Ok(())
    }

    fn revert_zone_changes(&self, name: &str, err: &StoreError) {
        let dropped = self.zones.with_pending(|pending| {
            let dropped = std::mem::take(pending);
            dropped.sessions.len() + dropped.sender_keys.len() + dropped.unprocessed.len()
        });
        if dropped > 0 {
            warn!(name, dropped, error = %err, "reverting zone changes");
        } else {
            debug!(name, error = %err, "zone body failed with nothing staged");
        }
    }

    /// Run `job` on the session queue for `address`, inside `zone`.
    ///
    /// Jobs for one peer device run one at a time in submission order.
    pub async fn enqueue_session_job<T, F, Fut>(
        &self,
        address: &QualifiedAddress,
        zone: &Zone,
        job: F,
    ) -> Result<T, StoreError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let key = address.to_string();
        self.with_zone(zone, "enqueue_session_job", || self.session_queues.enqueue(&key, job))
            .await
    }

    /// Run `job` on the sender key queue for `sender_key_id`, inside `zone`.
    pub async fn enqueue_sender_key_job<T, F, Fut>(
        &self,
        sender_key_id: &str,
        zone: &Zone,
        job: F,
    ) -> Result<T, StoreError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        self.with_zone(zone, "enqueue_sender_key_job", || {
            self.sender_key_queues.enqueue(sender_key_id, job)
        })
        .await
    }

    /// Settings item `key`, decoded.
    pub fn get_item<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.storage.get_by_id::<StoredItem>(key)? {
            Some(item) => Ok(Some(decode(&item.value)?)),
            None => Ok(None),
        }
    }

    /// Store settings item `key`.
    pub fn put_item<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let item = StoredItem { id: key.to_string(), value: encode(value)? };
        self.storage.create_or_update(&item)?;
        Ok(())
    }

    /// Delete settings item `key`.
    pub fn remove_item(&self, key: &str) -> Result<(), StoreError> {
        self.storage.remove_by_id::<StoredItem>(key)?;
        Ok(())
    }

    /// Reload every cache from storage.
    ///
    /// Entries come back raw and are hydrated again on first use.
    pub(crate) fn hydrate_caches(&self) -> Result<(), StoreError> {
        let identity_keys = self.storage.get_all::<StoredIdentityKey>()?;
        let sessions = self.storage.get_all::<StoredSession>()?;
        let pre_keys = self.storage.get_all::<StoredPreKey>()?;
        let signed_pre_keys = self.storage.get_all::<StoredSignedPreKey>()?;
        let sender_keys = self.storage.get_all::<StoredSenderKey>()?;

        let identities: BTreeMap<ServiceId, LocalIdentity> =
            self.get_item(IDENTITY_KEY_MAP)?.unwrap_or_default();
        let our_identity_keys = identities
            .into_iter()
            .map(|(id, local)| {
                let pair = KeyPair::from_parts(&local.private_key, &local.public_key)?;
                Ok((id, pair))
            })
            .collect::<Result<HashMap<_, _>, StoreError>>()?;
        let registration_ids: BTreeMap<ServiceId, u32> =
            self.get_item(REGISTRATION_ID_MAP)?.unwrap_or_default();

        let caches = Caches {
            identity_keys: RecordCache::from_raw(
                identity_keys.into_iter().map(|raw| (raw.id.to_string(), raw)),
            ),
            sessions: RecordCache::from_raw(sessions.into_iter().map(|raw| (raw.id.clone(), raw))),
            pre_keys: RecordCache::from_raw(pre_keys.into_iter().map(|raw| (raw.id.clone(), raw))),
            signed_pre_keys: RecordCache::from_raw(
                signed_pre_keys.into_iter().map(|raw| (raw.id.clone(), raw)),
            ),
            sender_keys: RecordCache::from_raw(
                sender_keys.into_iter().map(|raw| (raw.id.clone(), raw)),
            ),
            our_identity_keys,
            our_registration_ids: registration_ids.into_iter().collect(),
        };

        info!(
            identity_keys = caches.identity_keys.len(),
            sessions = caches.sessions.len(),
            local_identities = caches.our_identity_keys.len(),
            "caches hydrated"
        );
        *self.lock_caches() = caches;
        Ok(())
    }

    fn lock_caches(&self) -> MutexGuard<'_, Caches> {
        self.caches.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
