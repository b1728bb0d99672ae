//! Peer identity keys and trust decisions.
//!
//! Identity writes are never staged: a key change is persisted before the
//! key change event fires and before sibling sessions are archived.

use sigil_crypto::PublicKey;
use tracing::{info, warn};

use super::ProtocolStore;
use crate::{
    StoreError,
    env::Environment,
    events::StoreEvent,
    identity::{
        Direction, IdentityKeyRecord, SyncAction, VerifiedStatus, check_trusted_for_sending,
        plan_unverified_message, plan_verified_message, requires_nonblocking_approval,
        status_after_key_change,
    },
    ids::{Address, ServiceId},
    records::StoredIdentityKey,
    storage::Storage,
    zone::{GLOBAL_ZONE, Zone},
};

impl<E: Environment, S: Storage> ProtocolStore<E, S> {
    /// Stored identity of `service_id`.
    ///
    /// # Errors
    ///
    /// `StoreError::Corruption` if the stored record violates its schema.
    pub fn get_identity_record(
        &self,
        service_id: &ServiceId,
    ) -> Result<Option<IdentityKeyRecord>, StoreError> {
        self.lock_caches().identity_keys.get(service_id.as_str())
    }

    /// Stored identity key of `service_id`.
    pub fn load_identity_key(
        &self,
        service_id: &ServiceId,
    ) -> Result<Option<PublicKey>, StoreError> {
        Ok(self.get_identity_record(service_id)?.map(|record| record.public_key))
    }

    fn require_identity_record(
        &self,
        service_id: &ServiceId,
    ) -> Result<IdentityKeyRecord, StoreError> {
        self.get_identity_record(service_id)?
            .ok_or_else(|| StoreError::not_found("identity key", service_id.as_str()))
    }

    fn save_identity_record(&self, record: IdentityKeyRecord) -> Result<(), StoreError> {
        let raw = record.to_stored();
        self.storage.create_or_update(&raw)?;
        self.lock_caches().identity_keys.insert_hydrated(raw.id.to_string(), raw, record);
        Ok(())
    }

    fn is_our_service_id(&self, service_id: &ServiceId) -> bool {
        self.lock_caches().our_identity_keys.contains_key(service_id)
    }

    /// Record the identity key seen for `address`.
    ///
    /// Returns `true` if a different key was already stored and has been
    /// replaced. A replacement fires one [`StoreEvent::KeyChange`] and
    /// archives the sessions with every other device of the account, in
    /// `zone`. Key changes for our own accounts are ignored.
    pub async fn save_identity(
        &self,
        address: &Address,
        public_key: &PublicKey,
        nonblocking_approval: bool,
        zone: &Zone,
    ) -> Result<bool, StoreError> {
        let service_id = &address.service_id;
        let now = self.env.wall_clock_ms();

        let Some(existing) = self.get_identity_record(service_id)? else {
            info!(service_id = %service_id, "saving first identity key");
            self.save_identity_record(IdentityKeyRecord {
                service_id: service_id.clone(),
                public_key: *public_key,
                first_use: true,
                timestamp: now,
                verified: VerifiedStatus::Default,
                nonblocking_approval,
            })?;
            return Ok(false);
        };

        if !existing.public_key.ct_eq(public_key) {
            if self.is_our_service_id(service_id) {
                warn!(service_id = %service_id, "ignoring identity change for our own account");
                return Ok(false);
            }

            info!(
                service_id = %service_id,
                previous = ?existing.verified,
                "replacing identity key"
            );
            self.save_identity_record(IdentityKeyRecord {
                service_id: service_id.clone(),
                public_key: *public_key,
                first_use: false,
                timestamp: now,
                verified: status_after_key_change(existing.verified),
                nonblocking_approval,
            })?;
            self.events.emit(&StoreEvent::KeyChange {
                service_id: service_id.clone(),
                reason: "save_identity",
            });
            self.archive_sibling_sessions(address, zone).await?;
            return Ok(true);
        }

        if requires_nonblocking_approval(&existing, now, self.config.approval_window) {
            info!(service_id = %service_id, nonblocking_approval, "recording approval");
            self.save_identity_record(IdentityKeyRecord { nonblocking_approval, ..existing })?;
        }
        Ok(false)
    }

    /// Whether `public_key` may be used with `service_id` in `direction`.
    ///
    /// Our own accounts only require the key to match. Receiving is always
    /// trusted; sending goes through [`Self::check_trusted_for_sending`].
    pub fn is_trusted_identity(
        &self,
        service_id: &ServiceId,
        public_key: &PublicKey,
        direction: Direction,
    ) -> Result<bool, StoreError> {
        let record = self.get_identity_record(service_id)?;

        if self.is_our_service_id(service_id) {
            return Ok(match record {
                Some(record) => record.public_key.ct_eq(public_key),
                None => {
                    warn!(service_id = %service_id, "no record for our own account, trusting");
                    true
                },
            });
        }

        match direction {
            Direction::Receiving => Ok(true),
            Direction::Sending => match self.check_trusted_for_sending(service_id, public_key) {
                Ok(()) => Ok(true),
                Err(StoreError::Trust { reason, .. }) => {
                    info!(service_id = %service_id, %reason, "identity not trusted for sending");
                    Ok(false)
                },
                Err(err) => Err(err),
            },
        }
    }

    /// Sending gate for `service_id`.
    ///
    /// # Errors
    ///
    /// `StoreError::Trust` naming the failed gate.
    pub fn check_trusted_for_sending(
        &self,
        service_id: &ServiceId,
        public_key: &PublicKey,
    ) -> Result<(), StoreError> {
        let record = self.get_identity_record(service_id)?;
        check_trusted_for_sending(
            record.as_ref(),
            public_key,
            self.env.wall_clock_ms(),
            self.config.approval_window,
        )
        .map_err(|reason| StoreError::Trust { service_id: service_id.to_string(), reason })
    }

    /// Whether `service_id` recently changed keys without approval, or is
    /// marked unverified.
    ///
    /// # Errors
    ///
    /// `StoreError::NotFound` without a stored identity.
    pub fn is_untrusted(&self, service_id: &ServiceId) -> Result<bool, StoreError> {
        let record = self.require_identity_record(service_id)?;
        Ok(requires_nonblocking_approval(
            &record,
            self.env.wall_clock_ms(),
            self.config.approval_window,
        ) || record.verified == VerifiedStatus::Unverified)
    }

    /// Verification status of `service_id`.
    ///
    /// # Errors
    ///
    /// `StoreError::NotFound` without a stored identity.
    pub fn get_verified(&self, service_id: &ServiceId) -> Result<VerifiedStatus, StoreError> {
        Ok(self.require_identity_record(service_id)?.verified)
    }

    /// Set the verification status of `service_id`, keeping its key.
    ///
    /// # Errors
    ///
    /// `StoreError::NotFound` without a stored identity.
    pub fn set_verified(
        &self,
        service_id: &ServiceId,
        verified: VerifiedStatus,
    ) -> Result<(), StoreError> {
        let record = self.require_identity_record(service_id)?;
        self.save_identity_record(IdentityKeyRecord { verified, ..record })
    }

    /// Record whether the user acknowledged the latest key change.
    ///
    /// # Errors
    ///
    /// `StoreError::NotFound` without a stored identity.
    pub fn set_approval(
        &self,
        service_id: &ServiceId,
        nonblocking_approval: bool,
    ) -> Result<(), StoreError> {
        let record = self.require_identity_record(service_id)?;
        self.save_identity_record(IdentityKeyRecord { nonblocking_approval, ..record })
    }

    /// Apply a "verified" sync message from one of our linked devices.
    ///
    /// Returns `true` if a different stored key was replaced, in which case
    /// every session with the account is archived.
    pub async fn process_verified_message(
        &self,
        service_id: &ServiceId,
        status: VerifiedStatus,
        public_key: &PublicKey,
    ) -> Result<bool, StoreError> {
        let existing = self.get_identity_record(service_id)?;
        let action = plan_verified_message(existing.as_ref(), status, public_key);
        self.apply_sync_action(service_id, existing, action, status, public_key, true, "verified")
            .await
    }

    /// Apply an "unverified" sync message from one of our linked devices.
    ///
    /// Returns `true` if a different stored key was replaced.
    pub async fn process_unverified_message(
        &self,
        service_id: &ServiceId,
        status: VerifiedStatus,
        public_key: &PublicKey,
    ) -> Result<bool, StoreError> {
        let existing = self.get_identity_record(service_id)?;
        let action = plan_unverified_message(existing.as_ref(), status, public_key);
        self.apply_sync_action(
            service_id,
            existing,
            action,
            status,
            public_key,
            false,
            "unverified",
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn apply_sync_action(
        &self,
        service_id: &ServiceId,
        existing: Option<IdentityKeyRecord>,
        action: SyncAction,
        status: VerifiedStatus,
        public_key: &PublicKey,
        nonblocking_approval: bool,
        reason: &'static str,
    ) -> Result<bool, StoreError> {
        match action {
            SyncAction::Ignore => Ok(false),
            SyncAction::SetStatus(verified) => {
                let Some(record) = existing else {
                    return Ok(false);
                };
                self.save_identity_record(IdentityKeyRecord { verified, ..record })?;
                Ok(false)
            },
            SyncAction::Overwrite { key_changed } => {
                info!(
                    service_id = %service_id,
                    ?status,
                    key_changed,
                    reason,
                    "overwriting identity from sync"
                );
                self.save_identity_record(IdentityKeyRecord {
                    service_id: service_id.clone(),
                    public_key: *public_key,
                    first_use: false,
                    timestamp: self.env.wall_clock_ms(),
                    verified: status,
                    nonblocking_approval,
                })?;

                if key_changed {
                    self.events
                        .emit(&StoreEvent::KeyChange { service_id: service_id.clone(), reason });
                    self.archive_all_sessions(service_id, &GLOBAL_ZONE).await?;
                }
                Ok(key_changed)
            },
        }
    }

    /// Forget the identity of `service_id` and every session with it.
    pub async fn remove_identity_key(&self, service_id: &ServiceId) -> Result<(), StoreError> {
        self.storage.remove_by_id::<StoredIdentityKey>(service_id.as_str())?;
        self.lock_caches().identity_keys.remove(service_id.as_str());
        self.remove_sessions_by_service_id(service_id).await
    }

    /// Every stored peer identity, sorted by account.
    pub fn get_all_identity_records(&self) -> Result<Vec<IdentityKeyRecord>, StoreError> {
        let ids: Vec<String> = {
            let caches = self.lock_caches();
            caches.identity_keys.iter().map(|(id, _)| id.clone()).collect()
        };

        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = self.lock_caches().identity_keys.get(&id)? {
                records.push(record);
            }
        }
        records.sort_by(|a, b| a.service_id.cmp(&b.service_id));
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use sigil_crypto::KeyPair;

    use super::*;
    use crate::{
        SystemEnv, TrustError, config::StoreConfig, events::EventKind, ids::DeviceId,
        storage::MemoryStorage,
    };

    fn store() -> ProtocolStore<SystemEnv, MemoryStorage> {
        ProtocolStore::open(SystemEnv::new(), MemoryStorage::new(), StoreConfig::default()).unwrap()
    }

    fn alice() -> Address {
        Address::new(ServiceId::new("alice").unwrap(), DeviceId(1))
    }

    fn key(seed: u8) -> PublicKey {
        KeyPair::from_seed(&[seed; 32]).public_key()
    }

    #[tokio::test]
    async fn first_key_is_first_use() {
        let store = store();
        assert!(!store.save_identity(&alice(), &key(1), false, &GLOBAL_ZONE).await.unwrap());

        let record = store.get_identity_record(&alice().service_id).unwrap().unwrap();
        assert!(record.first_use);
        assert_eq!(record.verified, VerifiedStatus::Default);
        let trusted = store.is_trusted_identity(&alice().service_id, &key(1), Direction::Sending);
        assert!(trusted.unwrap());
    }

    #[tokio::test]
    async fn key_change_blocks_sending_until_approved() {
        let store = store();
        let changes = Arc::new(AtomicUsize::new(0));
        let counter = changes.clone();
        let _sub = store.subscribe(EventKind::KeyChange, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        store.save_identity(&alice(), &key(1), false, &GLOBAL_ZONE).await.unwrap();
        store.set_verified(&alice().service_id, VerifiedStatus::Verified).unwrap();
        assert!(store.save_identity(&alice(), &key(2), false, &GLOBAL_ZONE).await.unwrap());

        assert_eq!(changes.load(Ordering::SeqCst), 1);
        assert_eq!(store.get_verified(&alice().service_id).unwrap(), VerifiedStatus::Unverified);
        assert!(matches!(
            store.check_trusted_for_sending(&alice().service_id, &key(1)),
            Err(StoreError::Trust { reason: TrustError::KeyMismatch, .. })
        ));
        assert!(matches!(
            store.check_trusted_for_sending(&alice().service_id, &key(2)),
            Err(StoreError::Trust { reason: TrustError::Unverified, .. })
        ));
        assert!(store.is_untrusted(&alice().service_id).unwrap());
        let receiving =
            store.is_trusted_identity(&alice().service_id, &key(1), Direction::Receiving);
        assert!(receiving.unwrap());
    }

    #[tokio::test]
    async fn approval_unblocks_recent_change() {
        let store = store();
        store.save_identity(&alice(), &key(1), false, &GLOBAL_ZONE).await.unwrap();
        store.save_identity(&alice(), &key(2), false, &GLOBAL_ZONE).await.unwrap();

        assert!(matches!(
            store.check_trusted_for_sending(&alice().service_id, &key(2)),
            Err(StoreError::Trust { reason: TrustError::ApprovalRequired, .. })
        ));

        store.save_identity(&alice(), &key(2), true, &GLOBAL_ZONE).await.unwrap();
        assert!(store.check_trusted_for_sending(&alice().service_id, &key(2)).is_ok());
    }

    #[tokio::test]
    async fn own_identity_change_is_ignored() {
        let store = store();
        let me = ServiceId::new("me").unwrap();
        store.set_local_identity(&me, &KeyPair::from_seed(&[5; 32]), 42).unwrap();
        let own_device = Address::new(me.clone(), DeviceId(2));

        store.save_identity(&own_device, &key(1), false, &GLOBAL_ZONE).await.unwrap();
        assert!(!store.save_identity(&own_device, &key(2), false, &GLOBAL_ZONE).await.unwrap());

        assert_eq!(store.load_identity_key(&me).unwrap(), Some(key(1)));
        assert!(!store.is_trusted_identity(&me, &key(2), Direction::Receiving).unwrap());
    }

    #[test]
    fn status_operations_need_a_record() {
        let store = store();
        let bob = ServiceId::new("bob").unwrap();

        assert!(store.get_verified(&bob).unwrap_err().is_not_found());
        assert!(store.set_verified(&bob, VerifiedStatus::Verified).unwrap_err().is_not_found());
        assert!(store.set_approval(&bob, true).unwrap_err().is_not_found());
        assert!(store.is_untrusted(&bob).unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn verified_sync_with_new_key_replaces_and_reports() {
        let store = store();
        store.save_identity(&alice(), &key(1), false, &GLOBAL_ZONE).await.unwrap();

        let changed = store
            .process_verified_message(&alice().service_id, VerifiedStatus::Verified, &key(2))
            .await
            .unwrap();

        assert!(changed);
        let record = store.get_identity_record(&alice().service_id).unwrap().unwrap();
        assert_eq!(record.public_key, key(2));
        assert_eq!(record.verified, VerifiedStatus::Verified);
        assert!(record.nonblocking_approval);
    }

    #[tokio::test]
    async fn default_sync_without_record_is_ignored() {
        let store = store();
        let changed = store
            .process_verified_message(&alice().service_id, VerifiedStatus::Default, &key(1))
            .await
            .unwrap();

        assert!(!changed);
        assert!(store.get_identity_record(&alice().service_id).unwrap().is_none());
    }

    #[tokio::test]
    async fn unverified_sync_sets_status() {
        let store = store();
        store.save_identity(&alice(), &key(1), false, &GLOBAL_ZONE).await.unwrap();

        let changed = store
            .process_unverified_message(&alice().service_id, VerifiedStatus::Unverified, &key(1))
            .await
            .unwrap();

        assert!(!changed);
        assert_eq!(store.get_verified(&alice().service_id).unwrap(), VerifiedStatus::Unverified);
    }

    #[tokio::test]
    async fn corrupt_verified_value_is_fatal() {
        let storage = MemoryStorage::new();
        storage
            .create_or_update(&StoredIdentityKey {
                id: ServiceId::new("alice").unwrap(),
                public_key: key(1).as_bytes().to_vec(),
                first_use: true,
                timestamp: 0,
                verified: 7,
                nonblocking_approval: false,
            })
            .unwrap();
        let store = ProtocolStore::open(SystemEnv::new(), storage, StoreConfig::default()).unwrap();

        let err = store.get_verified(&ServiceId::new("alice").unwrap()).unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn removing_identity_removes_sessions() {
        let store = store();
        store.save_identity(&alice(), &key(1), false, &GLOBAL_ZONE).await.unwrap();

        store.remove_identity_key(&alice().service_id).await.unwrap();

        assert!(store.get_identity_record(&alice().service_id).unwrap().is_none());
        assert!(!store.has_session_with(&alice().service_id));
    }
}
