//! Session lifecycle: load, store, archive, remove.
//!
//! Reads check the active zone's staged writes first, then the cache. Legacy
//! rows are migrated on first read and written back through
//! [`ProtocolStore::store_session`], so the cache entry and persisted row
//! change together.

use std::collections::BTreeSet;

use futures::future::try_join_all;
use sigil_crypto::{LocalUserData, SessionRecord, migrate_legacy_session};
use tracing::{debug, error, info, warn};

use super::ProtocolStore;
use crate::{
    StoreError,
    cache::{CacheEntry, Hydrate},
    env::Environment,
    ids::{Address, DeviceId, QualifiedAddress, ServiceId},
    records::{CURRENT_SESSION_VERSION, StoredSession},
    storage::Storage,
    zone::{GLOBAL_ZONE, Zone},
};

impl Hydrate for SessionRecord {
    type Raw = StoredSession;

    fn hydrate(raw: &StoredSession) -> Result<Self, StoreError> {
        match raw.version {
            Some(CURRENT_SESSION_VERSION) => Ok(SessionRecord::deserialize(&raw.record)?),
            other => Err(StoreError::Corruption(format!(
                "session {} has unsupported version {other:?}",
                raw.id
            ))),
        }
    }
}

/// A peer device with an open session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenDevice {
    /// Peer account
    pub service_id: ServiceId,
    /// Peer device
    pub device_id: DeviceId,
    /// Peer registration id from the open session
    pub registration_id: u32,
}

/// Result of [`ProtocolStore::get_open_devices`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpenDevices {
    /// Devices with an open session
    pub devices: Vec<OpenDevice>,
    /// Requested accounts with no open session on any device
    pub empty_service_ids: Vec<ServiceId>,
}

fn address_of(raw: &StoredSession) -> QualifiedAddress {
    QualifiedAddress::new(
        raw.our_service_id.clone(),
        Address::new(raw.service_id.clone(), raw.device_id),
    )
}

impl<E: Environment, S: Storage> ProtocolStore<E, S> {
    /// Session for `address`, or `None` if there is none.
    ///
    /// Legacy rows are migrated and written back. Records that fail to decode
    /// are logged and reported as absent.
    ///
    /// # Errors
    ///
    /// - `StoreError::Migration` if a legacy row needs a local identity we
    ///   do not have
    /// - `StoreError::Corruption` if the row has an unknown layout version
    pub async fn load_session(
        &self,
        address: &QualifiedAddress,
        zone: &Zone,
    ) -> Result<Option<SessionRecord>, StoreError> {
        self.with_zone(zone, "load_session", || async move {
            let id = address.to_string();

            let staged = self
                .zones
                .with_pending(|pending| pending.sessions.get(&id).map(|(_, live)| live.clone()));
            if staged.is_some() {
                return Ok(staged);
            }

            let raw = {
                let caches = self.lock_caches();
                match caches.sessions.entry(&id) {
                    None => return Ok(None),
                    Some(CacheEntry::Hydrated { live, .. }) => return Ok(Some(live.clone())),
                    Some(CacheEntry::Raw(raw)) => raw.clone(),
                }
            };

            match self.hydrate_session(raw, zone).await {
                Ok(record) => Ok(Some(record)),
                Err(err) if err.is_fatal() => {
                    error!(address = %address, error = %err, "failed to load session");
                    Err(err)
                },
                Err(err) => {
                    warn!(address = %address, error = %err, "unreadable session, ignoring");
                    Ok(None)
                },
            }
        })
        .await
    }

    async fn hydrate_session(
        &self,
        raw: StoredSession,
        zone: &Zone,
    ) -> Result<SessionRecord, StoreError> {
        if raw.version.is_none() {
            return self.migrate_session(raw, zone).await;
        }

        let record = SessionRecord::hydrate(&raw)?;
        self.lock_caches().sessions.promote(&raw.id, record.clone());
        Ok(record)
    }

    async fn migrate_session(
        &self,
        raw: StoredSession,
        zone: &Zone,
    ) -> Result<SessionRecord, StoreError> {
        let (identity_key, registration_id) = {
            let caches = self.lock_caches();
            (
                caches.our_identity_keys.get(&raw.our_service_id).map(|pair| pair.public_key()),
                caches.our_registration_ids.get(&raw.our_service_id).copied(),
            )
        };
        let Some(identity_key_public) = identity_key else {
            return Err(StoreError::Migration(format!(
                "no identity key for {} while migrating {}",
                raw.our_service_id, raw.id
            )));
        };
        let Some(registration_id) = registration_id else {
            return Err(StoreError::Migration(format!(
                "no registration id for {} while migrating {}",
                raw.our_service_id, raw.id
            )));
        };

        let record = migrate_legacy_session(
            &raw.record,
            &LocalUserData { identity_key_public, registration_id },
        )?;

        info!(id = %raw.id, "migrating legacy session");
        self.store_session(&address_of(&raw), record.clone(), zone).await?;
        Ok(record)
    }

    /// Save the session for `address`.
    ///
    /// Staged until the zone completes when the zone batches sessions,
    /// persisted immediately otherwise.
    pub async fn store_session(
        &self,
        address: &QualifiedAddress,
        record: SessionRecord,
        zone: &Zone,
    ) -> Result<(), StoreError> {
        self.with_zone(zone, "store_session", || async move {
            let id = address.to_string();
            let raw = StoredSession {
                id: id.clone(),
                our_service_id: address.our_service_id.clone(),
                service_id: address.service_id().clone(),
                conversation_id: address.service_id().to_string(),
                device_id: address.device_id(),
                record: record.serialize()?,
                version: Some(CURRENT_SESSION_VERSION),
            };

            self.zones.with_pending(|pending| pending.sessions.insert(id, (raw, record)));
            if !zone.supports_pending_sessions() {
                self.commit_zone_changes("store_session")?;
            }
            Ok(())
        })
        .await
    }

    /// Close the open session with `address`.
    ///
    /// Runs on the peer's session queue, except from inside a running session
    /// job, where it runs in the caller's zone without taking `address`'s key.
    /// A missing record or one without an open state is left alone.
    pub async fn archive_session(
        &self,
        address: &QualifiedAddress,
        zone: &Zone,
    ) -> Result<(), StoreError> {
        if self.session_queues.in_job() {
            return self
                .with_zone(zone, "archive_session", || self.archive_current(address, zone))
                .await;
        }
        self.enqueue_session_job(address, zone, || self.archive_current(address, zone)).await
    }

    async fn archive_current(
        &self,
        address: &QualifiedAddress,
        zone: &Zone,
    ) -> Result<(), StoreError> {
        let Some(mut record) = self.load_session(address, zone).await? else {
            debug!(address = %address, "no session to archive");
            return Ok(());
        };
        if !record.has_current_state() {
            return Ok(());
        }

        record.archive_current_state();
        self.store_session(address, record, zone).await
    }

    /// Archive every session with `service_id`, across all our identities.
    pub async fn archive_all_sessions(
        &self,
        service_id: &ServiceId,
        zone: &Zone,
    ) -> Result<(), StoreError> {
        self.with_zone(zone, "archive_all_sessions", || async move {
            let addresses = self.session_addresses(|raw| raw.service_id == *service_id);
            info!(service_id = %service_id, count = addresses.len(), "archiving all sessions");

            try_join_all(addresses.iter().map(|address| self.archive_session(address, zone)))
                .await?;
            Ok(())
        })
        .await
    }

    /// Archive the sessions with every other device of `address`'s account.
    pub async fn archive_sibling_sessions(
        &self,
        address: &Address,
        zone: &Zone,
    ) -> Result<(), StoreError> {
        self.with_zone(zone, "archive_sibling_sessions", || async move {
            let addresses = self.session_addresses(|raw| {
                raw.service_id == address.service_id && raw.device_id != address.device_id
            });
            info!(address = %address, count = addresses.len(), "archiving sibling sessions");

            try_join_all(addresses.iter().map(|sibling| self.archive_session(sibling, zone)))
                .await?;
            Ok(())
        })
        .await
    }

    /// Delete the session with `address`.
    pub async fn remove_session(&self, address: &QualifiedAddress) -> Result<(), StoreError> {
        self.with_zone(&GLOBAL_ZONE, "remove_session", || async move {
            let id = address.to_string();
            self.storage.remove_by_id::<StoredSession>(&id)?;

            self.zones.with_pending(|pending| pending.sessions.remove(&id));
            self.lock_caches().sessions.remove(&id);
            Ok(())
        })
        .await
    }

    /// Delete every session with `service_id`, across all our identities.
    pub async fn remove_sessions_by_service_id(
        &self,
        service_id: &ServiceId,
    ) -> Result<(), StoreError> {
        self.with_zone(&GLOBAL_ZONE, "remove_sessions_by_service_id", || async move {
            let ids: Vec<String> = self
                .session_addresses(|raw| raw.service_id == *service_id)
                .iter()
                .map(ToString::to_string)
                .collect();
            self.storage.remove_by_ids::<StoredSession>(&ids)?;

            self.zones.with_pending(|pending| {
                pending.sessions.retain(|_, (raw, _)| raw.service_id != *service_id);
            });
            self.lock_caches().sessions.remove_where(|raw| raw.service_id == *service_id);
            info!(service_id = %service_id, count = ids.len(), "removed sessions");
            Ok(())
        })
        .await
    }

    /// Delete every session.
    pub async fn clear_session_store(&self) -> Result<(), StoreError> {
        self.with_zone(&GLOBAL_ZONE, "clear_session_store", || async move {
            self.storage.remove_all::<StoredSession>()?;

            self.zones.with_pending(|pending| pending.sessions.clear());
            self.lock_caches().sessions.clear();
            Ok(())
        })
        .await
    }

    /// Whether any session row, open or archived, exists for `service_id`.
    pub fn has_session_with(&self, service_id: &ServiceId) -> bool {
        !self.session_addresses(|raw| raw.service_id == *service_id).is_empty()
    }

    /// Devices of `service_id` we hold an open session with, as seen by
    /// `our_service_id`.
    pub async fn get_device_ids(
        &self,
        our_service_id: &ServiceId,
        service_id: &ServiceId,
        zone: &Zone,
    ) -> Result<Vec<DeviceId>, StoreError> {
        let open = self
            .get_open_devices(our_service_id, std::slice::from_ref(service_id), zone)
            .await?;
        Ok(open.devices.into_iter().map(|device| device.device_id).collect())
    }

    /// Open sessions of `our_service_id` with any of `service_ids`.
    ///
    /// Accounts with no open session on any device are listed in
    /// `empty_service_ids`, in request order.
    pub async fn get_open_devices(
        &self,
        our_service_id: &ServiceId,
        service_ids: &[ServiceId],
        zone: &Zone,
    ) -> Result<OpenDevices, StoreError> {
        self.with_zone(zone, "get_open_devices", || async move {
            let wanted: BTreeSet<&ServiceId> = service_ids.iter().collect();
            let addresses = self.session_addresses(|raw| {
                raw.our_service_id == *our_service_id && wanted.contains(&raw.service_id)
            });

            let mut devices = Vec::new();
            for address in &addresses {
                let Some(record) = self.load_session(address, zone).await? else {
                    continue;
                };
                if let Some(registration_id) =
                    record.current_state().map(|state| state.remote_registration_id())
                {
                    devices.push(OpenDevice {
                        service_id: address.service_id().clone(),
                        device_id: address.device_id(),
                        registration_id,
                    });
                }
            }

            let empty_service_ids = service_ids
                .iter()
                .filter(|&service_id| {
                    !devices.iter().any(|device| device.service_id == *service_id)
                })
                .cloned()
                .collect();

            Ok(OpenDevices { devices, empty_service_ids })
        })
        .await
    }

    /// Addresses of staged and cached sessions whose row matches `predicate`,
    /// sorted and without duplicates.
    pub(crate) fn session_addresses(
        &self,
        predicate: impl Fn(&StoredSession) -> bool,
    ) -> Vec<QualifiedAddress> {
        let mut addresses: BTreeSet<QualifiedAddress> = self.zones.with_pending(|pending| {
            pending
                .sessions
                .values()
                .filter(|(raw, _)| predicate(raw))
                .map(|(raw, _)| address_of(raw))
                .collect()
        });

        let caches = self.lock_caches();
        addresses.extend(
            caches
                .sessions
                .iter()
                .map(|(_, entry)| entry.raw())
                .filter(|&raw| predicate(raw))
                .map(address_of),
        );
        addresses.into_iter().collect()
    }
}
