//! Group sender keys and the per-group distribution bookkeeping.

use sigil_crypto::SenderKeyRecord;
use tracing::{info, warn};

use super::ProtocolStore;
use crate::{
    StoreError,
    cache::Hydrate,
    env::Environment,
    ids::{DistributionId, QualifiedAddress, sender_key_id},
    records::{GroupSenderKeyInfo, MemberDevice, StoredGroup, StoredSenderKey},
    sender_key_info::{DistributionPlan, plan_sender_key_distribution},
    storage::Storage,
    zone::Zone,
};

impl Hydrate for SenderKeyRecord {
    type Raw = StoredSenderKey;

    fn hydrate(raw: &StoredSenderKey) -> Result<Self, StoreError> {
        Ok(SenderKeyRecord::deserialize(&raw.data)?)
    }
}

impl<E: Environment, S: Storage> ProtocolStore<E, S> {
    /// Save the sender key of `sender` for `distribution_id`.
    ///
    /// Staged until the zone completes when the zone batches sender keys.
    pub async fn save_sender_key(
        &self,
        sender: &QualifiedAddress,
        distribution_id: DistributionId,
        record: SenderKeyRecord,
        zone: &Zone,
    ) -> Result<(), StoreError> {
        self.with_zone(zone, "save_sender_key", || async move {
            let id = sender_key_id(sender, distribution_id);
            let raw = StoredSenderKey {
                id: id.clone(),
                sender_id: sender.to_string(),
                distribution_id,
                data: record.serialize()?,
                last_updated: self.env.wall_clock_ms(),
            };

            self.zones.with_pending(|pending| pending.sender_keys.insert(id, (raw, record)));
            if !zone.supports_pending_sender_keys() {
                self.commit_zone_changes("save_sender_key")?;
            }
            Ok(())
        })
        .await
    }

    /// Sender key of `sender` for `distribution_id`.
    ///
    /// Records that fail to decode are logged and reported as absent.
    pub async fn get_sender_key(
        &self,
        sender: &QualifiedAddress,
        distribution_id: DistributionId,
        zone: &Zone,
    ) -> Result<Option<SenderKeyRecord>, StoreError> {
        self.with_zone(zone, "get_sender_key", || async move {
            let id = sender_key_id(sender, distribution_id);

            let staged = self
                .zones
                .with_pending(|pending| pending.sender_keys.get(&id).map(|(_, live)| live.clone()));
            if staged.is_some() {
                return Ok(staged);
            }

            let hydrated = self.lock_caches().sender_keys.get(&id);
            match hydrated {
                Ok(record) => Ok(record),
                Err(err) => {
                    warn!(id, error = %err, "unreadable sender key, treating as absent");
                    Ok(None)
                },
            }
        })
        .await
    }

    /// Delete the sender key of `sender` for `distribution_id`.
    pub fn remove_sender_key(
        &self,
        sender: &QualifiedAddress,
        distribution_id: DistributionId,
    ) -> Result<(), StoreError> {
        let id = sender_key_id(sender, distribution_id);
        self.storage.remove_by_id::<StoredSenderKey>(&id)?;
        self.lock_caches().sender_keys.remove(&id);
        Ok(())
    }

    /// Delete every sender key.
    pub fn clear_sender_key_store(&self) -> Result<(), StoreError> {
        self.storage.remove_all::<StoredSenderKey>()?;
        self.lock_caches().sender_keys.clear();
        Ok(())
    }

    /// Sender key bookkeeping of `group_id`, if the group has sent before.
    pub fn get_sender_key_info(
        &self,
        group_id: &str,
    ) -> Result<Option<GroupSenderKeyInfo>, StoreError> {
        Ok(self.storage.get_by_id::<StoredGroup>(group_id)?.and_then(|group| group.sender_key_info))
    }

    /// Replace the sender key bookkeeping of `group_id`.
    pub fn update_sender_key_info(
        &self,
        group_id: &str,
        info: GroupSenderKeyInfo,
    ) -> Result<(), StoreError> {
        self.storage.create_or_update(&StoredGroup {
            id: group_id.to_string(),
            sender_key_info: Some(info),
        })?;
        Ok(())
    }

    /// Start sender key bookkeeping for `group_id` with a fresh distribution.
    pub fn create_sender_key_info(&self, group_id: &str) -> Result<GroupSenderKeyInfo, StoreError> {
        let info = GroupSenderKeyInfo {
            created_at: self.env.wall_clock_ms(),
            distribution_id: DistributionId(self.env.random_u128()),
            member_devices: Vec::new(),
        };
        info!(group_id, distribution_id = %info.distribution_id, "created sender key info");
        self.update_sender_key_info(group_id, info.clone())?;
        Ok(info)
    }

    /// Decide how to handle our sender key before a send to `devices`.
    pub fn plan_group_send(
        &self,
        group_id: &str,
        devices: &[MemberDevice],
        is_partial_send: bool,
    ) -> Result<DistributionPlan, StoreError> {
        let info = self.get_sender_key_info(group_id)?;
        Ok(plan_sender_key_distribution(
            info.as_ref(),
            devices,
            is_partial_send,
            self.env.wall_clock_ms(),
            self.config.sender_key_max_age,
        ))
    }

    /// Forget our sender key for `group_id` so the next send creates a new
    /// one.
    ///
    /// The distribution id is kept, the member list is emptied, and our own
    /// sender key for the distribution is deleted. Groups without bookkeeping
    /// are left alone.
    pub fn reset_sender_key(
        &self,
        group_id: &str,
        our_address: &QualifiedAddress,
    ) -> Result<(), StoreError> {
        let Some(info) = self.get_sender_key_info(group_id)? else {
            return Ok(());
        };

        info!(group_id, distribution_id = %info.distribution_id, "resetting sender key");
        self.update_sender_key_info(
            group_id,
            GroupSenderKeyInfo {
                created_at: self.env.wall_clock_ms(),
                distribution_id: info.distribution_id,
                member_devices: Vec::new(),
            },
        )?;
        self.remove_sender_key(our_address, info.distribution_id)
    }
}

#[cfg(test)]
mod tests {
    use sigil_crypto::{KeyPair, SenderKeyState};

    use super::*;
    use crate::{
        SystemEnv,
        config::StoreConfig,
        ids::{Address, DeviceId, ServiceId},
        storage::MemoryStorage,
        zone::{GLOBAL_ZONE, ZoneOptions},
    };

    fn store() -> ProtocolStore<SystemEnv, MemoryStorage> {
        ProtocolStore::open(SystemEnv::new(), MemoryStorage::new(), StoreConfig::default()).unwrap()
    }

    fn me() -> QualifiedAddress {
        QualifiedAddress::new(
            ServiceId::new("me").unwrap(),
            Address::new(ServiceId::new("me").unwrap(), DeviceId(1)),
        )
    }

    fn record() -> SenderKeyRecord {
        SenderKeyRecord::new(SenderKeyState::from_seed(
            1,
            &[7; 32],
            KeyPair::from_seed(&[8; 32]).public_key(),
        ))
    }

    #[tokio::test]
    async fn sender_key_round_trip_and_remove() {
        let store = store();
        let distribution = DistributionId(5);

        store.save_sender_key(&me(), distribution, record(), &GLOBAL_ZONE).await.unwrap();
        assert_eq!(
            store.get_sender_key(&me(), distribution, &GLOBAL_ZONE).await.unwrap(),
            Some(record())
        );

        store.remove_sender_key(&me(), distribution).unwrap();
        assert_eq!(store.get_sender_key(&me(), distribution, &GLOBAL_ZONE).await.unwrap(), None);
    }

    #[tokio::test]
    async fn sender_key_is_staged_in_batching_zone() {
        let store = store();
        let zone = Zone::new("send", ZoneOptions::batch_all());

        store
            .with_zone(&zone, "send", || async {
                store.save_sender_key(&me(), DistributionId(1), record(), &zone).await?;
                assert_eq!(store.storage().writes(), 0);
                assert!(store.get_sender_key(&me(), DistributionId(1), &zone).await?.is_some());
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(store.storage().writes(), 1);
        store.clear_sender_key_store().unwrap();
        let cleared = store.get_sender_key(&me(), DistributionId(1), &GLOBAL_ZONE).await.unwrap();
        assert!(cleared.is_none());
    }

    #[tokio::test]
    async fn reset_keeps_distribution_and_drops_our_key() {
        let store = store();
        let info = store.create_sender_key_info("group").unwrap();
        store
            .update_sender_key_info(
                "group",
                GroupSenderKeyInfo {
                    member_devices: vec![MemberDevice {
                        id: DeviceId(1),
                        identifier: ServiceId::new("alice").unwrap(),
                        registration_id: 9,
                    }],
                    ..info.clone()
                },
            )
            .unwrap();
        store.save_sender_key(&me(), info.distribution_id, record(), &GLOBAL_ZONE).await.unwrap();

        store.reset_sender_key("group", &me()).unwrap();

        let after = store.get_sender_key_info("group").unwrap().unwrap();
        assert_eq!(after.distribution_id, info.distribution_id);
        assert!(after.member_devices.is_empty());
        assert!(
            store.get_sender_key(&me(), info.distribution_id, &GLOBAL_ZONE).await.unwrap().is_none()
        );
    }

    #[test]
    fn group_send_plans_follow_bookkeeping() {
        let store = store();
        let alice = MemberDevice {
            id: DeviceId(1),
            identifier: ServiceId::new("alice").unwrap(),
            registration_id: 9,
        };

        assert_eq!(
            store.plan_group_send("group", &[alice.clone()], false).unwrap(),
            DistributionPlan::Create
        );

        store.create_sender_key_info("group").unwrap();
        assert_eq!(
            store.plan_group_send("group", &[alice.clone()], false).unwrap(),
            DistributionPlan::Distribute(vec![alice])
        );
    }
}
