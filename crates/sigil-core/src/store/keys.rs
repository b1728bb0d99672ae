//! Our own identities, one-time pre-keys and signed pre-keys.

use std::collections::BTreeMap;

use sigil_crypto::{KeyPair, PublicKey};
use tracing::{debug, info};

use super::{IDENTITY_KEY_MAP, LocalIdentity, ProtocolStore, REGISTRATION_ID_MAP};
use crate::{
    StoreError,
    cache::Hydrate,
    env::Environment,
    events::StoreEvent,
    ids::{ServiceId, pre_key_id},
    records::{StoredPreKey, StoredSignedPreKey},
    storage::Storage,
};

/// Largest key id handed out before wrapping back to 1.
pub const MAX_KEY_ID: u32 = 0x00ff_ffff;

fn next_key_id(id: u32) -> u32 {
    if id >= MAX_KEY_ID { 1 } else { id + 1 }
}

impl Hydrate for KeyPair {
    type Raw = StoredPreKey;

    fn hydrate(raw: &StoredPreKey) -> Result<Self, StoreError> {
        Ok(KeyPair::from_parts(&raw.private_key, &raw.public_key)?)
    }
}

/// A signed pre-key with its signature and upload state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignedPreKey {
    /// Key id advertised to peers
    pub key_id: u32,
    /// Key pair
    pub key_pair: KeyPair,
    /// Identity signature over the public key
    pub signature: Vec<u8>,
    /// Wall clock time (ms) of creation
    pub created_at: u64,
    /// Whether the server acknowledged the upload
    pub confirmed: bool,
}

impl SignedPreKey {
    fn to_stored(&self, our_service_id: &ServiceId) -> StoredSignedPreKey {
        StoredSignedPreKey {
            id: pre_key_id(our_service_id, self.key_id),
            our_service_id: our_service_id.clone(),
            key_id: self.key_id,
            public_key: self.key_pair.public_key().as_bytes().to_vec(),
            private_key: self.key_pair.private_key().to_vec(),
            signature: self.signature.clone(),
            created_at: self.created_at,
            confirmed: self.confirmed,
        }
    }
}

impl Hydrate for SignedPreKey {
    type Raw = StoredSignedPreKey;

    fn hydrate(raw: &StoredSignedPreKey) -> Result<Self, StoreError> {
        Ok(Self {
            key_id: raw.key_id,
            key_pair: KeyPair::from_parts(&raw.private_key, &raw.public_key)?,
            signature: raw.signature.clone(),
            created_at: raw.created_at,
            confirmed: raw.confirmed,
        })
    }
}

impl<E: Environment, S: Storage> ProtocolStore<E, S> {
    /// Register one of our identities.
    ///
    /// Replaces any key pair or registration id already stored for
    /// `our_service_id`.
    pub fn set_local_identity(
        &self,
        our_service_id: &ServiceId,
        key_pair: &KeyPair,
        registration_id: u32,
    ) -> Result<(), StoreError> {
        let mut identities: BTreeMap<ServiceId, LocalIdentity> =
            self.get_item(IDENTITY_KEY_MAP)?.unwrap_or_default();
        identities.insert(
            our_service_id.clone(),
            LocalIdentity {
                public_key: key_pair.public_key().as_bytes().to_vec(),
                private_key: key_pair.private_key().to_vec(),
            },
        );
        let mut registration_ids: BTreeMap<ServiceId, u32> =
            self.get_item(REGISTRATION_ID_MAP)?.unwrap_or_default();
        registration_ids.insert(our_service_id.clone(), registration_id);

        self.put_item(IDENTITY_KEY_MAP, &identities)?;
        self.put_item(REGISTRATION_ID_MAP, &registration_ids)?;

        let mut caches = self.lock_caches();
        caches.our_identity_keys.insert(our_service_id.clone(), key_pair.clone());
        caches.our_registration_ids.insert(our_service_id.clone(), registration_id);
        info!(our_service_id = %our_service_id, registration_id, "local identity set");
        Ok(())
    }

    /// Identity key pair of one of our accounts.
    pub fn get_identity_key_pair(&self, our_service_id: &ServiceId) -> Option<KeyPair> {
        self.lock_caches().our_identity_keys.get(our_service_id).cloned()
    }

    /// Registration id of one of our accounts.
    pub fn get_local_registration_id(&self, our_service_id: &ServiceId) -> Option<u32> {
        self.lock_caches().our_registration_ids.get(our_service_id).copied()
    }

    /// One-time pre-key `key_id` of `our_service_id`.
    pub fn load_pre_key(
        &self,
        our_service_id: &ServiceId,
        key_id: u32,
    ) -> Result<Option<KeyPair>, StoreError> {
        self.lock_caches().pre_keys.get(&pre_key_id(our_service_id, key_id))
    }

    /// Save one-time pre-keys.
    pub fn store_pre_keys(
        &self,
        our_service_id: &ServiceId,
        keys: &[(u32, KeyPair)],
    ) -> Result<(), StoreError> {
        let created_at = self.env.wall_clock_ms();
        let rows: Vec<StoredPreKey> = keys
            .iter()
            .map(|(key_id, pair)| StoredPreKey {
                id: pre_key_id(our_service_id, *key_id),
                our_service_id: our_service_id.clone(),
                key_id: *key_id,
                public_key: pair.public_key().as_bytes().to_vec(),
                private_key: pair.private_key().to_vec(),
                created_at,
            })
            .collect();
        self.storage.bulk_add(&rows)?;

        let mut caches = self.lock_caches();
        for (row, (_, pair)) in rows.into_iter().zip(keys) {
            caches.pre_keys.insert_hydrated(row.id.clone(), row, pair.clone());
        }
        Ok(())
    }

    /// Create `count` one-time pre-keys with ids from `start_id`, wrapping at
    /// [`MAX_KEY_ID`].
    ///
    /// Returns the key ids and public keys to upload.
    pub fn generate_pre_keys(
        &self,
        our_service_id: &ServiceId,
        start_id: u32,
        count: u32,
    ) -> Result<Vec<(u32, PublicKey)>, StoreError> {
        let mut key_id = start_id.clamp(1, MAX_KEY_ID);
        let mut keys = Vec::with_capacity(count as usize);
        for _ in 0..count {
            keys.push((key_id, KeyPair::from_seed(&self.env.random_seed())));
            key_id = next_key_id(key_id);
        }

        self.store_pre_keys(our_service_id, &keys)?;
        debug!(our_service_id = %our_service_id, count, start_id, "generated pre-keys");
        Ok(keys.iter().map(|(key_id, pair)| (*key_id, pair.public_key())).collect())
    }

    /// Delete one-time pre-keys, typically after they were used.
    pub fn remove_pre_keys(
        &self,
        our_service_id: &ServiceId,
        key_ids: &[u32],
    ) -> Result<(), StoreError> {
        let ids: Vec<String> =
            key_ids.iter().map(|key_id| pre_key_id(our_service_id, *key_id)).collect();
        self.storage.remove_by_ids::<StoredPreKey>(&ids)?;
        {
            let mut caches = self.lock_caches();
            for id in &ids {
                caches.pre_keys.remove(id);
            }
        }

        self.events.emit(&StoreEvent::RemovePreKey { our_service_id: our_service_id.clone() });
        Ok(())
    }

    /// Delete every one-time pre-key.
    pub fn clear_pre_key_store(&self) -> Result<(), StoreError> {
        self.storage.remove_all::<StoredPreKey>()?;
        self.lock_caches().pre_keys.clear();
        Ok(())
    }

    /// Signed pre-key `key_id` of `our_service_id`.
    pub fn load_signed_pre_key(
        &self,
        our_service_id: &ServiceId,
        key_id: u32,
    ) -> Result<Option<SignedPreKey>, StoreError> {
        self.lock_caches().signed_pre_keys.get(&pre_key_id(our_service_id, key_id))
    }

    /// Every signed pre-key of `our_service_id`, newest first.
    pub fn load_signed_pre_keys(
        &self,
        our_service_id: &ServiceId,
    ) -> Result<Vec<SignedPreKey>, StoreError> {
        let mut caches = self.lock_caches();
        let ids: Vec<String> = caches
            .signed_pre_keys
            .iter()
            .filter(|(_, entry)| entry.raw().our_service_id == *our_service_id)
            .map(|(id, _)| id.clone())
            .collect();

        let mut keys = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(key) = caches.signed_pre_keys.get(&id)? {
                keys.push(key);
            }
        }
        keys.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.key_id.cmp(&a.key_id)));
        Ok(keys)
    }

    /// Save a signed pre-key.
    pub fn store_signed_pre_key(
        &self,
        our_service_id: &ServiceId,
        key: &SignedPreKey,
    ) -> Result<(), StoreError> {
        let raw = key.to_stored(our_service_id);
        self.storage.create_or_update(&raw)?;
        self.lock_caches().signed_pre_keys.insert_hydrated(raw.id.clone(), raw, key.clone());
        Ok(())
    }

    /// Mark signed pre-key `key_id` as acknowledged by the server.
    ///
    /// # Errors
    ///
    /// `StoreError::NotFound` if the key does not exist.
    pub fn confirm_signed_pre_key(
        &self,
        our_service_id: &ServiceId,
        key_id: u32,
    ) -> Result<(), StoreError> {
        let key = self.load_signed_pre_key(our_service_id, key_id)?.ok_or_else(|| {
            StoreError::not_found("signed pre-key", pre_key_id(our_service_id, key_id))
        })?;
        self.store_signed_pre_key(our_service_id, &SignedPreKey { confirmed: true, ..key })
    }

    /// Delete signed pre-keys.
    pub fn remove_signed_pre_keys(
        &self,
        our_service_id: &ServiceId,
        key_ids: &[u32],
    ) -> Result<(), StoreError> {
        let ids: Vec<String> =
            key_ids.iter().map(|key_id| pre_key_id(our_service_id, *key_id)).collect();
        self.storage.remove_by_ids::<StoredSignedPreKey>(&ids)?;

        let mut caches = self.lock_caches();
        for id in &ids {
            caches.signed_pre_keys.remove(id);
        }
        Ok(())
    }

    /// Delete every signed pre-key.
    pub fn clear_signed_pre_keys_store(&self) -> Result<(), StoreError> {
        self.storage.remove_all::<StoredSignedPreKey>()?;
        self.lock_caches().signed_pre_keys.clear();
        Ok(())
    }

    /// Create, sign and store a new signed pre-key, then prune old ones.
    ///
    /// The newest [`crate::StoreConfig::signed_pre_key_keep`] keys are always
    /// kept; older ones are deleted once past
    /// [`crate::StoreConfig::signed_pre_key_max_age`].
    ///
    /// # Errors
    ///
    /// `StoreError::NotFound` if `our_service_id` has no identity key.
    pub fn rotate_signed_pre_key(
        &self,
        our_service_id: &ServiceId,
    ) -> Result<SignedPreKey, StoreError> {
        let identity = self
            .get_identity_key_pair(our_service_id)
            .ok_or_else(|| StoreError::not_found("local identity", our_service_id.as_str()))?;

        let existing = self.load_signed_pre_keys(our_service_id)?;
        let key_id = existing
            .iter()
            .map(|key| key.key_id)
            .max()
            .map_or(1, next_key_id);

        let key_pair = KeyPair::from_seed(&self.env.random_seed());
        let key = SignedPreKey {
            key_id,
            signature: identity.sign(key_pair.public_key().as_bytes()).to_vec(),
            key_pair,
            created_at: self.env.wall_clock_ms(),
            confirmed: false,
        };
        self.store_signed_pre_key(our_service_id, &key)?;
        info!(our_service_id = %our_service_id, key_id, "rotated signed pre-key");

        self.prune_signed_pre_keys(our_service_id)?;
        Ok(key)
    }

    fn prune_signed_pre_keys(&self, our_service_id: &ServiceId) -> Result<(), StoreError> {
        let now = self.env.wall_clock_ms();
        let max_age = self.config.signed_pre_key_max_age.as_millis() as u64;

        let stale: Vec<u32> = self
            .load_signed_pre_keys(our_service_id)?
            .iter()
            .skip(self.config.signed_pre_key_keep)
            .filter(|key| now.saturating_sub(key.created_at) > max_age)
            .map(|key| key.key_id)
            .collect();

        if !stale.is_empty() {
            info!(our_service_id = %our_service_id, ?stale, "pruning signed pre-keys");
            self.remove_signed_pre_keys(our_service_id, &stale)?;
        }
        Ok(())
    }
}
