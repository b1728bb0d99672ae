//! Unprocessed envelopes: received but not yet fully handled.

use std::time::Duration;

use tracing::{debug, info};

use super::ProtocolStore;
use crate::{
    StoreError,
    env::Environment,
    records::{StoredUnprocessed, UnprocessedUpdate},
    storage::Storage,
    zone::{GLOBAL_ZONE, Zone},
};

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl<E: Environment, S: Storage> ProtocolStore<E, S> {
    /// Save one envelope for later processing.
    pub async fn add_unprocessed(
        &self,
        envelope: StoredUnprocessed,
        zone: &Zone,
    ) -> Result<(), StoreError> {
        self.add_multiple_unprocessed(vec![envelope], zone).await
    }

    /// Save envelopes for later processing.
    ///
    /// Staged until the zone completes when the zone batches unprocessed
    /// envelopes, so they land together with the session changes that
    /// decrypted them.
    pub async fn add_multiple_unprocessed(
        &self,
        envelopes: Vec<StoredUnprocessed>,
        zone: &Zone,
    ) -> Result<(), StoreError> {
        self.with_zone(zone, "add_unprocessed", || async move {
            self.zones.with_pending(|pending| {
                for envelope in envelopes {
                    pending.unprocessed.insert(envelope.id.clone(), envelope);
                }
            });
            if !zone.supports_pending_unprocessed() {
                self.commit_zone_changes("add_unprocessed")?;
            }
            Ok(())
        })
        .await
    }

    /// Number of persisted envelopes.
    pub fn get_unprocessed_count(&self) -> Result<usize, StoreError> {
        Ok(self.storage.get_all::<StoredUnprocessed>()?.len())
    }

    /// Every envelope still worth retrying, oldest first.
    ///
    /// Envelopes older than the configured maximum age are deleted. The rest
    /// have their attempt count bumped, and those that reach the maximum
    /// attempts are deleted as well.
    pub async fn get_all_unprocessed_and_increment_attempts(
        &self,
    ) -> Result<Vec<StoredUnprocessed>, StoreError> {
        self.with_zone(&GLOBAL_ZONE, "get_all_unprocessed", || async move {
            let now = self.env.wall_clock_ms();
            let oldest = now.saturating_sub(millis(self.config.unprocessed_max_age));
            let max_attempts = self.config.max_unprocessed_attempts;

            let mut expired = Vec::new();
            let mut exhausted = Vec::new();
            let mut retry = Vec::new();
            for mut envelope in self.storage.get_all::<StoredUnprocessed>()? {
                if envelope.received_at < oldest {
                    expired.push(envelope.id);
                    continue;
                }
                envelope.attempts = envelope.attempts.saturating_add(1);
                if envelope.attempts >= max_attempts {
                    exhausted.push(envelope.id);
                } else {
                    retry.push(envelope);
                }
            }

            if !expired.is_empty() || !exhausted.is_empty() {
                info!(
                    expired = expired.len(),
                    exhausted = exhausted.len(),
                    "dropping unprocessed envelopes"
                );
                let dropped: Vec<String> = expired.into_iter().chain(exhausted).collect();
                self.storage.remove_by_ids::<StoredUnprocessed>(&dropped)?;
            }
            if !retry.is_empty() {
                self.storage.bulk_add(&retry)?;
            }

            retry.sort_by(|a, b| a.received_at.cmp(&b.received_at).then_with(|| a.id.cmp(&b.id)));
            Ok(retry)
        })
        .await
    }

    /// Attach decryption results to an envelope.
    ///
    /// An envelope staged in the active zone is updated in place and lands
    /// with the zone's commit. An envelope that is already gone is ignored.
    pub fn update_unprocessed_with_data(
        &self,
        id: &str,
        update: UnprocessedUpdate,
    ) -> Result<(), StoreError> {
        let unstaged = self.zones.with_pending(|pending| match pending.unprocessed.get_mut(id) {
            Some(envelope) => {
                envelope.apply(update);
                None
            },
            None => Some(update),
        });
        let Some(update) = unstaged else {
            debug!(id, "updated staged unprocessed envelope");
            return Ok(());
        };

        let Some(mut envelope) = self.storage.get_by_id::<StoredUnprocessed>(id)? else {
            debug!(id, "unprocessed envelope already removed");
            return Ok(());
        };
        envelope.apply(update);
        self.storage.create_or_update(&envelope)?;
        Ok(())
    }

    /// Delete envelopes by id, staged or persisted.
    pub fn remove_unprocessed(&self, ids: &[String]) -> Result<(), StoreError> {
        self.storage.remove_by_ids::<StoredUnprocessed>(ids)?;
        self.zones.with_pending(|pending| {
            for id in ids {
                pending.unprocessed.remove(id);
            }
        });
        Ok(())
    }

    /// Delete every envelope, staged or persisted.
    pub fn remove_all_unprocessed(&self) -> Result<(), StoreError> {
        self.storage.remove_all::<StoredUnprocessed>()?;
        self.zones.with_pending(|pending| pending.unprocessed.clear());
        Ok(())
    }
}
