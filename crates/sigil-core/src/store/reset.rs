//! Light session reset and account wipes.
//!
//! A light reset archives the session with one peer device and sends that
//! device a null message so it starts a fresh handshake. Resets are rate
//! limited per device through the `session_resets` item:
//!
//! ```text
//! failures == 0      one reset per light_reset_interval
//! failures == 1      retry immediately
//! failures == n > 1  retry after backoff_base * 2^(n-2), capped at the interval
//! ```

use std::{collections::BTreeMap, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use super::ProtocolStore;
use crate::{
    StoreError,
    env::Environment,
    events::StoreEvent,
    ids::{QualifiedAddress, ServiceId},
    storage::Storage,
    zone::GLOBAL_ZONE,
};

/// Item holding light reset bookkeeping, keyed by qualified address.
const SESSION_RESETS: &str = "session_resets";

/// Sends the empty message that prompts a peer to rebuild its session.
#[async_trait]
pub trait NullMessageSender: Send + Sync {
    /// Send a null message to every device of `service_id`.
    async fn send_null_message(&self, service_id: &ServiceId) -> Result<(), StoreError>;
}

/// Result of [`ProtocolStore::light_session_reset`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LightResetOutcome {
    /// Rate limited; nothing was done
    Skipped {
        /// Wall clock time of the attempt that is still in effect
        last_attempt: u64,
    },
    /// Session archived and null message sent
    Reset,
    /// Archive or send failed
    Failed {
        /// Earliest time, relative to now, another attempt is permitted
        retry_after: Duration,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct SessionResetEntry {
    last_attempt: u64,
    consecutive_failures: u32,
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Delay before the next attempt after `failures` consecutive failures.
fn retry_delay(failures: u32, base: Duration, interval: Duration) -> Duration {
    match failures {
        0 => interval,
        1 => Duration::ZERO,
        n => base.saturating_mul(2u32.saturating_pow(n - 2)).min(interval),
    }
}

impl<E: Environment, S: Storage> ProtocolStore<E, S> {
    /// Archive the session with `address` and ask the peer to start over.
    ///
    /// # Errors
    ///
    /// Only fatal errors and failures to persist the bookkeeping are
    /// returned; an ordinary archive or send failure is reported as
    /// [`LightResetOutcome::Failed`].
    pub async fn light_session_reset(
        &self,
        address: &QualifiedAddress,
        sender: &dyn NullMessageSender,
    ) -> Result<LightResetOutcome, StoreError> {
        let key = address.to_string();
        let now = self.env.wall_clock_ms();

        if let Some(last_attempt) = self.begin_light_reset(&key, now)? {
            info!(address = %address, last_attempt, "light session reset rate limited");
            return Ok(LightResetOutcome::Skipped { last_attempt });
        }

        info!(address = %address, "light session reset");
        let attempt = match self.archive_session(address, &GLOBAL_ZONE).await {
            Ok(()) => sender.send_null_message(address.service_id()).await,
            Err(err) => Err(err),
        };

        match attempt {
            Ok(()) => {
                self.finish_light_reset(&key, true)?;
                Ok(LightResetOutcome::Reset)
            },
            Err(err) => {
                let failures = self.finish_light_reset(&key, false)?;
                error!(address = %address, failures, error = %err, "light session reset failed");
                if err.is_fatal() {
                    return Err(err);
                }
                Ok(LightResetOutcome::Failed {
                    retry_after: retry_delay(
                        failures,
                        self.config.light_reset_backoff_base,
                        self.config.light_reset_interval,
                    ),
                })
            },
        }
    }

    /// Record an attempt for `key` unless one is still in effect.
    ///
    /// Returns the time of the blocking attempt when rate limited.
    fn begin_light_reset(&self, key: &str, now: u64) -> Result<Option<u64>, StoreError> {
        let _resets = self.resets.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut entries: BTreeMap<String, SessionResetEntry> =
            self.get_item(SESSION_RESETS)?.unwrap_or_default();

        let interval = self.config.light_reset_interval;
        let base = self.config.light_reset_backoff_base;
        let failures = match entries.get(key) {
            Some(entry) => {
                let delay = retry_delay(entry.consecutive_failures, base, interval);
                if now < entry.last_attempt.saturating_add(millis(delay)) {
                    return Ok(Some(entry.last_attempt));
                }
                entry.consecutive_failures
            },
            None => 0,
        };

        // Settled entries past the interval no longer limit anything.
        let horizon = now.saturating_sub(millis(interval));
        entries.retain(|_, entry| entry.consecutive_failures > 0 || entry.last_attempt >= horizon);
        entries.insert(
            key.to_string(),
            SessionResetEntry { last_attempt: now, consecutive_failures: failures },
        );
        self.put_item(SESSION_RESETS, &entries)?;
        Ok(None)
    }

    /// Settle the attempt for `key`, returning the consecutive failure count.
    fn finish_light_reset(&self, key: &str, succeeded: bool) -> Result<u32, StoreError> {
        let _resets = self.resets.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut entries: BTreeMap<String, SessionResetEntry> =
            self.get_item(SESSION_RESETS)?.unwrap_or_default();

        let now = self.env.wall_clock_ms();
        let entry = entries
            .entry(key.to_string())
            .or_insert(SessionResetEntry { last_attempt: now, consecutive_failures: 0 });
        entry.consecutive_failures =
            if succeeded { 0 } else { entry.consecutive_failures.saturating_add(1) };
        let failures = entry.consecutive_failures;

        self.put_item(SESSION_RESETS, &entries)?;
        Ok(failures)
    }

    /// Delete every record, then reload the caches.
    ///
    /// Subscribers to [`crate::EventKind::RemoveAllData`] are notified once
    /// the wipe is done.
    pub async fn remove_all_data(&self) -> Result<(), StoreError> {
        self.with_zone(&GLOBAL_ZONE, "remove_all_data", || async move {
            warn!("removing all data");
            self.storage.remove_all_data()?;
            self.reset_runtime_state()
        })
        .await?;

        self.events.emit(&StoreEvent::RemoveAllData);
        Ok(())
    }

    /// Delete keys, sessions and settings but keep groups, then reload the
    /// caches.
    pub async fn remove_all_configuration(&self) -> Result<(), StoreError> {
        self.with_zone(&GLOBAL_ZONE, "remove_all_configuration", || async move {
            warn!("removing all configuration");
            self.storage.remove_all_configuration()?;
            self.reset_runtime_state()
        })
        .await
    }

    fn reset_runtime_state(&self) -> Result<(), StoreError> {
        self.hydrate_caches()?;
        self.session_queues.prune_idle();
        self.sender_key_queues.prune_idle();
        Ok(())
    }
}
