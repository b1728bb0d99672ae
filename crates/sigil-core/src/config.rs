//! Store configuration.

use std::time::Duration;

use crate::StoreError;

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(60 * 60);
const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Tunables for [`crate::ProtocolStore`].
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Time a queued session or sender key job may run before it is rejected
    pub job_timeout: Duration,
    /// Jobs allowed to run at once across all queue keys
    pub max_concurrent_jobs: usize,
    /// Minimum spacing between successful light session resets per device
    pub light_reset_interval: Duration,
    /// Base delay between retries after repeated failed light resets
    pub light_reset_backoff_base: Duration,
    /// How long after a key change sending needs explicit approval
    pub approval_window: Duration,
    /// Attempts after which an unprocessed envelope is dropped
    pub max_unprocessed_attempts: u32,
    /// Age after which an unprocessed envelope is dropped
    pub unprocessed_max_age: Duration,
    /// Age after which a group sender key is reset
    pub sender_key_max_age: Duration,
    /// Age after which old signed pre-keys may be pruned
    pub signed_pre_key_max_age: Duration,
    /// Newest signed pre-keys always kept when pruning
    pub signed_pre_key_keep: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            job_timeout: 30 * MINUTE,
            max_concurrent_jobs: 32,
            light_reset_interval: HOUR,
            light_reset_backoff_base: Duration::from_secs(30),
            approval_window: Duration::from_secs(5),
            max_unprocessed_attempts: 3,
            unprocessed_max_age: 30 * DAY,
            sender_key_max_age: 90 * DAY,
            signed_pre_key_max_age: 30 * DAY,
            signed_pre_key_keep: 3,
        }
    }
}

impl StoreConfig {
    /// Reject values that would stall queues or disable rate limits.
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.max_concurrent_jobs == 0 {
            return Err(StoreError::Config("max_concurrent_jobs must be at least 1".into()));
        }
        if self.job_timeout.is_zero() {
            return Err(StoreError::Config("job_timeout must be non-zero".into()));
        }
        if self.light_reset_backoff_base > self.light_reset_interval {
            return Err(StoreError::Config(
                "light_reset_backoff_base must not exceed light_reset_interval".into(),
            ));
        }
        if self.max_unprocessed_attempts == 0 {
            return Err(StoreError::Config("max_unprocessed_attempts must be at least 1".into()));
        }
        Ok(())
    }
}
