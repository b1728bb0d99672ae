//! Clock, timer and entropy seam.
//!
//! The store never touches the OS directly. Tests supply a seeded RNG and a
//! wall clock they advance by hand; [`crate::SystemEnv`] supplies the real
//! ones.

use std::time::Duration;

/// Time and randomness as seen by the store.
///
/// Implementations must keep `now()` monotonic and, outside tests, fill
/// `random_bytes()` from a cryptographically secure source.
pub trait Environment: Clone + Send + Sync + 'static {
    /// Monotonic instant.
    type Instant: Copy + Ord + Send + Sync + std::ops::Sub<Output = Duration>;

    /// Monotonic now, for measuring job run time.
    fn now(&self) -> Self::Instant;

    /// Future that completes after `duration`; drives job timeouts.
    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send;

    /// Fill `buffer` with random bytes.
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Milliseconds since the Unix epoch.
    ///
    /// Persisted timestamps (identity changes, reset attempts, key creation)
    /// use this clock.
    fn wall_clock_ms(&self) -> u64;

    /// Random distribution id material.
    fn random_u128(&self) -> u128 {
        let mut bytes = [0u8; 16];
        self.random_bytes(&mut bytes);
        u128::from_be_bytes(bytes)
    }

    /// 32 random bytes, for key seeds.
    fn random_seed(&self) -> [u8; 32] {
        let mut seed = [0u8; 32];
        self.random_bytes(&mut seed);
        seed
    }
}
