//! Simulated environment for deterministic store tests.
//!
//! Randomness comes from a seeded ChaCha20 stream and the wall clock only
//! moves when a test calls [`SimEnv::advance`]. Monotonic time and sleeps use
//! tokio's clock, so tests that pause it (`start_paused = true`) drive job
//! timeouts without waiting.

#![allow(clippy::disallowed_types, reason = "RNG lock is never held across await")]

use std::{
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use sigil_core::Environment;

/// Wall clock start: 2024-01-01T00:00:00Z.
pub const SIM_EPOCH_MS: u64 = 1_704_067_200_000;

/// Deterministic [`Environment`].
///
/// Clones share the RNG stream and the wall clock.
#[derive(Clone)]
pub struct SimEnv {
    rng: Arc<Mutex<ChaCha20Rng>>,
    wall_clock_ms: Arc<AtomicU64>,
}

impl SimEnv {
    /// Environment seeded with `seed`, wall clock at [`SIM_EPOCH_MS`].
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Arc::new(Mutex::new(ChaCha20Rng::seed_from_u64(seed))),
            wall_clock_ms: Arc::new(AtomicU64::new(SIM_EPOCH_MS)),
        }
    }

    /// Move the wall clock forward.
    ///
    /// Does not touch tokio's clock; pair with `tokio::time::advance` when a
    /// test needs both.
    pub fn advance(&self, by: Duration) {
        let millis = u64::try_from(by.as_millis()).unwrap_or(u64::MAX);
        self.wall_clock_ms.fetch_add(millis, Ordering::SeqCst);
    }

    /// Set the wall clock.
    ///
    /// Going backwards is allowed here; persisted timestamps are the only
    /// consumer and tests use it to model clock skew.
    pub fn set_wall_clock(&self, millis: u64) {
        self.wall_clock_ms.store(millis, Ordering::SeqCst);
    }
}

impl Default for SimEnv {
    fn default() -> Self {
        Self::with_seed(0)
    }
}

impl Environment for SimEnv {
    type Instant = tokio::time::Instant;

    fn now(&self) -> Self::Instant {
        tokio::time::Instant::now()
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        self.rng.lock().unwrap_or_else(PoisonError::into_inner).fill_bytes(buffer);
    }

    fn wall_clock_ms(&self) -> u64 {
        self.wall_clock_ms.load(Ordering::SeqCst)
    }
}
