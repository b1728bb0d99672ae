//! Chaotic storage wrapper for fault injection testing
//!
//! Storage wrapper that randomly fails operations. Used by chaos tests to
//! check that a failed zone commit leaves neither storage nor the cache half
//! updated.

#![allow(clippy::disallowed_types, reason = "Locking simple RNG state")]

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
};

use super::{Record, Storage, StorageError};
use crate::records::CommitBatch;

/// Chaotic storage wrapper that randomly injects failures
///
/// Delegates to an underlying storage implementation but fails operations
/// with probability `failure_rate`. Failures are injected before the inner
/// call, so a failed write never partially reaches the inner storage.
#[derive(Clone)]
pub struct ChaoticStorage<S: Storage> {
    inner: S,
    /// Failure rate (0.0 = never fail, 1.0 = always fail)
    failure_rate: f64,
    /// Whether reads may fail too, or only writes
    fail_reads: bool,
    /// RNG state for deterministic chaos
    rng: Arc<Mutex<ChaoticRng>>,
    /// Operations attempted
    operation_count: Arc<AtomicUsize>,
    /// Operations that were failed on purpose
    injected_failures: Arc<AtomicUsize>,
}

/// Simple deterministic RNG for chaos injection
///
/// Linear congruential generator, so chaos tests are reproducible with the
/// same seed.
struct ChaoticRng {
    state: u64,
}

impl ChaoticRng {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    /// Generate next random value [0.0, 1.0)
    fn next(&mut self) -> f64 {
        // LCG constants from Numerical Recipes
        const A: u64 = 1_664_525;
        const C: u64 = 1_013_904_223;
        const M: u64 = 1u64 << 32;

        self.state = (A.wrapping_mul(self.state).wrapping_add(C)) % M;
        (self.state as f64) / (M as f64)
    }
}

impl<S: Storage> ChaoticStorage<S> {
    /// Create a new chaotic storage wrapper
    ///
    /// # Panics
    ///
    /// Panics if `failure_rate` is not in [0.0, 1.0]
    pub fn new(inner: S, failure_rate: f64) -> Self {
        Self::with_seed(inner, failure_rate, 0x1234_5678_9ABC_DEF0)
    }

    /// Create with explicit seed for reproducible chaos
    ///
    /// # Panics
    ///
    /// Panics if `failure_rate` is not in [0.0, 1.0]
    #[allow(clippy::panic)]
    pub fn with_seed(inner: S, failure_rate: f64, seed: u64) -> Self {
        assert!(
            (0.0..=1.0).contains(&failure_rate),
            "failure_rate must be between 0.0 and 1.0, got {failure_rate}"
        );

        Self {
            inner,
            failure_rate,
            fail_reads: true,
            rng: Arc::new(Mutex::new(ChaoticRng::new(seed))),
            operation_count: Arc::new(AtomicUsize::new(0)),
            injected_failures: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Only inject failures into mutating calls.
    #[must_use]
    pub fn writes_only(mut self) -> Self {
        self.fail_reads = false;
        self
    }

    /// Underlying storage (for checking invariants after chaos).
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Total number of storage operations attempted.
    pub fn operation_count(&self) -> usize {
        self.operation_count.load(Ordering::Relaxed)
    }

    /// Number of operations failed on purpose.
    pub fn injected_failures(&self) -> usize {
        self.injected_failures.load(Ordering::Relaxed)
    }

    fn gate(&self, is_write: bool) -> Result<(), StorageError> {
        self.operation_count.fetch_add(1, Ordering::Relaxed);
        if !is_write && !self.fail_reads {
            return Ok(());
        }

        #[allow(clippy::expect_used)]
        let roll = self.rng.lock().expect("ChaoticRng mutex poisoned").next();
        if roll < self.failure_rate {
            self.injected_failures.fetch_add(1, Ordering::Relaxed);
            return Err(StorageError::Io("chaotic failure injection".to_string()));
        }
        Ok(())
    }
}

impl<S: Storage> Storage for ChaoticStorage<S> {
    fn create_or_update<R: Record>(&self, record: &R) -> Result<(), StorageError> {
        self.gate(true)?;
        self.inner.create_or_update(record)
    }

    fn get_by_id<R: Record>(&self, id: &str) -> Result<Option<R>, StorageError> {
        self.gate(false)?;
        self.inner.get_by_id(id)
    }

    fn bulk_add<R: Record>(&self, records: &[R]) -> Result<(), StorageError> {
        self.gate(true)?;
        self.inner.bulk_add(records)
    }

    fn remove_by_ids<R: Record>(&self, ids: &[String]) -> Result<(), StorageError> {
        self.gate(true)?;
        self.inner.remove_by_ids::<R>(ids)
    }

    fn remove_all<R: Record>(&self) -> Result<(), StorageError> {
        self.gate(true)?;
        self.inner.remove_all::<R>()
    }

    fn get_all<R: Record>(&self) -> Result<Vec<R>, StorageError> {
        self.gate(false)?;
        self.inner.get_all()
    }

    fn commit_decrypt_result(&self, batch: &CommitBatch) -> Result<(), StorageError> {
        self.gate(true)?;
        self.inner.commit_decrypt_result(batch)
    }

    fn remove_all_data(&self) -> Result<(), StorageError> {
        self.gate(true)?;
        self.inner.remove_all_data()
    }

    fn remove_all_configuration(&self) -> Result<(), StorageError> {
        self.gate(true)?;
        self.inner.remove_all_configuration()
    }
}
