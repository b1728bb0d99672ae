//! Per-key FIFO job queues.
//!
//! Every distinct key gets its own FIFO, created on first use and reused
//! afterwards. Jobs for one key run one at a time in submission order; jobs for
//! different keys run concurrently, up to the shared concurrency limit.
//!
//! # Invariants
//!
//! - At most one job per key is running at any time
//! - A job that exceeds the timeout is rejected and its key released
//! - A job enqueued from inside a running job for the same key runs inline
//! - Nested jobs reuse the outer job's concurrency permit
//! - [`JobQueues::in_job`] tells callers when taking another key of the same
//!   family could wait on a job that is waiting on them

#![allow(clippy::disallowed_types, reason = "Short critical sections, never held across await")]

use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tokio::sync::{Mutex as KeyLock, Semaphore};
use tracing::{debug, trace, warn};

use crate::{StoreError, env::Environment};

tokio::task_local! {
    /// Queue family and key held by the jobs running on this task, outermost first.
    static HELD_KEYS: Vec<(&'static str, String)>;
}

/// A family of keyed FIFO queues sharing one concurrency limit.
pub struct JobQueues<E: Environment> {
    name: &'static str,
    env: E,
    timeout: Duration,
    queues: Mutex<HashMap<String, Arc<KeyLock<()>>>>,
    limiter: Arc<Semaphore>,
}

impl<E: Environment> JobQueues<E> {
    /// Queues named `name` (for logs) drawing permits from `limiter`.
    pub fn new(name: &'static str, env: E, timeout: Duration, limiter: Arc<Semaphore>) -> Self {
        Self { name, env, timeout, queues: Mutex::new(HashMap::new()), limiter }
    }

    /// Run `job` on the queue for `key`.
    ///
    /// Waits for earlier jobs on the same key, then for a concurrency permit.
    /// The timeout covers the job itself, not the wait.
    ///
    /// # Errors
    ///
    /// - `StoreError::Timeout` if the job runs longer than the allowance
    /// - `StoreError::QueueClosed` if the concurrency limiter was closed
    /// - Whatever `job` returns
    pub async fn enqueue<T, F, Fut>(&self, key: &str, job: F) -> Result<T, StoreError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let held = HELD_KEYS.try_with(Clone::clone).ok();
        if held
            .as_ref()
            .is_some_and(|keys| keys.iter().any(|(name, k)| *name == self.name && k == key))
        {
            debug!(queue = self.name, key, "running nested job inline");
            return job().await;
        }

        let turn = self.queue_for(key).lock_owned().await;
        let permit = match held {
            Some(_) => None,
            None => Some(
                self.limiter
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| StoreError::QueueClosed(self.name.to_string()))?,
            ),
        };

        let mut keys = held.unwrap_or_default();
        keys.push((self.name, key.to_string()));

        let started = self.env.now();
        let result = tokio::select! {
            result = HELD_KEYS.scope(keys, job()) => result,
            () = self.env.sleep(self.timeout) => {
                warn!(queue = self.name, key, timeout = ?self.timeout, "job timed out");
                Err(StoreError::Timeout { queue: key.to_string(), after: self.timeout })
            },
        };
        trace!(queue = self.name, key, elapsed = ?(self.env.now() - started), "job finished");

        drop(permit);
        drop(turn);
        result
    }

    /// Whether the current task is running a job from this family.
    pub fn in_job(&self) -> bool {
        HELD_KEYS
            .try_with(|keys| keys.iter().any(|(name, _)| *name == self.name))
            .unwrap_or(false)
    }

    /// Drop queues nobody is using.
    pub fn prune_idle(&self) {
        self.lock().retain(|_, queue| Arc::strong_count(queue) > 1);
    }

    /// Number of keys with a queue.
    pub fn queue_count(&self) -> usize {
        self.lock().len()
    }

    fn queue_for(&self, key: &str) -> Arc<KeyLock<()>> {
        self.lock().entry(key.to_string()).or_insert_with(|| Arc::new(KeyLock::new(()))).clone()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<KeyLock<()>>>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
