//! Zone-based transaction coordinator.
//!
//! A zone is a named transaction scope. At most one zone is active at a time:
//!
//! ```text
//!            enter(Z)                     enter(Z) (re-entry)
//!   Idle ───────────────► InZone(Z, 1) ─────────────────────► InZone(Z, d+1)
//!    ▲                         │  ▲                                │
//!    │   leave, no waiters     │  └────────── leave ───────────────┘
//!    └─────────────────────────┘
//!
//!   enter(Y != Z) while InZone(Z, _) parks in FIFO order. When depth drops
//!   to 0 the first waiter and every consecutive waiter for the same zone
//!   are admitted together.
//! ```
//!
//! The coordinator also owns the zone's pending writes (`P`). They live as
//! long as the zone is active and are taken by whoever completes at depth 1.
//! Admission is a hand-off: the waker builds the waiter's [`ZoneGuard`] while
//! holding the state lock, so no other zone can slip in between.

#![allow(clippy::disallowed_types, reason = "Short critical sections, never held across await")]

use std::{
    collections::VecDeque,
    fmt,
    sync::{
        Arc, LazyLock, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use tokio::sync::oneshot;
use tracing::{debug, info, warn};

static NEXT_ZONE_ID: AtomicU64 = AtomicU64::new(1);

/// The always-available zone.
///
/// It batches nothing: writes made in it commit immediately.
pub static GLOBAL_ZONE: LazyLock<Zone> = LazyLock::new(|| Zone {
    id: 0,
    name: Arc::from("global"),
    options: ZoneOptions::default(),
});

/// Which writes a zone may stage until it completes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ZoneOptions {
    /// Stage session writes
    pub pending_sessions: bool,
    /// Stage sender key writes
    pub pending_sender_keys: bool,
    /// Stage unprocessed envelope writes
    pub pending_unprocessed: bool,
}

impl ZoneOptions {
    /// Stage every kind of write.
    pub fn batch_all() -> Self {
        Self { pending_sessions: true, pending_sender_keys: true, pending_unprocessed: true }
    }
}

/// A named transaction scope.
///
/// Identity is by instance: clones are the same zone, two zones created with
/// the same name are not.
#[derive(Clone)]
pub struct Zone {
    id: u64,
    name: Arc<str>,
    options: ZoneOptions,
}

impl Zone {
    /// Create a new zone.
    pub fn new(name: impl Into<Arc<str>>, options: ZoneOptions) -> Self {
        Self { id: NEXT_ZONE_ID.fetch_add(1, Ordering::Relaxed), name: name.into(), options }
    }

    /// Zone name, for logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether session writes are staged.
    pub fn supports_pending_sessions(&self) -> bool {
        self.options.pending_sessions
    }

    /// Whether sender key writes are staged.
    pub fn supports_pending_sender_keys(&self) -> bool {
        self.options.pending_sender_keys
    }

    /// Whether unprocessed envelope writes are staged.
    pub fn supports_pending_unprocessed(&self) -> bool {
        self.options.pending_unprocessed
    }

    /// Whether this is [`GLOBAL_ZONE`].
    pub fn is_global(&self) -> bool {
        self.id == 0
    }
}

impl PartialEq for Zone {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Zone {}

impl fmt::Debug for Zone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Zone({}#{})", self.name, self.id)
    }
}

struct Waiter<P: Default> {
    zone: Zone,
    name: String,
    admit: oneshot::Sender<ZoneGuard<P>>,
}

struct ZoneState<P: Default> {
    current: Option<Zone>,
    depth: usize,
    waiters: VecDeque<Waiter<P>>,
    pending: P,
}

type Shared<P> = Arc<Mutex<ZoneState<P>>>;

fn lock<P: Default>(state: &Mutex<ZoneState<P>>) -> MutexGuard<'_, ZoneState<P>> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Re-entrant zone monitor with a FIFO of waiters grouped by zone.
pub struct ZoneCoordinator<P: Default> {
    state: Shared<P>,
}

impl<P: Default + Send + 'static> Default for ZoneCoordinator<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Default + Send + 'static> ZoneCoordinator<P> {
    /// Idle coordinator with empty pending writes.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ZoneState {
                current: None,
                depth: 0,
                waiters: VecDeque::new(),
                pending: P::default(),
            })),
        }
    }

    /// Enter `zone`, waiting if a different zone is active.
    ///
    /// `name` identifies the operation in logs.
    pub async fn enter(&self, zone: &Zone, name: &str) -> ZoneGuard<P> {
        loop {
            let admitted = {
                let mut state = lock(&self.state);
                match state.current.clone() {
                    None => {
                        debug!(zone = ?zone, name, "entering zone");
                        state.current = Some(zone.clone());
                        state.depth = 1;
                        return ZoneGuard::new(self.state.clone(), zone.clone());
                    },
                    Some(active) if active == *zone => {
                        state.depth += 1;
                        return ZoneGuard::new(self.state.clone(), zone.clone());
                    },
                    Some(active) => {
                        info!(
                            zone = ?zone,
                            active = ?active,
                            name,
                            "waiting for active zone to unwind"
                        );
                        let (admit, admitted) = oneshot::channel();
                        state.waiters.push_back(Waiter {
                            zone: zone.clone(),
                            name: name.to_string(),
                            admit,
                        });
                        admitted
                    },
                }
            };

            // The sender only drops unsent if the coordinator itself is torn
            // down; entering again is the only sensible recovery.
            if let Ok(guard) = admitted.await {
                return guard;
            }
        }
    }

    /// Current nesting depth; 0 when idle.
    pub fn depth(&self) -> usize {
        lock(&self.state).depth
    }

    /// Active zone, if any.
    pub fn current_zone(&self) -> Option<Zone> {
        lock(&self.state).current.clone()
    }

    /// Callers parked behind the active zone.
    pub fn waiting(&self) -> usize {
        lock(&self.state).waiters.len()
    }

    /// Run `f` against the pending writes.
    pub fn with_pending<T>(&self, f: impl FnOnce(&mut P) -> T) -> T {
        f(&mut lock(&self.state).pending)
    }

    /// Take the pending writes, leaving them empty.
    pub fn take_pending(&self) -> P {
        std::mem::take(&mut lock(&self.state).pending)
    }

    /// Drop the pending writes.
    pub fn discard_pending(&self) {
        lock(&self.state).pending = P::default();
    }
}

/// Proof of being inside a zone. Leaves the zone on drop.
///
/// A guard dropped before [`ZoneGuard::settle`] while at depth 1 (the
/// enclosing future was cancelled) discards the pending writes.
pub struct ZoneGuard<P: Default> {
    state: Shared<P>,
    zone: Zone,
    settled: bool,
    released: bool,
}

impl<P: Default> ZoneGuard<P> {
    fn new(state: Shared<P>, zone: Zone) -> Self {
        Self { state, zone, settled: false, released: false }
    }

    /// Zone this guard holds.
    pub fn zone(&self) -> &Zone {
        &self.zone
    }

    /// Whether this is the outermost active call (depth 1).
    pub fn is_top_level(&self) -> bool {
        lock(&self.state).depth == 1
    }

    /// Mark the call as completed; commit or revert already ran.
    pub fn settle(&mut self) {
        self.settled = true;
    }
}

impl<P: Default> Drop for ZoneGuard<P> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        let mut state = lock(&self.state);
        if !self.settled && state.depth == 1 {
            warn!(zone = ?self.zone, "zone abandoned before completion, discarding pending writes");
            state.pending = P::default();
        }
        leave(&mut *state, &self.state);
    }
}

fn leave<P: Default>(state: &mut ZoneState<P>, shared: &Shared<P>) {
    debug_assert!(state.depth > 0, "leaving a zone that was never entered");
    state.depth = state.depth.saturating_sub(1);
    if state.depth > 0 {
        return;
    }

    if let Some(zone) = state.current.take() {
        debug!(zone = ?zone, "left zone");
    }
    admit_waiters(state, shared);
}

/// Admit the front waiter and every consecutive waiter for the same zone.
///
/// Waiters whose callers were cancelled are skipped.
fn admit_waiters<P: Default>(state: &mut ZoneState<P>, shared: &Shared<P>) {
    while let Some(first) = state.waiters.pop_front() {
        let zone = first.zone.clone();
        state.current = Some(zone.clone());
        admit(state, shared, first);

        while state.waiters.front().is_some_and(|waiter| waiter.zone == zone) {
            if let Some(waiter) = state.waiters.pop_front() {
                admit(state, shared, waiter);
            }
        }

        if state.depth > 0 {
            return;
        }
        state.current = None;
    }
}

fn admit<P: Default>(state: &mut ZoneState<P>, shared: &Shared<P>, waiter: Waiter<P>) {
    debug!(zone = ?waiter.zone, name = %waiter.name, "admitting waiter");
    state.depth += 1;
    let guard = ZoneGuard::new(shared.clone(), waiter.zone);
    if let Err(mut guard) = waiter.admit.send(guard) {
        // The waiting caller is gone; undo its admission without re-locking.
        guard.released = true;
        state.depth -= 1;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn zone(name: &str) -> Zone {
        Zone::new(name, ZoneOptions::batch_all())
    }

    #[tokio::test]
    async fn reentry_tracks_depth() {
        let coordinator = ZoneCoordinator::<Vec<u32>>::new();
        let z = zone("decrypt");

        let outer = coordinator.enter(&z, "outer").await;
        let inner = coordinator.enter(&z, "inner").await;
        assert_eq!(coordinator.depth(), 2);
        assert!(!inner.is_top_level());

        drop(inner);
        assert!(outer.is_top_level());
        drop(outer);

        assert_eq!(coordinator.depth(), 0);
        assert_eq!(coordinator.current_zone(), None);
    }

    #[tokio::test]
    async fn different_zone_waits_for_unwind() {
        let coordinator = Arc::new(ZoneCoordinator::<()>::new());
        let a = zone("a");
        let b = zone("b");

        let held = coordinator.enter(&a, "a").await;

        let task = {
            let coordinator = coordinator.clone();
            let b = b.clone();
            tokio::spawn(async move {
                let guard = coordinator.enter(&b, "b").await;
                guard.zone().clone()
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(coordinator.waiting(), 1);
        assert!(!task.is_finished());

        drop(held);
        assert_eq!(task.await.unwrap(), b);
        assert_eq!(coordinator.depth(), 0);
    }

    #[tokio::test]
    async fn same_zone_waiters_are_admitted_together() {
        let coordinator = Arc::new(ZoneCoordinator::<()>::new());
        let a = zone("a");
        let b = zone("b");
        let c = zone("c");

        let held = coordinator.enter(&a, "a").await;

        let mut tasks = Vec::new();
        for z in [b.clone(), b.clone(), c.clone()] {
            let coordinator = coordinator.clone();
            tasks.push(tokio::spawn(async move {
                let guard = coordinator.enter(&z, "waiter").await;
                tokio::time::sleep(Duration::from_millis(20)).await;
                drop(guard);
            }));
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        drop(held);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(coordinator.current_zone(), Some(b));
        assert_eq!(coordinator.depth(), 2);
        assert_eq!(coordinator.waiting(), 1);

        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(coordinator.depth(), 0);
    }

    #[tokio::test]
    async fn cancelled_waiter_is_skipped() {
        let coordinator = Arc::new(ZoneCoordinator::<()>::new());
        let a = zone("a");
        let b = zone("b");

        let held = coordinator.enter(&a, "a").await;
        let waiting = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                let _guard = coordinator.enter(&b, "b").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        waiting.abort();
        let _ = waiting.await;

        drop(held);
        assert_eq!(coordinator.depth(), 0);
        assert_eq!(coordinator.current_zone(), None);

        let again = coordinator.enter(&zone("c"), "c").await;
        assert!(again.is_top_level());
    }

    #[tokio::test]
    async fn abandoned_top_level_discards_pending() {
        let coordinator = ZoneCoordinator::<Vec<u32>>::new();
        let z = zone("send");

        let guard = coordinator.enter(&z, "send").await;
        coordinator.with_pending(|pending| pending.push(7));
        drop(guard);

        assert!(coordinator.take_pending().is_empty());
    }

    #[tokio::test]
    async fn settled_guard_keeps_pending() {
        let coordinator = ZoneCoordinator::<Vec<u32>>::new();
        let z = zone("send");

        let mut guard = coordinator.enter(&z, "send").await;
        coordinator.with_pending(|pending| pending.push(7));
        guard.settle();
        drop(guard);

        assert_eq!(coordinator.take_pending(), vec![7]);
    }

    #[test]
    fn global_zone_batches_nothing() {
        assert!(GLOBAL_ZONE.is_global());
        assert!(!GLOBAL_ZONE.supports_pending_sessions());
        assert!(!GLOBAL_ZONE.supports_pending_unprocessed());
        assert_ne!(*GLOBAL_ZONE, zone("global"));
    }
}
