//! Store notifications.
//!
//! Handlers are plain callbacks invoked synchronously after the change they
//! describe has been applied. A [`Subscription`] unsubscribes when dropped.

#![allow(clippy::disallowed_types, reason = "Handler list only, never held across await")]

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};

use tracing::trace;

use crate::ids::ServiceId;

/// Kind of store notification, for subscribing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A peer identity key was replaced
    KeyChange,
    /// One-time pre-keys were consumed or deleted
    RemovePreKey,
    /// Every record was wiped
    RemoveAllData,
}

/// A store notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// A peer identity key was replaced.
    KeyChange {
        /// Peer whose key changed
        service_id: ServiceId,
        /// Operation that observed the change
        reason: &'static str,
    },
    /// One-time pre-keys of one of our identities were removed.
    RemovePreKey {
        /// Identity the pre-keys belonged to
        our_service_id: ServiceId,
    },
    /// Every record was wiped.
    RemoveAllData,
}

impl StoreEvent {
    /// Subscription kind of this event.
    pub fn kind(&self) -> EventKind {
        match self {
            Self::KeyChange { .. } => EventKind::KeyChange,
            Self::RemovePreKey { .. } => EventKind::RemovePreKey,
            Self::RemoveAllData => EventKind::RemoveAllData,
        }
    }
}

type Handler = Arc<dyn Fn(&StoreEvent) + Send + Sync>;

#[derive(Default)]
struct Handlers {
    next_id: u64,
    by_kind: HashMap<EventKind, Vec<(u64, Handler)>>,
}

type SharedHandlers = Arc<Mutex<Handlers>>;

fn lock(handlers: &Mutex<Handlers>) -> MutexGuard<'_, Handlers> {
    handlers.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Fan-out of store notifications to subscribed handlers.
#[derive(Clone, Default)]
pub struct EventBus {
    handlers: SharedHandlers,
}

impl EventBus {
    /// Bus with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Call `handler` for every event of `kind` until the subscription drops.
    #[must_use = "dropping the subscription unsubscribes immediately"]
    pub fn subscribe(
        &self,
        kind: EventKind,
        handler: impl Fn(&StoreEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let mut handlers = lock(&self.handlers);
        let id = handlers.next_id;
        handlers.next_id += 1;
        handlers.by_kind.entry(kind).or_default().push((id, Arc::new(handler)));

        Subscription { handlers: Arc::downgrade(&self.handlers), kind, id }
    }

    /// Deliver `event` to its subscribers.
    ///
    /// Handlers run outside the bus lock, so they may subscribe or emit.
    pub fn emit(&self, event: &StoreEvent) {
        let targets: Vec<Handler> = lock(&self.handlers)
            .by_kind
            .get(&event.kind())
            .map(|list| list.iter().map(|(_, handler)| handler.clone()).collect())
            .unwrap_or_default();

        trace!(kind = ?event.kind(), handlers = targets.len(), "emitting store event");
        for handler in targets {
            handler(event);
        }
    }

    /// Number of live subscriptions for `kind`.
    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        lock(&self.handlers).by_kind.get(&kind).map_or(0, Vec::len)
    }
}

/// Live subscription. Unsubscribes on drop.
pub struct Subscription {
    handlers: Weak<Mutex<Handlers>>,
    kind: EventKind,
    id: u64,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(handlers) = self.handlers.upgrade() else {
            return;
        };
        if let Some(list) = lock(&handlers).by_kind.get_mut(&self.kind) {
            list.retain(|(id, _)| *id != self.id);
        }
    }
}
