//! Record hydration cache.
//!
//! Every cached row is either still raw (as read from storage) or hydrated
//! into its live object. Hydration happens at most once per entry; later
//! reads hand out clones of the live object without decoding again.

use std::collections::HashMap;

use crate::StoreError;

/// A cached row, raw or hydrated.
#[derive(Debug, Clone)]
pub enum CacheEntry<R, L> {
    /// Row as persisted, not yet decoded
    Raw(R),
    /// Row with its decoded live object
    Hydrated {
        /// Row as persisted
        raw: R,
        /// Decoded object
        live: L,
    },
}

impl<R, L> CacheEntry<R, L> {
    /// Persisted row.
    pub fn raw(&self) -> &R {
        match self {
            Self::Raw(raw) | Self::Hydrated { raw, .. } => raw,
        }
    }

    /// Live object, if already hydrated.
    pub fn live(&self) -> Option<&L> {
        match self {
            Self::Raw(_) => None,
            Self::Hydrated { live, .. } => Some(live),
        }
    }
}

/// Decoding of a persisted row into its live object.
pub trait Hydrate: Sized {
    /// Persisted row type
    type Raw;

    /// Decode `raw`.
    fn hydrate(raw: &Self::Raw) -> Result<Self, StoreError>;
}

/// In-memory cache of one record type, keyed by row id.
#[derive(Debug)]
pub struct RecordCache<R, L> {
    entries: HashMap<String, CacheEntry<R, L>>,
}

impl<R, L> Default for RecordCache<R, L> {
    fn default() -> Self {
        Self { entries: HashMap::new() }
    }
}

impl<R: Clone, L: Clone> RecordCache<R, L> {
    /// Cache from raw rows.
    pub fn from_raw(rows: impl IntoIterator<Item = (String, R)>) -> Self {
        Self { entries: rows.into_iter().map(|(id, raw)| (id, CacheEntry::Raw(raw))).collect() }
    }

    /// Entry for `id`.
    pub fn entry(&self, id: &str) -> Option<&CacheEntry<R, L>> {
        self.entries.get(id)
    }

    /// Whether `id` is cached.
    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Cache a row with its live object, replacing any entry.
    pub fn insert_hydrated(&mut self, id: String, raw: R, live: L) {
        self.entries.insert(id, CacheEntry::Hydrated { raw, live });
    }

    /// Attach a live object to a raw entry.
    ///
    /// Entries that were replaced or hydrated in the meantime are left alone.
    pub fn promote(&mut self, id: &str, live: L) {
        if let Some(entry) = self.entries.get_mut(id)
            && let CacheEntry::Raw(raw) = entry
        {
            *entry = CacheEntry::Hydrated { raw: raw.clone(), live };
        }
    }

    /// Drop the entry for `id`.
    pub fn remove(&mut self, id: &str) -> Option<CacheEntry<R, L>> {
        self.entries.remove(id)
    }

    /// Drop entries whose raw row matches `predicate`.
    pub fn remove_where(&mut self, mut predicate: impl FnMut(&R) -> bool) -> Vec<String> {
        let ids: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| predicate(entry.raw()))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &ids {
            self.entries.remove(id);
        }
        ids
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of cached rows.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All entries.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &CacheEntry<R, L>)> {
        self.entries.iter()
    }
}

impl<R: Clone, L: Clone + Hydrate<Raw = R>> RecordCache<R, L> {
    /// Live object for `id`, hydrating a raw entry in place.
    pub fn get(&mut self, id: &str) -> Result<Option<L>, StoreError> {
        let Some(entry) = self.entries.get_mut(id) else {
            return Ok(None);
        };

        match entry {
            CacheEntry::Hydrated { live, .. } => Ok(Some(live.clone())),
            CacheEntry::Raw(raw) => {
                let live = L::hydrate(raw)?;
                *entry = CacheEntry::Hydrated { raw: raw.clone(), live: live.clone() };
                Ok(Some(live))
            },
        }
    }
}
