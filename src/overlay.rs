//! DirtyOverlay: the lock-guarded mutable mapping plus miss accounting.
//!
//! Lives inside the coordinator's mutex; every method here assumes the
//! lock is held.

use crate::entry::Entry;
use crate::snapshot::{EntryMap, ReadSnapshot};
use core::borrow::Borrow;
use core::hash::{BuildHasher, Hash};
use std::sync::Arc;

pub(crate) struct DirtyOverlay<K, V, S> {
    map: Option<EntryMap<K, V, S>>,
    misses: usize,
}

impl<K, V, S> DirtyOverlay<K, V, S>
where
    K: Eq + Hash + Clone,
    S: BuildHasher + Clone,
{
    pub(crate) fn new() -> Self {
        Self {
            map: None,
            misses: 0,
        }
    }

    #[cfg(test)]
    pub(crate) fn is_materialized(&self) -> bool {
        self.map.is_some()
    }

    #[cfg(test)]
    pub(crate) fn misses(&self) -> usize {
        self.misses
    }

    pub(crate) fn len(&self) -> usize {
        self.map.as_ref().map_or(0, |m| m.len())
    }

    pub(crate) fn get<Q>(&self, key: &Q) -> Option<&Arc<Entry<V>>>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.map.as_ref()?.get(key)
    }

    /// Physically unlink `key` from the overlay.
    pub(crate) fn remove<Q>(&mut self, key: &Q) -> Option<Arc<Entry<V>>>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.map.as_mut()?.remove(key)
    }

    /// Register `entry` under `key`, materializing the overlay from `read`
    /// first if it does not exist yet.
    pub(crate) fn insert(&mut self, read: &ReadSnapshot<K, V, S>, key: K, entry: Arc<Entry<V>>) {
        self.materialize(read).insert(key, entry);
    }

    /// Build the overlay from the live entries of `read` if it is absent.
    ///
    /// Soft-deleted entries are expunged and left out; this is the only
    /// place an entry becomes expunged.
    pub(crate) fn materialize(&mut self, read: &ReadSnapshot<K, V, S>) -> &mut EntryMap<K, V, S> {
        let read_len = read.len();
        self.map.get_or_insert_with(|| {
            let mut dirty =
                EntryMap::with_capacity_and_hasher(read_len, read.hasher().clone());
            let mut expunged = 0usize;
            for (k, e) in read.map.iter() {
                if e.try_expunge_locked() {
                    expunged += 1;
                } else {
                    dirty.insert(k.clone(), Arc::clone(e));
                }
            }
            tracing::trace!(
                snapshot_len = read_len,
                expunged,
                "materialized dirty overlay"
            );
            dirty
        })
    }

    /// Count one lookup that had to go through the overlay. Once the misses
    /// reach the overlay length the overlay is handed back for promotion and
    /// the counter resets.
    pub(crate) fn record_miss(&mut self) -> Option<EntryMap<K, V, S>> {
        self.misses += 1;
        if self.misses < self.len() {
            return None;
        }
        let misses = core::mem::take(&mut self.misses);
        let map = self.map.take()?;
        tracing::trace!(overlay_len = map.len(), misses, "promoting dirty overlay");
        Some(map)
    }

    /// Hand back the overlay regardless of the miss count.
    pub(crate) fn take(&mut self) -> Option<EntryMap<K, V, S>> {
        self.misses = 0;
        self.map.take()
    }
}
