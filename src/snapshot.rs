//! ReadSnapshot: the immutable mapping consulted by lock-free readers.

use crate::entry::Entry;
use core::borrow::Borrow;
use core::hash::{BuildHasher, Hash};
use hashbrown::HashMap;
use std::sync::Arc;

/// Key to shared entry handle. Both the snapshot and the overlay use this
/// shape so promotion is a move, not a copy.
pub(crate) type EntryMap<K, V, S> = HashMap<K, Arc<Entry<V>>, S>;

/// Published wholesale through an atomic pointer and never mutated after.
pub(crate) struct ReadSnapshot<K, V, S> {
    pub(crate) map: Arc<EntryMap<K, V, S>>,
    /// True when the overlay holds a key this snapshot lacks.
    pub(crate) amended: bool,
}

impl<K, V, S> ReadSnapshot<K, V, S>
where
    K: Eq + Hash,
    S: BuildHasher,
{
    pub(crate) fn empty(hasher: S) -> Self {
        Self {
            map: Arc::new(HashMap::with_hasher(hasher)),
            amended: false,
        }
    }

    /// Snapshot made authoritative from a promoted overlay.
    pub(crate) fn promoted(map: EntryMap<K, V, S>) -> Self {
        Self {
            map: Arc::new(map),
            amended: false,
        }
    }

    /// Same mapping, flagged as missing keys the overlay holds.
    pub(crate) fn amend(&self) -> Self {
        Self {
            map: Arc::clone(&self.map),
            amended: true,
        }
    }

    #[inline]
    pub(crate) fn get<Q>(&self, key: &Q) -> Option<&Arc<Entry<V>>>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.map.get(key)
    }

    pub(crate) fn len(&self) -> usize {
        self.map.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub(crate) fn hasher(&self) -> &S {
        self.map.hasher()
    }
}
