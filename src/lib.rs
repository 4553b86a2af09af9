//! sync-hashmap: a concurrent map for read-mostly workloads where reads and
//! updates of existing keys never take a lock.
//!
//! Internal Design:
//!
//! Summary
//! - Goal: serve many parallel readers of a mostly stable key set without
//!   funnelling them through one lock, while keeping every operation on a
//!   single key linearizable.
//! - Layers:
//!   - Entry<V>: per-key atomic slot with a three-state lifecycle
//!     (live / soft-deleted / expunged). All value updates of a key that is
//!     already known happen here with compare-and-swap, no lock.
//!   - ReadSnapshot<K, V, S>: immutable key -> entry mapping plus an
//!     `amended` flag, published through an `ArcSwap`. Readers load it
//!     without locking; it is only ever replaced, never mutated.
//!   - DirtyOverlay<K, V, S>: mutable key -> entry mapping behind a mutex,
//!     plus a miss counter. Holds every live key whenever the snapshot is
//!     amended.
//!   - SyncHashMap<K, V, S>: public API; coordinates the snapshot swap,
//!     overlay materialization and promotion.
//!
//! Data flow
//! - Reads consult the snapshot. Only a miss on an amended snapshot takes
//!   the lock, looks in the overlay and counts a miss.
//! - Writes to a key present in the snapshot CAS its entry directly. New
//!   keys, and keys whose entry was expunged, go through the overlay under
//!   the lock.
//! - Once misses reach the overlay length, the overlay is promoted: it
//!   becomes the new snapshot (`amended = false`) and is discarded. `range`
//!   promotes unconditionally.
//!
//! Entry states
//! - Soft-deleted: removed, but the overlay (if any) holds this same entry,
//!   so storing into it again needs no lock.
//! - Expunged: removed while an overlay exists that leaves it out. Produced
//!   only when the overlay is materialized. A lock holder must flip it back
//!   to soft-deleted and re-register it in the overlay before storing.
//!
//! Constraints
//! - `K: Eq + Hash + Clone`: keys are cloned into a freshly materialized
//!   overlay. `V: Clone` where values are handed back; wrap large values in
//!   `Arc`.
//! - The lock guards only short, bounded critical sections. User code that
//!   runs under it is limited to `K: Hash/Eq/Clone` and `V: PartialEq`.
//!   `V: Clone` runs before the lock is taken or after it is released, and
//!   values replaced by a lock holder are dropped after it is released.
//! - Reentrancy: re-entering the same map from code running under its lock
//!   panics in debug builds (see `reentrancy`) instead of deadlocking.
//!
//! Notes and non-goals
//! - No ordered iteration, range queries, eviction or multi-key
//!   transactions. `range` is weakly consistent: it may or may not observe
//!   writes that race with it.
//! - No `len()`: counting live entries would need the same walk as `range`.

mod entry;
mod overlay;
mod reentrancy;
mod snapshot;
mod sync_hash_map;
mod sync_hash_map_proptest;

// Public surface
pub use sync_hash_map::{InsertError, SyncHashMap};
