//! Entry: the per-key value slot shared by the read snapshot and the dirty
//! overlay.
//!
//! The slot is a single `ArcSwapOption<Slot<V>>` and encodes three states:
//! - `None`: soft-deleted. The key may be recreated in place because the
//!   overlay, if it exists, holds this same entry.
//! - `Some(Slot::Expunged)`: deleted while an overlay exists that does not
//!   hold this entry. Only a lock holder may bring it back, and it must
//!   re-register the entry in the overlay when it does.
//! - `Some(Slot::Value(v))`: live.
//!
//! Every lock-free operation is a load followed by a compare-and-swap
//! against the pointer it loaded. The guard keeps that allocation alive,
//! so a successful swap proves nothing was published in between.

use arc_swap::{ArcSwapOption, Guard};
use std::sync::Arc;

/// Contents of a non-deleted slot.
#[derive(Debug)]
pub(crate) enum Slot<V> {
    Expunged,
    Value(V),
}

impl<V> Slot<V> {
    #[inline]
    pub(crate) fn value(&self) -> Option<&V> {
        match self {
            Slot::Value(v) => Some(v),
            Slot::Expunged => None,
        }
    }

    #[inline]
    fn is_expunged(&self) -> bool {
        matches!(self, Slot::Expunged)
    }
}

/// Marker returned by the lock-free writers when the entry is expunged and
/// the caller has to take the locked path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Expunged;

type Current<V> = Guard<Option<Arc<Slot<V>>>>;

/// A slot taken out of an entry. Handed back so the caller picks where the
/// value it holds is released.
pub(crate) type Retired<V> = Option<Arc<Slot<V>>>;

#[inline]
fn same<V>(a: &Option<Arc<Slot<V>>>, b: &Option<Arc<Slot<V>>>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        _ => false,
    }
}

#[inline]
fn live<V>(cur: &Option<Arc<Slot<V>>>) -> Option<&V> {
    cur.as_deref().and_then(Slot::value)
}

pub(crate) struct Entry<V> {
    slot: ArcSwapOption<Slot<V>>,
}

impl<V> Entry<V> {
    /// New live entry holding an already prepared value slot.
    pub(crate) fn new(slot: Arc<Slot<V>>) -> Self {
        Self {
            slot: ArcSwapOption::new(Some(slot)),
        }
    }

    #[inline]
    fn current(&self) -> Current<V> {
        self.slot.load()
    }

    /// Publish `new` iff the slot still holds `cur`.
    #[inline]
    fn cas(&self, cur: &Current<V>, new: Option<Arc<Slot<V>>>) -> bool {
        let prev = self.slot.compare_and_swap(cur, new);
        same(&prev, cur)
    }

    /// Run `f` on the live value without cloning it.
    #[inline]
    pub(crate) fn with_value<R>(&self, f: impl FnOnce(&V) -> R) -> Option<R> {
        let cur = self.current();
        live(&cur).map(f)
    }

    pub(crate) fn is_live(&self) -> bool {
        self.with_value(|_| ()).is_some()
    }

    pub(crate) fn is_expunged(&self) -> bool {
        matches!(self.current().as_deref(), Some(Slot::Expunged))
    }

    /// Compare-and-delete: clear the slot iff it holds a value equal to `old`.
    pub(crate) fn try_compare_and_delete(&self, old: &V) -> bool
    where
        V: PartialEq,
    {
        loop {
            let cur = self.current();
            match live(&cur) {
                Some(v) if v == old => {}
                _ => return false,
            }
            if self.cas(&cur, None) {
                return true;
            }
        }
    }

    /// Remove a live value, leaving the entry soft-deleted.
    pub(crate) fn delete(&self) -> Option<V>
    where
        V: Clone,
    {
        loop {
            let cur = self.current();
            let v = live(&cur)?.clone();
            if self.cas(&cur, None) {
                return Some(v);
            }
        }
    }

    /// Publish `new` iff the entry is live and its value equals `old`.
    /// Intervening stores of an equal value do not fail it.
    ///
    /// Returns whether it applied together with the last slot observed,
    /// which is the replaced one on success. Lock holders release it after
    /// unlocking.
    pub(crate) fn try_compare_and_swap(&self, old: &V, new: &Arc<Slot<V>>) -> (bool, Retired<V>)
    where
        V: PartialEq,
    {
        loop {
            let cur = self.current();
            if !live(&cur).is_some_and(|v| v == old) {
                return (false, Guard::into_inner(cur));
            }
            if self.cas(&cur, Some(Arc::clone(new))) {
                return (true, Guard::into_inner(cur));
            }
        }
    }

    /// Load the live value or store a clone of `value` into a soft-deleted
    /// slot.
    ///
    /// Returns `Some(existing)` when loaded and `None` when `value` was
    /// stored. Fails with [`Expunged`] without touching the slot when the
    /// entry must first be re-registered under the lock.
    pub(crate) fn try_load_or_store(&self, value: &V) -> Result<Option<V>, Expunged>
    where
        V: Clone,
    {
        let mut new = None;
        loop {
            let cur = self.current();
            match cur.as_deref() {
                Some(Slot::Expunged) => return Err(Expunged),
                Some(Slot::Value(v)) => return Ok(Some(v.clone())),
                None => {}
            }
            let slot = new.get_or_insert_with(|| Arc::new(Slot::Value(value.clone())));
            if self.cas(&cur, Some(Arc::clone(slot))) {
                return Ok(None);
            }
        }
    }

    /// Load-or-store with the new slot prepared by the caller, for the
    /// locked path: nothing is cloned or dropped here.
    ///
    /// Returns the live slot when loaded and `None` when `new` was stored.
    pub(crate) fn try_load_or_store_slot(&self, new: &Arc<Slot<V>>) -> Result<Retired<V>, Expunged> {
        loop {
            let cur = self.current();
            match cur.as_deref().map(Slot::is_expunged) {
                Some(true) => return Err(Expunged),
                Some(false) => return Ok(Guard::into_inner(cur)),
                None => {}
            }
            if self.cas(&cur, Some(Arc::clone(new))) {
                return Ok(None);
            }
        }
    }

    /// Unconditionally store `new` unless the entry is expunged.
    ///
    /// Returns the replaced slot, `None` when the entry was soft-deleted.
    pub(crate) fn try_swap(&self, new: &Arc<Slot<V>>) -> Result<Retired<V>, Expunged> {
        loop {
            let cur = self.current();
            if cur.as_deref().is_some_and(Slot::is_expunged) {
                return Err(Expunged);
            }
            if self.cas(&cur, Some(Arc::clone(new))) {
                return Ok(Guard::into_inner(cur));
            }
        }
    }

    /// Flip an expunged entry back to soft-deleted. Returns whether it was
    /// expunged, in which case the caller must add it to the overlay.
    ///
    /// Caller holds the overlay lock.
    pub(crate) fn unexpunge_locked(&self) -> bool {
        let cur = self.current();
        if !cur.as_deref().is_some_and(Slot::is_expunged) {
            return false;
        }
        // Only lock holders write to an expunged slot.
        self.cas(&cur, None)
    }

    /// Store `new` without a compare loop. The entry must not be expunged.
    ///
    /// Returns the previous slot so the caller can release it after
    /// dropping the lock. Caller holds the overlay lock.
    pub(crate) fn swap_locked(&self, new: Arc<Slot<V>>) -> Retired<V> {
        debug_assert!(!self.is_expunged(), "swap_locked on an expunged entry");
        self.slot.swap(Some(new))
    }

    /// Mark a soft-deleted entry expunged. Returns whether the entry ends up
    /// expunged, i.e. whether it must be left out of a new overlay.
    ///
    /// Caller holds the overlay lock.
    pub(crate) fn try_expunge_locked(&self) -> bool {
        let mut cur = self.current();
        while cur.is_none() {
            if self.cas(&cur, Some(Arc::new(Slot::Expunged))) {
                return true;
            }
            cur = self.current();
        }
        cur.as_deref().is_some_and(Slot::is_expunged)
    }
}

impl<V: Clone> Entry<V> {
    pub(crate) fn load(&self) -> Option<V> {
        self.with_value(V::clone)
    }
}

impl<V: core::fmt::Debug> core::fmt::Debug for Entry<V> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.current().as_deref() {
            None => f.write_str("Deleted"),
            Some(Slot::Expunged) => f.write_str("Expunged"),
            Some(Slot::Value(v)) => f.debug_tuple("Value").field(v).finish(),
        }
    }
}
