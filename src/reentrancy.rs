//! Debug-only reentrancy guard for the overlay lock.
//!
//! User code runs while the overlay lock is held (`K: Hash/Eq/Clone`,
//! `V: PartialEq`). If that code calls back into the same map on the same
//! thread, the lock would deadlock. In debug builds the guard records the
//! owning thread and turns that deadlock into a panic. In release builds it
//! compiles to a zero-cost no-op.

use core::marker::PhantomData;
#[cfg(debug_assertions)]
use core::sync::atomic::{AtomicUsize, Ordering};

/// Identifies the calling thread by the address of a thread-local. Never 0.
#[cfg(debug_assertions)]
fn thread_token() -> usize {
    thread_local! {
        static TOKEN: u8 = const { 0 };
    }
    TOKEN.with(|t| t as *const u8 as usize)
}

/// Per-map lock owner tracker. Call [`DebugReentrancy::check`] before
/// acquiring the lock and [`DebugReentrancy::enter`] right after.
#[derive(Debug)]
pub(crate) struct DebugReentrancy {
    #[cfg(debug_assertions)]
    owner: AtomicUsize,
}

impl DebugReentrancy {
    pub(crate) const fn new() -> Self {
        Self {
            #[cfg(debug_assertions)]
            owner: AtomicUsize::new(0),
        }
    }

    /// Panics in debug builds if the calling thread already holds the lock.
    #[inline]
    pub(crate) fn check(&self) {
        #[cfg(debug_assertions)]
        {
            // Only the owner ever stores its own token, so a relaxed read is
            // enough to recognise ourselves.
            assert!(
                self.owner.load(Ordering::Relaxed) != thread_token(),
                "reentrancy detected: map re-entered while its lock is held"
            );
        }
    }

    /// Mark the calling thread as lock owner until the guard drops. Must be
    /// called with the lock held and dropped before it is released.
    #[inline]
    pub(crate) fn enter(&self) -> ReentrancyGuard<'_> {
        #[cfg(debug_assertions)]
        {
            self.owner.store(thread_token(), Ordering::Relaxed);
            return ReentrancyGuard {
                owner: self,
                _lt: PhantomData,
            };
        }

        #[cfg(not(debug_assertions))]
        {
            return ReentrancyGuard { _lt: PhantomData };
        }
    }
}

impl Default for DebugReentrancy {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard returned by `DebugReentrancy::enter`.
pub(crate) struct ReentrancyGuard<'a> {
    #[cfg(debug_assertions)]
    owner: &'a DebugReentrancy,
    _lt: PhantomData<&'a ()>,
}

impl Drop for ReentrancyGuard<'_> {
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        {
            debug_assert_eq!(self.owner.owner.load(Ordering::Relaxed), thread_token());
            self.owner.owner.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::DebugReentrancy;

    #[test]
    fn enter_and_exit_is_ok() {
        let r = DebugReentrancy::new();
        r.check();
        let g = r.enter();
        drop(g);
        // Released: the same thread may enter again.
        r.check();
        let _g = r.enter();
    }

    #[cfg(debug_assertions)]
    #[test]
    fn reentrancy_panics_in_debug() {
        let r = DebugReentrancy::new();
        let res = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _g1 = r.enter();
            // Checking again from the owning thread should panic.
            r.check();
        }));
        assert!(res.is_err(), "expected reentrancy to panic in debug builds");
    }

    #[cfg(debug_assertions)]
    #[test]
    fn other_threads_are_not_flagged() {
        let r = DebugReentrancy::new();
        let _g = r.enter();
        std::thread::scope(|s| {
            s.spawn(|| r.check()).join().unwrap();
        });
    }

    #[cfg(not(debug_assertions))]
    #[test]
    fn reentrancy_noop_in_release() {
        let r = DebugReentrancy::new();
        let _g1 = r.enter();
        r.check();
        let _g2 = r.enter();
    }
}
