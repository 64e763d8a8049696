//! A versioned-snapshot gate: a single slot holding "the current version" of
//! some value, where readers may *acquire* a pinned reference to whatever
//! version is current at that instant, and a writer may *exchange* the
//! current version for a new one without ever blocking a reader.
//!
//! The previous version is not freed the instant it is replaced: it is kept
//! alive until every reference acquired before the exchange has been
//! released, i.e. until the end of its grace period. `Gate<T>` realises this
//! contract as a thin, typed wrapper over [`crossbeam_epoch`], rather than as
//! a hand-rolled reference-counted scheme — a naive "load pointer, then
//! increment a refcount embedded in it" gate has a use-after-free hazard
//! between the load and the increment if the writer retires the version
//! exactly in that window. Epoch-based reclamation closes that hole without
//! requiring a double-width atomic CAS.
use std::ops::Deref;

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned};
use std::sync::atomic::Ordering;

/// A single versioned slot.
///
/// `T` is reclaimed (dropped) once its grace period elapses, so any cleanup
/// a version needs to perform on retirement belongs in `T`'s own [`Drop`]
/// impl — `Gate` itself never inspects or calls into `T` beyond that. The
/// version still installed when the `Gate` itself is dropped is freed
/// synchronously at that point, same as any other owning container.
pub struct Gate<T> {
    current: Atomic<T>,
}

impl<T> Gate<T> {
    /// Creates a gate with no version installed yet.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            current: Atomic::null(),
        }
    }

    /// Creates a gate with `initial` already installed.
    #[must_use]
    pub fn new(initial: T) -> Self {
        Self {
            current: Atomic::new(initial),
        }
    }
}

impl<T: Send + 'static> Gate<T> {
    /// Installs `new` as the current version, retiring whatever version was
    /// previously current (if any).
    ///
    /// The retired version is not dropped synchronously: it is handed to the
    /// epoch collector, which drops it once every guard that could have
    /// observed it has been released. Works equally whether a version was
    /// already installed (ordinary replacement) or not (first-time install).
    #[tracing::instrument(level = "trace", skip_all)]
    pub fn exchange(&self, new: T) {
        let guard = epoch::pin();
        let new = Owned::new(new).into_shared(&guard);
        let old = self.current.swap(new, Ordering::AcqRel, &guard);
        if !old.is_null() {
            // Safety: `old` was just unlinked by the swap above, so this is
            // the only `exchange` call that can ever retire it.
            unsafe {
                guard.defer_destroy(old);
            }
        }
    }

    /// Pins and returns the currently installed version, or `None` if the
    /// gate is still empty.
    #[tracing::instrument(level = "trace", skip_all)]
    pub fn acquire(&self) -> Option<Acquired<T>> {
        let guard = epoch::pin();
        let shared = self.current.load(Ordering::Acquire, &guard);
        if shared.is_null() {
            return None;
        }
        // Safety: the pointer was just loaded from `self.current` under this
        // `guard`'s pin, so it cannot be reclaimed before `guard` is dropped.
        let ptr = shared.as_raw();
        Some(Acquired { _guard: guard, ptr })
    }
}

impl<T> Default for Gate<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T> Drop for Gate<T> {
    fn drop(&mut self) {
        let guard = epoch::pin();
        let shared = self.current.load(Ordering::Acquire, &guard);
        if !shared.is_null() {
            // Safety: `&mut self` guarantees no concurrent `acquire`/
            // `exchange` can observe this version; it is safe to drop it
            // immediately rather than deferring to the epoch collector.
            unsafe {
                drop(shared.into_owned());
            }
        }
    }
}

/// A pinned reference to the version that was current at the moment of
/// [`Gate::acquire`]. Dropping it unpins; the referenced version remains
/// valid for at least as long as this value is alive.
pub struct Acquired<T> {
    _guard: Guard,
    ptr: *const T,
}

impl<T> Deref for Acquired<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: `_guard` keeps the epoch pinned for the lifetime of this
        // value, and `ptr` was obtained from a version installed before that
        // pin, so it cannot have been reclaimed yet.
        unsafe { &*self.ptr }
    }
}

// `Acquired` deliberately does not implement `Send`/`Sync`: it carries a
// `crossbeam_epoch::Guard`, which is itself pinned to the thread that
// created it and must be unpinned on that same thread.

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AtOrdering};
    use std::sync::Arc;

    #[test]
    fn acquire_on_empty_gate_is_none() {
        let gate: Gate<u32> = Gate::empty();
        assert!(gate.acquire().is_none());
    }

    #[test]
    fn exchange_then_acquire_sees_new_value() {
        let gate = Gate::new(1_u32);
        assert_eq!(*gate.acquire().unwrap(), 1);
        gate.exchange(2);
        assert_eq!(*gate.acquire().unwrap(), 2);
    }

    #[test]
    fn retired_version_is_eventually_dropped() {
        tracing_subscriber::fmt::init();

        struct DropCounter(Arc<AtomicUsize>);
        impl Drop for DropCounter {
            fn drop(&mut self) {
                self.0.fetch_add(1, AtOrdering::SeqCst);
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));
        let gate = Gate::new(DropCounter(drops.clone()));
        for _ in 0..64 {
            gate.exchange(DropCounter(drops.clone()));
        }
        drop(gate);

        // Force the epoch collector to run down pending garbage.
        for _ in 0..16 {
            let guard = epoch::pin();
            guard.flush();
            drop(guard);
        }
        assert_eq!(drops.load(AtOrdering::SeqCst), 65);
    }
}
