use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crate::node::Node;

const RELEASED_BIT: usize = 0b1;

fn encode(ptr: *mut TailVersion, released: bool) -> usize {
    (ptr as usize) | if released { RELEASED_BIT } else { 0 }
}

fn decode(bits: usize) -> (*mut TailVersion, bool) {
    (
        (bits & !RELEASED_BIT) as *mut TailVersion,
        bits & RELEASED_BIT != 0,
    )
}

/// A reclamation epoch: a contiguous, closed range `[tail_node, head_node]`
/// of retired nodes, linked to the epoch that preceded it and the one that
/// superseded it.
///
/// `TailVersion`s are allocated and freed explicitly by this module, never
/// handed to the epoch collector directly — see [`TailPtr`] for the value
/// that actually rides in the `atomsnap` gate.
pub(crate) struct TailVersion {
    tail_node: *mut Node,
    head_node: AtomicPtr<Node>,
    /// Tagged: pointer to the preceding version, with the low bit marking
    /// whether this version has been retired (superseded and grace-elapsed).
    prev: AtomicUsize,
    next: AtomicPtr<TailVersion>,
}

// Safety: every field is either an atomic, or a raw pointer only ever
// dereferenced while the reclamation protocol below guarantees uniqueness.
unsafe impl Send for TailVersion {}
unsafe impl Sync for TailVersion {}

impl TailVersion {
    /// Allocates a new version covering `[tail_node, tail_node]` initially,
    /// linked back to `prev` (which may be null for the very first version).
    pub(crate) fn alloc(tail_node: *mut Node, prev: *mut TailVersion) -> *mut TailVersion {
        Box::into_raw(Box::new(Self {
            tail_node,
            head_node: AtomicPtr::new(tail_node),
            prev: AtomicUsize::new(encode(prev, false)),
            next: AtomicPtr::new(ptr::null_mut()),
        }))
    }

    pub(crate) fn tail_node(&self) -> *mut Node {
        self.tail_node
    }

    pub(crate) fn head_node(&self) -> *mut Node {
        self.head_node.load(Ordering::Acquire)
    }

    pub(crate) fn set_head_node(&self, head: *mut Node) {
        self.head_node.store(head, Ordering::Release);
    }

    pub(crate) fn set_next(&self, next: *mut TailVersion) {
        self.next.store(next, Ordering::Release);
    }
}

/// The value actually installed in the `atomsnap` gate: a handle to a
/// [`TailVersion`] that, once its own grace period elapses (i.e. once this
/// value's `Drop` runs), triggers the cascading release of that version's
/// node range — and, transitively, of any already-retired successor ranges
/// left waiting on it.
pub(crate) struct TailPtr(pub(crate) *mut TailVersion);

// Safety: see `TailVersion` above; `TailPtr` only ever moves the pointer
// between threads, it never aliases the pointee concurrently with mutation.
unsafe impl Send for TailPtr {}
unsafe impl Sync for TailPtr {}

impl Drop for TailPtr {
    #[tracing::instrument(level = "trace", skip_all)]
    fn drop(&mut self) {
        if !self.0.is_null() {
            // Safety: this `TailPtr` is the unique handle to `self.0` that
            // the gate retired; the epoch collector guarantees this `Drop`
            // runs at most once for it.
            unsafe {
                release_or_cascade(self.0);
            }
        }
    }
}

/// Implements the cascading reclamation algorithm: mark `version` retired;
/// if an older version is still unreclaimed, stop and let its own cascade
/// reach us later. Otherwise free `version`'s node range and struct, then
/// walk forward through already-retired successors freeing each in turn,
/// stopping at (and handing off to) the first successor that has not yet
/// been retired itself.
unsafe fn release_or_cascade(version_ptr: *mut TailVersion) {
    // Safety: caller guarantees `version_ptr` is valid and not yet freed.
    let version = unsafe { &*version_ptr };
    let predecessor = loop {
        let old = version.prev.load(Ordering::Acquire);
        let (predecessor_ptr, already_released) = decode(old);
        debug_assert!(!already_released, "a tail version must be retired at most once");
        let new = encode(predecessor_ptr, true);
        if version
            .prev
            .compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            break predecessor_ptr;
        }
    };

    if !predecessor.is_null() {
        // The predecessor hasn't been reclaimed yet; its own cascade will
        // reach this version once it gets there.
        return;
    }

    let mut current_ptr = version_ptr;
    loop {
        // Safety: `current_ptr` has not been freed: either it is
        // `version_ptr` (still valid per the caller's guarantee) or it was
        // read from `next` just below before any freeing happened.
        let current = unsafe { &*current_ptr };
        // Safety: we just confirmed (via the bit protocol) that nothing
        // else can still observe this range.
        unsafe {
            free_range(current.tail_node, current.head_node.load(Ordering::Acquire));
        }
        let next_ptr = current.next.load(Ordering::Acquire);
        // Safety: `current_ptr` was allocated by `TailVersion::alloc` and is
        // uniquely owned at this point in the protocol.
        drop(unsafe { Box::from_raw(current_ptr) });

        if next_ptr.is_null() {
            return;
        }

        // Safety: `next_ptr` is the successor installed by `adjust_tail`
        // before being superseded; it has not been freed because only this
        // cascade (or its own, mutually exclusive via the bit below) frees
        // `TailVersion`s.
        let next_version = unsafe { &*next_ptr };
        let handed_off = loop {
            let old = next_version.prev.load(Ordering::Acquire);
            let (_, already_released) = decode(old);
            if already_released {
                break false;
            }
            let new = encode(ptr::null_mut(), false);
            match next_version
                .prev
                .compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break true,
                Err(_) => continue,
            }
        };

        if handed_off {
            return;
        }
        current_ptr = next_ptr;
    }
}

/// Frees every node in the inclusive range `[from, to]`.
///
/// # Safety
/// Every node in the range must be uniquely owned by the caller — not
/// reachable through any other live reference — at the moment this runs.
unsafe fn free_range(from: *mut Node, to: *mut Node) {
    let mut cursor = from;
    loop {
        // Safety: caller guarantees unique ownership of the whole range.
        let next = unsafe { (*cursor).next_raw() };
        let done = cursor == to;
        // Safety: `cursor` was allocated via `Box::new`/`Box::into_raw` when
        // the node was submitted, and is uniquely owned here.
        drop(unsafe { Box::from_raw(cursor) });
        if done {
            break;
        }
        cursor = next;
    }
}
