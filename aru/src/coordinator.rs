use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU8, Ordering};
use std::sync::Arc;

use aru_spin::Backoff;
use aru_util::CachePadded;
use atomsnap::Gate;

use crate::node::{Kind, Node};
use crate::tail_version::{TailPtr, TailVersion};

/// Iteration count past which a bounded spin is treated as suspicious rather
/// than merely contended, and logged at `warn` (debug builds only) to aid
/// diagnosing a caller bug (a closure that panicked or never returned).
const STALL_WARN_ITERATIONS: u32 = 10_000;

fn warn_if_stalled(iterations: u32, site: &'static str) {
    if cfg!(debug_assertions) && iterations == STALL_WARN_ITERATIONS {
        tracing::warn!(site, iterations, "bounded spin has not resolved after a generous iteration budget");
    }
}

/// The coordinator: a lock-free submission list plus the reader/writer
/// execution protocol described at the crate root.
///
/// Every caller thread both submits and drains: there is no background
/// worker. `Aru` is cheap to share (`Arc<Aru>` or a plain `&Aru` behind some
/// longer-lived owner) across the threads that submit work to it.
///
/// `head` and `tail_move_flag` are each hammered by every submitting thread
/// on every call; `CachePadded` keeps them off the same cache line as the
/// rest of the struct (and each other) to avoid false sharing.
pub struct Aru {
    head: CachePadded<AtomicPtr<Node>>,
    tail: Gate<TailPtr>,
    tail_move_flag: CachePadded<AtomicBool>,
    tail_init_flag: AtomicBool,
}

impl Aru {
    /// Creates an empty coordinator.
    #[must_use]
    pub fn new() -> Self {
        Self {
            head: CachePadded::from(AtomicPtr::new(ptr::null_mut())),
            tail: Gate::empty(),
            tail_move_flag: CachePadded::from(AtomicBool::new(false)),
            tail_init_flag: AtomicBool::new(false),
        }
    }

    /// Submits an `UPDATE`: `task` will run only once every operation
    /// submitted before it has completed, and no other `UPDATE` runs
    /// concurrently with it.
    pub fn update<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(Kind::Update, None, Box::new(task));
    }

    /// Like [`Self::update`], additionally mirroring completion into
    /// `status` (stored `DONE` after the node's own tag is).
    pub fn update_with_status<F>(&self, status: Arc<AtomicU8>, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(Kind::Update, Some(status), Box::new(task));
    }

    /// Submits a `READ`: `task` will run only once every `UPDATE` submitted
    /// before it has completed; it may run concurrently with other `READ`s.
    pub fn read<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(Kind::Read, None, Box::new(task));
    }

    /// Like [`Self::read`], additionally mirroring completion into `status`.
    pub fn read_with_status<F>(&self, status: Arc<AtomicU8>, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(Kind::Read, Some(status), Box::new(task));
    }

    /// Cooperatively drains pending work without submitting anything of its
    /// own. Useful when a caller is waiting on some other thread's pending
    /// operation and wants to help it along.
    #[tracing::instrument(level = "trace", skip_all)]
    pub fn sync(&self) {
        if self.head.load(Ordering::Acquire).is_null() {
            return;
        }

        let acquired_mover = self.try_acquire_mover();
        if let Some(tail_ptr) = self.tail.acquire() {
            self.drain_from(&tail_ptr, None, acquired_mover);
        }
        if acquired_mover {
            self.tail_move_flag.store(false, Ordering::Release);
        }
    }

    fn try_acquire_mover(&self) -> bool {
        !self.tail_move_flag.fetch_or(true, Ordering::AcqRel)
    }

    #[tracing::instrument(level = "trace", skip_all, fields(kind = ?kind))]
    fn submit(
        &self,
        kind: Kind,
        status: Option<Arc<AtomicU8>>,
        task: Box<dyn FnOnce() + Send + 'static>,
    ) {
        let node = Box::new(Node::new(kind, status, task)).into_raw();
        self.insert_node_and_execute(node);
    }

    fn insert_node_and_execute(&self, node: *mut Node) {
        let acquired_mover = self.try_acquire_mover();
        // Ensures this thread cannot miss a tail movement that a concurrent
        // mover is about to perform, and vice versa.
        std::sync::atomic::fence(Ordering::SeqCst);

        let old_head = self.head.swap(node, Ordering::AcqRel);

        if old_head.is_null() {
            let version_ptr = TailVersion::alloc(node, ptr::null_mut());
            self.tail.exchange(TailPtr(version_ptr));
            self.tail_init_flag.store(true, Ordering::Release);
        } else {
            // Safety: `old_head` was just unlinked from `self.head` by the
            // swap above, so this call is the only one permitted to write
            // its `next` link.
            unsafe {
                (*old_head).set_next_raw(node);
                (*node).set_prev_raw(old_head);
            }

            let mut backoff = Backoff::new();
            let mut iterations: u32 = 0;
            while !self.tail_init_flag.load(Ordering::Acquire) {
                backoff.spin();
                iterations = iterations.saturating_add(1);
                warn_if_stalled(iterations, "insert_node_and_execute: waiting for tail_init_flag");
            }
        }

        if let Some(tail_ptr) = self.tail.acquire() {
            self.drain_from(&tail_ptr, Some(node), acquired_mover);
        }

        if acquired_mover {
            self.tail_move_flag.store(false, Ordering::Release);
        }
    }

    /// Walks from `tail_ptr`'s tail node forward, executing every runnable
    /// node, and — if `can_move_tail` — installs a new tail version once the
    /// walk stalls.
    ///
    /// `own_node` is the node this call itself inserted (`None` for
    /// [`Self::sync`], which inserts nothing): once the walk reaches it, a
    /// `null` successor is a definitive stop rather than a transient
    /// in-flight link, since nothing obliges a *later* producer's link to
    /// exist yet.
    fn drain_from(&self, tail_ptr: &TailPtr, own_node: Option<*mut Node>, can_move_tail: bool) {
        // Safety: `tail_ptr` was returned by `self.tail.acquire()`, which
        // pins the epoch for the lifetime of that guard (held by our
        // caller); the referenced version cannot be reclaimed before then.
        let version = unsafe { &*tail_ptr.0 };
        let tail_node = version.tail_node();

        let mut cursor = tail_node;
        let mut last_processed = tail_node;
        let mut made_progress = false;

        loop {
            // Safety: `cursor` lies within the range pinned by `tail_ptr`,
            // or was reached via a `next` link written by a producer whose
            // submission has already completed.
            let node = unsafe { &*cursor };

            if !self.dependencies_satisfied(tail_node, cursor, node.kind()) {
                break;
            }

            node.execute();
            last_processed = cursor;
            made_progress = true;

            let next = self.advance(node, cursor, own_node);
            match next {
                Some(next) => cursor = next,
                None => break,
            }
        }

        if can_move_tail && made_progress && last_processed != tail_node {
            self.adjust_tail(version, tail_ptr, last_processed);
        }
    }

    /// Resolves the successor of `node` (at `cursor`), bounded-spinning on a
    /// transient `null` link only while `cursor` has not yet reached the
    /// caller's own inserted node.
    fn advance(&self, node: &Node, cursor: *mut Node, own_node: Option<*mut Node>) -> Option<*mut Node> {
        let mut next = node.next_raw();
        if !next.is_null() {
            return Some(next);
        }

        let still_before_own = matches!(own_node, Some(own) if own != cursor);
        if !still_before_own {
            return None;
        }

        let mut backoff = Backoff::new();
        let mut iterations: u32 = 0;
        while next.is_null() {
            backoff.spin();
            next = node.next_raw();
            iterations = iterations.saturating_add(1);
            warn_if_stalled(iterations, "advance: waiting for next link");
        }
        Some(next)
    }

    /// Checks whether every node `cursor` depends on (per `kind`) has
    /// completed, walking backward from `cursor` through `tail_node`
    /// inclusive.
    fn dependencies_satisfied(&self, tail_node: *mut Node, cursor: *mut Node, kind: Kind) -> bool {
        if cursor == tail_node {
            return true;
        }

        // Safety: `cursor` is live (see `drain_from`); its `prev` chain back
        // to `tail_node` consists of nodes still within the pinned range.
        let mut predecessor = unsafe { (*cursor).prev_raw() };
        loop {
            if predecessor.is_null() {
                // Walked off the front of the pinned range; treat as
                // satisfied rather than spin — this can only happen if the
                // range has already been fully processed by another caller.
                return true;
            }
            // Safety: see above.
            let node = unsafe { &*predecessor };
            let relevant = match kind {
                Kind::Update => true,
                Kind::Read => node.kind() == Kind::Update,
            };
            if relevant && !node.is_done() {
                return false;
            }
            if predecessor == tail_node {
                return true;
            }
            predecessor = node.prev_raw();
        }
    }

    /// Installs a new tail version rooted at `new_tail_node`, retiring
    /// `old_version` (pinned via `old_tail_ptr`).
    fn adjust_tail(&self, old_version: &TailVersion, old_tail_ptr: &TailPtr, new_tail_node: *mut Node) {
        let new_version_ptr = TailVersion::alloc(new_tail_node, old_tail_ptr.0);
        self.tail.exchange(TailPtr(new_version_ptr));

        // Safety: `new_tail_node` was reached via `prev` links from a live
        // node, so it and its predecessor are both still valid.
        let old_head_node = unsafe { (*new_tail_node).prev_raw() };
        old_version.set_next(new_version_ptr);
        old_version.set_head_node(old_head_node);
    }
}

impl Default for Aru {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Aru {
    fn drop(&mut self) {
        let Some(tail_ptr) = self.tail.acquire() else {
            return;
        };
        // Safety: `&mut self` guarantees no concurrent submissions or
        // drains; this is the only remaining reference to the chain.
        let version = unsafe { &*tail_ptr.0 };
        let real_head = self.head.load(Ordering::Acquire);

        #[cfg(debug_assertions)]
        {
            let mut cursor = version.tail_node();
            loop {
                // Safety: see above.
                let node = unsafe { &*cursor };
                assert!(
                    node.is_done(),
                    "Aru dropped while an operation was still PENDING; quiesce before dropping"
                );
                if cursor == real_head {
                    break;
                }
                let next = node.next_raw();
                assert!(!next.is_null(), "Aru dropped mid-submission");
                cursor = next;
            }
        }

        if !real_head.is_null() {
            // Extends the still-current version's range to cover every
            // remaining live node, so dropping `self.tail` below frees the
            // whole chain through the ordinary retirement path.
            version.set_head_node(real_head);
        }
    }
}

