use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU8, Ordering};
use std::sync::Arc;

/// A node's tag is `PENDING` until the node's task has finished running, at
/// which point it becomes `DONE` and never changes again.
pub const PENDING: u8 = 0;
pub const DONE: u8 = 1;

/// Whether a node depends on every prior node, or only on prior updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Update,
    Read,
}

type Task = dyn FnOnce() + Send + 'static;

/// One submitted operation, linked into the coordinator's submission list.
///
/// `prev`/`next` are written exactly once each (by the inserting thread and
/// by its immediate successor, respectively) and read many times by
/// traversers; `task` is taken and invoked exactly once, by whichever thread
/// wins the `claimed` compare-exchange.
pub struct Node {
    task: UnsafeCell<Option<Box<Task>>>,
    kind: Kind,
    tag: AtomicU8,
    status: Option<Arc<AtomicU8>>,
    claimed: AtomicBool,
    prev: AtomicPtr<Node>,
    next: AtomicPtr<Node>,
}

// Safety: `task` is only ever accessed by the single thread that wins the
// `claimed` compare-exchange, which happens at most once per node.
unsafe impl Send for Node {}
unsafe impl Sync for Node {}

impl Node {
    pub(crate) fn new(
        kind: Kind,
        status: Option<Arc<AtomicU8>>,
        task: Box<Task>,
    ) -> Self {
        Self {
            task: UnsafeCell::new(Some(task)),
            kind,
            tag: AtomicU8::new(PENDING),
            status,
            claimed: AtomicBool::new(false),
            prev: AtomicPtr::new(ptr::null_mut()),
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }

    pub(crate) fn into_raw(self: Box<Self>) -> *mut Node {
        Box::into_raw(self)
    }

    pub(crate) fn kind(&self) -> Kind {
        self.kind
    }

    pub(crate) fn is_done(&self) -> bool {
        self.tag.load(Ordering::Acquire) == DONE
    }

    pub(crate) fn next_raw(&self) -> *mut Node {
        self.next.load(Ordering::Acquire)
    }

    pub(crate) fn set_next_raw(&self, next: *mut Node) {
        self.next.store(next, Ordering::Release);
    }

    pub(crate) fn prev_raw(&self) -> *mut Node {
        self.prev.load(Ordering::Acquire)
    }

    pub(crate) fn set_prev_raw(&self, prev: *mut Node) {
        self.prev.store(prev, Ordering::Release);
    }

    /// Attempts to claim this node for execution. Returns `true` iff this
    /// call won the claim (and therefore must have run `task`, exactly
    /// once).
    fn try_claim(&self) -> bool {
        self.claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Runs this node's task if it is not already claimed, then marks the
    /// node `DONE`. No-op (beyond the claim attempt) if another thread has
    /// already claimed it.
    pub(crate) fn execute(&self) {
        if !self.try_claim() {
            return;
        }

        // Safety: `try_claim` just succeeded, so this is the unique thread
        // permitted to touch `task` for this node, and it will do so exactly
        // once.
        let task = unsafe { (*self.task.get()).take() };
        if let Some(task) = task {
            task();
        }

        self.tag.store(DONE, Ordering::Release);
        if let Some(status) = &self.status {
            status.store(DONE, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn executes_task_exactly_once_across_contenders() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let node = Node::new(
            Kind::Update,
            None,
            Box::new(move || {
                calls2.fetch_add(1, Ordering::SeqCst);
            }),
        );

        node.execute();
        node.execute();
        node.execute();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(node.is_done());
    }

    #[test]
    fn status_mirrors_tag_after_execute() {
        let status = Arc::new(AtomicU8::new(PENDING));
        let node = Node::new(Kind::Read, Some(status.clone()), Box::new(|| {}));
        node.execute();
        assert_eq!(status.load(Ordering::SeqCst), DONE);
    }

    #[test]
    fn concurrent_contenders_run_task_exactly_once() {
        use std::sync::Barrier;

        for _ in 0..200 {
            let calls = Arc::new(AtomicUsize::new(0));
            let calls2 = calls.clone();
            let node = Arc::new(Node::new(
                Kind::Update,
                None,
                Box::new(move || {
                    calls2.fetch_add(1, Ordering::SeqCst);
                }),
            ));
            let barrier = Arc::new(Barrier::new(4));

            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let node = node.clone();
                    let barrier = barrier.clone();
                    std::thread::spawn(move || {
                        barrier.wait();
                        node.execute();
                    })
                })
                .collect();
            for h in handles {
                h.join().unwrap();
            }

            assert_eq!(calls.load(Ordering::SeqCst), 1);
        }
    }
}
