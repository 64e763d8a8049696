//! Asynchronous read/update coordinator.
//!
//! `Aru` lets many threads submit `UPDATE` and `READ` closures against some
//! data structure they share out-of-band, and has the submitting threads
//! themselves execute those closures — under a single-writer/multi-reader
//! discipline — with no dedicated worker thread and no user-visible lock.
//!
//! ```
//! use std::sync::atomic::{AtomicI64, Ordering};
//! use std::sync::Arc;
//!
//! use aru::Aru;
//!
//! let counter = Arc::new(AtomicI64::new(0));
//! let coordinator = Arc::new(Aru::new());
//!
//! let c = counter.clone();
//! coordinator.update(move || {
//!     c.fetch_add(1, Ordering::Relaxed);
//! });
//!
//! let c = counter.clone();
//! coordinator.read(move || {
//!     assert_eq!(c.load(Ordering::Relaxed), 1);
//! });
//! ```
//!
//! The crate is split into:
//! - [`node`]: one submitted operation and its single-shot execution claim.
//! - [`tail_version`]: reclamation epochs and the cascading free algorithm.
//! - [`coordinator`]: the lock-free submission list and drain protocol.
//!
//! Reclamation grace periods are provided by the sibling `atomsnap` crate,
//! itself a thin wrapper over `crossbeam-epoch`.

mod coordinator;
mod node;
mod tail_version;

pub use coordinator::Aru;
pub use node::{DONE, PENDING};
