//! Two flavors of worker-thread pool for compute-bound work.
//!
//! The [`SyncPool`] is a `parallel_for`-style barrier pool: a job describes
//! an integer range, `submit` fans the range out across the background
//! workers plus the calling thread, and returns once every element has been
//! processed. Partitioning is dynamic, with all participants stealing
//! stripes off a shared atomic cursor, so uneven per-element cost balances
//! itself out.
//!
//! The [`AsyncPool`] is a fire-and-forget queue: reference-counted jobs are
//! picked up by background workers in submission order, with an optional
//! bounded priority bypass. A single job handle may be submitted several
//! times to have several workers run it concurrently. Completion is
//! observed by waiting on one job or on the whole pool.
//!
//! Both pools sleep through a compact futex-backed counter
//! ([`sync::WaitEvent`]) after a bounded spin phase, so dispatching a small
//! job does not pay a park/unpark round trip and a long job does not burn
//! cores.
//!
//! ```
//! use std::sync::atomic::{AtomicU64, Ordering};
//! use workpool::{SyncJob, SyncPool};
//!
//! // parallel sum of 0..1000
//! struct Sum {
//!     total: AtomicU64,
//! }
//!
//! impl SyncJob for Sum {
//!     fn range(&self) -> std::ops::Range<u32> {
//!         0..1000
//!     }
//!
//!     fn call(&self, _tid: u32, start: u32, end: u32) {
//!         let part: u64 = (start..end).map(u64::from).sum();
//!         self.total.fetch_add(part, Ordering::Relaxed);
//!     }
//! }
//!
//! let mut pool = SyncPool::new();
//! pool.set_num_thread(4);
//!
//! let job = Sum { total: AtomicU64::new(0) };
//! pool.submit(&job);
//! assert_eq!(job.total.into_inner(), 499_500);
//! ```
//!
//! Queued execution with the async flavor:
//!
//! ```
//! use std::sync::atomic::{AtomicU32, Ordering};
//! use std::sync::Arc;
//! use workpool::{AsyncJob, AsyncPool, JobCore, RefPtr};
//!
//! struct Count {
//!     core: JobCore,
//!     hits: Arc<AtomicU32>,
//! }
//!
//! impl AsyncJob for Count {
//!     fn core(&self) -> &JobCore {
//!         &self.core
//!     }
//!
//!     fn call(&self) {
//!         self.hits.fetch_add(1, Ordering::Relaxed);
//!     }
//! }
//!
//! let pool = AsyncPool::new();
//! pool.set_num_thread(4);
//!
//! let hits = Arc::new(AtomicU32::new(0));
//! let job: RefPtr<dyn AsyncJob> = RefPtr::new(Box::new(Count {
//!     core: JobCore::new(),
//!     hits: Arc::clone(&hits),
//! }));
//!
//! // ten submissions of the same handle mean ten calls
//! for _ in 0..10 {
//!     pool.submit(job.clone());
//! }
//! pool.wait();
//! assert_eq!(hits.load(Ordering::Relaxed), 10);
//! ```
//!
//! There is no recoverable error channel: contract violations (dropping a
//! pool with unfinished accounting, unbalanced event counters) and OS
//! failures (thread spawn) are fatal assertions, since a partially
//! constructed pool is not safe to limp along with.

// https://github.com/rust-lang/rfcs/blob/master/text/2585-unsafe-block-in-unsafe-fn.md
#![deny(unsafe_op_in_unsafe_fn)]

pub mod pools;
pub mod refptr;
pub mod sync;

pub use pools::async_pool::{AsyncJob, AsyncPool, JobCore};
pub use pools::sync_pool::{SyncJob, SyncPool};
pub use refptr::{RefCount, RefCounted, RefPtr};

/// Hard cap on the number of threads either pool flavor will run.
pub const MAX_THREAD: u32 = 32;
