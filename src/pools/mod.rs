//! The two pool flavors: barrier-style [`sync_pool`] and fire-and-forget
//! [`async_pool`].

pub mod async_pool;
pub mod sync_pool;

use std::sync::atomic::{AtomicU32, Ordering};

// Process-wide ids threaded through log lines to tell jobs and workers
// apart. Debug aid only; nothing depends on the concrete values.
static NEXT_JOB_ID: AtomicU32 = AtomicU32::new(0);
static NEXT_WORKER_ID: AtomicU32 = AtomicU32::new(0);

pub(crate) fn next_job_id() -> u32 {
    NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed)
}

pub(crate) fn next_worker_id() -> u32 {
    NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed)
}
