//! A `parallel_for`-style barrier pool.
//!
//! One range-partitioned job at a time is fanned out across the background
//! workers plus the submitting thread; [`SyncPool::submit`] returns only
//! once the whole range has been processed. Load balancing is dynamic: all
//! participants race on a single atomic cursor, each claiming one stripe of
//! the remaining range per round, so a slow stripe does not stall the rest.

use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use log::{debug, trace};

use crate::pools::{next_job_id, next_worker_id};
use crate::refptr::{RefCount, RefCounted, RefPtr};
use crate::sync::{cpu_relax, WaitEvent};
use crate::MAX_THREAD;

/// Iterations spent polling for work with CPU pause hints before falling
/// back to a blocking wait. Bridges the dispatch overhead of short jobs
/// without burning cores on long ones.
const ACTIVE_WAIT: u32 = 10_240;

/// A range-partitioned unit of work for [`SyncPool`].
///
/// The pool slices `range()` into stripes and invokes `call` from several
/// threads at once, so implementations must synchronize any shared output
/// themselves (typically with atomics).
pub trait SyncJob: Sync {
    /// The input range `[start, end)`. The product of the range length and
    /// the thread count must leave headroom below `u32::MAX`; scale or
    /// offset oversized ranges before submission.
    fn range(&self) -> Range<u32>;

    /// Upper bound on concurrent `call`s: 0 picks a bound dynamically, 1
    /// forces the whole range onto the submitting thread, any other value
    /// caps the number of participating threads.
    fn max_call(&self) -> u32 {
        0
    }

    /// Process one stripe `[start, end)`. `tid` identifies the
    /// participating thread, `0..W` with `W-1` being the submitter; no two
    /// threads share a `tid` within one submission.
    fn call(&self, tid: u32, start: u32, end: u32);
}

/// Scheduling state for one submission, shared with the workers through
/// strong handles so it outlives whichever side finishes last.
struct JobRef {
    refcount: RefCount,
    job: *const dyn SyncJob,
    id: u32,
    nstripe: u32,
    maxcall: u32,
    allstart: u32,
    allend: u32,
    /// Cursor advancing through `[allstart, allend)`; claims are fetch-adds.
    index: AtomicU32,
    /// Counts workers inside the stripe loop; the submitter waits for zero.
    event: WaitEvent,
}

// SAFETY: the raw job pointer is only dereferenced while claiming stripes,
// and `SyncPool::submit` does not return until the event reports that every
// claim has finished, so the pointer never outlives the borrow it came
// from. The job itself is `Sync`, so concurrent calls are permitted.
unsafe impl Send for JobRef {}
unsafe impl Sync for JobRef {}

impl JobRef {
    /// # Safety
    ///
    /// The caller must keep `job` alive and un-moved until this reference's
    /// event has drained back to zero. `SyncPool::submit` guarantees this
    /// by blocking on the event before returning.
    unsafe fn new(job: &dyn SyncJob, nthread: u32) -> Self {
        let Range { start, end } = job.range();
        let maxcall = job.max_call().min(end - start);
        // more stripes than threads so early finishers keep stealing, but
        // not so many that the fetch-add traffic dominates the work
        let nstripe = (nthread * nthread.min(4)).clamp(1, 128).min(end - start);
        // SAFETY: deferred to the caller, see above
        let job = unsafe { std::mem::transmute::<&dyn SyncJob, &'static dyn SyncJob>(job) };
        Self {
            refcount: RefCount::new(),
            job: job as *const dyn SyncJob,
            id: next_job_id(),
            nstripe,
            maxcall,
            allstart: start,
            allend: end,
            index: AtomicU32::new(start),
            event: WaitEvent::new(),
        }
    }

    /// Claim and process stripes until the cursor passes the end of the
    /// range. Every participant, including the submitter, runs this.
    fn execute(&self, tid: u32) {
        loop {
            let cur = self.index.load(Ordering::Acquire);
            if cur >= self.allend {
                break;
            }
            let stripe = if self.maxcall > 0 {
                // a fixed stripe size yields exactly `maxcall` claims
                (self.allend - self.allstart).div_ceil(self.maxcall)
            } else {
                ((self.allend - cur) / self.nstripe).max(1)
            };
            let start = self.index.fetch_add(stripe, Ordering::AcqRel);
            if start >= self.allend {
                break;
            }
            let end = self.allend.min(start + stripe);
            trace!("job {}: thread {tid} takes [{start}, {end})", self.id);
            // SAFETY: a stripe can only be claimed while the submitter is
            // still blocked in `submit`, which keeps the job alive.
            unsafe { (*self.job).call(tid, start, end) };
        }
    }
}

impl RefCounted for JobRef {
    fn ref_count(&self) -> &RefCount {
        &self.refcount
    }
}

impl Drop for JobRef {
    fn drop(&mut self) {
        // the last handle goes away only after the range has been drained
        debug_assert!(*self.index.get_mut() >= self.allend);
    }
}

struct WorkerSlot {
    job: Option<RefPtr<JobRef>>,
    stop: bool,
}

struct WorkerShared {
    slot: Mutex<WorkerSlot>,
    cond: Condvar,
    /// Set under the slot lock, but polled without it by the spin phase.
    wake_signal: AtomicBool,
}

struct SyncWorker {
    shared: Arc<WorkerShared>,
    handle: JoinHandle<()>,
    id: u32,
}

impl SyncWorker {
    fn spawn(index: u32) -> Self {
        let id = next_worker_id();
        let shared = Arc::new(WorkerShared {
            slot: Mutex::new(WorkerSlot {
                job: None,
                stop: false,
            }),
            cond: Condvar::new(),
            wake_signal: AtomicBool::new(false),
        });

        let shared_clone = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name(format!("sync-worker-{index}"))
            .spawn(move || work_loop(index, id, shared_clone))
            .expect("failed to spawn a sync pool worker");

        Self { shared, handle, id }
    }

    /// Install a job handle and wake the worker.
    fn assign(&self, job: RefPtr<JobRef>) {
        let mut slot = self.shared.slot.lock().unwrap();
        debug_assert!(!slot.stop);
        trace!("sync worker {} is assigned job {}", self.id, job.id);
        slot.job = Some(job);
        self.shared.wake_signal.store(true, Ordering::Release);
        drop(slot);
        self.shared.cond.notify_one();
    }

    fn stop_and_join(self) {
        {
            let mut slot = self.shared.slot.lock().unwrap();
            slot.stop = true;
            slot.job = None;
            self.shared.wake_signal.store(true, Ordering::Release);
        }
        self.shared.cond.notify_one();
        debug!("sync worker {} joining", self.id);
        self.handle.join().expect("a sync pool worker panicked");
    }
}

fn work_loop(index: u32, id: u32, shared: Arc<WorkerShared>) {
    debug!("sync worker {id} started");
    loop {
        // poll for a while first; short jobs arrive faster than a park
        for _ in 0..ACTIVE_WAIT {
            if shared.wake_signal.load(Ordering::Acquire) {
                break;
            }
            cpu_relax(16);
        }

        let job = {
            let mut slot = shared.slot.lock().unwrap();
            while !shared.wake_signal.load(Ordering::Acquire) {
                trace!("sync worker {id} wait (sleep)");
                slot = shared.cond.wait(slot).unwrap();
            }
            shared.wake_signal.store(false, Ordering::Release);
            if slot.stop {
                break;
            }
            slot.job.take()
        };

        let Some(job) = job else { continue };
        if job.index.load(Ordering::Acquire) >= job.allend {
            trace!("sync worker {id} got job {} which is already drained", job.id);
            continue;
        }

        job.event.enter();
        job.execute(index);
        if job.event.leave() == 1 {
            trace!("sync worker {id} finished job {} last, waking the submitter", job.id);
            job.event.wake();
        }
    }
    debug!("sync worker {id} stopped");
}

/// The barrier pool. See the [module docs](self) for the execution model.
///
/// A pool accepts one submission at a time; taking `&mut self` makes the
/// single-submitter discipline a compile-time property rather than a
/// runtime contract.
pub struct SyncPool {
    workers: Vec<SyncWorker>,
}

impl SyncPool {
    /// A pool with no background workers yet: jobs run on the submitter
    /// until [`set_num_thread`](Self::set_num_thread) raises the count.
    pub fn new() -> Self {
        Self {
            workers: Vec::new(),
        }
    }

    /// The number of participating threads, including the submitter.
    pub fn get(&self) -> u32 {
        self.workers.len() as u32 + 1
    }

    /// Bring the thread count (submitter included) to
    /// `clamp(n, 1, MAX_THREAD)`, spawning or stopping-and-joining workers
    /// as needed.
    pub fn set_num_thread(&mut self, n: u32) {
        let target = n.clamp(1, MAX_THREAD) - 1;
        debug!(
            "sync pool: changing worker count {} -> {target}",
            self.workers.len()
        );
        while self.workers.len() as u32 > target {
            self.workers.pop().unwrap().stop_and_join();
        }
        while (self.workers.len() as u32) < target {
            self.workers.push(SyncWorker::spawn(self.workers.len() as u32));
        }
    }

    /// Process the job's whole range, blocking until every stripe has been
    /// handled. An empty range returns immediately; if the effective thread
    /// count comes out below two, the submitter processes the range inline.
    pub fn submit(&mut self, job: &dyn SyncJob) {
        let Range { start, end } = job.range();
        if start >= end {
            return;
        }

        let mut nthread = end - start;
        let maxcall = job.max_call();
        if maxcall > 0 {
            nthread = nthread.min(maxcall);
        }
        nthread = nthread.min(self.workers.len() as u32 + 1);
        if nthread < 2 {
            job.call(0, start, end);
            return;
        }

        // SAFETY: we block on the reference's event below until every
        // stripe claim has returned, so the borrow outlives all uses.
        let job_ref = RefPtr::new(Box::new(unsafe { JobRef::new(job, nthread) }));
        debug!(
            "job {} scheduled [{start}, {end}) nstripe {} across {nthread} threads",
            job_ref.id, job_ref.nstripe
        );

        let subtrd = nthread - 1;
        for worker in &self.workers[..subtrd as usize] {
            worker.assign(job_ref.clone());
        }

        // the submitter works too, with the highest tid
        job_ref.execute(subtrd);

        // the range is fully claimed now; give stragglers a spin window to
        // finish their stripes before paying for a park
        for _ in 0..ACTIVE_WAIT {
            if job_ref.event.pending() == 0 {
                break;
            }
            cpu_relax(16);
        }
        job_ref.event.wait(0);
        debug!("job {} finished", job_ref.id);
    }
}

impl Default for SyncPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SyncPool {
    fn drop(&mut self) {
        self.set_num_thread(1);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU64;

    use super::*;

    struct SumJob {
        start: u32,
        end: u32,
        total: AtomicU64,
    }

    impl SumJob {
        fn new(start: u32, end: u32) -> Self {
            Self {
                start,
                end,
                total: AtomicU64::new(0),
            }
        }
    }

    impl SyncJob for SumJob {
        fn range(&self) -> Range<u32> {
            self.start..self.end
        }

        fn call(&self, _tid: u32, start: u32, end: u32) {
            let part: u64 = (start..end).map(u64::from).sum();
            self.total.fetch_add(part, Ordering::Relaxed);
        }
    }

    #[test]
    fn test_sum_across_thread_counts() {
        for nthread in [1, 2, 4, 8] {
            let mut pool = SyncPool::new();
            pool.set_num_thread(nthread);
            assert_eq!(pool.get(), nthread);

            let job = SumJob::new(0, 1000);
            pool.submit(&job);
            assert_eq!(job.total.load(Ordering::Relaxed), 499_500);
        }
    }

    #[test]
    fn test_resubmit_same_job() {
        let mut pool = SyncPool::new();
        pool.set_num_thread(4);

        let job = SumJob::new(0, 1000);
        pool.submit(&job);
        pool.submit(&job);
        assert_eq!(job.total.load(Ordering::Relaxed), 2 * 499_500);
    }

    #[test]
    fn test_empty_range() {
        let mut pool = SyncPool::new();
        pool.set_num_thread(4);

        let job = SumJob::new(10, 10);
        pool.submit(&job);
        assert_eq!(job.total.load(Ordering::Relaxed), 0);
    }

    struct RecordJob {
        start: u32,
        end: u32,
        maxcall: u32,
        slices: Mutex<Vec<(u32, u32, u32)>>,
    }

    impl RecordJob {
        fn new(start: u32, end: u32, maxcall: u32) -> Self {
            Self {
                start,
                end,
                maxcall,
                slices: Mutex::new(Vec::new()),
            }
        }
    }

    impl SyncJob for RecordJob {
        fn range(&self) -> Range<u32> {
            self.start..self.end
        }

        fn max_call(&self) -> u32 {
            self.maxcall
        }

        fn call(&self, tid: u32, start: u32, end: u32) {
            self.slices.lock().unwrap().push((tid, start, end));
        }
    }

    #[test]
    fn test_single_element_runs_inline() {
        let mut pool = SyncPool::new();
        pool.set_num_thread(8);

        let job = RecordJob::new(5, 6, 0);
        pool.submit(&job);

        let slices = job.slices.lock().unwrap();
        assert_eq!(*slices, vec![(0, 5, 6)]);
    }

    #[test]
    fn test_max_call_one_runs_inline() {
        let mut pool = SyncPool::new();
        pool.set_num_thread(8);

        let job = RecordJob::new(0, 1000, 1);
        pool.submit(&job);

        let slices = job.slices.lock().unwrap();
        assert_eq!(*slices, vec![(0, 0, 1000)]);
    }

    #[test]
    fn test_stripe_coverage() {
        let mut pool = SyncPool::new();
        pool.set_num_thread(16);

        let job = RecordJob::new(0, 10_000, 7);
        pool.submit(&job);

        let mut slices = job.slices.lock().unwrap().clone();
        slices.sort_by_key(|&(_, start, _)| start);

        // a fixed stripe of ceil(10000 / 7) = 1429 gives exactly 7 slices
        assert_eq!(slices.len(), 7);
        // the slices tile the range with no gap and no overlap
        let mut expected = 0;
        for &(tid, start, end) in slices.iter() {
            assert!(tid < 7);
            assert_eq!(start, expected);
            assert!(end > start);
            expected = end;
        }
        assert_eq!(expected, 10_000);
    }

    #[test]
    fn test_dynamic_stripes_cover_range() {
        let mut pool = SyncPool::new();
        pool.set_num_thread(4);

        let job = RecordJob::new(100, 4_600, 0);
        pool.submit(&job);

        let mut slices = job.slices.lock().unwrap().clone();
        slices.sort_by_key(|&(_, start, _)| start);

        let mut expected = 100;
        for &(tid, start, end) in slices.iter() {
            assert!(tid < 4);
            assert_eq!(start, expected);
            expected = end;
        }
        assert_eq!(expected, 4_600);
    }

    #[test]
    fn test_set_num_thread_clamps() {
        let mut pool = SyncPool::new();
        assert_eq!(pool.get(), 1);

        pool.set_num_thread(100);
        assert_eq!(pool.get(), MAX_THREAD);

        pool.set_num_thread(0);
        assert_eq!(pool.get(), 1);

        pool.set_num_thread(4);
        pool.set_num_thread(4);
        assert_eq!(pool.get(), 4);

        // the pool stays usable after resizing
        let job = SumJob::new(0, 100);
        pool.submit(&job);
        assert_eq!(job.total.load(Ordering::Relaxed), 4950);
    }
}
