//! A fire-and-forget job queue.
//!
//! Jobs are reference-counted trait objects. A single job handle may be
//! submitted several times, in which case its `call` runs once per
//! submission, possibly on several workers at the same time; the job is
//! expected to partition its own work. Waiters block either on one job
//! ([`AsyncJob::wait`]) or on the whole pool ([`AsyncPool::wait`]).

use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use log::{debug, trace};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::pools::{next_job_id, next_worker_id};
use crate::refptr::{RefCount, RefCounted, RefPtr};
use crate::sync::WaitEvent;
use crate::MAX_THREAD;

/// Shared bookkeeping embedded in every [`AsyncJob`] implementation: the
/// handle count and the per-job submission event.
#[derive(Debug)]
pub struct JobCore {
    refcount: RefCount,
    /// One `enter` per submission, one `leave` per completed `call`.
    event: WaitEvent,
    id: u32,
}

impl Default for JobCore {
    fn default() -> Self {
        Self::new()
    }
}

impl JobCore {
    pub fn new() -> Self {
        Self {
            refcount: RefCount::new(),
            event: WaitEvent::new(),
            id: next_job_id(),
        }
    }

    /// Debug id of the owning job, as shown in log lines.
    pub fn id(&self) -> u32 {
        self.id
    }
}

/// An opaque unit of work for [`AsyncPool`].
///
/// Implementors embed a [`JobCore`] and hand the pool a
/// `RefPtr<dyn AsyncJob>` handle.
pub trait AsyncJob: Send + Sync {
    /// The embedded bookkeeping block.
    fn core(&self) -> &JobCore;

    /// Request to bypass queued work by a bounded number of positions.
    /// This is a bias, not preemption; see [`AsyncPool::submit`].
    fn priority(&self) -> u32 {
        0
    }

    /// The work itself. Runs once per submission; concurrent runs on
    /// different workers are possible when the job is submitted repeatedly.
    fn call(&self);

    /// Block until every outstanding submission of this job has completed.
    /// Returns immediately if there are none.
    ///
    /// Waiting on a *different* job from inside `call` is fine as long as
    /// another worker is available to run it; waiting on the job being
    /// executed, or on the pool, deadlocks because the running submission
    /// is itself still outstanding.
    fn wait(&self) {
        self.core().event.wait(0);
    }
}

impl RefCounted for dyn AsyncJob {
    fn ref_count(&self) -> &RefCount {
        &self.core().refcount
    }
}

/// A heap entry: the effective id decides execution order.
struct IdJob {
    id: u32,
    job: RefPtr<dyn AsyncJob>,
}

// id-reverse ordering turns std's max-heap into a min-heap on the id
impl Ord for IdJob {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other.id.cmp(&self.id)
    }
}

impl PartialOrd for IdJob {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for IdJob {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for IdJob {}

struct WorkQueue {
    waitlist: BinaryHeap<IdJob>,
    /// Sequence id handed to the next submission.
    current_id: u32,
    /// Jitter source for the priority bypass.
    rng: SmallRng,
}

struct AsyncShared {
    work: Mutex<WorkQueue>,
    work_cond: Condvar,
    /// Outstanding submissions across all jobs; `wait` blocks on zero.
    event: WaitEvent,
}

struct AsyncWorker {
    /// Set under the work lock during shutdown; the worker rechecks it
    /// whenever it holds that lock.
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
    id: u32,
}

impl AsyncWorker {
    fn spawn(index: u32, shared: Arc<AsyncShared>) -> Self {
        let id = next_worker_id();
        let stop = Arc::new(AtomicBool::new(false));
        let stop_clone = Arc::clone(&stop);

        let handle = std::thread::Builder::new()
            .name(format!("async-worker-{index}"))
            .spawn(move || work_loop(id, stop_clone, shared))
            .expect("failed to spawn an async pool worker");

        Self { stop, handle, id }
    }
}

fn work_loop(id: u32, stop: Arc<AtomicBool>, shared: Arc<AsyncShared>) {
    debug!("async worker {id} started");
    loop {
        let job = {
            let mut work = shared.work.lock().unwrap();
            while !stop.load(Ordering::Relaxed) && work.waitlist.is_empty() {
                trace!("async worker {id} wait (sleep)");
                work = shared.work_cond.wait(work).unwrap();
            }
            if stop.load(Ordering::Relaxed) {
                break;
            }
            work.waitlist.pop().unwrap().job
        };

        trace!("async worker {id} runs job {}", job.core().id);
        job.call();
        // the job's own waiters first, then the pool-wide ones
        if job.core().event.leave() == 1 {
            job.core().event.wake();
        }
        if shared.event.leave() == 1 {
            shared.event.wake();
        }
    }
    debug!("async worker {id} stopped");
}

/// The queue pool. See the [module docs](self) for the execution model.
pub struct AsyncPool {
    shared: Arc<AsyncShared>,
    /// Worker bookkeeping; the lock also serializes resize operations.
    workers: Mutex<Vec<AsyncWorker>>,
}

impl AsyncPool {
    /// A pool with no workers: submissions run inline on the submitter
    /// until [`set_num_thread`](Self::set_num_thread) raises the count.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(AsyncShared {
                work: Mutex::new(WorkQueue {
                    waitlist: BinaryHeap::new(),
                    current_id: 0,
                    rng: SmallRng::from_entropy(),
                }),
                work_cond: Condvar::new(),
                event: WaitEvent::new(),
            }),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// The number of background workers.
    pub fn get(&self) -> u32 {
        self.workers.lock().unwrap().len() as u32
    }

    /// Bring the worker count to `min(n, MAX_THREAD)`. Zero is legal and
    /// disables asynchrony: later submissions run inline on the submitter,
    /// which also yields complete stacks under a debugger.
    ///
    /// Shrinking stops and joins the highest-index workers; a worker
    /// mid-`call` finishes that call first. Queued jobs stay queued.
    pub fn set_num_thread(&self, n: u32) {
        let n = n.min(MAX_THREAD) as usize;
        let mut workers = self.workers.lock().unwrap();
        debug!("async pool: changing worker count {} -> {n}", workers.len());

        if n < workers.len() {
            {
                // flags are set under the work lock so a worker between its
                // queue check and its sleep cannot miss the broadcast
                let _work = self.shared.work.lock().unwrap();
                for worker in &workers[n..] {
                    worker.stop.store(true, Ordering::Relaxed);
                }
            }
            self.shared.work_cond.notify_all();
            for worker in workers.drain(n..) {
                debug!("async worker {} joining", worker.id);
                worker.handle.join().expect("an async pool worker panicked");
            }
        }
        while workers.len() < n {
            let index = workers.len() as u32;
            workers.push(AsyncWorker::spawn(index, Arc::clone(&self.shared)));
        }
    }

    /// Queue one submission of the job and signal a worker. With zero
    /// workers the job runs right here instead.
    ///
    /// Each submission takes a sequence id; workers drain the queue in id
    /// order. A nonzero [`priority`](AsyncJob::priority) lowers the id by
    /// at most 15 positions, so a hot job jumps part of the queue without
    /// starving what was queued long before it.
    pub fn submit(&self, job: RefPtr<dyn AsyncJob>) {
        if self.workers.lock().unwrap().is_empty() {
            job.call();
            return;
        }

        self.shared.event.enter();
        job.core().event.enter();

        {
            let mut work = self.shared.work.lock().unwrap();
            let mut id = work.current_id;
            work.current_id = work.current_id.wrapping_add(1);
            let priority = job.priority();
            if priority > 0 {
                // cut the queue by 8 to 15 positions at most
                let jump = work.rng.gen_range(8..16);
                id -= priority.min(jump).min(id);
            }
            trace!("job {} submitted as entry {id}", job.core().id);
            work.waitlist.push(IdJob { id, job });
        }
        self.shared.work_cond.notify_one();
    }

    /// Block until every submission made so far has completed. Submissions
    /// made while waiting are not guaranteed to be covered.
    pub fn wait(&self) {
        self.shared.event.wait(0);
    }
}

impl Default for AsyncPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for AsyncPool {
    fn drop(&mut self) {
        self.set_num_thread(0);
        // discard submissions that never ran, returning their accounting so
        // job waiters unblock and the events drop as drained
        let mut work = self.shared.work.lock().unwrap();
        for entry in work.waitlist.drain() {
            debug!("discarding queued submission of job {}", entry.job.core().id);
            if entry.job.core().event.leave() == 1 {
                entry.job.core().event.wake();
            }
            if self.shared.event.leave() == 1 {
                self.shared.event.wake();
            }
        }
    }
}
