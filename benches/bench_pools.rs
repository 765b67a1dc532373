use criterion::{
    black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion,
};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use workpool::{AsyncJob, AsyncPool, JobCore, RefCount, RefCounted, RefPtr, SyncJob, SyncPool};

const RANGE: u32 = 100_000;

struct SumJob {
    total: AtomicU64,
}

impl SyncJob for SumJob {
    fn range(&self) -> std::ops::Range<u32> {
        0..RANGE
    }

    fn call(&self, _tid: u32, start: u32, end: u32) {
        let part: u64 = (black_box(start)..end).map(u64::from).sum();
        self.total.fetch_add(part, Ordering::Relaxed);
    }
}

struct CountJob {
    core: JobCore,
    hits: Arc<AtomicU32>,
}

impl AsyncJob for CountJob {
    fn core(&self) -> &JobCore {
        &self.core
    }

    fn call(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }
}

struct Unit {
    count: RefCount,
}

impl RefCounted for Unit {
    fn ref_count(&self) -> &RefCount {
        &self.count
    }
}

#[inline(never)]
fn refptr_clone_and_drop(x: RefPtr<Unit>) {
    #[allow(clippy::redundant_clone)]
    let _ = x.clone();
}

#[inline(never)]
fn arc_clone_and_drop(x: Arc<()>) {
    #[allow(clippy::redundant_clone)]
    let _ = x.clone();
}

fn criterion_benchmark(c: &mut Criterion) {
    let _ = env_logger::try_init();

    {
        let mut group = c.benchmark_group("range sum");
        group.bench_function("serial", |b| {
            b.iter(|| {
                let total: u64 = (black_box(0u32)..RANGE).map(u64::from).sum();
                black_box(total)
            })
        });
        for nthread in [2, 4, 8] {
            group.bench_function(BenchmarkId::new("SyncPool", nthread), |b| {
                let mut pool = SyncPool::new();
                pool.set_num_thread(nthread);
                let job = SumJob {
                    total: AtomicU64::new(0),
                };
                b.iter(|| pool.submit(&job));
            });
        }
        group.finish();
    }

    {
        let mut group = c.benchmark_group("async submit");
        group.bench_function("100 submissions + wait", |b| {
            let pool = AsyncPool::new();
            pool.set_num_thread(4);
            let hits = Arc::new(AtomicU32::new(0));
            let job: RefPtr<dyn AsyncJob> = RefPtr::new(Box::new(CountJob {
                core: JobCore::new(),
                hits,
            }));
            b.iter(|| {
                for _ in 0..100 {
                    pool.submit(job.clone());
                }
                pool.wait();
            });
        });
        group.finish();
    }

    {
        let mut group = c.benchmark_group("clone and drop");
        group.bench_function("RefPtr", |b| {
            b.iter_batched(
                || {
                    RefPtr::new(Box::new(Unit {
                        count: RefCount::new(),
                    }))
                },
                refptr_clone_and_drop,
                BatchSize::SmallInput,
            );
        });
        group.bench_function("Arc", |b| {
            b.iter_batched(|| Arc::new(()), arc_clone_and_drop, BatchSize::SmallInput);
        });
        group.finish();
    }
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
