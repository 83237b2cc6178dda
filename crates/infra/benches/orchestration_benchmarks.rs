use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use chrono::Utc;
use im2_core::{Classification, Job, JobId, JobState, OwnerId, RetryPolicy, Stage, WorkerId};
use im2_infra::handoff::HandoffArea;
use im2_infra::locks::{InMemoryLockManager, LockKey, LockManager};
use im2_infra::pause::PauseGate;
use im2_infra::publish::NullSink;
use im2_infra::query::PipelineStats;
use im2_infra::router::{RouterSettings, StageRouter, StageSuccess};
use im2_infra::store::{InMemoryJobStore, JobFilter, JobStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

fn seed_job(store: &InMemoryJobStore, n: usize) -> JobId {
    let job = Job::register(
        OwnerId::parse("bench").unwrap(),
        PathBuf::from(format!("/intake/bench/batch/{n}.wav")),
        "batch",
        n as u64,
        Utc::now(),
    );
    store.insert_if_absent(job).unwrap().job().job_id()
}

/// Lock grant + release on a fresh key, and renewal of a held lease.
fn bench_lock_manager(c: &mut Criterion) {
    let mut group = c.benchmark_group("lock_manager");
    group.throughput(Throughput::Elements(1));

    let locks = InMemoryLockManager::new();
    let worker = WorkerId::parse("bench-worker").unwrap();
    let lease = Duration::from_secs(30);

    group.bench_function("try_acquire_release", |b| {
        b.iter(|| {
            let key = LockKey::new(JobId::new(), JobState::Staging);
            let grant = locks.try_acquire(key, &worker, lease).unwrap().unwrap();
            locks.release(black_box(&grant)).unwrap();
        })
    });

    let held = locks
        .try_acquire(LockKey::new(JobId::new(), JobState::Separating), &worker, lease)
        .unwrap()
        .unwrap();
    group.bench_function("renew", |b| {
        b.iter(|| black_box(locks.renew(&held, lease).unwrap()))
    });

    group.finish();
}

/// Full categorizing attempt: claim, handoff commit, lock release.
fn bench_claim_commit(c: &mut Criterion) {
    let mut group = c.benchmark_group("claim_commit");
    group.sample_size(200);

    let dir = tempfile::tempdir().unwrap();
    let store = InMemoryJobStore::arc();
    let router = StageRouter::new(
        store.clone(),
        Arc::new(InMemoryLockManager::new()),
        Arc::new(PauseGate::new()),
        HandoffArea::new(dir.path().join("staging"), dir.path().join("output")),
        Arc::new(NullSink),
        RouterSettings::new(Duration::from_secs(30), Duration::from_secs(1), RetryPolicy::default()),
    );
    let worker = WorkerId::parse("bench-worker").unwrap();
    let mut n = 0;

    group.bench_function("categorizing_attempt", |b| {
        b.iter(|| {
            n += 1;
            let id = seed_job(&store, n);
            router.admit(id).unwrap();
            let lease = router.claim(Stage::Categorizing, &worker).unwrap().unwrap();
            let success = StageSuccess {
                classification: Some(Classification::new("wav")),
            };
            black_box(router.complete(lease, success).unwrap());
        })
    });

    group.finish();
}

/// Aggregate stats over stores of increasing size.
fn bench_pipeline_stats(c: &mut Criterion) {
    let mut group = c.benchmark_group("pipeline_stats");

    for size in [100usize, 1_000, 10_000].iter() {
        let store = InMemoryJobStore::new();
        for n in 0..*size {
            seed_job(&store, n);
        }
        let jobs = store.list(&JobFilter::all()).unwrap();

        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &jobs, |b, jobs| {
            b.iter(|| {
                black_box(PipelineStats::compute(
                    jobs,
                    Utc::now(),
                    Duration::from_secs(3600),
                    false,
                ))
            })
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_lock_manager,
    bench_claim_commit,
    bench_pipeline_stats
);
criterion_main!(benches);
