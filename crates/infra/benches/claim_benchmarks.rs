use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};

use std::sync::Arc;

use queuectl_core::{Outcome, WorkerId};
use queuectl_infra::jobs::{InMemoryJobStore, JobQueue, SqliteJobStore};
use tokio::runtime::Runtime;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

async fn in_memory_queue(backlog: usize) -> JobQueue<Arc<InMemoryJobStore>> {
    let queue = JobQueue::open(InMemoryJobStore::arc()).await.unwrap();
    for i in 0..backlog {
        queue.enqueue(&format!("echo {i}"), None).await.unwrap();
    }
    queue
}

/// Claim from an in-memory store as the pending backlog grows.
fn bench_in_memory_claim(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("in_memory_claim");
    let worker = WorkerId::new("bench");

    for backlog in [10usize, 100, 1000] {
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::new("claim_one", backlog), &backlog, |b, &size| {
            b.iter_batched(
                || rt.block_on(in_memory_queue(size)),
                |queue| {
                    rt.block_on(async {
                        black_box(queue.claim(&worker).await.unwrap());
                    })
                },
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

/// Full job cycle (enqueue, claim, record success) against a SQLite file.
fn bench_sqlite_cycle(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("sqlite_job_cycle");
    group.sample_size(20);

    let path = std::env::temp_dir().join(format!("queuectl-bench-{}.db", uuid::Uuid::now_v7()));
    let queue = rt.block_on(async {
        let store = SqliteJobStore::open(&path).await.unwrap();
        JobQueue::open(store).await.unwrap()
    });
    let worker = WorkerId::new("bench");

    group.bench_function("enqueue_claim_complete", |b| {
        b.iter(|| {
            rt.block_on(async {
                let id = queue.enqueue(black_box("true"), None).await.unwrap();
                let job = queue.claim(&worker).await.unwrap().unwrap();
                queue
                    .record_outcome(job.id, &worker, &Outcome::Succeeded)
                    .await
                    .unwrap();
                black_box(id);
            })
        });
    });

    group.finish();

    rt.block_on(queue.store().pool().close());
    for suffix in ["", "-wal", "-shm"] {
        let _ = std::fs::remove_file(format!("{}{suffix}", path.display()));
    }
}

criterion_group!(benches, bench_in_memory_claim, bench_sqlite_cycle);
criterion_main!(benches);
