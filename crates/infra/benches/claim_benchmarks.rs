use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use bandscore_core::{
    BandScore, Criterion as BandCriterion, EvaluationResult, Submission, SubmissionId, TaskId, TaskType, UserId,
    WorkerId, WritingTask,
};
use bandscore_infra::jobs::{ClaimPolicy, InMemoryJobStore, JobStore, RetryPolicy};
use chrono::Utc;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::runtime::Runtime;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap()
}

fn essay() -> String {
    vec!["word"; 260].join(" ")
}

async fn seed(store: &InMemoryJobStore, n: usize) {
    let text = essay();
    for _ in 0..n {
        let task = WritingTask::new(TaskId::new(), TaskType::Task2, "Discuss both views.");
        let s = Submission::draft(SubmissionId::new(), UserId::new(), task, &text, Utc::now());
        store.insert_submission(&s).await.unwrap();
        store.enqueue(s.id, Utc::now()).await.unwrap();
    }
}

fn result() -> EvaluationResult {
    let scores = BandCriterion::ALL
        .into_iter()
        .map(|c| (c, BandScore::from_f64(6.5).unwrap()))
        .collect();
    EvaluationResult::new(scores, BTreeMap::new(), vec![], None).unwrap()
}

fn bench_claim_throughput(c: &mut Criterion) {
    let rt = runtime();
    let policy = ClaimPolicy::default();
    let worker = WorkerId::new("bench");
    let mut group = c.benchmark_group("claim_next");

    for queue_depth in [10usize, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*queue_depth as u64));
        group.bench_with_input(BenchmarkId::from_parameter(queue_depth), queue_depth, |b, &depth| {
            b.iter_batched(
                || {
                    let store = InMemoryJobStore::new();
                    rt.block_on(seed(&store, depth));
                    store
                },
                |store| {
                    rt.block_on(async {
                        while let Some(claimed) = store.claim_next(&worker, Utc::now(), &policy).await.unwrap() {
                            black_box(claimed);
                        }
                    })
                },
                criterion::BatchSize::LargeInput,
            );
        });
    }

    group.finish();
}

fn bench_claim_and_complete(c: &mut Criterion) {
    let rt = runtime();
    let policy = ClaimPolicy::default();
    let worker = WorkerId::new("bench");
    let scored = result();

    c.bench_function("claim_complete_100", |b| {
        b.iter_batched(
            || {
                let store = InMemoryJobStore::new();
                rt.block_on(seed(&store, 100));
                store
            },
            |store| {
                rt.block_on(async {
                    while let Some(claimed) = store.claim_next(&worker, Utc::now(), &policy).await.unwrap() {
                        store.complete(&claimed.token, scored.clone(), Utc::now()).await.unwrap();
                    }
                })
            },
            criterion::BatchSize::LargeInput,
        );
    });
}

fn bench_retry_decision(c: &mut Criterion) {
    let policy = RetryPolicy::default();
    let now = Utc::now();

    c.bench_function("retry_decide", |b| {
        b.iter(|| {
            for attempt in 1..=policy.max_attempts {
                black_box(policy.decide(
                    black_box(attempt),
                    bandscore_infra::jobs::FailureKind::RateLimited,
                    now,
                ));
            }
        })
    });

    let capped = RetryPolicy::exponential(40, Duration::from_secs(30), Duration::from_secs(600));
    c.bench_function("backoff_capped", |b| b.iter(|| black_box(capped.backoff(black_box(37)))));
}

criterion_group!(benches, bench_claim_throughput, bench_claim_and_complete, bench_retry_decision);
criterion_main!(benches);
