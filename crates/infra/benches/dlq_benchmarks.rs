use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use chrono::Utc;
use reportflow_infra::dlq::{
    classify_failure, next_retry_delay, retry_delay, FailedJobData, FailedJobFilter,
    FailedJobId, FailedJobMetadata, FailedJobState, FailureClassification, RecoveryStats,
};
use reportflow_infra::jobs::{JobId, JobOptions};

const ERRORS: &[&str] = &[
    "request timed out after 30000ms",
    "Circuit breaker is OPEN for llm-provider",
    "429 Too Many Requests: rate limit exceeded",
    "invalid API key supplied",
    "connect ECONNREFUSED 10.0.0.3:443",
    "read ECONNRESET",
    "TypeError: cannot read properties of undefined (reading 'competitors')",
];

fn entry(i: usize) -> FailedJobData {
    let now = Utc::now();
    let classification = FailureClassification::ALL[i % FailureClassification::ALL.len()];
    FailedJobData {
        id: FailedJobId::new(),
        job_id: JobId::new(),
        job_name: "generate-report".to_string(),
        payload: serde_json::json!({ "seq": i }),
        options: JobOptions::default(),
        failed_at: now - chrono::Duration::seconds(i as i64),
        error: ERRORS[i % ERRORS.len()].to_string(),
        attempts_made: 3,
        max_attempts: 3,
        company_id: None,
        run_id: None,
        classification,
        can_retry: i % 2 == 0,
        next_retry_at: None,
        retry_count: 0,
        state: if i % 3 == 0 {
            FailedJobState::Retried
        } else {
            FailedJobState::Pending
        },
        metadata: FailedJobMetadata::default(),
        updated_at: now,
    }
}

fn bench_classification(c: &mut Criterion) {
    let mut group = c.benchmark_group("classification");
    group.throughput(Throughput::Elements(ERRORS.len() as u64));

    group.bench_function("classify_known_errors", |b| {
        b.iter(|| {
            for error in ERRORS {
                black_box(classify_failure(black_box(error), 3));
            }
        })
    });

    let long_error = format!("{} caused by: {}", "x".repeat(4096), ERRORS[6]);
    group.bench_function("classify_long_unmatched_error", |b| {
        b.iter(|| black_box(classify_failure(black_box(&long_error), 1)))
    });

    group.finish();
}

fn bench_backoff(c: &mut Criterion) {
    let mut group = c.benchmark_group("backoff");

    group.bench_function("retry_delay_fixed_jitter", |b| {
        b.iter(|| {
            for attempts in 0..8 {
                black_box(retry_delay(FailureClassification::Dependency, black_box(attempts), 1.1));
            }
        })
    });

    group.bench_function("next_retry_delay_random_jitter", |b| {
        b.iter(|| black_box(next_retry_delay(FailureClassification::Transient, black_box(3))))
    });

    group.finish();
}

fn bench_recovery_stats(c: &mut Criterion) {
    let mut group = c.benchmark_group("recovery_stats");

    for size in [100_usize, 1_000, 10_000] {
        let entries: Vec<_> = (0..size).map(entry).collect();
        let filter = FailedJobFilter::unresolved();
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &entries, |b, entries| {
            b.iter(|| {
                let unresolved: Vec<_> =
                    entries.iter().filter(|e| filter.matches(e)).cloned().collect();
                black_box(RecoveryStats::from_entries(&unresolved, Utc::now()))
            })
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_classification,
    bench_backoff,
    bench_recovery_stats
);
criterion_main!(benches);
