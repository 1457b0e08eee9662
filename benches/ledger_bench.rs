//! Benchmarks for the admission planning hot path
//!
//! Measures the lock-held part of a scheduling pass: direct admission on a
//! large cluster and steal planning against many running jobs.

use corebroker::core::agent::Registration;
use corebroker::core::job::{JobKey, JobStatus};
use corebroker::core::ledger::{Attempt, Ledger};
use corebroker::core::steal::{estimate_used_cores, rank_candidates, StealPolicy};
use criterion::{criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;
use std::time::SystemTime;

const CORES_PER_AGENT: u32 = 64;

/// A ledger with `agents` agents of 64 cores, each fully packed with
/// two-core jobs.
fn packed_ledger(agents: u32) -> Ledger {
    let mut ledger = Ledger::default();
    for a in 0..agents {
        ledger
            .register(
                Registration {
                    vm_name: format!("vm{a}"),
                    endpoint: Some(format!("http://10.0.{a}.1:5001")),
                    total_cores: Some(CORES_PER_AGENT),
                    core_offset: Some(a * CORES_PER_AGENT),
                },
                SystemTime::now(),
            )
            .expect("register");
        for j in 0..CORES_PER_AGENT / 2 {
            let ticket = ledger
                .enqueue(
                    &format!("vm{a}"),
                    &format!("job{j}"),
                    1000 + j as i32,
                    2,
                    SystemTime::now(),
                )
                .expect("enqueue");
            if let Attempt::Direct(plan) = ledger.begin_admission(ticket) {
                ledger.confirm_admission(&plan);
            }
        }
    }
    ledger
}

fn live_jobs(utilisation: f64) -> Vec<JobStatus> {
    (0..CORES_PER_AGENT / 2)
        .map(|j| JobStatus {
            job: format!("job{j}"),
            pid: 1000 + j as i32,
            cores: vec![],
            cpu_percent: utilisation * (j % 4) as f64,
        })
        .collect()
}

fn bench_direct_admission(c: &mut Criterion) {
    let mut group = c.benchmark_group("direct_admission");
    group.sample_size(20);

    for &agents in &[1u32, 16, 64] {
        group.throughput(Throughput::Elements(agents as u64));
        group.bench_with_input(BenchmarkId::new("agents", agents), &agents, |b, &agents| {
            b.iter_batched(
                || {
                    let mut ledger = Ledger::default();
                    for a in 0..agents {
                        ledger
                            .register(
                                Registration {
                                    vm_name: format!("vm{a}"),
                                    endpoint: Some("http://127.0.0.1:5001".into()),
                                    total_cores: Some(CORES_PER_AGENT),
                                    core_offset: Some(a * CORES_PER_AGENT),
                                },
                                SystemTime::now(),
                            )
                            .expect("register");
                    }
                    let ticket = ledger
                        .enqueue("vm0", "train", 1, 8, SystemTime::now())
                        .expect("enqueue");
                    (ledger, ticket)
                },
                |(mut ledger, ticket)| black_box(ledger.begin_admission(ticket)),
                BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

fn bench_plan_steal(c: &mut Criterion) {
    let mut group = c.benchmark_group("plan_steal");
    group.sample_size(20);

    for &agents in &[1u32, 16] {
        let jobs = live_jobs(25.0);
        group.bench_with_input(BenchmarkId::new("agents", agents), &agents, |b, &agents| {
            b.iter_batched(
                || {
                    let mut ledger = packed_ledger(agents);
                    let ticket = ledger
                        .enqueue("vm0", "infer", 9999, 4, SystemTime::now())
                        .expect("enqueue");
                    (ledger, ticket)
                },
                |(mut ledger, ticket)| black_box(ledger.plan_steal(ticket, &jobs)),
                BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

fn bench_rank_candidates(c: &mut Criterion) {
    let ledger = packed_ledger(1);
    let jobs = live_jobs(30.0);
    let policy = StealPolicy::default();

    c.bench_function("rank_candidates_32_jobs", |b| {
        b.iter(|| {
            black_box(rank_candidates(
                "vm0",
                &jobs,
                |key: &JobKey| ledger.allocated_count(key),
                policy,
            ))
        })
    });

    c.bench_function("estimate_used_cores", |b| {
        b.iter(|| black_box(estimate_used_cores(black_box(137.5), black_box(8))))
    });
}

criterion_group!(
    benches,
    bench_direct_admission,
    bench_plan_steal,
    bench_rank_candidates
);
criterion_main!(benches);
