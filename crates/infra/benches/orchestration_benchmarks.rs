use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use conduit_core::{EntityId, IdempotencyKey, InitiatedBy, LifecycleState, StateMachine, Stage};
use conduit_events::JobDescriptor;
use conduit_infra::command_handler::CommandHandler;
use conduit_infra::idempotency::{IdempotencyStore, InMemoryIdempotencyCache};
use conduit_infra::outbox::{OutboxProcessor, OutboxProcessorConfig};
use conduit_infra::queue::InMemoryJobQueue;
use conduit_infra::store::{InMemoryStore, InitializeCommand};
use serde_json::json;
use std::sync::Arc;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn handler(store: &Arc<InMemoryStore>) -> CommandHandler {
    let idempotency = IdempotencyStore::new(Arc::new(InMemoryIdempotencyCache::new()), store.clone());
    CommandHandler::new(store.clone(), idempotency)
}

fn command(entity: usize, key: usize, jobs: usize) -> InitializeCommand {
    InitializeCommand::new(
        EntityId::new(format!("course-{entity}")).unwrap(),
        Stage::first().init(),
        IdempotencyKey::new(format!("key-{key}")).unwrap(),
        InitiatedBy::Api,
    )
    .with_jobs((0..jobs).map(|i| JobDescriptor::new("document-processing", json!({"part": i}))))
}

fn bench_validator(c: &mut Criterion) {
    let states = LifecycleState::all();
    let mut group = c.benchmark_group("validator");
    group.throughput(Throughput::Elements((states.len() * states.len()) as u64));

    group.bench_function("all_pairs", |b| {
        b.iter(|| {
            let mut allowed = 0usize;
            for from in &states {
                for to in &states {
                    if StateMachine::can_transition(black_box(*from), black_box(*to)) {
                        allowed += 1;
                    }
                }
            }
            allowed
        })
    });

    let entity = EntityId::new("course-1").unwrap();
    group.bench_function("plan_restart", |b| {
        b.iter(|| {
            StateMachine::plan(
                black_box(&entity),
                Some(LifecycleState::Completed),
                Stage::first().init(),
            )
        })
    });
    group.finish();
}

fn bench_initialize(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("initialize");

    for jobs in [0usize, 2, 10] {
        group.bench_with_input(BenchmarkId::new("fresh_entity", jobs), &jobs, |b, &jobs| {
            let store = Arc::new(InMemoryStore::new());
            let handler = handler(&store);
            let mut n = 0usize;
            b.iter(|| {
                n += 1;
                rt.block_on(handler.initialize(command(n, n, jobs))).unwrap()
            })
        });
    }

    group.bench_function("idempotent_replay", |b| {
        let store = Arc::new(InMemoryStore::new());
        let handler = handler(&store);
        rt.block_on(handler.initialize(command(1, 1, 2))).unwrap();
        b.iter(|| rt.block_on(handler.initialize(command(1, 1, 2))).unwrap())
    });
    group.finish();
}

fn bench_outbox_drain(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("outbox");

    for rows in [10usize, 100] {
        group.throughput(Throughput::Elements(rows as u64));
        group.bench_with_input(BenchmarkId::new("drain_batch", rows), &rows, |b, &rows| {
            b.iter_with_setup(
                || {
                    let store = Arc::new(InMemoryStore::new());
                    let handler = handler(&store);
                    rt.block_on(async {
                        for entity in 0..rows / 2 {
                            handler.initialize(command(entity, entity, 2)).await.unwrap();
                        }
                    });
                    OutboxProcessor::new(
                        store,
                        Arc::new(InMemoryJobQueue::new()),
                        OutboxProcessorConfig {
                            batch_size: rows,
                            ..OutboxProcessorConfig::default()
                        },
                    )
                },
                |processor| rt.block_on(processor.run_once()).unwrap(),
            )
        });
    }
    group.finish();
}

criterion_group!(benches, bench_validator, bench_initialize, bench_outbox_drain);
criterion_main!(benches);
