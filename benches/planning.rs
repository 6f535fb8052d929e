//! Benchmarks for planning and record processing
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use pipeflow::operation::{Count, Identity};
use pipeflow::pipe::{GroupBy, PipeAssembly};
use pipeflow::tap::{MemoryStore, Scheme};
use pipeflow::tuple::Fields;
use pipeflow::{tuple, Flow, FlowConfig, FlowConnector, FlowDef, LocalFlowRunner};

/// `groupings` chained group-and-count steps, each preceded by an identity.
fn chained(groupings: usize) -> PipeAssembly {
    let mut assembly = PipeAssembly::new();
    let mut pipe = assembly.head("in");
    for _ in 0..groupings {
        pipe = assembly.each_function(pipe, Fields::all(), Identity::new(), Fields::results());
        let group = assembly.group_by(GroupBy::new(pipe, "a"));
        pipe = assembly.every_aggregator(group, Fields::all(), Count::new(), Fields::all());
    }
    assembly
}

fn plan(store: &MemoryStore, groupings: usize) -> Flow {
    let def = FlowDef::new(chained(groupings))
        .named("bench")
        .source("in", store.tap("in", Scheme::new(Fields::from(["a", "b"]))))
        .sink("in", store.tap("out", Scheme::default()));
    FlowConnector::new(FlowConfig::default())
        .expect("default config is valid")
        .connect(def)
        .expect("bench flow must plan")
}

fn bench_planning(c: &mut Criterion) {
    let mut group = c.benchmark_group("planning");
    for groupings in [1, 4, 16].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(groupings), groupings, |b, &groupings| {
            let store = MemoryStore::new();
            b.iter(|| black_box(plan(&store, groupings)));
        });
    }
    group.finish();
}

fn bench_word_count(c: &mut Criterion) {
    let mut group = c.benchmark_group("word_count");
    for size in [1_000, 10_000, 100_000].iter() {
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let store = MemoryStore::new();
            let rows = (0..size).map(|i| tuple![format!("w{}", i % 97), i]).collect::<Vec<_>>();
            let flow = plan(&store, 1);
            let runner = LocalFlowRunner::new(FlowConfig {
                map_partitions: 4,
                ..FlowConfig::default()
            });
            b.iter(|| {
                store.insert("in", rows.clone());
                store.remove("out");
                black_box(runner.run(&flow).ok());
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_planning, bench_word_count);
criterion_main!(benches);
