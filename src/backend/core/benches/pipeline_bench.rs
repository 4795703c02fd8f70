//! Benchmarks for converter plans and dataset partitioning.
use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};
use serde_json::json;
use labkit_core::components::ComponentRegistry;
use labkit_core::dataset::{split_indexes, Cell, Column, Frame};
use labkit_core::jobs::pipeline::{apply_plan, build_plan};

fn table(rows: usize, cols: usize) -> Frame {
    let mut columns: Vec<Column> = (0..cols)
        .map(|c| Column::new(format!("c{}", c + 1), (0..rows).map(|r| Cell::Float((r * cols + c) as f64)).collect()))
        .collect();
    columns.push(Column::new("target", (0..rows).map(|r| Cell::Int((r % 2) as i64)).collect()));
    Frame::new(columns).unwrap()
}

fn spec() -> serde_json::Value {
    json!({
        "scale": {"order": 1, "component": "StandardScaler", "params": {}, "scope": {"columns": [1, 2, 3], "rows": []}},
        "squash": {"order": 2, "component": "Pipeline", "params": {}, "scope": {"columns": [4, 5], "rows": []},
            "children": [{"name": "StandardScaler", "params": {}}, {"name": "MinMaxScaler", "params": {}}]}
    })
}

fn bench_build_plan(c: &mut Criterion) {
    let registry = ComponentRegistry::with_defaults();
    let spec = spec();
    c.bench_function("build_plan", |b| { b.iter(|| black_box(build_plan(&registry, &spec, 6, 1_000).unwrap())); });
}

fn bench_apply_plan(c: &mut Criterion) {
    let mut group = c.benchmark_group("apply_plan");
    let registry = ComponentRegistry::with_defaults();
    let spec = spec();
    for rows in [100, 1_000, 10_000] {
        let base = table(rows, 5);
        let original = base.column_names();
        group.throughput(Throughput::Elements(rows as u64));
        group.bench_with_input(BenchmarkId::from_parameter(rows), &rows, |b, &rows| {
            b.iter_batched(
                || (base.clone(), build_plan(&registry, &spec, 6, rows).unwrap()),
                |(mut t, mut plan)| { apply_plan(&mut t, &original, "target", &mut plan).unwrap(); black_box(t) },
                BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

fn bench_split_indexes(c: &mut Criterion) {
    let mut group = c.benchmark_group("split_indexes");
    for rows in [1_000, 100_000] {
        group.throughput(Throughput::Elements(rows as u64));
        group.bench_with_input(BenchmarkId::from_parameter(rows), &rows, |b, &rows| { b.iter(|| black_box(split_indexes(rows, 0.6, 0.2, 0.2, Some(7)))); });
    }
    group.finish();
}

criterion_group!(benches, bench_build_plan, bench_apply_plan, bench_split_indexes);
criterion_main!(benches);
