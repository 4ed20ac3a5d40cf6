//! Benchmarks for graph planning and backoff computation.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use envforge::catalog::{ActionSpec, Catalog, StageDefinition};
use envforge::pipeline::{ClassificationTable, RetryConfig, RetryController, StageGraph};

/// Layers of `width` stages, each depending on two stages of the layer above.
fn layered_catalog(layers: usize, width: usize) -> Catalog {
    let mut stages = Vec::with_capacity(layers * width);
    for layer in 0..layers {
        for i in 0..width {
            let mut stage = StageDefinition::new(format!("l{layer}-s{i}"), ActionSpec::new("true"));
            if layer > 0 {
                stage = stage
                    .with_dependency(format!("l{}-s{i}", layer - 1))
                    .with_dependency(format!("l{}-s{}", layer - 1, (i + 1) % width));
            }
            stages.push(stage);
        }
    }
    match Catalog::new("bench", stages) {
        Ok(catalog) => catalog,
        Err(e) => panic!("invalid bench catalog: {e}"),
    }
}

fn graph_benchmark(c: &mut Criterion) {
    let catalog = layered_catalog(20, 25);

    c.bench_function("graph_build_500", |b| {
        b.iter(|| black_box(StageGraph::new(catalog.clone())));
    });

    let graph = StageGraph::new(catalog);
    c.bench_function("graph_waves_500", |b| {
        b.iter(|| black_box(graph.waves()));
    });
    c.bench_function("graph_descendants_root", |b| {
        b.iter(|| black_box(graph.descendants(0)));
    });
}

fn backoff_benchmark(c: &mut Criterion) {
    let controller = RetryController::new(RetryConfig::new().with_seed(7), ClassificationTable::default());

    c.bench_function("retry_delay", |b| {
        b.iter(|| black_box(controller.delay(black_box("solvers"), "exit:6", black_box(3))));
    });
}

criterion_group!(benches, graph_benchmark, backoff_benchmark);
criterion_main!(benches);
