//! Criterion benchmarks for concurrency planning and multi-stream execution.
//!
//! Graphs are `width` independent chains of `depth` element-wise ops, so the
//! ideal plan has `depth` groups of `width` nodes.

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use devgraph_common::{DType, DeviceConfig, MemoryModel};
use devgraph_graph::{ComputeGraph, GraphBuilder, HostBuffer};
use devgraph_runtime::{DeviceContext, plan_concurrency};
use std::hint::black_box;
use std::sync::Arc;

fn wide_graph(width: usize, depth: usize, elements: usize) -> (Arc<HostBuffer>, ComputeGraph) {
    let bytes = width * (depth + 1) * elements * 4 + 4096;
    let arena = HostBuffer::alloc("bench", bytes).expect("arena");
    let mut b = GraphBuilder::new(Arc::clone(&arena));
    for lane in 0..width {
        let mut t = b.tensor(&format!("x{lane}"), DType::F32, &[elements]).expect("leaf");
        for step in 0..depth {
            t = if step % 2 == 0 { b.silu(&t) } else { b.scale(&t, 0.5) }.expect("node");
        }
    }
    (arena, b.build())
}

// ---------------------------------------------------------------------------
// Planning
// ---------------------------------------------------------------------------

fn bench_plan(c: &mut Criterion) {
    let mut group = c.benchmark_group("plan_concurrency");

    for (width, depth) in [(4, 8), (16, 16), (64, 16), (256, 4)] {
        let (_arena, graph) = wide_graph(width, depth, 16);
        let label = format!("{width}x{depth}");
        for validate in [false, true] {
            let name = if validate { "validated" } else { "dependencies" };
            group.bench_with_input(BenchmarkId::new(name, &label), &graph, |b, graph| {
                b.iter(|| plan_concurrency(black_box(graph), validate))
            });
        }
    }

    group.finish();
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

fn bench_execute(c: &mut Criterion) {
    let mut group = c.benchmark_group("execute_graph");
    group.sample_size(20);

    let (arena, graph) = wide_graph(8, 8, 64 * 1024);
    for streams in [1, 4, 8] {
        let mut ctx = DeviceContext::with_config(DeviceConfig {
            stream_count: streams,
            memory_model: MemoryModel::Unified,
            ..DeviceConfig::default()
        })
        .expect("config");
        ctx.register_buffer("bench", &arena, arena.len()).expect("register");
        ctx.compute_concurrency_plan(&graph, true).expect("plan");
        group.bench_with_input(BenchmarkId::new("streams", streams), &streams, |b, _| {
            b.iter(|| ctx.execute_graph(black_box(&graph)).expect("execute"))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_plan, bench_execute);
criterion_main!(benches);
