//! # Codec and Tracker Benchmarks
//!
//! The packing and tracker callbacks run on the engine's hot path, once per
//! executed block.
//!
//! Run with: `cargo bench -p amba-core`

use amba_core::ipc::{IpcMessage, IpcRx, IpcTx};
use amba_core::{ControlFlowTracker, EngineStateId, Generation, StateLineageTracker, pack, unpack};
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use std::hint::black_box;
use std::io::Cursor;

/// Execute `blocks` consecutive blocks on four interleaved states.
fn run_blocks(blocks: u64) -> ControlFlowTracker {
    let mut tracker = ControlFlowTracker::new();
    for i in 0..blocks {
        let state = EngineStateId((i % 4) as i32);
        let address = 0x40_0000 + (i % 256) * 16;
        if i % 64 == 0 {
            tracker.on_block_translated(state, address);
        }
        tracker.on_block_entered(state, address);
    }
    tracker
}

// =============================================================================
// BENCHMARKS
// =============================================================================

fn bench_pack(c: &mut Criterion) {
    c.bench_function("pack_unpack", |b| {
        b.iter(|| {
            let key = pack(
                black_box(0xffff_8000_dead_beef),
                black_box(Generation::new(9)),
                black_box(4000),
            );
            black_box(unpack(key))
        });
    });
}

fn bench_block_entered(c: &mut Criterion) {
    let mut group = c.benchmark_group("block_entered");

    for size in [1_000u64, 10_000, 100_000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            b.iter(|| black_box(run_blocks(size)));
        });
    }

    group.finish();
}

fn bench_lineage(c: &mut Criterion) {
    let mut group = c.benchmark_group("lineage_fork_merge");

    for forks in [100i32, 1_000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(forks), forks, |b, &forks| {
            b.iter(|| {
                let mut tracker = StateLineageTracker::new();
                for child in 1..=forks {
                    tracker.on_fork(EngineStateId(0), &[EngineStateId(0), EngineStateId(child)]);
                    if child % 2 == 0 {
                        tracker.on_merge(EngineStateId(0), EngineStateId(child));
                    }
                }
                black_box(tracker.into_graph())
            });
        });
    }

    group.finish();
}

fn bench_snapshot_frame(c: &mut Criterion) {
    let graph = run_blocks(10_000).into_graph();
    let message = IpcMessage::GraphSnapshot {
        name: "basic blocks".to_string(),
        graph: graph.snapshot(),
    };

    c.bench_function("snapshot_frame_roundtrip", |b| {
        b.iter(|| {
            let mut tx = IpcTx::new(Vec::new());
            tx.blocking_send(&message).expect("send");
            let mut rx = IpcRx::new(Cursor::new(tx.into_inner()));
            black_box(rx.blocking_receive().expect("receive"))
        });
    });
}

criterion_group!(
    benches,
    bench_pack,
    bench_block_entered,
    bench_lineage,
    bench_snapshot_frame,
);
criterion_main!(benches);
