//! Channel append benchmark
//!
//! Measures the per-instruction hot path: appending records to a thread's
//! channels. The sink discards the bytes so that only buffering and the
//! occasional flush hand-off are timed.
//!
//! ```bash
//! cargo bench --bench channel_append
//! ```

use std::io;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use insntrace::channel::Channel;
use insntrace::records::{Direction, InsnRef, MemFile};
use insntrace::regfile::Amd64RegFile;

fn null_sink(bytes: &[u8]) -> io::Result<()> {
    black_box(bytes.len());
    Ok(())
}

/// Benchmark: one instruction reference per iteration
fn bench_insn_push(c: &mut Criterion) {
    let mut channel: Channel<InsnRef, _> = Channel::with_records(8192, null_sink).unwrap();
    let mut pc = 0u64;

    c.bench_function("insn_push", |b| {
        b.iter(|| {
            channel.push(black_box(InsnRef { pc })).unwrap();
            pc = pc.wrapping_add(4);
        });
    });
}

/// Benchmark: filling a register snapshot in place
fn bench_regfile_slot(c: &mut Criterion) {
    let mut channel: Channel<Amd64RegFile, _> = Channel::with_records(8192, null_sink).unwrap();
    let mut rip = 0u64;

    c.bench_function("regfile_next_slot", |b| {
        b.iter(|| {
            let slot = channel.next_slot().unwrap();
            slot.gpr.rip = black_box(rip);
            rip = rip.wrapping_add(4);
        });
    });
}

/// Benchmark: memory detail append with varying buffer capacity
///
/// Smaller buffers hand off to the sink more often.
fn bench_memfile_push_varying_capacity(c: &mut Criterion) {
    let mut group = c.benchmark_group("memfile_push_capacity");

    for records in [64, 1024, 8192, 65536] {
        group.bench_with_input(
            BenchmarkId::from_parameter(records),
            &records,
            |b, &records| {
                let mut channel: Channel<MemFile, _> =
                    Channel::with_records(records, null_sink).unwrap();
                let mut i = 0u64;

                b.iter(|| {
                    let record = MemFile::new(i, 0x7000 + i, 8, i, Direction::Write);
                    channel.push(black_box(record)).unwrap();
                    i += 1;
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_insn_push,
    bench_regfile_slot,
    bench_memfile_push_varying_capacity
);
criterion_main!(benches);
