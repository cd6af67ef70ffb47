//! Loader and replay benchmarks.

use std::fmt::Write as _;
use std::os::unix::net::UnixStream;
use std::thread;

use allocutil_core::{Address, ReplayAllocator, Trace, replay, serve};
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};

/// Alternating allocate/free script over `blocks` indices.
fn synthetic_trace(blocks: usize) -> String {
    let mut text = format!("1\n{blocks}\n{}\n{}\n", blocks * 2, blocks * 64);
    for i in 0..blocks {
        let _ = writeln!(text, "a {i} {}", 16 + (i % 7) * 8);
    }
    for i in 0..blocks {
        let _ = writeln!(text, "f {i}");
    }
    text
}

struct CountingAllocator(usize);

impl ReplayAllocator for CountingAllocator {
    fn allocate(&mut self, size: usize) -> Address {
        self.0 += size.max(1);
        Address::from_raw(self.0)
    }

    fn reallocate(&mut self, _old: Address, size: usize) -> Address {
        self.allocate(size)
    }

    fn free(&mut self, _address: Address) {}
}

fn bench_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse_trace");
    for &blocks in &[100usize, 1_000, 10_000] {
        let text = synthetic_trace(blocks);
        group.bench_with_input(BenchmarkId::from_parameter(blocks), &text, |b, text| {
            b.iter(|| {
                let trace: Trace = text.parse().expect("valid trace");
                criterion::black_box(trace);
            });
        });
    }
    group.finish();
}

fn bench_socket_replay(c: &mut Criterion) {
    let mut group = c.benchmark_group("socket_replay");
    group.sample_size(20);
    for &blocks in &[100usize, 1_000] {
        let mut trace: Trace = synthetic_trace(blocks).parse().expect("valid trace");
        group.bench_function(BenchmarkId::from_parameter(blocks), |b| {
            b.iter(|| {
                let (mut ours, mut theirs) = UnixStream::pair().expect("socketpair");
                let server =
                    thread::spawn(move || serve(&mut theirs, &mut CountingAllocator(0x1000)));
                let out = replay(&mut trace, &mut ours, |_| {}).expect("replay");
                drop(ours);
                let _ = server.join();
                criterion::black_box(out);
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_parse, bench_socket_replay);
criterion_main!(benches);
