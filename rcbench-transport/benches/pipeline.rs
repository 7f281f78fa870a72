// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use rcbench_transport::{pipeline, CancelToken, Res, WorkQueue};

/// Completes everything outstanding on each poll, so the benchmark
/// measures the bookkeeping of the loop itself.
struct InstantQueue {
    depth: u32,
    outstanding: u32,
}

impl WorkQueue for InstantQueue {
    fn depth(&self) -> u32 {
        self.depth
    }

    fn submit(&mut self, count: u32) -> Res<()> {
        self.outstanding += count;
        Ok(())
    }

    fn poll(&mut self) -> Res<usize> {
        let n = self.outstanding;
        self.outstanding = 0;
        Ok(n as usize)
    }
}

fn benchmark_pipelined(c: &mut Criterion) {
    const COUNT: u64 = 100_000;
    let cancel = CancelToken::default();
    let mut group = c.benchmark_group("pipelined");
    group.throughput(Throughput::Elements(COUNT));
    for depth in [4_u32, 100, 1000] {
        group.bench_function(format!("depth {depth}"), |b| {
            b.iter(|| {
                let mut q = InstantQueue {
                    depth,
                    outstanding: 0,
                };
                pipeline::run_pipelined(&mut q, COUNT, 0, &cancel).unwrap();
            });
        });
    }
    group.finish();
}

criterion_group!(benches, benchmark_pipelined);
criterion_main!(benches);
