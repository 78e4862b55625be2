use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use mindad::tape::{RestoreTarget, TapeScalar, TapeValue};
use mindad::{Interval, SmartTape};

struct Heap(Vec<f64>);

impl RestoreTarget for Heap {
    fn write_back(&mut self, start: usize, value: &TapeValue) {
        for (i, s) in value.scalars().iter().enumerate() {
            if let TapeScalar::F64(v) = s {
                self.0[start + i] = *v;
            }
        }
    }
}

fn bench_points(c: &mut Criterion) {
    let mut group = c.benchmark_group("tape_points");

    for size in [64usize, 1024, 16384] {
        group.bench_with_input(BenchmarkId::new("store_restore", size), &size, |b, &size| {
            let mut heap = Heap(vec![1.0; size]);
            b.iter(|| {
                let mut tape = SmartTape::new();
                // Stride through memory so inserts land all over the tape.
                for k in 0..size {
                    let addr = (k * 7919) % size;
                    let value = TapeValue::Scalar(TapeScalar::F64(heap.0[addr]));
                    tape.store(Interval::point(addr), value).expect("store");
                }
                tape.restore(black_box(&mut heap));
            });
        });
    }

    group.finish();
}

fn bench_ranges(c: &mut Criterion) {
    let mut group = c.benchmark_group("tape_ranges");

    for width in [4usize, 64] {
        group.bench_with_input(BenchmarkId::new("covered_points", width), &width, |b, &width| {
            let size = 4096;
            let mut heap = Heap(vec![2.0; size]);
            b.iter(|| {
                let mut tape = SmartTape::new();
                for start in (0..size).step_by(width) {
                    let snapshot = heap.0[start..start + width]
                        .iter()
                        .map(|v| TapeScalar::F64(*v))
                        .collect();
                    let interval = Interval::range(start, start + width);
                    tape.store(interval, TapeValue::Aggregate(snapshot)).expect("store");
                }
                for addr in 0..size {
                    black_box(tape.contains(Interval::point(addr)).expect("contains"));
                }
                tape.restore(&mut heap);
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_points, bench_ranges);
criterion_main!(benches);
