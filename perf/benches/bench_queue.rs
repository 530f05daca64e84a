use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use framebus_ingest::{FrameQueue, SequenceTracker};

fn bench_push_pop(c: &mut Criterion) {
    let queue = FrameQueue::new(25).unwrap();

    let mut group = c.benchmark_group("queue");
    group.throughput(Throughput::Elements(1));
    group.bench_function("push_back + pop_front", |b| {
        b.iter(|| {
            queue.push_back(black_box(1u64), true).unwrap();
            black_box(queue.pop_front());
        });
    });
}

fn bench_flush(c: &mut Criterion) {
    let queue = FrameQueue::new(25).unwrap();

    let mut group = c.benchmark_group("queue");
    group.bench_function("discontinuity flush (24 queued)", |b| {
        b.iter_custom(|iters| {
            let mut total = std::time::Duration::ZERO;
            for _ in 0..iters {
                for i in 0..24u64 {
                    queue.push_back(i, true).unwrap();
                }
                let start = std::time::Instant::now();
                black_box(queue.push_back(99, false).unwrap());
                total += start.elapsed();
                queue.pop_front();
            }
            total
        });
    });
}

fn bench_sequence(c: &mut Criterion) {
    let mut tracker = SequenceTracker::new();
    let mut n = 0u32;
    c.bench_function("sequence observe", |b| {
        b.iter(|| {
            n = n.wrapping_add(1);
            black_box(tracker.observe(n))
        });
    });
}

criterion_group!(benches, bench_push_pop, bench_flush, bench_sequence);
criterion_main!(benches);
