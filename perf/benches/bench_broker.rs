use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use framebus_icc::{Broker, BrokerConfig};
use framebus_perf::{bench_format, make_frame, temp_shm_path};

fn config(label: &str) -> BrokerConfig {
    BrokerConfig {
        socket_path: temp_shm_path(&format!("{label}_sock")).into(),
        arena_path: temp_shm_path(&format!("{label}_arena")).into(),
        format: bench_format(),
        ..BrokerConfig::default()
    }
}

fn bench_publish_no_clients(c: &mut Criterion) {
    let broker = Broker::bind(config("broker_pub")).expect("bind broker");
    let record = make_frame(bench_format(), 0);

    let mut group = c.benchmark_group("broker");
    group.throughput(Throughput::Bytes(record.encoded_len() as u64));
    // Allocate, copy into the arena, release straight away.
    group.bench_function("publish (no clients)", |b| {
        b.iter(|| black_box(broker.publish(black_box(&record)).unwrap()));
    });
}

fn bench_allocate_release(c: &mut Criterion) {
    let broker = Broker::bind(config("broker_alloc")).expect("bind broker");
    let size = bench_format().record_size();

    let mut group = c.benchmark_group("broker");
    group.throughput(Throughput::Elements(1));
    group.bench_function("allocate + release", |b| {
        b.iter(|| {
            let block = broker.allocate(size).unwrap();
            black_box(broker.release(block).unwrap());
        });
    });
}

criterion_group!(benches, bench_publish_no_clients, bench_allocate_release);
criterion_main!(benches);
