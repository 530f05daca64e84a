use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use framebus_icc::{CreatePolicy, SlotReader, SlotWriter};
use framebus_perf::{bench_format, make_frame, temp_shm_path};

fn bench_publish(c: &mut Criterion) {
    let path = temp_shm_path("slot_pub");
    let mut writer =
        SlotWriter::create(&path, bench_format(), CreatePolicy::Truncate).expect("create slot");
    let record = make_frame(bench_format(), 0);

    let mut group = c.benchmark_group("slot");
    group.throughput(Throughput::Bytes(record.encoded_len() as u64));
    group.bench_function("publish", |b| {
        b.iter(|| writer.publish(black_box(&record)).unwrap());
    });

    drop(group);
    drop(writer);
    let _ = std::fs::remove_file(&path);
}

fn bench_read_latest(c: &mut Criterion) {
    let path = temp_shm_path("slot_read");
    let mut writer =
        SlotWriter::create(&path, bench_format(), CreatePolicy::Truncate).expect("create slot");
    let mut reader = SlotReader::open(&path).expect("open slot");
    writer.publish(&make_frame(bench_format(), 7)).unwrap();

    let mut group = c.benchmark_group("slot");
    group.throughput(Throughput::Elements(1));
    // A different last_seen every time, so each read copies the frame.
    group.bench_function("read_latest (copy)", |b| {
        b.iter(|| black_box(reader.read_latest(Some(0)).unwrap()));
    });

    drop(group);
    drop(reader);
    drop(writer);
    let _ = std::fs::remove_file(&path);
}

criterion_group!(benches, bench_publish, bench_read_latest);
criterion_main!(benches);
