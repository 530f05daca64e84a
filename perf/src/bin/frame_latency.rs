//! Publish-to-receive latency of one frame through each transport.
//!
//! The writer stamps a monotonic timestamp into the image bytes right before
//! publishing; the reader subtracts it from its own clock after the copy out
//! of shared memory completes.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use framebus_icc::{Broker, BrokerClient, BrokerConfig, CreatePolicy, SlotReader, SlotWriter};
use framebus_perf::{
    LatencySummary, bench_format, make_frame, mono_now_ns, print_result_row, print_table_header,
    read_stamp, stamp, temp_shm_path,
};

const FRAMES: u32 = 2_000;
const GAP: Duration = Duration::from_micros(500);

fn slot_latency() -> Vec<u64> {
    let path = temp_shm_path("lat_slot");
    let format = bench_format();
    let mut writer =
        SlotWriter::create(&path, format, CreatePolicy::Truncate).expect("create slot");
    let mut reader = SlotReader::open(&path).expect("open slot");

    let consumer = thread::spawn(move || {
        let mut samples = Vec::with_capacity(FRAMES as usize);
        let mut last = None;
        while let Ok(Some(latest)) = reader.read_latest(last) {
            samples.push(mono_now_ns().saturating_sub(read_stamp(&latest.record)));
            last = Some(latest.record.frame_number());
        }
        samples
    });

    let frames: Vec<_> = (0..FRAMES).map(|n| make_frame(format, n)).collect();
    for f in &frames {
        writer.publish(&stamp(f)).expect("publish");
        thread::sleep(GAP);
    }
    writer.close().expect("close");
    let samples = consumer.join().expect("consumer thread");
    let _ = std::fs::remove_file(&path);
    samples
}

fn broker_latency() -> Vec<u64> {
    let format = bench_format();
    let broker = Arc::new(
        Broker::bind(BrokerConfig {
            socket_path: temp_shm_path("lat_sock").into(),
            arena_path: temp_shm_path("lat_arena").into(),
            format,
            ..BrokerConfig::default()
        })
        .expect("bind broker"),
    );
    let shutdown = broker.shutdown_handle().expect("shutdown handle");
    let event_loop = {
        let broker = Arc::clone(&broker);
        thread::spawn(move || broker.run_event_loop())
    };

    let mut client = BrokerClient::connect(broker.socket_path(), Some(&format)).expect("connect");
    while broker.client_count() == 0 {
        thread::sleep(Duration::from_millis(1));
    }
    let consumer = thread::spawn(move || {
        let mut samples = Vec::with_capacity(FRAMES as usize);
        while let Ok(record) = client.recv() {
            samples.push(mono_now_ns().saturating_sub(read_stamp(&record)));
        }
        samples
    });

    let frames: Vec<_> = (0..FRAMES).map(|n| make_frame(format, n)).collect();
    for f in &frames {
        broker.publish(&stamp(f)).expect("publish");
        thread::sleep(GAP);
    }
    shutdown.trigger();
    let _ = event_loop.join();
    drop(broker);
    consumer.join().expect("consumer thread")
}

fn main() {
    println!("\n  {FRAMES} frames of {} bytes, {GAP:?} apart\n", bench_format().record_size());
    print_table_header();
    for (name, samples) in [("slot", slot_latency()), ("broker", broker_latency())] {
        match LatencySummary::from_samples(samples) {
            Some(summary) => print_result_row(name, &summary),
            None => println!("  {name:<30} no frames received"),
        }
    }
}
