//! Broker and client behaviour over a real socket and arena.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use framebus_frame::{AudioFormat, FrameRecord, ImageFormat, StreamFormat};
use framebus_icc::{
    Broker, BrokerClient, BrokerConfig, ClientId, HELLO_TIMEOUT, IccError, PublishOutcome,
};

fn format() -> StreamFormat {
    StreamFormat {
        image_format: ImageFormat::Yuv420p,
        width: 16,
        height: 8,
        audio_format: AudioFormat::S16,
        frequency: 48_000,
        channels: 2,
        samples: 32,
        frame_rate_num: 25,
        frame_rate_den: 1,
    }
}

fn frame(n: u32) -> FrameRecord {
    let f = format();
    FrameRecord::new(
        n,
        &f,
        vec![n as u8; f.image_size() as usize],
        vec![(n >> 8) as u8; f.audio_size() as usize],
    )
    .unwrap()
}

fn config(dir: &tempfile::TempDir, block_count: u32, max_pending: usize) -> BrokerConfig {
    BrokerConfig {
        socket_path: dir.path().join("bus.sock"),
        arena_path: dir.path().join("arena.shm"),
        format: format(),
        block_count,
        max_pending,
    }
}

/// Polls `cond` until it holds or a generous deadline passes.
fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(2));
    }
}

/// Connects a client on a helper thread while this thread accepts it.
fn connect_manually(broker: &Broker) -> (ClientId, BrokerClient) {
    let path = broker.socket_path().to_path_buf();
    let expected = format();
    let handle = thread::spawn(move || BrokerClient::connect(&path, Some(&expected)).unwrap());
    let mut id = None;
    wait_for("accept", || {
        id = broker.accept().unwrap();
        id.is_some()
    });
    (id.unwrap(), handle.join().unwrap())
}

#[test]
fn every_client_receives_each_frame() {
    let dir = tempfile::tempdir().unwrap();
    let broker = Arc::new(Broker::bind(config(&dir, 8, 8)).unwrap());
    let shutdown = broker.shutdown_handle().unwrap();
    let event_loop = {
        let broker = Arc::clone(&broker);
        thread::spawn(move || broker.run_event_loop())
    };

    let sock = broker.socket_path().to_path_buf();
    let mut a = BrokerClient::connect(&sock, Some(&format())).unwrap();
    let mut b = BrokerClient::connect(&sock, None).unwrap();
    wait_for("two clients", || broker.client_count() == 2);

    for n in 0..5 {
        assert_eq!(broker.publish(&frame(n)).unwrap(), PublishOutcome::Delivered(2));
        assert_eq!(a.recv().unwrap(), frame(n));
        assert_eq!(b.recv().unwrap(), frame(n));
    }

    wait_for("acks to free every block", || broker.arena().free_blocks() == 8);

    shutdown.trigger();
    event_loop.join().unwrap().unwrap();
}

#[test]
fn hangup_releases_everything_the_client_held() {
    let dir = tempfile::tempdir().unwrap();
    let broker = Arc::new(Broker::bind(config(&dir, 6, 8)).unwrap());
    let shutdown = broker.shutdown_handle().unwrap();
    let event_loop = {
        let broker = Arc::clone(&broker);
        thread::spawn(move || broker.run_event_loop())
    };

    let sock = broker.socket_path().to_path_buf();
    let mut reader = BrokerClient::connect(&sock, None).unwrap();
    let lazy = BrokerClient::connect(&sock, None).unwrap();
    wait_for("two clients", || broker.client_count() == 2);

    for n in 0..3 {
        assert_eq!(broker.publish(&frame(n)).unwrap(), PublishOutcome::Delivered(2));
        reader.recv().unwrap();
    }
    // The reader acked everything; the lazy client still pins three blocks.
    wait_for("reader acks", || broker.arena().free_blocks() == 3);

    drop(lazy);
    wait_for("lazy client removed", || broker.client_count() == 1);
    assert_eq!(broker.arena().free_blocks(), 6);

    shutdown.trigger();
    event_loop.join().unwrap().unwrap();
}

#[test]
fn explicit_disconnect_releases_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let broker = Broker::bind(config(&dir, 4, 8)).unwrap();
    let (id, _client) = connect_manually(&broker);

    broker.publish(&frame(1)).unwrap();
    broker.publish(&frame(2)).unwrap();
    assert_eq!(broker.arena().free_blocks(), 2);

    assert_eq!(broker.disconnect(id).unwrap(), 2);
    assert_eq!(broker.arena().free_blocks(), 4);
    assert!(matches!(broker.disconnect(id), Err(IccError::UnknownClient(_))));
    assert_eq!(broker.arena().free_blocks(), 4);
}

#[test]
fn exhausted_arena_drops_frames() {
    let dir = tempfile::tempdir().unwrap();
    let broker = Broker::bind(config(&dir, 2, 8)).unwrap();
    let (_id, _client) = connect_manually(&broker);

    assert_eq!(broker.publish(&frame(0)).unwrap(), PublishOutcome::Delivered(1));
    assert_eq!(broker.publish(&frame(1)).unwrap(), PublishOutcome::Delivered(1));
    assert_eq!(broker.publish(&frame(2)).unwrap(), PublishOutcome::Dropped);
}

#[test]
fn frames_without_recipients_free_immediately() {
    let dir = tempfile::tempdir().unwrap();
    let broker = Broker::bind(config(&dir, 2, 8)).unwrap();
    for n in 0..10 {
        assert_eq!(broker.publish(&frame(n)).unwrap(), PublishOutcome::NoClients);
    }
    assert_eq!(broker.arena().free_blocks(), 2);
}

#[test]
fn saturated_client_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let broker = Broker::bind(config(&dir, 4, 1)).unwrap();
    let (id, mut client) = connect_manually(&broker);

    assert_eq!(broker.publish(&frame(0)).unwrap(), PublishOutcome::Delivered(1));
    assert_eq!(broker.publish(&frame(1)).unwrap(), PublishOutcome::NoClients);

    // Consume and ack by hand, then the client has room again.
    assert_eq!(client.recv().unwrap().frame_number(), 0);
    let block_id = (0..4)
        .find(|&b| broker.arena().refcount(b).unwrap() == 1)
        .unwrap();
    broker.client_ack(id, block_id).unwrap();
    assert_eq!(broker.publish(&frame(2)).unwrap(), PublishOutcome::Delivered(1));
}

#[test]
fn bogus_ack_disconnects_only_the_offender() {
    let dir = tempfile::tempdir().unwrap();
    let broker = Broker::bind(config(&dir, 4, 8)).unwrap();
    let (good, _g) = connect_manually(&broker);
    let (bad, _b) = connect_manually(&broker);

    broker.publish(&frame(0)).unwrap();
    assert!(matches!(broker.client_ack(bad, 3), Err(IccError::Protocol(_))));
    assert_eq!(broker.client_count(), 1);
    assert!(matches!(broker.client_ack(bad, 0), Err(IccError::UnknownClient(_))));
    assert!(matches!(broker.disconnect(good), Ok(1)));
}

#[test]
fn format_mismatch_is_refused_at_connect() {
    let dir = tempfile::tempdir().unwrap();
    let broker = Broker::bind(config(&dir, 2, 8)).unwrap();
    let path = broker.socket_path().to_path_buf();
    let want = StreamFormat {
        height: 9,
        ..format()
    };
    let handle = thread::spawn(move || BrokerClient::connect(&path, Some(&want)));
    wait_for("accept", || broker.accept().unwrap().is_some());
    match handle.join().unwrap() {
        Err(IccError::FormatMismatch(m)) => assert_eq!(m.field, "height"),
        Err(e) => panic!("unexpected error: {e}"),
        Ok(_) => panic!("mismatched client was accepted"),
    }
}

#[test]
fn stale_socket_file_is_replaced() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(&dir, 2, 8);
    let first = Broker::bind(cfg.clone()).unwrap();
    // Simulate a crash: the socket file survives the broker.
    std::mem::forget(first);
    assert!(cfg.socket_path.exists());
    let second = Broker::bind(cfg).unwrap();
    let (_id, _client) = connect_manually(&second);
}

#[test]
fn silent_broker_times_out_the_handshake() {
    let dir = tempfile::tempdir().unwrap();
    // Bound, but nothing ever accepts or greets.
    let broker = Broker::bind(config(&dir, 2, 8)).unwrap();
    let started = Instant::now();
    match BrokerClient::connect(broker.socket_path(), Some(&format())) {
        Err(IccError::HandshakeTimeout { timeout, .. }) => assert_eq!(timeout, HELLO_TIMEOUT),
        Err(e) => panic!("unexpected error: {e}"),
        Ok(_) => panic!("connected without a hello"),
    }
    let waited = started.elapsed();
    assert!(waited < HELLO_TIMEOUT * 3, "handshake took {waited:?}");
}
