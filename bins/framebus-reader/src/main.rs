use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use framebus_config::{ReaderConfig, Transport};
use framebus_ingest::{BrokerConnector, Connector, FrameSource, SlotConnector, SourceOptions};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::{Handle, Signals};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn load_config() -> anyhow::Result<ReaderConfig> {
    match std::env::args().nth(1) {
        Some(path) => ReaderConfig::load(&path).with_context(|| format!("loading {path}")),
        None => Ok(ReaderConfig::from_toml_str("")?),
    }
}

const WATCH_INTERVAL: Duration = Duration::from_millis(100);

/// Pulls frames until the source is shut down.
fn drain(source: &FrameSource) {
    let mut last: Option<u32> = None;
    let mut total = 0u64;
    let mut window_start = Instant::now();
    let mut window_count = 0u64;

    while let Some(frame) = source.next_frame() {
        let n = frame.frame_number();
        if last.is_some_and(|prev| prev.wrapping_add(1) != n) {
            warn!(prev = ?last, frame = n, "discontinuity");
        }
        last = Some(n);
        total += 1;
        window_count += 1;

        if window_start.elapsed() >= Duration::from_secs(1) {
            info!(
                rate = window_count as f64 / window_start.elapsed().as_secs_f64(),
                frame = n,
                queued = source.queued(),
                link = ?source.link_state(),
                "read rate"
            );
            window_start = Instant::now();
            window_count = 0;
        }
    }
    info!(total, "reader finished");
}

/// Returns on a shutdown signal, once `deadline` passes, or when `handle`
/// is closed, whether or not frames are flowing.
fn watch(signals: &mut Signals, handle: &Handle, deadline: Option<Instant>) {
    while !handle.is_closed() {
        if let Some(sig) = signals.pending().next() {
            info!(signal = sig, "shutting down");
            return;
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            info!("run duration reached");
            return;
        }
        thread::sleep(WATCH_INTERVAL);
    }
}

fn run<C: Connector>(connector: C, config: &ReaderConfig) -> anyhow::Result<()> {
    let describe = connector.describe();
    let options = SourceOptions {
        queue_capacity: config.queue_capacity,
        prime: config.prime,
        retry_interval: Duration::from_millis(config.retry_ms),
    };
    let source = Arc::new(
        FrameSource::spawn(connector, options)
            .with_context(|| format!("connecting to {describe}"))?,
    );

    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    let handle = signals.handle();
    let deadline = config
        .duration_secs
        .map(|s| Instant::now() + Duration::from_secs(s));
    let watcher = {
        let source = Arc::clone(&source);
        let handle = handle.clone();
        thread::spawn(move || {
            watch(&mut signals, &handle, deadline);
            source.shutdown();
        })
    };

    drain(&source);

    // Ends the watcher when the drain finished on its own.
    handle.close();
    let _ = watcher.join();
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let config = load_config()?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&config.log_level))
        .init();

    let expected = config.expected_format();
    match config.transport {
        Transport::Slot => run(
            SlotConnector {
                path: config.slot_path.clone(),
                expected,
            },
            &config,
        ),
        Transport::Broker => run(
            BrokerConnector {
                socket_path: config.socket_path.clone(),
                expected,
            },
            &config,
        ),
    }
}
