use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, anyhow};
use framebus_config::{SlotPolicy, Transport, WriterConfig};
use framebus_icc::{Broker, BrokerConfig, CreatePolicy, SlotWriter};
use framebus_publish::{EngineOptions, PublishEngine, PublishStats, TestPattern};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn load_config() -> anyhow::Result<WriterConfig> {
    match std::env::args().nth(1) {
        Some(path) => WriterConfig::load(&path).with_context(|| format!("loading {path}")),
        None => Ok(WriterConfig::from_toml_str("")?),
    }
}

/// Runs until the engine finishes on its own or a shutdown signal arrives.
fn run_until_signal(mut engine: PublishEngine) -> anyhow::Result<PublishStats> {
    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    while !engine.is_finished() {
        if let Some(sig) = signals.pending().next() {
            info!(signal = sig, "shutting down");
            break;
        }
        thread::sleep(Duration::from_millis(100));
    }
    Ok(engine.stop()?)
}

fn main() -> anyhow::Result<()> {
    let config = load_config()?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&config.log_level))
        .init();

    let format = config.stream.to_format();
    let options = EngineOptions {
        frame_rate_num: format.frame_rate_num,
        frame_rate_den: format.frame_rate_den,
        max_frames: config
            .duration_secs
            .map(|s| s * format.frame_rate_num as u64 / format.frame_rate_den as u64),
    };
    let pattern = TestPattern::new(format);

    let stats = match config.transport {
        Transport::Slot => {
            let policy = match config.slot_policy {
                SlotPolicy::Truncate => CreatePolicy::Truncate,
                SlotPolicy::Attach => CreatePolicy::Attach,
            };
            // A truncating writer owns the name; an attached one shares it.
            let writer = SlotWriter::create(&config.slot_path, format, policy)
                .with_context(|| format!("creating slot {}", config.slot_path.display()))?
                .unlink_on_drop(policy == CreatePolicy::Truncate);
            info!(path = %config.slot_path.display(), bytes = writer.capacity(), "slot ready");
            run_until_signal(PublishEngine::spawn(writer, pattern, options)?)?
        }
        Transport::Broker => {
            let broker = Arc::new(Broker::bind(BrokerConfig {
                socket_path: config.socket_path.clone(),
                arena_path: config.arena_path.clone(),
                format,
                block_count: config.block_count,
                max_pending: config.max_pending,
            })?);
            let shutdown = broker.shutdown_handle()?;
            let event_loop = {
                let broker = Arc::clone(&broker);
                thread::Builder::new()
                    .name("framebus-broker".into())
                    .spawn(move || broker.run_event_loop())?
            };

            let engine = PublishEngine::spawn(Arc::clone(&broker), pattern, options)?;
            let stats = run_until_signal(engine);
            shutdown.trigger();
            event_loop
                .join()
                .map_err(|_| anyhow!("broker event loop panicked"))??;
            stats?
        }
    };

    info!(
        published = stats.published,
        dropped = stats.dropped,
        late = stats.late,
        "writer finished"
    );
    Ok(())
}
