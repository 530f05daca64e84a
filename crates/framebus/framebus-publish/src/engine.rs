use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use framebus_frame::FrameRecord;
use tracing::{debug, info, warn};

use crate::PublishError;
use crate::pacer::Pacer;
use crate::sink::{FrameSink, SinkOutcome};

/// Source of the frames a [`PublishEngine`] sends.
pub trait FrameProducer: Send {
    fn produce(&mut self, frame_number: u32) -> Result<FrameRecord, PublishError>;
}

#[derive(Debug, Clone, Copy)]
pub struct EngineOptions {
    pub frame_rate_num: u32,
    pub frame_rate_den: u32,
    /// Stop by itself after this many frames.
    pub max_frames: Option<u64>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            frame_rate_num: 25,
            frame_rate_den: 1,
            max_frames: None,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PublishStats {
    pub published: u64,
    pub dropped: u64,
    /// Deadlines that had already passed when the frame went out.
    pub late: u64,
}

/// Falling this far behind abandons the old cadence instead of bursting.
const MAX_LATENESS: Duration = Duration::from_secs(1);

/// Owns the write thread: produce, publish, pace, repeat.
pub struct PublishEngine {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<Result<PublishStats, PublishError>>>,
}

impl PublishEngine {
    pub fn spawn<S, P>(sink: S, producer: P, options: EngineOptions) -> Result<Self, PublishError>
    where
        S: FrameSink + 'static,
        P: FrameProducer + 'static,
    {
        // Validate the rate before a thread exists.
        Pacer::new(options.frame_rate_num, options.frame_rate_den)?;

        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let handle = thread::Builder::new()
            .name("framebus-write".into())
            .spawn(move || write_loop(sink, producer, options, &flag))
            .map_err(PublishError::Spawn)?;

        Ok(Self {
            running,
            handle: Some(handle),
        })
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(|h| h.is_finished())
    }

    /// Asks the write thread to stop after the current frame and joins it.
    pub fn stop(&mut self) -> Result<PublishStats, PublishError> {
        self.running.store(false, Ordering::Release);
        self.join()
    }

    /// Joins without asking the thread to stop; for `max_frames` runs.
    pub fn join(&mut self) -> Result<PublishStats, PublishError> {
        match self.handle.take() {
            Some(h) => h.join().map_err(|_| PublishError::WorkerPanicked)?,
            None => Ok(PublishStats::default()),
        }
    }
}

impl Drop for PublishEngine {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn write_loop<S: FrameSink, P: FrameProducer>(
    mut sink: S,
    mut producer: P,
    options: EngineOptions,
    running: &AtomicBool,
) -> Result<PublishStats, PublishError> {
    let mut pacer = Pacer::new(options.frame_rate_num, options.frame_rate_den)?;
    let mut stats = PublishStats::default();
    let mut frame_number: u32 = 0;
    let mut sent: u64 = 0;
    let mut window_start = Instant::now();
    let mut window_count = 0u64;

    info!(
        fps_num = options.frame_rate_num,
        fps_den = options.frame_rate_den,
        "publishing"
    );

    while running.load(Ordering::Acquire) && options.max_frames.is_none_or(|max| sent < max) {
        let record = producer.produce(frame_number)?;
        match sink.publish(&record)? {
            SinkOutcome::Written => stats.published += 1,
            SinkOutcome::Dropped => {
                stats.dropped += 1;
                debug!(frame = frame_number, "frame dropped");
            }
        }
        frame_number = frame_number.wrapping_add(1);
        sent += 1;
        window_count += 1;

        if let Some(late) = pacer.wait() {
            stats.late += 1;
            if late > MAX_LATENESS {
                warn!(?late, "fell behind, resetting cadence");
                pacer.resync();
            }
        }

        if window_start.elapsed() >= Duration::from_secs(1) {
            info!(
                rate = window_count as f64 / window_start.elapsed().as_secs_f64(),
                published = stats.published,
                dropped = stats.dropped,
                "publish rate"
            );
            window_start = Instant::now();
            window_count = 0;
        }
    }

    debug!(?stats, "write thread exiting");
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TestPattern;
    use framebus_frame::{AudioFormat, ImageFormat, StreamFormat};
    use framebus_icc::{CreatePolicy, IccError, SlotReader, SlotWriter};
    use std::sync::Mutex;

    fn fmt() -> StreamFormat {
        StreamFormat {
            image_format: ImageFormat::Rgb24,
            width: 4,
            height: 4,
            audio_format: AudioFormat::S16,
            samples: 4,
            frame_rate_num: 500,
            frame_rate_den: 1,
            ..StreamFormat::default()
        }
    }

    /// Records frame numbers; drops every third frame.
    struct Collect(Arc<Mutex<Vec<u32>>>);

    impl FrameSink for Collect {
        fn publish(&mut self, record: &FrameRecord) -> Result<SinkOutcome, IccError> {
            self.0.lock().unwrap().push(record.frame_number());
            Ok(if record.frame_number() % 3 == 2 {
                SinkOutcome::Dropped
            } else {
                SinkOutcome::Written
            })
        }
    }

    #[test]
    fn bounded_run_counts_published_and_dropped() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut engine = PublishEngine::spawn(
            Collect(Arc::clone(&seen)),
            TestPattern::new(fmt()),
            EngineOptions {
                frame_rate_num: 500,
                frame_rate_den: 1,
                max_frames: Some(9),
            },
        )
        .unwrap();
        let stats = engine.join().unwrap();
        assert_eq!(stats.published, 6);
        assert_eq!(stats.dropped, 3);
        assert_eq!(*seen.lock().unwrap(), (0..9).collect::<Vec<_>>());
    }

    #[test]
    fn stop_ends_an_unbounded_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("slot");
        let writer = SlotWriter::create(&path, fmt(), CreatePolicy::Truncate).unwrap();
        let mut reader = SlotReader::open(&path).unwrap();

        let mut engine =
            PublishEngine::spawn(writer, TestPattern::new(fmt()), EngineOptions {
                frame_rate_num: 500,
                frame_rate_den: 1,
                max_frames: None,
            })
            .unwrap();
        let first = reader.read_latest(None).unwrap().unwrap();
        assert_eq!(first.record.stream_format().unwrap(), fmt());

        let stats = engine.stop().unwrap();
        assert!(stats.published >= 1);
        assert!(engine.is_finished());
    }

    #[test]
    fn producer_error_ends_the_thread_with_it() {
        struct Broken;
        impl FrameProducer for Broken {
            fn produce(&mut self, _: u32) -> Result<FrameRecord, PublishError> {
                Err(PublishError::InvalidRate { num: 0, den: 0 })
            }
        }
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut engine =
            PublishEngine::spawn(Collect(seen), Broken, EngineOptions::default()).unwrap();
        assert!(matches!(engine.join(), Err(PublishError::InvalidRate { .. })));
    }
}
