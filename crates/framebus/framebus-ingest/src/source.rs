use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use framebus_frame::FrameRecord;
use tracing::info;

use crate::channel::{ChannelError, Connector, FrameChannel};
use crate::queue::{FrameQueue, QueueError};
use crate::supervisor::{LinkState, Supervisor, SupervisorControl};

#[derive(Debug, Clone, Copy)]
pub struct SourceOptions {
    pub queue_capacity: usize,
    /// Frames to accumulate before the first pull, and after every flush.
    pub prime: usize,
    pub retry_interval: Duration,
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self {
            queue_capacity: 25,
            prime: 0,
            retry_interval: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("invalid queue settings")]
    Queue(#[from] QueueError),

    #[error("initial connection failed")]
    Channel(#[from] ChannelError),
}

/// A producer connection plus its read thread and frame queue.
///
/// The first connection is made synchronously and its failure is returned
/// to the caller. After that, link problems are handled on the read thread
/// and never surface through [`FrameSource::next_frame`].
pub struct FrameSource {
    queue: Arc<FrameQueue<FrameRecord>>,
    control: Arc<SupervisorControl>,
    reader: Option<JoinHandle<()>>,
}

impl FrameSource {
    pub fn spawn<C: Connector>(
        mut connector: C,
        options: SourceOptions,
    ) -> Result<Self, SourceError> {
        let queue = Arc::new(FrameQueue::with_prime(options.queue_capacity, options.prime)?);
        let control = Arc::new(SupervisorControl::new());

        control.link().begin_connect();
        let channel = match connector.connect() {
            Ok(ch) => ch,
            Err(e) => {
                control.link().connect_failed();
                return Err(e.into());
            }
        };
        control.install(channel.interrupter()?);
        control.link().connected();
        info!(source = %connector.describe(), "connected to producer");

        let supervisor = Supervisor::new(
            connector,
            Arc::clone(&queue),
            Arc::clone(&control),
            options.retry_interval,
        );
        let reader = thread::Builder::new()
            .name("framebus-read".into())
            .spawn(move || supervisor.run(channel))
            .map_err(ChannelError::Spawn)?;

        Ok(Self {
            queue,
            control,
            reader: Some(reader),
        })
    }

    /// Blocks for the next frame. `None` only after [`FrameSource::close`].
    pub fn next_frame(&self) -> Option<FrameRecord> {
        self.queue.pop_front()
    }

    pub fn try_next_frame(&self) -> Option<FrameRecord> {
        self.queue.try_pop_front()
    }

    pub fn link_state(&self) -> LinkState {
        self.control.link_state()
    }

    /// Frames waiting to be pulled.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Wakes everything blocked on this source and tells the read thread to
    /// exit, without waiting for it. Callable from any thread.
    pub fn shutdown(&self) {
        self.control.stop();
        self.queue.close();
    }

    /// Stops the read thread and joins it.
    pub fn close(&mut self) {
        self.shutdown();
        if let Some(handle) = self.reader.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Interrupter;
    use framebus_frame::{AudioFormat, ImageFormat, StreamFormat};
    use framebus_icc::IccError;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::{Condvar, Mutex};
    use std::time::Instant;

    enum Step {
        Frame(u32),
        Lose,
    }

    /// Scripted producer shared by every channel a connector hands out.
    #[derive(Default)]
    struct Feed {
        steps: Mutex<VecDeque<Step>>,
        cv: Condvar,
    }

    impl Feed {
        fn push(&self, steps: impl IntoIterator<Item = Step>) {
            self.steps.lock().unwrap().extend(steps);
            self.cv.notify_all();
        }

        fn is_drained(&self) -> bool {
            self.steps.lock().unwrap().is_empty()
        }
    }

    struct ScriptChannel {
        feed: Arc<Feed>,
        stopped: Arc<AtomicBool>,
    }

    impl FrameChannel for ScriptChannel {
        fn recv(&mut self) -> Result<Option<FrameRecord>, ChannelError> {
            let mut steps = self.feed.steps.lock().unwrap();
            loop {
                if self.stopped.load(Ordering::SeqCst) {
                    return Ok(None);
                }
                match steps.pop_front() {
                    Some(Step::Frame(n)) => return Ok(Some(record(n))),
                    Some(Step::Lose) => return Err(IccError::Disconnected.into()),
                    None => steps = self.feed.cv.wait(steps).unwrap(),
                }
            }
        }

        fn interrupter(&self) -> Result<Interrupter, ChannelError> {
            let (feed, stopped) = (Arc::clone(&self.feed), Arc::clone(&self.stopped));
            Ok(Interrupter::new(move || {
                let _g = feed.steps.lock().unwrap();
                stopped.store(true, Ordering::SeqCst);
                feed.cv.notify_all();
            }))
        }
    }

    struct ScriptConnector {
        feed: Arc<Feed>,
        fail_next: Arc<AtomicU32>,
        attempts: Arc<AtomicU32>,
    }

    impl Connector for ScriptConnector {
        type Channel = ScriptChannel;

        fn connect(&mut self) -> Result<ScriptChannel, ChannelError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let failing = self
                .fail_next
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(IccError::Disconnected.into());
            }
            Ok(ScriptChannel {
                feed: Arc::clone(&self.feed),
                stopped: Arc::new(AtomicBool::new(false)),
            })
        }

        fn describe(&self) -> String {
            "script".into()
        }
    }

    fn record(n: u32) -> FrameRecord {
        let f = StreamFormat {
            image_format: ImageFormat::Rgb24,
            width: 2,
            height: 2,
            audio_format: AudioFormat::None,
            samples: 0,
            ..StreamFormat::default()
        };
        FrameRecord::new(n, &f, vec![n as u8; 12], Vec::new()).unwrap()
    }

    fn connector(fail_first: u32) -> (ScriptConnector, Arc<Feed>, Arc<AtomicU32>, Arc<AtomicU32>) {
        let feed = Arc::new(Feed::default());
        let fail_next = Arc::new(AtomicU32::new(fail_first));
        let attempts = Arc::new(AtomicU32::new(0));
        (
            ScriptConnector {
                feed: Arc::clone(&feed),
                fail_next: Arc::clone(&fail_next),
                attempts: Arc::clone(&attempts),
            },
            feed,
            fail_next,
            attempts,
        )
    }

    fn fast() -> SourceOptions {
        SourceOptions {
            retry_interval: Duration::from_millis(5),
            ..SourceOptions::default()
        }
    }

    fn wait_for(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn initial_connect_failure_is_returned() {
        let (conn, ..) = connector(1);
        assert!(matches!(
            FrameSource::spawn(conn, fast()),
            Err(SourceError::Channel(_))
        ));
    }

    #[test]
    fn gap_leaves_only_the_new_run_queued() {
        let (conn, feed, ..) = connector(0);
        let source = FrameSource::spawn(conn, fast()).unwrap();
        feed.push([0, 1, 2, 5, 6].map(Step::Frame));

        wait_for(|| feed.is_drained() && source.queued() == 2);
        assert_eq!(source.next_frame().unwrap().frame_number(), 5);
        assert_eq!(source.next_frame().unwrap().frame_number(), 6);
    }

    #[test]
    fn lost_channel_is_reestablished_without_pipeline_errors() {
        let (conn, feed, fail_next, attempts) = connector(0);
        let source = FrameSource::spawn(conn, fast()).unwrap();
        assert_eq!(source.link_state(), LinkState::Connected);

        fail_next.store(2, Ordering::SeqCst);
        feed.push([Step::Frame(0), Step::Frame(1), Step::Lose, Step::Frame(2), Step::Frame(3)]);

        let got: Vec<u32> = (0..4)
            .map(|_| source.next_frame().unwrap().frame_number())
            .collect();
        assert_eq!(got, [0, 1, 2, 3]);
        // Initial connect, two failed attempts, one success.
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        assert_eq!(source.link_state(), LinkState::Connected);
    }

    #[test]
    fn close_unblocks_puller_and_reader() {
        let (conn, ..) = connector(0);
        let mut source = FrameSource::spawn(conn, fast()).unwrap();
        assert!(source.try_next_frame().is_none());
        source.close();
        assert!(source.next_frame().is_none());
        assert_eq!(source.link_state(), LinkState::Stopped);
    }

    #[test]
    fn shutdown_from_another_thread_ends_a_blocked_pull() {
        let (conn, ..) = connector(0);
        let source = Arc::new(FrameSource::spawn(conn, fast()).unwrap());
        let puller = {
            let source = Arc::clone(&source);
            thread::spawn(move || source.next_frame())
        };
        thread::sleep(Duration::from_millis(20));
        source.shutdown();
        assert!(puller.join().unwrap().is_none());
    }
}
