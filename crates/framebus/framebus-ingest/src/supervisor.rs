//! Consumer-side link supervision.
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Reconnecting -> Connecting -> ...
//!                                   any state -> Stopped
//! ```
//!
//! The read thread owns the channel. When a read fails or the producer goes
//! away, the channel is dropped at once and the thread retries the
//! producer every `retry_interval` until a connect succeeds. The queue is
//! left alone meanwhile, so the pipeline keeps pulling whatever is buffered
//! and then simply blocks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use framebus_frame::FrameRecord;
use tracing::{debug, info, warn};

use crate::channel::{Connector, FrameChannel, Interrupter};
use crate::queue::{FrameQueue, QueueError};
use crate::sequence::SequenceTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Stopped,
}

/// Transition rules, kept apart from any I/O.
#[derive(Debug)]
pub struct LinkStateMachine {
    state: LinkState,
    /// Where a failed connect attempt falls back to.
    fallback: LinkState,
}

impl Default for LinkStateMachine {
    fn default() -> Self {
        Self {
            state: LinkState::Disconnected,
            fallback: LinkState::Disconnected,
        }
    }
}

impl LinkStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    fn set(&mut self, next: LinkState) {
        if self.state != next {
            debug!(from = ?self.state, to = ?next, "link state");
            self.state = next;
        }
    }

    /// `Disconnected | Reconnecting -> Connecting`. `false` from any other
    /// state.
    pub fn begin_connect(&mut self) -> bool {
        match self.state {
            LinkState::Disconnected | LinkState::Reconnecting => {
                self.fallback = self.state;
                self.set(LinkState::Connecting);
                true
            }
            _ => false,
        }
    }

    pub fn connected(&mut self) -> bool {
        if self.state == LinkState::Connecting {
            self.set(LinkState::Connected);
            true
        } else {
            false
        }
    }

    /// A connect attempt failed; the state the attempt started from is restored.
    pub fn connect_failed(&mut self) {
        if self.state == LinkState::Connecting {
            self.set(self.fallback);
        }
    }

    /// `Connected -> Reconnecting`. Returns `false` if a reconnection is
    /// already under way (or the link is not up), so callers start at most
    /// one.
    pub fn channel_lost(&mut self) -> bool {
        if self.state == LinkState::Connected {
            self.set(LinkState::Reconnecting);
            true
        } else {
            false
        }
    }

    pub fn stop(&mut self) {
        self.set(LinkState::Stopped);
    }
}

/// State shared between the read thread and whoever owns it.
pub struct SupervisorControl {
    running: AtomicBool,
    link: Mutex<LinkStateMachine>,
    interrupter: Mutex<Option<Interrupter>>,
    retry_lock: Mutex<()>,
    retry_wake: Condvar,
}

impl Default for SupervisorControl {
    fn default() -> Self {
        Self {
            running: AtomicBool::new(true),
            link: Mutex::new(LinkStateMachine::new()),
            interrupter: Mutex::new(None),
            retry_lock: Mutex::new(()),
            retry_wake: Condvar::new(),
        }
    }
}

fn relock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

impl SupervisorControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn link_state(&self) -> LinkState {
        relock(&self.link).state()
    }

    pub fn link(&self) -> MutexGuard<'_, LinkStateMachine> {
        relock(&self.link)
    }

    /// Registers the interrupter of a freshly opened channel. If a stop
    /// raced ahead of us, the channel is interrupted right away.
    pub fn install(&self, interrupter: Interrupter) {
        let mut slot = relock(&self.interrupter);
        if self.is_running() {
            *slot = Some(interrupter);
        } else {
            interrupter.interrupt();
        }
    }

    pub fn clear_interrupter(&self) {
        relock(&self.interrupter).take();
    }

    /// Sleeps for `interval` unless stopped first. Returns whether the
    /// supervisor is still running.
    pub fn sleep(&self, interval: Duration) -> bool {
        let guard = relock(&self.retry_lock);
        let _ = self
            .retry_wake
            .wait_timeout_while(guard, interval, |_| self.is_running())
            .unwrap_or_else(|p| p.into_inner());
        self.is_running()
    }

    /// Clears the running flag and wakes the read thread wherever it blocks.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        relock(&self.link).stop();
        if let Some(i) = relock(&self.interrupter).take() {
            i.interrupt();
        }
        let _g = relock(&self.retry_lock);
        self.retry_wake.notify_all();
    }
}

/// Drives one connector for the lifetime of a read thread.
pub struct Supervisor<C: Connector> {
    connector: C,
    queue: Arc<FrameQueue<FrameRecord>>,
    control: Arc<SupervisorControl>,
    retry_interval: Duration,
    sequence: SequenceTracker,
}

impl<C: Connector> Supervisor<C> {
    pub fn new(
        connector: C,
        queue: Arc<FrameQueue<FrameRecord>>,
        control: Arc<SupervisorControl>,
        retry_interval: Duration,
    ) -> Self {
        Self {
            connector,
            queue,
            control,
            retry_interval,
            sequence: SequenceTracker::new(),
        }
    }

    /// Reads from `channel` (already connected) until stopped, reconnecting
    /// as often as needed.
    pub fn run(mut self, channel: C::Channel) {
        let mut channel = Some(channel);
        while self.control.is_running() {
            let Some(ch) = channel.as_mut() else {
                channel = self.reconnect();
                continue;
            };
            match ch.recv() {
                Ok(Some(record)) => {
                    if self.deliver(record).is_err() {
                        break;
                    }
                }
                Ok(None) => channel = self.lost(None),
                Err(e) => channel = self.lost(Some(e.to_string())),
            }
        }
        debug!(source = %self.connector.describe(), "read thread exiting");
    }

    fn deliver(&mut self, record: FrameRecord) -> Result<(), QueueError> {
        let n = record.frame_number();
        // Re-reading the frame we already have, typically right after a reconnect.
        if self.sequence.last() == Some(n) {
            return Ok(());
        }
        let consecutive = self.sequence.observe(n);
        let flushed = self.queue.push_back(record, consecutive)?;
        if flushed > 0 {
            info!(frame = n, flushed, "frame gap, dropped queued frames");
        }
        Ok(())
    }

    fn lost(&mut self, reason: Option<String>) -> Option<C::Channel> {
        self.control.clear_interrupter();
        if !self.control.is_running() {
            return None;
        }
        if self.control.link().channel_lost() {
            match reason {
                Some(r) => {
                    warn!(source = %self.connector.describe(), error = %r, "producer channel lost")
                }
                None => info!(source = %self.connector.describe(), "producer went away"),
            }
        }
        None
    }

    fn reconnect(&mut self) -> Option<C::Channel> {
        while self.control.is_running() {
            if !self.control.link().begin_connect() {
                return None;
            }
            match self.connector.connect().and_then(|ch| Ok((ch.interrupter()?, ch))) {
                Ok((interrupter, ch)) => {
                    self.control.link().connected();
                    self.control.install(interrupter);
                    info!(source = %self.connector.describe(), "reconnected to producer");
                    return Some(ch);
                }
                Err(e) => {
                    self.control.link().connect_failed();
                    debug!(source = %self.connector.describe(), error = %e, "connect attempt failed");
                    if !self.control.sleep(self.retry_interval) {
                        return None;
                    }
                }
            }
        }
        None
    }
}
