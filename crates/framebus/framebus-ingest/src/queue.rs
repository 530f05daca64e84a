//! Bounded hand-off between the read thread and the pipeline's pull.
//!
//! A push that breaks frame continuity flushes everything queued before it,
//! so the consumer never plays stale frames after a gap. Consecutive pushes
//! block while the queue is full. Pops block while it is empty, or, in
//! prime mode, until enough frames have accumulated after startup or a
//! flush.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};

use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("queue capacity must be at least 1")]
    ZeroCapacity,

    #[error("prime level {prime} exceeds capacity {capacity}")]
    PrimeTooLarge { prime: usize, capacity: usize },

    #[error("queue closed")]
    Closed,
}

struct QueueState<T> {
    items: VecDeque<T>,
    primed: bool,
    closed: bool,
}

pub struct FrameQueue<T> {
    state: Mutex<QueueState<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
    prime: usize,
}

impl<T> FrameQueue<T> {
    pub fn new(capacity: usize) -> Result<Self, QueueError> {
        Self::with_prime(capacity, 0)
    }

    /// With `prime > 0`, pops wait until `prime` items are queued, both
    /// initially and after every flush.
    pub fn with_prime(capacity: usize, prime: usize) -> Result<Self, QueueError> {
        if capacity == 0 {
            return Err(QueueError::ZeroCapacity);
        }
        if prime > capacity {
            return Err(QueueError::PrimeTooLarge { prime, capacity });
        }
        Ok(Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                primed: prime == 0,
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
            prime,
        })
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Appends `item`. Returns how many queued items were flushed to make
    /// way for a non-consecutive one.
    pub fn push_back(&self, item: T, consecutive: bool) -> Result<usize, QueueError> {
        let mut st = self.lock();
        if st.closed {
            return Err(QueueError::Closed);
        }

        let mut flushed = 0;
        if consecutive {
            while st.items.len() >= self.capacity && !st.closed {
                st = self.not_full.wait(st).unwrap_or_else(|p| p.into_inner());
            }
            if st.closed {
                return Err(QueueError::Closed);
            }
        } else if !st.items.is_empty() {
            flushed = st.items.len();
            st.items.clear();
            st.primed = self.prime == 0;
            debug!(flushed, "discontinuity, queue flushed");
        }

        st.items.push_back(item);
        if !st.primed && st.items.len() >= self.prime {
            st.primed = true;
        }
        drop(st);
        self.not_empty.notify_all();
        if flushed > 0 {
            self.not_full.notify_all();
        }
        Ok(flushed)
    }

    fn take(&self, st: &mut QueueState<T>) -> Option<T> {
        let ready = st.primed || st.closed;
        let item = if ready { st.items.pop_front() } else { None };
        if item.is_some() {
            self.not_full.notify_all();
        }
        item
    }

    /// Blocks for the next item. After [`FrameQueue::close`], remaining
    /// items are still handed out, then `None`.
    pub fn pop_front(&self) -> Option<T> {
        let mut st = self.lock();
        loop {
            if let Some(item) = self.take(&mut st) {
                return Some(item);
            }
            if st.closed {
                return None;
            }
            st = self.not_empty.wait(st).unwrap_or_else(|p| p.into_inner());
        }
    }

    pub fn try_pop_front(&self) -> Option<T> {
        let mut st = self.lock();
        self.take(&mut st)
    }

    /// Wakes every waiter. Later pushes fail; pops drain what is left.
    pub fn close(&self) {
        self.lock().closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
