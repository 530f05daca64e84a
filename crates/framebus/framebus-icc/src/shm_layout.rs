//! Binary layout of a single-slot frame segment.
//!
//! A segment holds exactly one live frame. The control block at offset 0
//! carries identification, the stream format the slot was sized for, and the
//! process-shared primitives every participant locks. The frame record
//! (header, image, audio) follows at a cache-line aligned offset.
//!
//! # Memory Layout
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                        ControlBlock                            │
//! │  ┌─────────┬─────────┬────────────┬─────────┬──────────────┐   │
//! │  │  magic  │ version │ total_size │  state  │  generation  │   │
//! │  │  (8B)   │  (4B)   │    (4B)    │ (4B at) │  (8B atomic) │   │
//! │  └─────────┴─────────┴────────────┴─────────┴──────────────┘   │
//! │  ┌──────────────┬────────────┬───────────────┬─────────────┐   │
//! │  │ format (36B) │   rwlock   │  frame_ready  │ frame_mutex │   │
//! │  └──────────────┴────────────┴───────────────┴─────────────┘   │
//! ├──────────────────────── PAYLOAD_OFFSET ────────────────────────┤
//! │  FrameHeader (48B) │ image bytes │ audio bytes                 │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! `magic`, `version`, `total_size` and `format` are written once by the
//! initializer before `state` is published as [`SegmentState::Ready`] with
//! release ordering; after that they are read-only.

use std::mem::size_of;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use framebus_frame::{HEADER_SIZE, STREAM_FORMAT_SIZE, StreamFormat};

use crate::sync::{SharedCondvar, SharedMutex, SharedRwLock};

/// ASCII "FRAMEBUS".
pub const SEGMENT_MAGIC: u64 = 0x4652_414D_4542_5553;

/// Bump on any incompatible change to [`ControlBlock`] or the record layout.
pub const SEGMENT_VERSION: u32 = 1;

/// Lifecycle of a segment as seen by every process mapping it.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SegmentState {
    /// Zero-filled or still being set up by its creator.
    Initializing = 0,
    /// Primitives constructed; a writer is attached.
    Ready = 1,
    /// The writer shut down. Blocked readers have been woken.
    Closed = 2,
}

impl SegmentState {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Initializing),
            1 => Some(Self::Ready),
            2 => Some(Self::Closed),
            _ => None,
        }
    }
}

/// Header at offset 0 of every slot segment.
#[repr(C)]
pub struct ControlBlock {
    /// Must equal [`SEGMENT_MAGIC`].
    pub magic: u64,
    /// Must equal [`SEGMENT_VERSION`].
    pub version: u32,
    /// Mapped bytes the creator sized the segment to.
    pub total_size: u32,
    /// Raw [`SegmentState`].
    pub state: AtomicU32,
    _pad: u32,
    /// Number of frames published so far. Zero means the slot is empty.
    pub generation: AtomicU64,
    /// Encoded [`StreamFormat`] the slot was sized for.
    pub format: [u8; STREAM_FORMAT_SIZE],
    /// Exclusive for the writer's overwrite, shared for readers' copies.
    pub rwlock: SharedRwLock,
    /// Broadcast after every publish, on close and on reader interrupt.
    pub frame_ready: SharedCondvar,
    /// Pairs with `frame_ready`; guards nothing else.
    pub frame_mutex: SharedMutex,
}

impl ControlBlock {
    #[inline]
    pub fn state(&self) -> Option<SegmentState> {
        SegmentState::from_raw(self.state.load(Ordering::Acquire))
    }

    /// Checks identification and size against the mapped length.
    ///
    /// Only meaningful once `state` has been observed as initialised.
    pub fn validate(&self, mapped_len: usize) -> Result<(), &'static str> {
        if self.magic != SEGMENT_MAGIC {
            return Err("bad magic");
        }
        if self.version != SEGMENT_VERSION {
            return Err("unsupported version");
        }
        let total = self.total_size as usize;
        if total > mapped_len {
            return Err("declared size exceeds mapping");
        }
        if total < PAYLOAD_OFFSET + HEADER_SIZE {
            return Err("declared size too small for a frame header");
        }
        Ok(())
    }

    pub fn stream_format(&self) -> Result<StreamFormat, framebus_frame::LayoutError> {
        StreamFormat::decode(&self.format)
    }
}

/// Offset of the frame record from the start of the segment.
pub const PAYLOAD_OFFSET: usize = size_of::<ControlBlock>().next_multiple_of(64);

/// Segment size needed to hold one record of `format`.
pub fn bytes_for_slot(format: &StreamFormat) -> usize {
    PAYLOAD_OFFSET + format.record_size()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_is_cache_line_aligned_past_control_block() {
        assert_eq!(PAYLOAD_OFFSET % 64, 0);
        assert!(PAYLOAD_OFFSET >= size_of::<ControlBlock>());
    }

    #[test]
    fn slot_size_covers_one_record() {
        let fmt = StreamFormat::default();
        assert_eq!(bytes_for_slot(&fmt), PAYLOAD_OFFSET + fmt.record_size());
    }

    #[test]
    fn unknown_state_values_are_not_states() {
        assert_eq!(SegmentState::from_raw(1), Some(SegmentState::Ready));
        assert_eq!(SegmentState::from_raw(7), None);
    }
}
