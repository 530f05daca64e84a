//! Single overwrite slot shared by one writer and any number of readers.
//!
//! The writer overwrites the slot under the exclusive side of the segment's
//! rwlock, bumps the generation counter, then broadcasts `frame_ready` under
//! `frame_mutex`. Readers copy under the shared side, so a copy is never torn
//! and readers never hold up each other.

use std::path::{Path, PathBuf};
use std::ptr::addr_of_mut;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use framebus_frame::{FrameHeader, FrameRecord, STREAM_FORMAT_SIZE, StreamFormat};
use framebus_mmap::ShmSegment;
use tracing::{debug, info, warn};

use crate::IccError;
use crate::shm_layout::{
    ControlBlock, PAYLOAD_OFFSET, SEGMENT_MAGIC, SEGMENT_VERSION, SegmentState, bytes_for_slot,
};
use crate::sync::{SharedCondvar, SharedMutex, SharedRwLock};

/// How an attaching writer waits for a concurrent creator to finish.
const ATTACH_RETRIES: u32 = 200;
const ATTACH_BACKOFF: Duration = Duration::from_millis(5);

/// How [`SlotWriter::create`] treats an existing segment at the path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum CreatePolicy {
    /// Replace it: unlink, recreate, initialise.
    #[default]
    Truncate,
    /// Reuse it if present; only the process that created the file
    /// initialises the primitives.
    Attach,
}

/// A mapped slot segment plus cached pointers into it.
struct SlotMapping {
    segment: ShmSegment,
    base: *mut u8,
    capacity: usize,
    path: PathBuf,
}

// SAFETY: all shared state behind `base` is accessed through the
// process-shared primitives or atomics in the control block.
unsafe impl Send for SlotMapping {}
unsafe impl Sync for SlotMapping {}

impl SlotMapping {
    #[inline]
    fn control(&self) -> &ControlBlock {
        // SAFETY: the mapping is at least `PAYLOAD_OFFSET` long (checked on
        // construction) and page aligned.
        unsafe { &*self.base.cast::<ControlBlock>() }
    }

    #[inline]
    fn payload_ptr(&self) -> *mut u8 {
        // SAFETY: in bounds, see `control`.
        unsafe { self.base.add(PAYLOAD_OFFSET) }
    }

    /// Wakes everyone blocked on `frame_ready`.
    fn broadcast(&self) -> Result<(), IccError> {
        let cb = self.control();
        let _g = cb.frame_mutex.lock()?;
        cb.frame_ready.notify_all()
    }
}

/// Writer side of a slot segment.
pub struct SlotWriter {
    map: Arc<SlotMapping>,
    format: StreamFormat,
    closed: bool,
    unlink_on_drop: bool,
}

impl SlotWriter {
    /// Creates (or attaches to) a slot sized for `format`.
    pub fn create<P: AsRef<Path>>(
        path: P,
        format: StreamFormat,
        policy: CreatePolicy,
    ) -> Result<Self, IccError> {
        let path = path.as_ref();
        let size = bytes_for_slot(&format);
        let total_size = u32::try_from(size).map_err(|_| IccError::RecordTooLarge {
            len: size,
            capacity: u32::MAX as usize,
        })?;
        let seg_err = |source| IccError::Segment {
            path: path.to_path_buf(),
            source,
        };

        let (mut segment, initialized) = match policy {
            CreatePolicy::Truncate => {
                retire_previous(path)?;
                (
                    ShmSegment::create_truncate(path, size as u64).map_err(seg_err)?,
                    true,
                )
            }
            CreatePolicy::Attach => attach_segment(path, size as u64)?,
        };

        let base = segment.as_mut_ptr();
        if segment.len() < PAYLOAD_OFFSET {
            return Err(IccError::InvalidSegment {
                path: path.to_path_buf(),
                reason: "shorter than the control block",
            });
        }
        let capacity = segment.len() - PAYLOAD_OFFSET;
        let map = Arc::new(SlotMapping {
            segment,
            base,
            capacity,
            path: path.to_path_buf(),
        });

        if initialized {
            // SAFETY: this call created the file, so nobody else has touched
            // the control block yet.
            unsafe { init_control(base, &format, total_size)? };
            info!(path = %path.display(), bytes = size, "created frame segment");
        } else {
            wait_until_initialized(&map)?;
            let cb = map.control();
            cb.validate(map.segment.len())
                .map_err(|reason| IccError::InvalidSegment {
                    path: path.to_path_buf(),
                    reason,
                })?;
            format.check_compatible(&cb.stream_format()?)?;
            let _ = cb.state.compare_exchange(
                SegmentState::Closed as u32,
                SegmentState::Ready as u32,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
            info!(path = %path.display(), "attached to existing frame segment");
        }

        Ok(Self {
            map,
            format,
            closed: false,
            unlink_on_drop: false,
        })
    }

    /// Overwrites the slot with `record` and wakes blocked readers.
    pub fn publish(&mut self, record: &FrameRecord) -> Result<(), IccError> {
        let len = record.encoded_len();
        if len > self.map.capacity {
            return Err(IccError::RecordTooLarge {
                len,
                capacity: self.map.capacity,
            });
        }
        self.format.check_compatible(&record.stream_format()?)?;

        let cb = self.map.control();
        {
            let _w = cb.rwlock.write()?;
            // SAFETY: the exclusive lock keeps every reader out of the payload.
            let buf = unsafe {
                std::slice::from_raw_parts_mut(self.map.payload_ptr(), self.map.capacity)
            };
            record.write_into(buf)?;
            cb.generation.fetch_add(1, Ordering::Release);
        }
        self.map.broadcast()
    }

    /// Marks the segment closed and wakes every blocked reader. Idempotent.
    pub fn close(&mut self) -> Result<(), IccError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.map
            .control()
            .state
            .store(SegmentState::Closed as u32, Ordering::Release);
        debug!(path = %self.map.path.display(), "frame segment closed");
        self.map.broadcast()
    }

    /// Closes and unlinks the segment when the writer is dropped, leaving
    /// nothing behind after an orderly shutdown.
    pub fn unlink_on_drop(mut self, enabled: bool) -> Self {
        self.unlink_on_drop = enabled;
        self
    }

    /// Removes the segment name. Mapped processes keep their view.
    pub fn unlink(&self) -> Result<(), IccError> {
        ShmSegment::unlink(&self.map.path).map_err(|source| IccError::Segment {
            path: self.map.path.clone(),
            source,
        })
    }

    pub fn format(&self) -> &StreamFormat {
        &self.format
    }

    pub fn capacity(&self) -> usize {
        self.map.capacity
    }

    pub fn path(&self) -> &Path {
        &self.map.path
    }
}

impl Drop for SlotWriter {
    fn drop(&mut self) {
        let _ = self.close();
        if self.unlink_on_drop {
            if let Err(e) = self.unlink() {
                warn!(error = %e, "failed to unlink frame segment");
            }
        }
    }
}

/// A frame copied out of the slot.
#[derive(Debug, Clone)]
pub struct LatestFrame {
    pub record: FrameRecord,
    /// `frame_number == last_seen + 1`, or this was the first read.
    pub consecutive: bool,
}

/// Reader side of a slot segment.
pub struct SlotReader {
    map: Arc<SlotMapping>,
    format: StreamFormat,
    interrupted: Arc<AtomicBool>,
}

impl SlotReader {
    /// Attaches to a segment with a live writer.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, IccError> {
        let path = path.as_ref();
        let mut segment = ShmSegment::open(path).map_err(|source| IccError::Segment {
            path: path.to_path_buf(),
            source,
        })?;
        if segment.len() < PAYLOAD_OFFSET {
            return Err(IccError::InvalidSegment {
                path: path.to_path_buf(),
                reason: "shorter than the control block",
            });
        }
        let base = segment.as_mut_ptr();
        let len = segment.len();
        let mut map = SlotMapping {
            segment,
            base,
            capacity: 0,
            path: path.to_path_buf(),
        };

        let cb = map.control();
        match cb.state() {
            Some(SegmentState::Ready) => {}
            Some(SegmentState::Initializing) | Some(SegmentState::Closed) => {
                return Err(IccError::NotReady {
                    path: path.to_path_buf(),
                });
            }
            None => {
                return Err(IccError::InvalidSegment {
                    path: path.to_path_buf(),
                    reason: "unknown state",
                });
            }
        }
        cb.validate(len).map_err(|reason| IccError::InvalidSegment {
            path: path.to_path_buf(),
            reason,
        })?;
        let format = cb.stream_format()?;
        let capacity = cb.total_size as usize - PAYLOAD_OFFSET;
        map.capacity = capacity;
        let map = Arc::new(map);

        Ok(Self {
            map,
            format,
            interrupted: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Like [`SlotReader::open`], but fails if the segment was sized for a
    /// different stream.
    pub fn open_expecting<P: AsRef<Path>>(
        path: P,
        expected: &StreamFormat,
    ) -> Result<Self, IccError> {
        let reader = Self::open(path)?;
        expected.check_compatible(&reader.format)?;
        Ok(reader)
    }

    /// Blocks until a frame whose number differs from `last_seen` is in the
    /// slot, then copies it out.
    ///
    /// Returns `Ok(None)` once this reader is interrupted, or once the writer
    /// has closed the segment and its last frame has been read.
    pub fn read_latest(&mut self, last_seen: Option<u32>) -> Result<Option<LatestFrame>, IccError> {
        let cb = self.map.control();
        loop {
            if self.interrupted.load(Ordering::Acquire) {
                return Ok(None);
            }

            let observed = {
                let _r = cb.rwlock.read()?;
                let generation = cb.generation.load(Ordering::Acquire);
                if generation != 0 {
                    // SAFETY: the shared lock keeps the writer out.
                    let buf = unsafe {
                        std::slice::from_raw_parts(self.map.payload_ptr(), self.map.capacity)
                    };
                    let header = FrameHeader::decode(buf)?;
                    if Some(header.frame_number) != last_seen {
                        let record = FrameRecord::read_from(buf)?;
                        let consecutive = last_seen
                            .is_none_or(|n| n.wrapping_add(1) == record.frame_number());
                        return Ok(Some(LatestFrame {
                            record,
                            consecutive,
                        }));
                    }
                }
                generation
            };
            // A frame published just before close is still delivered above.
            if self.stopped() {
                return Ok(None);
            }

            // Publishers bump the generation before taking the mutex to
            // broadcast, so rechecking it here cannot miss a wakeup.
            let mut guard = cb.frame_mutex.lock()?;
            if !self.stopped() && cb.generation.load(Ordering::Acquire) == observed {
                cb.frame_ready.wait(&mut guard)?;
            }
        }
    }

    fn stopped(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
            || self.map.control().state() != Some(SegmentState::Ready)
    }

    /// Handle that can unblock [`SlotReader::read_latest`] from another thread.
    pub fn interrupter(&self) -> SlotInterrupter {
        SlotInterrupter {
            map: Arc::clone(&self.map),
            interrupted: Arc::clone(&self.interrupted),
        }
    }

    pub fn format(&self) -> &StreamFormat {
        &self.format
    }

    pub fn path(&self) -> &Path {
        &self.map.path
    }
}

/// Wakes a [`SlotReader`] blocked in `read_latest`; it then returns `None`.
#[derive(Clone)]
pub struct SlotInterrupter {
    map: Arc<SlotMapping>,
    interrupted: Arc<AtomicBool>,
}

impl SlotInterrupter {
    pub fn interrupt(&self) -> Result<(), IccError> {
        self.interrupted.store(true, Ordering::Release);
        self.map.broadcast()
    }
}

fn attach_segment(path: &Path, size: u64) -> Result<(ShmSegment, bool), IccError> {
    let mut attempt = 0;
    loop {
        match ShmSegment::create_or_attach(path, size) {
            Ok(a) => return Ok((a.segment, a.initialized)),
            // The creator has the file but has not sized it yet.
            Err(e) if e.kind() == std::io::ErrorKind::InvalidData && attempt < ATTACH_RETRIES => {
                attempt += 1;
                thread::sleep(ATTACH_BACKOFF);
            }
            Err(source) => {
                return Err(IccError::Segment {
                    path: path.to_path_buf(),
                    source,
                });
            }
        }
    }
}

/// Closes whatever slot segment currently lives at `path` and wakes its
/// readers, so they notice the replacement even if the previous writer died
/// without closing it. Anything that is not one of our segments is left alone.
fn retire_previous(path: &Path) -> Result<(), IccError> {
    let mut segment = match ShmSegment::open(path) {
        Ok(segment) => segment,
        Err(_) => return Ok(()),
    };
    if segment.len() < PAYLOAD_OFFSET {
        return Ok(());
    }
    let base = segment.as_mut_ptr();
    let capacity = segment.len() - PAYLOAD_OFFSET;
    let map = SlotMapping {
        segment,
        base,
        capacity,
        path: path.to_path_buf(),
    };
    let cb = map.control();
    if cb.validate(map.segment.len()).is_err() || cb.state() != Some(SegmentState::Ready) {
        return Ok(());
    }
    cb.state.store(SegmentState::Closed as u32, Ordering::Release);
    map.broadcast()?;
    info!(path = %path.display(), "closed previous frame segment");
    Ok(())
}

fn wait_until_initialized(map: &SlotMapping) -> Result<(), IccError> {
    for _ in 0..ATTACH_RETRIES {
        match map.control().state() {
            Some(SegmentState::Initializing) => thread::sleep(ATTACH_BACKOFF),
            Some(_) => return Ok(()),
            None => {
                return Err(IccError::InvalidSegment {
                    path: map.path.clone(),
                    reason: "unknown state",
                });
            }
        }
    }
    Err(IccError::NotReady {
        path: map.path.clone(),
    })
}

/// Writes the control block and constructs the shared primitives.
///
/// # Safety
/// `base` must point to a zero-filled mapping of at least `total_size`
/// bytes that no other process has started using.
unsafe fn init_control(
    base: *mut u8,
    format: &StreamFormat,
    total_size: u32,
) -> Result<(), IccError> {
    let cb = base.cast::<ControlBlock>();
    let mut encoded = [0u8; STREAM_FORMAT_SIZE];
    format.encode_into(&mut encoded)?;
    unsafe {
        addr_of_mut!((*cb).magic).write(SEGMENT_MAGIC);
        addr_of_mut!((*cb).version).write(SEGMENT_VERSION);
        addr_of_mut!((*cb).total_size).write(total_size);
        addr_of_mut!((*cb).format).write(encoded);
        SharedRwLock::init(addr_of_mut!((*cb).rwlock))?;
        SharedCondvar::init(addr_of_mut!((*cb).frame_ready))?;
        SharedMutex::init(addr_of_mut!((*cb).frame_mutex))?;
        (*cb).generation.store(0, Ordering::Relaxed);
        (*cb).state.store(SegmentState::Ready as u32, Ordering::Release);
    }
    Ok(())
}
