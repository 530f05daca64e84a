//! Pool of fixed-size, reference-counted frame blocks in a shared segment.
//!
//! ```text
//! ┌──────────────────────┐ 0
//! │ ArenaHeader          │
//! ├──────────────────────┤ SLOTS_OFFSET
//! │ BlockSlot[0..count]  │ refcount + payload length per block
//! ├──────────────────────┤ data_offset (64-byte aligned)
//! │ block 0              │ block_size bytes each
//! │ block 1              │
//! │ ...                  │
//! └──────────────────────┘
//! ```
//!
//! Only the broker process touches reference counts; clients map the arena
//! read-only and hand their references back over the control channel. A
//! block is rewritten only after its count has dropped to zero, so a client
//! holding a reference always reads a stable record.

use std::mem::size_of;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use framebus_frame::FrameRecord;
use framebus_mmap::{ShmSegment, ShmSegmentRo};

use crate::IccError;

/// ASCII "FBARENA1".
pub const ARENA_MAGIC: u64 = 0x4642_4152_454E_4131;
pub const ARENA_VERSION: u32 = 1;

#[repr(C)]
struct ArenaHeader {
    magic: u64,
    version: u32,
    block_count: u32,
    block_size: u64,
    data_offset: u64,
}

#[repr(C)]
struct BlockSlot {
    refcount: AtomicU32,
    len: AtomicU32,
}

const SLOTS_OFFSET: usize = size_of::<ArenaHeader>().next_multiple_of(64);

fn data_offset(block_count: u32) -> usize {
    (SLOTS_OFFSET + block_count as usize * size_of::<BlockSlot>()).next_multiple_of(64)
}

/// Total segment size for `block_count` blocks of `block_size` bytes.
pub fn bytes_for_arena(block_size: usize, block_count: u32) -> usize {
    data_offset(block_count) + block_size * block_count as usize
}

#[derive(Debug, thiserror::Error)]
pub enum ArenaError {
    #[error("no block {0} in this arena")]
    NoSuchBlock(u32),

    #[error("block {0} released more times than it was retained")]
    DoubleRelease(u32),

    #[error("block {0} is free and cannot be retained")]
    NotAllocated(u32),

    #[error("block reference out of bounds (block {block_id}, offset {offset}, len {len})")]
    OutOfBounds { block_id: u32, offset: u64, len: u32 },

    #[error("arena header rejected: {0}")]
    BadHeader(&'static str),
}

/// A claimed block. The holder that allocated it owns one reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    pub id: u32,
    /// Byte offset of the block from the start of the arena.
    pub offset: u64,
    /// Bytes of record written into the block.
    pub len: u32,
}

/// Writer-side arena: allocates, fills and refcounts blocks.
pub struct Arena {
    _segment: ShmSegment,
    base: *mut u8,
    block_size: usize,
    block_count: u32,
    data_offset: usize,
    cursor: AtomicU32,
    path: PathBuf,
}

// SAFETY: shared bookkeeping lives in atomics; block bytes are written only
// by the holder of a freshly claimed block (refcount 0 -> 1).
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    /// Creates a fresh arena at `path`, replacing any previous one.
    pub fn create<P: AsRef<Path>>(
        path: P,
        block_size: usize,
        block_count: u32,
    ) -> Result<Self, IccError> {
        let path = path.as_ref();
        let size = bytes_for_arena(block_size, block_count);
        let mut segment =
            ShmSegment::create_truncate(path, size as u64).map_err(|source| IccError::Segment {
                path: path.to_path_buf(),
                source,
            })?;
        let base = segment.as_mut_ptr();
        let data_offset = data_offset(block_count);

        // SAFETY: fresh zero-filled mapping of `size` bytes, not yet shared.
        // Zeroed slots already read as free.
        unsafe {
            base.cast::<ArenaHeader>().write(ArenaHeader {
                magic: ARENA_MAGIC,
                version: ARENA_VERSION,
                block_count,
                block_size: block_size as u64,
                data_offset: data_offset as u64,
            });
        }

        Ok(Self {
            _segment: segment,
            base,
            block_size,
            block_count,
            data_offset,
            cursor: AtomicU32::new(0),
            path: path.to_path_buf(),
        })
    }

    fn slot(&self, id: u32) -> Result<&BlockSlot, ArenaError> {
        if id >= self.block_count {
            return Err(ArenaError::NoSuchBlock(id));
        }
        // SAFETY: `id` is in range and the slot table lies inside the mapping.
        Ok(unsafe {
            &*self
                .base
                .add(SLOTS_OFFSET + id as usize * size_of::<BlockSlot>())
                .cast::<BlockSlot>()
        })
    }

    fn block_offset(&self, id: u32) -> usize {
        self.data_offset + id as usize * self.block_size
    }

    /// Claims a free block able to hold `size` bytes.
    ///
    /// Scans from a rotating cursor so that recently freed blocks are not
    /// reused first. `None` if `size` exceeds the block size or every block
    /// is still referenced.
    pub fn allocate(&self, size: usize) -> Option<Block> {
        if size > self.block_size || self.block_count == 0 {
            return None;
        }
        let start = self.cursor.load(Ordering::Relaxed);
        for step in 0..self.block_count {
            let id = (start + step) % self.block_count;
            let slot = self.slot(id).ok()?;
            if slot
                .refcount
                .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                slot.len.store(0, Ordering::Relaxed);
                self.cursor
                    .store((id + 1) % self.block_count, Ordering::Relaxed);
                return Some(Block {
                    id,
                    offset: self.block_offset(id) as u64,
                    len: 0,
                });
            }
        }
        None
    }

    /// Serializes `record` into `block` and records its length.
    pub fn write(&self, block: &mut Block, record: &FrameRecord) -> Result<(), IccError> {
        let slot = self.slot(block.id)?;
        if slot.refcount.load(Ordering::Acquire) == 0 {
            return Err(ArenaError::NotAllocated(block.id).into());
        }
        let len = record.encoded_len();
        if len > self.block_size {
            return Err(IccError::RecordTooLarge {
                len,
                capacity: self.block_size,
            });
        }
        // SAFETY: the block is referenced only by its allocator until it is
        // broadcast, so nobody else reads or writes these bytes.
        let buf = unsafe {
            std::slice::from_raw_parts_mut(
                self.base.add(self.block_offset(block.id)),
                self.block_size,
            )
        };
        let written = record.write_into(buf)?;
        block.len = written as u32;
        slot.len.store(block.len, Ordering::Release);
        Ok(())
    }

    /// Adds a reference to an allocated block.
    pub fn retain(&self, id: u32) -> Result<u32, ArenaError> {
        self.slot(id)?
            .refcount
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n != 0).then(|| n + 1)
            })
            .map(|prev| prev + 1)
            .map_err(|_| ArenaError::NotAllocated(id))
    }

    /// Drops a reference. Returns `true` if this freed the block.
    pub fn release(&self, id: u32) -> Result<bool, ArenaError> {
        self.slot(id)?
            .refcount
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .map(|prev| prev == 1)
            .map_err(|_| ArenaError::DoubleRelease(id))
    }

    pub fn refcount(&self, id: u32) -> Result<u32, ArenaError> {
        Ok(self.slot(id)?.refcount.load(Ordering::Acquire))
    }

    /// Blocks with no outstanding reference.
    pub fn free_blocks(&self) -> usize {
        (0..self.block_count)
            .filter(|&id| self.refcount(id).is_ok_and(|n| n == 0))
            .count()
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn block_count(&self) -> u32 {
        self.block_count
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Client-side, read-only view of an arena.
pub struct ArenaView {
    segment: ShmSegmentRo,
    block_size: usize,
    block_count: u32,
    data_offset: usize,
}

impl ArenaView {
    /// Maps the arena and checks its header against what the broker announced.
    pub fn open<P: AsRef<Path>>(
        path: P,
        block_size: usize,
        block_count: u32,
    ) -> Result<Self, IccError> {
        let path = path.as_ref();
        let segment = ShmSegmentRo::open(path).map_err(|source| IccError::Segment {
            path: path.to_path_buf(),
            source,
        })?;
        if segment.len() < SLOTS_OFFSET {
            return Err(ArenaError::BadHeader("shorter than the header").into());
        }
        // SAFETY: long enough for the header, which the broker wrote before
        // it started accepting clients.
        let header = unsafe { &*segment.as_ptr().cast::<ArenaHeader>() };
        if header.magic != ARENA_MAGIC {
            return Err(ArenaError::BadHeader("bad magic").into());
        }
        if header.version != ARENA_VERSION {
            return Err(ArenaError::BadHeader("unsupported version").into());
        }
        if header.block_size != block_size as u64 || header.block_count != block_count {
            return Err(ArenaError::BadHeader("geometry differs from announcement").into());
        }
        if segment.len() < bytes_for_arena(block_size, block_count) {
            return Err(ArenaError::BadHeader("mapping shorter than its blocks").into());
        }
        Ok(Self {
            segment,
            block_size,
            block_count,
            data_offset: header.data_offset as usize,
        })
    }

    /// Copies the record in block `block_id` out of the arena.
    ///
    /// The announced offset and length must describe that block exactly;
    /// the copy never touches bytes outside it.
    pub fn read(&self, block_id: u32, offset: u64, len: u32) -> Result<FrameRecord, IccError> {
        let oob = ArenaError::OutOfBounds {
            block_id,
            offset,
            len,
        };
        if block_id >= self.block_count {
            return Err(ArenaError::NoSuchBlock(block_id).into());
        }
        let expected = self.data_offset + block_id as usize * self.block_size;
        if offset != expected as u64 || len as usize > self.block_size {
            return Err(oob.into());
        }
        let end = expected + len as usize;
        if end > self.segment.len() {
            return Err(oob.into());
        }
        // SAFETY: `[expected, end)` is inside the mapping, and the broker
        // does not rewrite a block this client still references.
        let buf = unsafe {
            std::slice::from_raw_parts(self.segment.as_ptr().add(expected), len as usize)
        };
        Ok(FrameRecord::read_from(buf)?)
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn block_count(&self) -> u32 {
        self.block_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use framebus_frame::{AudioFormat, ImageFormat, StreamFormat};

    fn fmt() -> StreamFormat {
        StreamFormat {
            image_format: ImageFormat::Yuv422,
            width: 4,
            height: 4,
            audio_format: AudioFormat::U8,
            frequency: 8_000,
            channels: 1,
            samples: 8,
            frame_rate_num: 25,
            frame_rate_den: 1,
        }
    }

    fn record(n: u32) -> FrameRecord {
        let f = fmt();
        FrameRecord::new(
            n,
            &f,
            vec![n as u8; f.image_size() as usize],
            vec![0x80; f.audio_size() as usize],
        )
        .unwrap()
    }

    #[test]
    fn exhaustion_and_reuse() {
        let dir = tempfile::tempdir().unwrap();
        let arena = Arena::create(dir.path().join("arena"), 128, 2).unwrap();

        let a = arena.allocate(64).unwrap();
        let b = arena.allocate(64).unwrap();
        assert_ne!(a.id, b.id);
        assert!(arena.allocate(64).is_none());
        assert!(arena.allocate(129).is_none());

        assert!(arena.release(a.id).unwrap());
        assert_eq!(arena.free_blocks(), 1);
        assert_eq!(arena.allocate(64).unwrap().id, a.id);
    }

    #[test]
    fn last_release_frees_and_extra_release_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let arena = Arena::create(dir.path().join("arena"), 128, 4).unwrap();
        let blk = arena.allocate(10).unwrap();

        assert_eq!(arena.retain(blk.id).unwrap(), 2);
        assert!(!arena.release(blk.id).unwrap());
        assert!(arena.release(blk.id).unwrap());
        assert_eq!(arena.refcount(blk.id).unwrap(), 0);

        assert!(matches!(arena.release(blk.id), Err(ArenaError::DoubleRelease(_))));
        assert!(matches!(arena.retain(blk.id), Err(ArenaError::NotAllocated(_))));
        assert!(matches!(arena.release(99), Err(ArenaError::NoSuchBlock(99))));
    }

    #[test]
    fn view_reads_what_the_arena_wrote() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("arena");
        let block_size = fmt().record_size();
        let arena = Arena::create(&path, block_size, 3).unwrap();
        let view = ArenaView::open(&path, block_size, 3).unwrap();

        let mut blk = arena.allocate(block_size).unwrap();
        arena.write(&mut blk, &record(7)).unwrap();
        assert_eq!(blk.len as usize, block_size);
        assert_eq!(view.read(blk.id, blk.offset, blk.len).unwrap(), record(7));

        // Wrong offset for the block id.
        assert!(view.read(blk.id, blk.offset + 1, blk.len).is_err());
        assert!(view.read(blk.id, blk.offset, block_size as u32 + 1).is_err());
    }

    #[test]
    fn view_rejects_mismatched_geometry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("arena");
        let _arena = Arena::create(&path, 256, 3).unwrap();
        assert!(matches!(
            ArenaView::open(&path, 256, 4),
            Err(IccError::Arena(ArenaError::BadHeader(_)))
        ));
    }
}
