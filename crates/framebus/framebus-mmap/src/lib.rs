//! File-backed shared memory segments.
//!
//! A segment is a regular file, normally under `/dev/shm`, mapped with
//! `MAP_SHARED` by every participant. Two creation policies exist:
//!
//! - [`ShmSegment::create_truncate`]: last creator wins. Any previous file at
//!   the path is unlinked first, so processes still mapping the old instance
//!   keep a private, intact copy instead of seeing it reset underneath them.
//! - [`ShmSegment::create_or_attach`]: first creator wins. The call that
//!   actually created the file reports `initialized = true` and is the only
//!   one allowed to construct whatever lives inside it.

use memmap2::{Mmap, MmapMut};
use std::{
    fs::{self, File, OpenOptions},
    io,
    os::unix::fs::OpenOptionsExt,
    path::{Path, PathBuf},
};

/// Permission bits for newly created segments.
pub const SEGMENT_MODE: u32 = 0o666;

/// Read-write mapping of a segment.
pub struct ShmSegment {
    _file: File,
    mmap: MmapMut,
    path: PathBuf,
}

/// Read-only mapping of a segment.
pub struct ShmSegmentRo {
    _file: File,
    mmap: Mmap,
    path: PathBuf,
}

/// Result of [`ShmSegment::create_or_attach`].
pub struct Attached {
    pub segment: ShmSegment,
    /// `true` only for the caller that created the file.
    pub initialized: bool,
}

impl ShmSegment {
    /// Create a fresh segment of `size_bytes`, replacing whatever was at `path`.
    pub fn create_truncate<P: AsRef<Path>>(path: P, size_bytes: u64) -> io::Result<Self> {
        let path = path.as_ref();
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .mode(SEGMENT_MODE)
            .open(path)?;
        file.set_len(size_bytes)?;
        Self::map(file, path)
    }

    /// Create `path` exclusively, or open it if another process got there first.
    ///
    /// An attacher gets the file at whatever length it currently has; callers
    /// that need a fully sized and initialised segment must check for that
    /// themselves (the creator may still be inside its initialisation).
    pub fn create_or_attach<P: AsRef<Path>>(path: P, size_bytes: u64) -> io::Result<Attached> {
        let path = path.as_ref();
        let created = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .mode(SEGMENT_MODE)
            .open(path);
        match created {
            Ok(file) => {
                file.set_len(size_bytes)?;
                Ok(Attached {
                    segment: Self::map(file, path)?,
                    initialized: true,
                })
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(Attached {
                segment: Self::open(path)?,
                initialized: false,
            }),
            Err(e) => Err(e),
        }
    }

    /// Open an existing segment and map it read-write.
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Self::map(file, path)
    }

    fn map(file: File, path: &Path) -> io::Result<Self> {
        if file.metadata()?.len() == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("segment {} is empty", path.display()),
            ));
        }
        // SAFETY: the mapping is shared with other processes on purpose. All
        // access to its contents goes through the layout types built on top,
        // which synchronise with process-shared primitives or atomics.
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self {
            _file: file,
            mmap,
            path: path.to_path_buf(),
        })
    }

    /// Remove the segment name. Existing mappings stay valid.
    pub fn unlink<P: AsRef<Path>>(path: P) -> io::Result<()> {
        fs::remove_file(path)
    }

    /// Return raw pointer to start of the mapped region
    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.mmap.as_mut_ptr()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ShmSegmentRo {
    /// Open an existing segment and map it read-only.
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new().read(true).open(path)?;
        // SAFETY: see `ShmSegment::map`; this side never writes.
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(Self {
            _file: file,
            mmap,
            path: path.to_path_buf(),
        })
    }

    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.mmap.as_ptr()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::{MetadataExt, PermissionsExt};

    #[test]
    fn first_creator_initializes_later_openers_attach() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg");

        let first = ShmSegment::create_or_attach(&path, 4096).unwrap();
        assert!(first.initialized);
        assert_eq!(first.segment.len(), 4096);

        let second = ShmSegment::create_or_attach(&path, 4096).unwrap();
        assert!(!second.initialized);
        assert_eq!(second.segment.len(), 4096);
    }

    #[test]
    fn attached_mappings_share_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg");

        let mut a = ShmSegment::create_truncate(&path, 64).unwrap();
        let b = ShmSegmentRo::open(&path).unwrap();
        unsafe { a.as_mut_ptr().add(10).write(0x5A) };
        assert_eq!(unsafe { b.as_ptr().add(10).read() }, 0x5A);
    }

    #[test]
    fn truncate_replaces_the_file_instead_of_resetting_it() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg");

        let mut old = ShmSegment::create_truncate(&path, 64).unwrap();
        unsafe { old.as_mut_ptr().write(0xEE) };
        let old_ino = fs::metadata(&path).unwrap().ino();

        let new = ShmSegment::create_truncate(&path, 128).unwrap();
        assert_eq!(new.len(), 128);
        assert_ne!(fs::metadata(&path).unwrap().ino(), old_ino);
        // The previous mapping is untouched.
        assert_eq!(unsafe { old.as_mut_ptr().read() }, 0xEE);
    }

    #[test]
    fn created_with_read_write_bits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg");
        let _seg = ShmSegment::create_truncate(&path, 64).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        // umask may strip group/other bits; the owner always keeps rw.
        assert_eq!(mode & 0o600, 0o600);
    }

    #[test]
    fn opening_missing_segment_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ShmSegment::open(dir.path().join("missing")).is_err());
        assert!(ShmSegmentRo::open(dir.path().join("missing")).is_err());
    }
}
