//! Process-shared pthread primitives that live inside a mapped segment.
//!
//! These wrap `pthread_rwlock_t`, `pthread_mutex_t` and `pthread_cond_t`
//! initialised with `PTHREAD_PROCESS_SHARED`, so any process mapping the same
//! segment can lock them. They are never moved after initialisation: the
//! values only ever exist in place inside the mapping.
//!
//! # Initialisation
//!
//! Each type has an `unsafe fn init(*mut Self)`. It must run exactly once per
//! segment, by the process that created it, before anybody else touches the
//! primitive. Re-running it on a live lock is undefined behaviour, which is
//! why segments track whether the caller was the initializer.

use std::cell::UnsafeCell;
use std::io;
use std::mem::MaybeUninit;

use crate::IccError;

#[inline]
fn check(rc: libc::c_int) -> Result<(), IccError> {
    if rc == 0 {
        Ok(())
    } else {
        Err(IccError::Sync(io::Error::from_raw_os_error(rc)))
    }
}

/// Reader/writer lock shared across processes.
#[repr(transparent)]
pub struct SharedRwLock {
    raw: UnsafeCell<libc::pthread_rwlock_t>,
}

/// Mutex shared across processes. Only used to pair with [`SharedCondvar`].
#[repr(transparent)]
pub struct SharedMutex {
    raw: UnsafeCell<libc::pthread_mutex_t>,
}

/// Condition variable shared across processes.
#[repr(transparent)]
pub struct SharedCondvar {
    raw: UnsafeCell<libc::pthread_cond_t>,
}

// SAFETY: the pthread objects are designed for concurrent use from many
// threads (and, with PTHREAD_PROCESS_SHARED, many processes).
unsafe impl Sync for SharedRwLock {}
unsafe impl Sync for SharedMutex {}
unsafe impl Sync for SharedCondvar {}

impl SharedRwLock {
    /// # Safety
    /// `this` must point to writable, suitably aligned memory that no other
    /// thread or process is using as a lock yet.
    pub unsafe fn init(this: *mut Self) -> Result<(), IccError> {
        let mut attr = MaybeUninit::<libc::pthread_rwlockattr_t>::uninit();
        unsafe {
            check(libc::pthread_rwlockattr_init(attr.as_mut_ptr()))?;
            let rc = libc::pthread_rwlockattr_setpshared(
                attr.as_mut_ptr(),
                libc::PTHREAD_PROCESS_SHARED,
            );
            let rc = if rc == 0 {
                libc::pthread_rwlock_init(this.cast(), attr.as_ptr())
            } else {
                rc
            };
            libc::pthread_rwlockattr_destroy(attr.as_mut_ptr());
            check(rc)
        }
    }

    pub fn read(&self) -> Result<ReadGuard<'_>, IccError> {
        check(unsafe { libc::pthread_rwlock_rdlock(self.raw.get()) })?;
        Ok(ReadGuard { lock: self })
    }

    pub fn write(&self) -> Result<WriteGuard<'_>, IccError> {
        check(unsafe { libc::pthread_rwlock_wrlock(self.raw.get()) })?;
        Ok(WriteGuard { lock: self })
    }

    fn unlock(&self) {
        let rc = unsafe { libc::pthread_rwlock_unlock(self.raw.get()) };
        debug_assert_eq!(rc, 0, "pthread_rwlock_unlock failed");
    }
}

impl SharedMutex {
    /// # Safety
    /// Same contract as [`SharedRwLock::init`].
    pub unsafe fn init(this: *mut Self) -> Result<(), IccError> {
        let mut attr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
        unsafe {
            check(libc::pthread_mutexattr_init(attr.as_mut_ptr()))?;
            let rc = libc::pthread_mutexattr_setpshared(
                attr.as_mut_ptr(),
                libc::PTHREAD_PROCESS_SHARED,
            );
            let rc = if rc == 0 {
                libc::pthread_mutex_init(this.cast(), attr.as_ptr())
            } else {
                rc
            };
            libc::pthread_mutexattr_destroy(attr.as_mut_ptr());
            check(rc)
        }
    }

    pub fn lock(&self) -> Result<MutexGuard<'_>, IccError> {
        check(unsafe { libc::pthread_mutex_lock(self.raw.get()) })?;
        Ok(MutexGuard { mutex: self })
    }
}

impl SharedCondvar {
    /// # Safety
    /// Same contract as [`SharedRwLock::init`].
    pub unsafe fn init(this: *mut Self) -> Result<(), IccError> {
        let mut attr = MaybeUninit::<libc::pthread_condattr_t>::uninit();
        unsafe {
            check(libc::pthread_condattr_init(attr.as_mut_ptr()))?;
            let rc =
                libc::pthread_condattr_setpshared(attr.as_mut_ptr(), libc::PTHREAD_PROCESS_SHARED);
            let rc = if rc == 0 {
                libc::pthread_cond_init(this.cast(), attr.as_ptr())
            } else {
                rc
            };
            libc::pthread_condattr_destroy(attr.as_mut_ptr());
            check(rc)
        }
    }

    /// Atomically releases `guard`'s mutex and sleeps until notified.
    /// Spurious wakeups happen; callers loop on their own predicate.
    pub fn wait(&self, guard: &mut MutexGuard<'_>) -> Result<(), IccError> {
        check(unsafe { libc::pthread_cond_wait(self.raw.get(), guard.mutex.raw.get()) })
    }

    pub fn notify_all(&self) -> Result<(), IccError> {
        check(unsafe { libc::pthread_cond_broadcast(self.raw.get()) })
    }
}

/// Shared access; released on drop.
pub struct ReadGuard<'a> {
    lock: &'a SharedRwLock,
}

/// Exclusive access; released on drop.
pub struct WriteGuard<'a> {
    lock: &'a SharedRwLock,
}

pub struct MutexGuard<'a> {
    mutex: &'a SharedMutex,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        let rc = unsafe { libc::pthread_mutex_unlock(self.mutex.raw.get()) };
        debug_assert_eq!(rc, 0, "pthread_mutex_unlock failed");
    }
}
