//! A lock that is safe to take from inside an allocator callback.
//!
//! The hook trampolines run while the allocator is in the middle of a free,
//! so nothing on that path may allocate. `std::sync::Mutex` and
//! `parking_lot::Mutex` can both allocate when contended (the latter grows a
//! global table of parked threads). This one parks on a futex word directly
//! on Linux and spins elsewhere.

use core::sync::atomic::{AtomicI32, Ordering};

const UNLOCKED: i32 = 0;
const LOCKED: i32 = 1;
const CONTENDED: i32 = 2;

pub struct RawMutex {
    state: AtomicI32,
}

unsafe impl Send for RawMutex {}
unsafe impl Sync for RawMutex {}

impl RawMutex {
    pub const fn new() -> Self {
        Self {
            state: AtomicI32::new(UNLOCKED),
        }
    }

    #[inline]
    pub fn lock(&self) -> RawMutexGuard<'_> {
        if self
            .state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            self.lock_contended();
        }
        RawMutexGuard { mutex: self }
    }

    #[cold]
    fn lock_contended(&self) {
        // Once we have waited, we can't know whether others are waiting too,
        // so the lock is always taken in the contended state from here.
        while self.state.swap(CONTENDED, Ordering::Acquire) != UNLOCKED {
            self.wait();
        }
    }

    #[cfg(target_os = "linux")]
    fn wait(&self) {
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                &self.state as *const AtomicI32,
                libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
                CONTENDED,
                core::ptr::null::<libc::timespec>(),
            );
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn wait(&self) {
        core::hint::spin_loop();
    }

    #[inline]
    fn unlock(&self) {
        if self.state.swap(UNLOCKED, Ordering::Release) == CONTENDED {
            self.wake_one();
        }
    }

    #[cold]
    fn wake_one(&self) {
        #[cfg(target_os = "linux")]
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                &self.state as *const AtomicI32,
                libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
                1i32,
            );
        }
    }
}

impl Default for RawMutex {
    fn default() -> Self {
        Self::new()
    }
}

/// Releases the lock when dropped.
pub struct RawMutexGuard<'a> {
    mutex: &'a RawMutex,
}

impl Drop for RawMutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}
