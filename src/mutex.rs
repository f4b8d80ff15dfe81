//! Mutual exclusion locks built on a single-permit [`Semaphore`].
//!
//! [`FairMutex`] grants the lock to waiting threads in arrival order.
//! [`UnfairMutex`] lets any woken thread take it.
//! Both are [`lock_api`] mutexes and have the familiar guard-based interface.
//!
//! ```rust
//! use waitline::mutex::FairMutex;
//!
//! let counter = FairMutex::new(0);
//!
//! std::thread::scope(|scope| {
//!     for _ in 0..4 {
//!         scope.spawn(|| *counter.lock() += 1);
//!     }
//! });
//!
//! assert_eq!(counter.into_inner(), 4);
//! ```

use crate::semaphore::Semaphore;

/// Raw mutex that holds a semaphore with one permit.
///
/// Locking never observes interruptions.
pub struct RawSemaphoreMutex<const FAIR: bool> {
    semaphore: Semaphore,
}

impl<const FAIR: bool> RawSemaphoreMutex<FAIR> {
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        RawSemaphoreMutex {
            semaphore: Semaphore::with_fairness(1, FAIR),
        }
    }

    /// Returns number of threads blocked waiting for the lock.
    #[inline]
    #[must_use]
    pub fn queue_length(&self) -> usize {
        self.semaphore.queue_length()
    }
}

impl<const FAIR: bool> Default for RawSemaphoreMutex<FAIR> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl<const FAIR: bool> lock_api::RawMutex for RawSemaphoreMutex<FAIR> {
    type GuardMarker = lock_api::GuardSend;

    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new();

    #[inline]
    fn lock(&self) {
        self.semaphore.acquire_uninterruptibly();
    }

    #[inline]
    fn try_lock(&self) -> bool {
        self.semaphore.try_acquire()
    }

    #[inline]
    unsafe fn unlock(&self) {
        self.semaphore.release();
    }

    #[inline]
    fn is_locked(&self) -> bool {
        self.semaphore.available_permits() <= 0
    }
}

pub type RawFairMutex = RawSemaphoreMutex<true>;
pub type RawUnfairMutex = RawSemaphoreMutex<false>;

/// Mutex that hands the lock to waiters in arrival order.
pub type FairMutex<T> = lock_api::Mutex<RawFairMutex, T>;
pub type FairMutexGuard<'a, T> = lock_api::MutexGuard<'a, RawFairMutex, T>;

pub type UnfairMutex<T> = lock_api::Mutex<RawUnfairMutex, T>;
pub type UnfairMutexGuard<'a, T> = lock_api::MutexGuard<'a, RawUnfairMutex, T>;

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use lock_api::RawMutex as _;

    use super::*;
    use crate::sync::Duration;

    #[test]
    fn test_try_lock() {
        let mutex = FairMutex::new(1);

        let guard = mutex.lock();
        assert!(mutex.is_locked());
        assert!(mutex.try_lock().is_none());
        drop(guard);

        assert!(!mutex.is_locked());
        assert_eq!(*mutex.try_lock().unwrap(), 1);
    }

    #[test]
    fn test_unfair_mutex_counts() {
        let counter = UnfairMutex::new(0);

        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for _ in 0..1000 {
                        *counter.lock() += 1;
                    }
                });
            }
        });

        assert_eq!(counter.into_inner(), 8000);
    }

    #[test]
    fn test_fair_mutex_lock_order() {
        let mutex = FairMutex::new(Vec::new());
        let (tx, rx) = mpsc::channel();

        std::thread::scope(|scope| {
            let guard = mutex.lock();

            for i in 0..4 {
                let mutex = &mutex;
                let tx = tx.clone();
                scope.spawn(move || {
                    mutex.lock().push(i);
                    tx.send(()).unwrap();
                });
                while unsafe { mutex.raw() }.queue_length() != i + 1 {
                    std::thread::sleep(Duration::from_millis(1));
                }
            }

            drop(guard);
            for _ in 0..4 {
                rx.recv().unwrap();
            }
        });

        assert_eq!(mutex.into_inner(), [0, 1, 2, 3]);
    }

    #[test]
    fn test_raw_init_is_unlocked() {
        let raw = RawUnfairMutex::INIT;
        assert!(!raw.is_locked());
        assert!(raw.try_lock());
        assert!(raw.is_locked());
        unsafe { raw.unlock() };
        assert!(!raw.is_locked());
    }
}
