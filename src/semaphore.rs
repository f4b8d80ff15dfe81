//! Provides counting [`Semaphore`] with selectable fairness.
//!
//! A semaphore maintains a set of permits.
//! Acquiring blocks until a permit is available and takes it,
//! releasing adds permits and potentially unblocks waiters.
//! The number of permits may be negative, in which case releases first
//! repay the deficit before anyone can acquire.
//!
//! # Fairness
//!
//! Nonfair semaphore parks waiters on a single condition variable and
//! makes no promises about the order in which they are granted permits.
//!
//! Fair semaphore queues waiters in arrival order and releasing thread hands
//! permits directly to the head of the queue. A thread arriving later can
//! never overtake a queued waiter, except through [`Semaphore::try_acquire`]
//! which checks for a free permit without looking at the queue.

use core::fmt;

use crate::{
    error::Interrupted,
    interrupt::{self, Wake},
    park::deadline_after,
    sync::{Condvar, Duration, Instant, Mutex, Thread, const_mutex},
    wait_queue::{WaitNode, WaitOutcome, WaitQueue},
};

struct State {
    permits: isize,

    /// Waiters of a fair semaphore. Always empty for nonfair one.
    queue: WaitQueue,

    /// Threads blocked on the condition variable of a nonfair semaphore.
    blocked: usize,
}

impl State {
    #[inline]
    fn try_take(&mut self) -> bool {
        if self.permits > 0 {
            self.permits -= 1;
            true
        } else {
            false
        }
    }

    /// Hands one permit to the first waiter that is still waiting.
    /// Returns `false` if there is none.
    fn hand_off(&mut self) -> bool {
        while let Some(node) = self.queue.pop() {
            if node.signal() {
                return true;
            }
            tracing::trace!("skipping cancelled waiter");
        }
        false
    }

    fn add(&mut self, permits: usize) {
        self.permits = match self.permits.checked_add_unsigned(permits) {
            Some(permits) => permits,
            None => permits_overflow(),
        };
    }
}

/// Counting semaphore.
///
/// See [module level documentation](self) for details.
pub struct Semaphore {
    state: Mutex<State>,
    available: Condvar,
    fair: bool,
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Semaphore")
            .field("permits", &self.available_permits())
            .field("fair", &self.fair)
            .finish_non_exhaustive()
    }
}

impl Wake for Semaphore {
    fn wake(&self) {
        let _state = self.state.lock();
        self.available.notify_all();
    }
}

impl Semaphore {
    /// Creates nonfair semaphore with given number of permits.
    #[must_use]
    pub const fn new(permits: isize) -> Self {
        Self::with_fairness(permits, false)
    }

    /// Creates fair semaphore with given number of permits.
    #[must_use]
    pub const fn new_fair(permits: isize) -> Self {
        Self::with_fairness(permits, true)
    }

    #[must_use]
    pub const fn with_fairness(permits: isize, fair: bool) -> Self {
        Semaphore {
            state: const_mutex(State {
                permits,
                queue: WaitQueue::new(),
                blocked: 0,
            }),
            available: Condvar::new(),
            fair,
        }
    }

    /// Acquires a permit, blocking until one is available.
    ///
    /// # Errors
    ///
    /// Returns [`Interrupted`] if the calling thread was interrupted before or while waiting.
    /// No permit is consumed in that case.
    pub fn acquire(&self) -> Result<(), Interrupted> {
        interrupt::check()?;
        self.acquire_inner(None, true).map(|_| ())
    }

    /// Acquires a permit, blocking until one is available.
    ///
    /// Interruptions do not stop the wait.
    /// If the thread is interrupted while waiting its interruption status
    /// is still set when this function returns.
    pub fn acquire_uninterruptibly(&self) {
        let acquired = self.acquire_inner(None, false);
        debug_assert_eq!(acquired, Ok(true));
    }

    /// Acquires a permit only if one is available right now.
    ///
    /// This never waits and ignores fairness,
    /// a permit is taken even if other threads are queued on a fair semaphore.
    #[must_use]
    pub fn try_acquire(&self) -> bool {
        self.state.lock().try_take()
    }

    /// Acquires a permit, waiting up to `timeout` for one to become available.
    /// Returns `false` if the timeout elapsed first, without consuming a permit.
    ///
    /// # Errors
    ///
    /// Returns [`Interrupted`] if the calling thread was interrupted before or while waiting.
    pub fn try_acquire_for(&self, timeout: Duration) -> Result<bool, Interrupted> {
        interrupt::check()?;
        self.acquire_inner(Some(timeout), true)
    }

    /// Acquires a permit and returns a guard that releases it on drop.
    ///
    /// # Errors
    ///
    /// Returns [`Interrupted`] if the calling thread was interrupted before or while waiting.
    pub fn acquire_permit(&self) -> Result<SemaphorePermit<'_>, Interrupted> {
        self.acquire()?;
        Ok(SemaphorePermit { semaphore: self })
    }

    /// Same as [`try_acquire`](Self::try_acquire) but returns a guard.
    #[must_use]
    pub fn try_acquire_permit(&self) -> Option<SemaphorePermit<'_>> {
        if self.try_acquire() {
            Some(SemaphorePermit { semaphore: self })
        } else {
            None
        }
    }

    /// Releases one permit.
    #[inline]
    pub fn release(&self) {
        self.release_n(1);
    }

    /// Releases `permits` permits.
    ///
    /// Each permit repays deficit first, if any.
    /// Then on a fair semaphore it is handed to the longest waiting thread.
    /// Otherwise it is added to the pool of available permits.
    ///
    /// # Panics
    ///
    /// Panics if the number of available permits would overflow `isize`.
    pub fn release_n(&self, permits: usize) {
        if permits == 0 {
            return;
        }

        let mut state = self.state.lock();
        let mut remaining = permits;

        if state.permits < 0 {
            let repaid = remaining.min(state.permits.unsigned_abs());
            state.add(repaid);
            remaining -= repaid;
        }

        if self.fair {
            while remaining > 0 && state.hand_off() {
                remaining -= 1;
            }
        }

        if remaining > 0 {
            state.add(remaining);

            for _ in 0..remaining.min(state.blocked) {
                self.available.notify_one();
            }
        }
    }

    /// Takes all available permits and returns how many there were.
    ///
    /// Permit count is reset to zero, which also forgives any deficit.
    /// Queued waiters are not affected.
    pub fn drain_permits(&self) -> isize {
        let mut state = self.state.lock();
        core::mem::replace(&mut state.permits, 0)
    }

    /// Shrinks the number of available permits by `reduction`.
    /// Unlike acquiring this never blocks and may drive the count negative.
    ///
    /// # Panics
    ///
    /// Panics if the number of permits would overflow `isize`.
    pub fn reduce_permits(&self, reduction: usize) {
        let mut state = self.state.lock();
        state.permits = match state.permits.checked_sub_unsigned(reduction) {
            Some(permits) => permits,
            None => permits_overflow(),
        };
    }

    /// Returns current number of permits, negative if there is a deficit.
    #[must_use]
    pub fn available_permits(&self) -> isize {
        self.state.lock().permits
    }

    #[must_use]
    pub fn is_fair(&self) -> bool {
        self.fair
    }

    /// Returns `true` if any thread is blocked waiting for a permit.
    #[must_use]
    pub fn has_queued_threads(&self) -> bool {
        let state = self.state.lock();
        if self.fair {
            state.queue.has_waiting()
        } else {
            state.blocked > 0
        }
    }

    /// Returns number of threads blocked waiting for a permit.
    #[must_use]
    pub fn queue_length(&self) -> usize {
        let state = self.state.lock();
        if self.fair {
            state.queue.waiting()
        } else {
            state.blocked
        }
    }

    /// Returns threads waiting on a fair semaphore in arrival order.
    ///
    /// Nonfair semaphore keeps no record of individual waiters
    /// and always returns an empty list.
    #[must_use]
    pub fn queued_threads(&self) -> Vec<Thread> {
        self.state.lock().queue.waiting_threads()
    }

    /// Common part of all blocking acquires.
    /// `Ok(false)` means `timeout` elapsed.
    fn acquire_inner(
        &self,
        timeout: Option<Duration>,
        interruptible: bool,
    ) -> Result<bool, Interrupted> {
        if self.fair {
            self.acquire_fair(timeout, interruptible)
        } else if interruptible {
            interrupt::with_blocker(self, || self.acquire_nonfair(timeout, true))
        } else {
            self.acquire_nonfair(timeout, false)
        }
    }

    fn acquire_fair(
        &self,
        timeout: Option<Duration>,
        interruptible: bool,
    ) -> Result<bool, Interrupted> {
        let node = {
            let mut state = self.state.lock();
            if state.try_take() {
                return Ok(true);
            }
            if timeout == Some(Duration::ZERO) {
                return Ok(false);
            }

            let node = WaitNode::new();
            state.queue.push(node.clone());
            node
        };

        let deadline = timeout.and_then(deadline_after);

        match node.wait(deadline, interruptible) {
            WaitOutcome::Signalled => Ok(true),
            WaitOutcome::TimedOut => Ok(false),
            WaitOutcome::Interrupted => Err(Interrupted),
        }
    }

    fn acquire_nonfair(
        &self,
        timeout: Option<Duration>,
        interruptible: bool,
    ) -> Result<bool, Interrupted> {
        let mut state = self.state.lock();
        if state.try_take() {
            return Ok(true);
        }

        let deadline = timeout.map(deadline_after);
        state.blocked += 1;

        let result = loop {
            if interruptible && interrupt::interrupted() {
                // Pass on a notification this thread may have consumed.
                if state.permits > 0 {
                    self.available.notify_one();
                }
                break Err(Interrupted);
            }

            if state.try_take() {
                break Ok(true);
            }

            match deadline {
                None | Some(None) => self.available.wait(&mut state),
                Some(Some(deadline)) => {
                    if Instant::now() >= deadline {
                        break Ok(false);
                    }
                    let _ = self.available.wait_until(&mut state, deadline);
                }
            }
        };

        state.blocked -= 1;
        result
    }
}

/// RAII permit of a [`Semaphore`]. Releases the permit when dropped.
#[must_use = "permit is released immediately if not held"]
#[derive(Debug)]
pub struct SemaphorePermit<'a> {
    semaphore: &'a Semaphore,
}

impl SemaphorePermit<'_> {
    /// Keeps the permit acquired without releasing it.
    pub fn forget(self) {
        core::mem::forget(self);
    }
}

impl Drop for SemaphorePermit<'_> {
    fn drop(&mut self) {
        self.semaphore.release();
    }
}

#[cold]
#[inline(never)]
fn permits_overflow() -> ! {
    panic!("semaphore permit count overflow");
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;

    fn wait_until(cond: impl Fn() -> bool) {
        while !cond() {
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_permits_are_conserved() {
        for fair in [false, true] {
            let semaphore = Semaphore::with_fairness(3, fair);

            assert!(semaphore.try_acquire());
            semaphore.acquire().unwrap();
            semaphore.release_n(4);
            assert_eq!(semaphore.try_acquire_for(Duration::ZERO), Ok(true));
            semaphore.acquire_uninterruptibly();

            assert_eq!(semaphore.available_permits(), 3 + 4 - 4);
        }
    }

    #[test]
    fn test_permits_are_conserved_under_contention() {
        for fair in [false, true] {
            let semaphore = Semaphore::with_fairness(3, fair);

            std::thread::scope(|scope| {
                for _ in 0..8 {
                    scope.spawn(|| {
                        for _ in 0..500 {
                            semaphore.acquire().unwrap();
                            semaphore.release();
                        }
                    });
                }
            });

            assert_eq!(semaphore.available_permits(), 3);
            assert!(!semaphore.has_queued_threads());
        }
    }

    #[test]
    fn test_fair_grants_in_arrival_order() {
        let semaphore = Semaphore::new_fair(0);
        let (tx, rx) = mpsc::channel();

        std::thread::scope(|scope| {
            for i in 0..8 {
                let tx = tx.clone();
                let semaphore = &semaphore;
                scope.spawn(move || {
                    semaphore.acquire().unwrap();
                    tx.send(i).unwrap();
                });
                wait_until(|| semaphore.queue_length() == i + 1);
            }

            for i in 0..8 {
                semaphore.release();
                assert_eq!(rx.recv().unwrap(), i);
            }
        });

        assert_eq!(semaphore.available_permits(), 0);
    }

    #[test]
    fn test_queued_threads_in_arrival_order() {
        let semaphore = Semaphore::new_fair(0);
        let (tx, rx) = mpsc::channel();

        std::thread::scope(|scope| {
            let mut ids = Vec::new();
            for i in 0..3 {
                let tx = tx.clone();
                let semaphore = &semaphore;
                scope.spawn(move || {
                    tx.send(crate::sync::current().id()).unwrap();
                    semaphore.acquire_uninterruptibly();
                });
                ids.push(rx.recv().unwrap());
                wait_until(|| semaphore.queue_length() == i + 1);
            }

            let queued: Vec<_> = semaphore.queued_threads().iter().map(Thread::id).collect();
            assert_eq!(queued, ids);

            semaphore.release_n(3);
        });
    }

    #[test]
    fn test_try_acquire_never_enqueues() {
        let semaphore = Semaphore::new_fair(0);

        assert!(!semaphore.try_acquire());
        assert!(!semaphore.has_queued_threads());

        std::thread::scope(|scope| {
            let waiter = scope.spawn(|| semaphore.try_acquire_for(Duration::from_secs(10)));

            // Timed acquire honours fairness and joins the queue.
            wait_until(|| semaphore.queue_length() == 1);
            semaphore.release();
            assert_eq!(waiter.join().unwrap(), Ok(true));
        });

        // Barging acquire takes whatever permit is counted. Releases hand permits
        // straight to queued waiters, so a counted permit never coexists with a
        // live waiter and there is nothing for `try_acquire` to overtake.
        semaphore.release();
        assert!(semaphore.try_acquire());
    }

    #[test]
    fn test_release_wakes_exactly_released_count() {
        for fair in [false, true] {
            let semaphore = Semaphore::with_fairness(0, fair);
            let (tx, rx) = mpsc::channel();

            std::thread::scope(|scope| {
                for _ in 0..4 {
                    let tx = tx.clone();
                    let semaphore = &semaphore;
                    scope.spawn(move || {
                        semaphore.acquire().unwrap();
                        tx.send(()).unwrap();
                    });
                }
                wait_until(|| semaphore.queue_length() == 4);

                semaphore.release_n(2);
                rx.recv().unwrap();
                rx.recv().unwrap();
                assert!(
                    rx.recv_timeout(Duration::from_millis(50)).is_err(),
                    "more waiters woke than permits released"
                );
                assert_eq!(semaphore.queue_length(), 2);

                semaphore.release_n(2);
                rx.recv().unwrap();
                rx.recv().unwrap();
            });

            assert_eq!(semaphore.available_permits(), 0);
        }
    }

    #[test]
    fn test_interrupted_waiter_does_not_consume_permit() {
        for fair in [false, true] {
            let semaphore = Semaphore::with_fairness(0, fair);
            let (tx, rx) = mpsc::channel();

            std::thread::scope(|scope| {
                let waiter = scope.spawn(|| {
                    tx.send(interrupt::current()).unwrap();
                    semaphore.acquire()
                });

                let interrupter = rx.recv().unwrap();
                wait_until(|| semaphore.queue_length() == 1);
                interrupter.interrupt();
                assert_eq!(waiter.join().unwrap(), Err(Interrupted));
            });

            semaphore.release();
            assert_eq!(semaphore.available_permits(), 1);
            assert_eq!(semaphore.acquire(), Ok(()));
            assert_eq!(semaphore.available_permits(), 0);
        }
    }

    #[test]
    fn test_prior_interrupt_fails_immediately() {
        let semaphore = Semaphore::new_fair(1);

        interrupt::current().interrupt();
        assert_eq!(semaphore.acquire(), Err(Interrupted));
        assert!(!interrupt::is_interrupted());

        interrupt::current().interrupt();
        assert_eq!(
            semaphore.try_acquire_for(Duration::from_secs(1)),
            Err(Interrupted)
        );
        assert_eq!(semaphore.available_permits(), 1);
    }

    #[test]
    fn test_uninterruptible_acquire_preserves_interrupt() {
        for fair in [false, true] {
            let semaphore = Semaphore::with_fairness(0, fair);
            let (tx, rx) = mpsc::channel();

            std::thread::scope(|scope| {
                let waiter = scope.spawn(|| {
                    tx.send(interrupt::current()).unwrap();
                    semaphore.acquire_uninterruptibly();
                    interrupt::is_interrupted()
                });

                let interrupter = rx.recv().unwrap();
                wait_until(|| semaphore.queue_length() == 1);
                interrupter.interrupt();

                std::thread::sleep(Duration::from_millis(20));
                assert_eq!(semaphore.queue_length(), 1);

                semaphore.release();
                assert!(waiter.join().unwrap());
            });
        }
    }

    #[test]
    fn test_timed_acquire_times_out() {
        for fair in [false, true] {
            let semaphore = Semaphore::with_fairness(0, fair);

            assert_eq!(
                semaphore.try_acquire_for(Duration::from_millis(10)),
                Ok(false)
            );
            assert_eq!(semaphore.try_acquire_for(Duration::ZERO), Ok(false));
            assert_eq!(semaphore.available_permits(), 0);
            assert!(!semaphore.has_queued_threads());

            // Timed out waiter is skipped by the next release.
            semaphore.release();
            assert!(semaphore.try_acquire());
        }
    }

    #[test]
    fn test_deficit_is_repaid_first() {
        for fair in [false, true] {
            let semaphore = Semaphore::with_fairness(-1, fair);

            std::thread::scope(|scope| {
                let waiter = scope.spawn(|| semaphore.acquire());
                wait_until(|| semaphore.queue_length() == 1);

                semaphore.release();
                assert_eq!(semaphore.available_permits(), 0);
                std::thread::sleep(Duration::from_millis(20));
                assert_eq!(semaphore.queue_length(), 1);

                semaphore.release();
                assert_eq!(waiter.join().unwrap(), Ok(()));
            });

            assert_eq!(semaphore.available_permits(), 0);
        }
    }

    #[test]
    fn test_drain_and_reduce() {
        let semaphore = Semaphore::new(5);

        semaphore.reduce_permits(2);
        assert_eq!(semaphore.available_permits(), 3);
        assert_eq!(semaphore.drain_permits(), 3);
        assert_eq!(semaphore.available_permits(), 0);

        semaphore.reduce_permits(4);
        assert_eq!(semaphore.available_permits(), -4);
        assert!(!semaphore.try_acquire());

        assert_eq!(semaphore.drain_permits(), -4);
        assert_eq!(semaphore.available_permits(), 0);
    }

    #[test]
    fn test_drain_keeps_waiters_queued() {
        for fair in [false, true] {
            let semaphore = Semaphore::with_fairness(-2, fair);
            let (tx, rx) = mpsc::channel();

            std::thread::scope(|scope| {
                for _ in 0..2 {
                    let tx = tx.clone();
                    let semaphore = &semaphore;
                    scope.spawn(move || tx.send(semaphore.acquire()).unwrap());
                }
                wait_until(|| semaphore.queue_length() == 2);

                // Deficit is forgiven, waiters stay where they are.
                assert_eq!(semaphore.drain_permits(), -2);
                assert_eq!(semaphore.drain_permits(), 0);
                assert_eq!(semaphore.queue_length(), 2);
                assert!(rx.recv_timeout(Duration::from_millis(20)).is_err());

                semaphore.release();
                assert_eq!(rx.recv().unwrap(), Ok(()));
                assert!(
                    rx.recv_timeout(Duration::from_millis(50)).is_err(),
                    "drained semaphore woke more waiters than released"
                );
                assert_eq!(semaphore.queue_length(), 1);

                semaphore.release();
                assert_eq!(rx.recv().unwrap(), Ok(()));
            });

            assert_eq!(semaphore.available_permits(), 0);
            assert!(!semaphore.has_queued_threads());
        }
    }

    #[test]
    fn test_permit_guard() {
        let semaphore = Semaphore::new_fair(1);

        {
            let _permit = semaphore.acquire_permit().unwrap();
            assert!(semaphore.try_acquire_permit().is_none());
        }
        assert_eq!(semaphore.available_permits(), 1);

        semaphore.try_acquire_permit().unwrap().forget();
        assert_eq!(semaphore.available_permits(), 0);
    }

    #[test]
    #[should_panic(expected = "overflow")]
    fn test_release_overflow_panics() {
        let semaphore = Semaphore::new(isize::MAX);
        semaphore.release();
    }
}
