//! Cooperative thread interruption.
//!
//! Each thread owns an interruption status flag.
//! Another thread holding the [`Interrupter`] handle may set the flag,
//! which wakes the thread if it is blocked in an interruptible operation
//! of this crate. The blocked operation then fails with [`Interrupted`].
//!
//! ```rust
//! # #[cfg(feature = "semaphore")]
//! # {
//! use waitline::{interrupt, semaphore::Semaphore};
//!
//! let semaphore = Semaphore::new(0);
//! let (tx, rx) = std::sync::mpsc::channel();
//!
//! std::thread::scope(|scope| {
//!     let waiter = scope.spawn(|| {
//!         tx.send(interrupt::current()).unwrap();
//!         semaphore.acquire()
//!     });
//!
//!     rx.recv().unwrap().interrupt();
//!     assert!(waiter.join().unwrap().is_err());
//! });
//!
//! // No permit was consumed by the interrupted waiter.
//! assert_eq!(semaphore.available_permits(), 0);
//! # }
//! ```

use core::fmt;

use crate::{
    error::Interrupted,
    sync::{Arc, AtomicBool, Mutex, Ordering, Thread, const_mutex, current as current_thread},
};

/// Something a blocked thread waits on that must be poked
/// for the thread to notice an interruption.
///
/// Implementors lock the mutex protecting their condition before notifying,
/// so a waiter cannot miss the interruption between its check and its wait.
pub(crate) trait Wake {
    fn wake(&self);
}

struct Blocker(*const (dyn Wake + Sync));

// Safety: the pointee is `Sync` and only dereferenced under the registration lock.
unsafe impl Send for Blocker {}

struct InterruptState {
    interrupted: AtomicBool,
    thread: Thread,

    /// Condition the thread is currently blocked on, if any.
    blocker: Mutex<Option<Blocker>>,
}

thread_local! {
    static CURRENT: Arc<InterruptState> = Arc::new(InterruptState {
        interrupted: AtomicBool::new(false),
        thread: current_thread(),
        blocker: const_mutex(None),
    });
}

/// Handle that allows interrupting a particular thread.
#[derive(Clone)]
pub struct Interrupter {
    state: Arc<InterruptState>,
}

impl fmt::Debug for Interrupter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interrupter")
            .field("thread", &self.state.thread.id())
            .field("interrupted", &self.is_interrupted())
            .finish()
    }
}

impl Interrupter {
    /// Sets the interruption status of the thread and wakes it
    /// if it is blocked in an interruptible operation.
    pub fn interrupt(&self) {
        self.state.interrupted.store(true, Ordering::SeqCst);

        {
            let blocker = self.state.blocker.lock();
            if let Some(Blocker(target)) = &*blocker {
                // Safety: registration is removed under this lock
                // before the target can go out of scope.
                unsafe { (**target).wake() };
            }
        }

        self.state.thread.unpark();
    }

    /// Returns the interruption status without clearing it.
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        self.state.interrupted.load(Ordering::SeqCst)
    }

    /// Returns the thread this handle interrupts.
    #[must_use]
    pub fn thread(&self) -> &Thread {
        &self.state.thread
    }
}

/// Returns the interrupter for the calling thread.
#[must_use]
pub fn current() -> Interrupter {
    CURRENT.with(|state| Interrupter {
        state: state.clone(),
    })
}

/// Returns the interruption status of the calling thread without clearing it.
#[must_use]
pub fn is_interrupted() -> bool {
    CURRENT.with(|state| state.interrupted.load(Ordering::SeqCst))
}

/// Returns and clears the interruption status of the calling thread.
pub fn interrupted() -> bool {
    CURRENT.with(|state| state.interrupted.swap(false, Ordering::SeqCst))
}

/// Sets the interruption status of the calling thread.
pub(crate) fn self_interrupt() {
    CURRENT.with(|state| state.interrupted.store(true, Ordering::SeqCst));
}

/// Consumes a pending interruption of the calling thread.
pub(crate) fn check() -> Result<(), Interrupted> {
    if interrupted() {
        Err(Interrupted)
    } else {
        Ok(())
    }
}

/// Runs `f` with `target` registered as the condition the calling thread blocks on.
///
/// `f` must not hold the lock `target` takes in `Wake::wake` when it returns,
/// and must not be called with that lock held.
pub(crate) fn with_blocker<W, R>(target: &W, f: impl FnOnce() -> R) -> R
where
    W: Wake + Sync,
{
    struct Restore<'a> {
        state: &'a InterruptState,
        previous: Option<Blocker>,
    }

    impl Drop for Restore<'_> {
        fn drop(&mut self) {
            *self.state.blocker.lock() = self.previous.take();
        }
    }

    CURRENT.with(|state| {
        let target: *const (dyn Wake + Sync + '_) = target;

        // Safety: only the lifetime is erased.
        // `Restore` unregisters the pointer before `target` goes out of scope.
        let target = unsafe {
            core::mem::transmute::<*const (dyn Wake + Sync + '_), *const (dyn Wake + Sync)>(
                target,
            )
        };

        let previous = state.blocker.lock().replace(Blocker(target));
        let _restore = Restore { state, previous };
        f()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::{Condvar, Duration};

    struct Gate {
        open: Mutex<bool>,
        condvar: Condvar,
    }

    impl Wake for Gate {
        fn wake(&self) {
            let _open = self.open.lock();
            self.condvar.notify_all();
        }
    }

    impl Gate {
        fn wait(&self) -> Result<(), Interrupted> {
            with_blocker(self, || {
                let mut open = self.open.lock();
                loop {
                    check()?;
                    if *open {
                        return Ok(());
                    }
                    self.condvar.wait(&mut open);
                }
            })
        }
    }

    #[test]
    fn test_status_is_cleared_by_interrupted() {
        current().interrupt();
        assert!(is_interrupted());
        assert!(interrupted());
        assert!(!is_interrupted());
        assert!(!interrupted());
    }

    #[test]
    fn test_check_consumes_status() {
        self_interrupt();
        assert_eq!(check(), Err(Interrupted));
        assert_eq!(check(), Ok(()));
    }

    #[test]
    fn test_interrupt_wakes_condvar_waiter() {
        let gate = Gate {
            open: const_mutex(false),
            condvar: Condvar::new(),
        };
        let (tx, rx) = std::sync::mpsc::channel();

        std::thread::scope(|scope| {
            let waiter = scope.spawn(|| {
                tx.send(current()).unwrap();
                let result = gate.wait();
                (result, is_interrupted())
            });

            let interrupter = rx.recv().unwrap();
            std::thread::sleep(Duration::from_millis(20));
            interrupter.interrupt();

            let (result, still_interrupted) = waiter.join().unwrap();
            assert_eq!(result, Err(Interrupted));
            assert!(!still_interrupted);
        });
    }

    #[test]
    fn test_blocker_is_unregistered_after_wait() {
        let gate = Gate {
            open: const_mutex(true),
            condvar: Condvar::new(),
        };
        assert_eq!(gate.wait(), Ok(()));

        CURRENT.with(|state| assert!(state.blocker.lock().is_none()));

        // Interrupting with no registered blocker only sets the flag.
        current().interrupt();
        assert!(interrupted());
    }
}
