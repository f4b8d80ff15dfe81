//! Deadline-aware thread parking used by blocked waiters.

use crate::sync::{Instant, park, park_timeout};

/// Blocks the current thread until it is unparked, the `deadline` passes
/// or it wakes up spuriously.
///
/// Callers must re-check their wake condition after this returns.
#[inline]
pub fn park_until(deadline: Option<Instant>) {
    match deadline {
        None => park(),
        Some(deadline) => {
            let now = Instant::now();
            if deadline > now {
                park_timeout(deadline - now);
            }
        }
    }
}

/// Computes the deadline `timeout` from now.
/// `None` means the deadline is too far away to be represented and the wait is unbounded.
#[inline]
pub fn deadline_after(timeout: crate::sync::Duration) -> Option<Instant> {
    Instant::now().checked_add(timeout)
}

#[test]
fn test_park_until_elapsed_deadline_returns() {
    // Must not block when the deadline already passed.
    park_until(Some(Instant::now()));
}

#[test]
fn test_unpark_wakes_parked_thread() {
    let (tx, rx) = std::sync::mpsc::channel();
    let handle = std::thread::spawn(move || {
        tx.send(crate::sync::current()).unwrap();
        park_until(None);
    });
    let thread = rx.recv().unwrap();
    thread.unpark();
    handle.join().unwrap();
}

#[test]
fn test_deadline_after_overflow_is_unbounded() {
    assert!(deadline_after(crate::sync::Duration::MAX).is_none());
    assert!(deadline_after(crate::sync::Duration::from_millis(1)).is_some());
}
