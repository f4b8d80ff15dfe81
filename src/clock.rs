//! Monotonic time sources measured in nanoseconds.

use std::sync::OnceLock;

use crate::sync::{Arc, AtomicU64, Duration, Instant, Ordering};

/// Source of monotonic time in nanoseconds.
///
/// Values are only meaningful relative to each other.
pub trait Clock: Send + Sync {
    fn now(&self) -> u64;
}

impl<C> Clock for &C
where
    C: Clock + ?Sized,
{
    #[inline]
    fn now(&self) -> u64 {
        C::now(self)
    }
}

impl<C> Clock for Arc<C>
where
    C: Clock + ?Sized,
{
    #[inline]
    fn now(&self) -> u64 {
        C::now(self)
    }
}

/// Clock backed by [`Instant`].
///
/// Counts nanoseconds since the first time any `MonotonicClock` was read in this process.
#[derive(Clone, Copy, Debug, Default)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    #[inline]
    fn now(&self) -> u64 {
        static EPOCH: OnceLock<Instant> = OnceLock::new();
        let epoch = *EPOCH.get_or_init(Instant::now);
        duration_nanos(epoch.elapsed())
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicU64,
}

impl ManualClock {
    #[must_use]
    pub const fn new(nanos: u64) -> Self {
        ManualClock {
            nanos: AtomicU64::new(nanos),
        }
    }

    pub fn set(&self, nanos: u64) {
        self.nanos.store(nanos, Ordering::Release);
    }

    /// Moves the clock forward, saturating at `u64::MAX`.
    pub fn advance(&self, by: Duration) {
        let by = duration_nanos(by);
        let _ = self
            .nanos
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |nanos| {
                Some(nanos.saturating_add(by))
            });
    }
}

impl Clock for ManualClock {
    #[inline]
    fn now(&self) -> u64 {
        self.nanos.load(Ordering::Acquire)
    }
}

/// Converts duration to nanoseconds, saturating at `u64::MAX`.
#[inline]
pub(crate) fn duration_nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

#[test]
fn test_monotonic_clock_moves_forward() {
    let clock = MonotonicClock;
    let a = clock.now();
    std::thread::sleep(Duration::from_millis(2));
    let b = clock.now();
    assert!(b >= a + 2_000_000);
}

#[test]
fn test_manual_clock() {
    let clock = Arc::new(ManualClock::new(10));
    assert_eq!(clock.now(), 10);

    clock.advance(Duration::from_nanos(5));
    assert_eq!((&*clock).now(), 15);

    clock.set(u64::MAX - 1);
    clock.advance(Duration::from_secs(1));
    assert_eq!(clock.now(), u64::MAX);
}
