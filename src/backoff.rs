/// Waiting hint for threads that expect a hand-off soon.
/// Spins with exponentially growing bursts, then yields.
/// When yield count exceeds its limit it advises caller to park the thread.
#[derive(Debug, Default)]
pub struct BackOff {
    step: u32,
}

impl BackOff {
    const SPIN_THRESHOLD: u32 = 6;
    const YIELD_THRESHOLD: u32 = 10;

    #[inline(always)]
    #[must_use]
    pub fn new() -> Self {
        BackOff { step: 0 }
    }

    #[inline(always)]
    pub fn reset(&mut self) {
        self.step = 0;
    }

    /// Waits a little, longer on each call.
    #[inline]
    pub fn snooze(&mut self) {
        if self.step <= Self::SPIN_THRESHOLD {
            for _ in 0..1u32 << self.step {
                core::hint::spin_loop();
            }
        } else {
            crate::sync::yield_now();
        }

        if self.step <= Self::YIELD_THRESHOLD {
            self.step += 1;
        }
    }

    /// Returns `true` once spinning and yielding did not pay off
    /// and the thread should be parked instead.
    #[must_use]
    pub fn should_park(&self) -> bool {
        self.step > Self::YIELD_THRESHOLD
    }
}

#[test]
fn test_backoff_escalates_to_park() {
    let mut backoff = BackOff::new();
    let mut snoozes = 0;
    while !backoff.should_park() {
        backoff.snooze();
        snoozes += 1;
    }
    assert_eq!(snoozes, BackOff::YIELD_THRESHOLD + 1);

    backoff.reset();
    assert!(!backoff.should_park());
}
