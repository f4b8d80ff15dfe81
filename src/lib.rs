//! # Waitline
//!
//! Blocking coordination primitives with explicit waiting order.
//! Counting semaphores that can be fair, delay-ordered work queues
//! and a scheduler of delayed and periodic tasks built on top of them.
//!
//! Each algorithm has its own feature flag, all of them are enabled by default.
//!
//! ## Available Algorithms
//!
//! ### 🚦 Semaphore
//! Counting semaphore with optional FIFO fairness.
//! Permit count may start negative, releases repay the deficit first.
//! **Feature:** `semaphore`
//!
//! #### Examples
//!
//! Here is an example of limiting concurrent access to a resource with a fair semaphore:
//!
//! ```rust
//! # #[cfg(feature = "semaphore")]
//! # {
//! use waitline::semaphore::Semaphore;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! let semaphore = Semaphore::new_fair(2);
//! let inside = AtomicUsize::new(0);
//!
//! std::thread::scope(|scope| {
//!     for _ in 0..8 {
//!         scope.spawn(|| {
//!             let _permit = semaphore.acquire_permit().unwrap();
//!
//!             // At most two threads get here at the same time.
//!             let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
//!             assert!(now <= 2);
//!             inside.fetch_sub(1, Ordering::SeqCst);
//!         });
//!     }
//! });
//!
//! assert_eq!(semaphore.available_permits(), 2);
//! # }
//! ```
//!
//! Same semaphores back [`FairMutex`](mutex::FairMutex) and [`UnfairMutex`](mutex::UnfairMutex),
//! regular [`lock_api`] mutexes.
//!
//! ### ⏳ Delay Queue
//! Unbounded blocking queue where entries become available after their delay expires.
//! Entries are kept in a binary heap ordered by trigger time and submission order.
//! **Feature:** `delay-queue`
//!
//! #### Examples
//!
//! ```rust
//! # #[cfg(feature = "delay-queue")]
//! # {
//! use std::sync::Arc;
//! use waitline::{clock::{Clock, MonotonicClock}, delay_queue::{DelayQueue, Delayed, delay_until}};
//!
//! struct Deadline(u64);
//!
//! impl Delayed for Deadline {
//!     fn delay(&self, now: u64) -> i64 {
//!         delay_until(self.0, now)
//!     }
//! }
//!
//! let queue = DelayQueue::new();
//! let now = MonotonicClock.now();
//! queue.offer(Arc::new(Deadline(now + 1_000_000)));
//!
//! // Blocks for about a millisecond.
//! let entry = queue.take().unwrap();
//! assert!(MonotonicClock.now() >= entry.0);
//! # }
//! ```
//!
//! ### ⏰ Scheduler
//! Runs one-shot, fixed-rate and fixed-delay tasks on threads donated by the caller.
//! Shutdown behaviour is configured with [`ShutdownPolicy`](scheduler::ShutdownPolicy).
//! **Feature:** `scheduler`
//!
//! #### Examples
//!
//! ```rust
//! # #[cfg(feature = "scheduler")]
//! # {
//! use std::time::Duration;
//! use waitline::{clock::ManualClock, scheduler::{Scheduler, ShutdownPolicy}};
//!
//! let scheduler = Scheduler::with_config(ManualClock::new(0), ShutdownPolicy::default());
//! let task = scheduler
//!     .schedule_at_fixed_rate(Duration::from_nanos(100), Duration::from_nanos(50), || {})
//!     .unwrap();
//!
//! scheduler.clock().set(130);
//! assert_eq!(scheduler.run_pending(), 1);
//!
//! // Next run is anchored to the previous trigger time, not to when it ran.
//! assert_eq!(task.trigger_time(), 150);
//! # }
//! ```
//!
//! ## Interruption
//!
//! Blocking operations are interruptible through [`interrupt::Interrupter`] handles,
//! and fail with [`Interrupted`] without consuming anything they were waiting for.

#![deny(clippy::pedantic)]
#![allow(clippy::inline_always, clippy::module_name_repetitions)]

mod sync;

pub mod backoff;
pub mod error;
pub mod interrupt;
pub mod park;

#[cfg(feature = "semaphore")]
mod wait_queue;

#[cfg(feature = "semaphore")]
pub mod semaphore;

#[cfg(feature = "semaphore")]
pub mod mutex;

#[cfg(feature = "delay-queue")]
pub mod clock;

#[cfg(feature = "delay-queue")]
pub mod delay_queue;

#[cfg(feature = "scheduler")]
pub mod scheduled;

#[cfg(feature = "scheduler")]
pub mod scheduler;

pub use self::error::Interrupted;

#[cfg(feature = "scheduler")]
pub use self::error::{ScheduleError, TaskError};

// One central function responsible for reporting capacity overflows. This'll
// ensure that the code generation related to these panics is minimal as there's
// only one location which panics rather than a bunch throughout the module.
#[cfg(any(feature = "semaphore", feature = "delay-queue"))]
#[cold]
#[inline(never)]
fn capacity_overflow() -> ! {
    panic!("capacity overflow");
}
