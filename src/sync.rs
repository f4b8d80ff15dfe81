//! Single import point for the synchronization primitives used across the crate.

pub use std::{
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicIsize, AtomicU8, AtomicU64, AtomicUsize, Ordering},
    },
    thread::{Thread, current, park, park_timeout, yield_now},
    time::{Duration, Instant},
};

pub use parking_lot::{Condvar, Mutex, MutexGuard, const_mutex};
