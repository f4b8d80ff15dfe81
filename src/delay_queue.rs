//! Unbounded blocking queue of delayed entries.
//!
//! Entries become available once their delay expires.
//! The head of the queue is the entry whose delay expired furthest in the past,
//! or that expires soonest if none has expired yet.
//!
//! Storage is a binary min-heap kept in one array.
//! Entries that carry a [`SortKey`] are ordered by it, which makes ordering of
//! entries with equal deadlines FIFO if sequence numbers are handed out in
//! submission order. Entries that carry a [`HeapIndex`] remember their own
//! position in the heap so removing them does not need a scan.
//!
//! ```rust
//! use std::sync::Arc;
//! use waitline::{clock::ManualClock, delay_queue::{DelayQueue, Delayed, delay_until}};
//!
//! struct Reminder {
//!     at: u64,
//!     text: &'static str,
//! }
//!
//! impl Delayed for Reminder {
//!     fn delay(&self, now: u64) -> i64 {
//!         delay_until(self.at, now)
//!     }
//! }
//!
//! let queue = DelayQueue::with_clock(ManualClock::new(0));
//! queue.offer(Arc::new(Reminder { at: 20, text: "later" }));
//! queue.offer(Arc::new(Reminder { at: 10, text: "sooner" }));
//!
//! assert!(queue.poll().is_none());
//!
//! queue.clock().set(15);
//! assert_eq!(queue.poll().unwrap().text, "sooner");
//! assert!(queue.poll().is_none());
//! ```

use core::{cmp::Ordering as CmpOrdering, fmt};

use crate::{
    clock::{Clock, MonotonicClock},
    error::Interrupted,
    interrupt::{self, Wake},
    park::deadline_after,
    sync::{Arc, AtomicIsize, Condvar, Duration, Instant, Mutex, MutexGuard, Ordering},
};

/// Entry of a [`DelayQueue`].
pub trait Delayed {
    /// Returns remaining delay in nanoseconds at time `now`.
    /// Zero or negative values mean the delay has expired.
    fn delay(&self, now: u64) -> i64;

    /// Returns key that totally orders this entry among other keyed entries.
    fn sort_key(&self) -> Option<SortKey> {
        None
    }

    /// Returns slot where the queue records position of this entry.
    fn heap_index(&self) -> Option<&HeapIndex> {
        None
    }
}

/// Ordering key of a delayed entry.
/// Earlier trigger time comes first, sequence number breaks ties.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct SortKey {
    pub trigger: u64,
    pub sequence: u64,
}

/// Position of an entry inside a queue's heap, or nothing if it is not enqueued.
///
/// An entry that provides a heap index may sit in at most one queue, at most once.
/// Offering it again before it was taken or removed corrupts the recorded position.
#[derive(Debug)]
pub struct HeapIndex(AtomicIsize);

impl HeapIndex {
    const NONE: isize = -1;

    #[must_use]
    pub const fn new() -> Self {
        HeapIndex(AtomicIsize::new(Self::NONE))
    }

    /// Returns the recorded position.
    #[must_use]
    pub fn get(&self) -> Option<usize> {
        usize::try_from(self.0.load(Ordering::Acquire)).ok()
    }

    #[inline]
    fn set(&self, index: usize) {
        let index = isize::try_from(index).unwrap_or(Self::NONE);
        self.0.store(index, Ordering::Release);
    }

    #[inline]
    fn clear(&self) {
        self.0.store(Self::NONE, Ordering::Release);
    }
}

impl Default for HeapIndex {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

/// Computes the signed delay from `now` until `trigger`, saturating at `i64` bounds.
#[must_use]
pub fn delay_until(trigger: u64, now: u64) -> i64 {
    if trigger >= now {
        i64::try_from(trigger - now).unwrap_or(i64::MAX)
    } else {
        i64::try_from(now - trigger).map_or(i64::MIN, |late| -late)
    }
}

fn compare<T>(lhs: &T, rhs: &T, now: u64) -> CmpOrdering
where
    T: Delayed + ?Sized,
{
    if core::ptr::addr_eq(lhs, rhs) {
        return CmpOrdering::Equal;
    }

    match (lhs.sort_key(), rhs.sort_key()) {
        (Some(lhs), Some(rhs)) => lhs.cmp(&rhs),
        _ => lhs.delay(now).cmp(&rhs.delay(now)),
    }
}

#[inline]
fn record<T>(entry: &T, index: usize)
where
    T: Delayed + ?Sized,
{
    if let Some(slot) = entry.heap_index() {
        slot.set(index);
    }
}

#[inline]
fn forget<T>(entry: &T)
where
    T: Delayed + ?Sized,
{
    if let Some(slot) = entry.heap_index() {
        slot.clear();
    }
}

struct Heap<T: ?Sized> {
    entries: Vec<Arc<T>>,
}

impl<T> Heap<T>
where
    T: Delayed + ?Sized,
{
    const INITIAL_CAPACITY: usize = 64;

    /// Inserts the entry and returns its final position.
    fn push(&mut self, entry: Arc<T>, now: u64) -> usize {
        if self.entries.len() == self.entries.capacity() {
            self.grow();
        }

        self.entries.push(entry);
        self.sift_up(self.entries.len() - 1, now)
    }

    #[cold]
    fn grow(&mut self) {
        let cap = self.entries.capacity();
        let new_cap = if cap == 0 {
            Self::INITIAL_CAPACITY
        } else {
            match cap.checked_add(cap / 2) {
                Some(new_cap) => new_cap,
                None => crate::capacity_overflow(),
            }
        };

        tracing::debug!(from = cap, to = new_cap, "growing delay heap");
        self.entries.reserve_exact(new_cap - self.entries.len());
    }

    fn sift_up(&mut self, mut k: usize, now: u64) -> usize {
        while k > 0 {
            let parent = (k - 1) / 2;
            if compare(&*self.entries[k], &*self.entries[parent], now) != CmpOrdering::Less {
                break;
            }
            self.entries.swap(k, parent);
            record(&*self.entries[k], k);
            k = parent;
        }
        record(&*self.entries[k], k);
        k
    }

    fn sift_down(&mut self, mut k: usize, now: u64) -> usize {
        let len = self.entries.len();
        loop {
            let left = 2 * k + 1;
            if left >= len {
                break;
            }

            let right = left + 1;
            let child = if right < len
                && compare(&*self.entries[right], &*self.entries[left], now) == CmpOrdering::Less
            {
                right
            } else {
                left
            };

            if compare(&*self.entries[k], &*self.entries[child], now) != CmpOrdering::Greater {
                break;
            }
            self.entries.swap(k, child);
            record(&*self.entries[k], k);
            k = child;
        }
        record(&*self.entries[k], k);
        k
    }

    /// Removes entry at `index`, filling the hole with the last entry.
    fn remove_at(&mut self, index: usize, now: u64) -> Arc<T> {
        let removed = self.entries.swap_remove(index);
        forget(&*removed);

        if index < self.entries.len() && self.sift_down(index, now) == index {
            self.sift_up(index, now);
        }
        removed
    }

    fn head_delay(&self, now: u64) -> Option<i64> {
        self.entries.first().map(|head| head.delay(now))
    }

    fn index_of(&self, entry: &T) -> Option<usize> {
        if let Some(index) = entry.heap_index().and_then(HeapIndex::get) {
            if index < self.entries.len() && core::ptr::addr_eq(&*self.entries[index], entry) {
                return Some(index);
            }
        }

        self.entries
            .iter()
            .position(|candidate| core::ptr::addr_eq(&**candidate, entry))
    }

    fn take_all(&mut self) -> Vec<Arc<T>> {
        let entries = core::mem::take(&mut self.entries);
        for entry in &entries {
            forget(&**entry);
        }
        entries
    }
}

/// Blocking queue of [`Delayed`] entries.
///
/// See [module level documentation](self) for details.
///
/// Blocked consumers sleep in real time for the remaining delay of the head.
/// When the clock is moved by other means, call [`wake_all`](Self::wake_all)
/// to have them re-check.
pub struct DelayQueue<T: ?Sized, C = MonotonicClock> {
    heap: Mutex<Heap<T>>,
    available: Condvar,
    clock: C,
}

impl<T, C> fmt::Debug for DelayQueue<T, C>
where
    T: ?Sized,
    C: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelayQueue")
            .field("len", &self.heap.lock().entries.len())
            .field("clock", &self.clock)
            .finish()
    }
}

impl<T> DelayQueue<T>
where
    T: Delayed + Send + Sync + ?Sized,
{
    /// Creates empty queue that uses [`MonotonicClock`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(MonotonicClock)
    }
}

impl<T> Default for DelayQueue<T>
where
    T: Delayed + Send + Sync + ?Sized,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, C> Wake for DelayQueue<T, C>
where
    T: ?Sized,
{
    fn wake(&self) {
        let _heap = self.heap.lock();
        self.available.notify_all();
    }
}

impl<T, C> DelayQueue<T, C>
where
    T: Delayed + Send + Sync + ?Sized,
    C: Clock,
{
    /// Creates empty queue that reads time from `clock`.
    pub fn with_clock(clock: C) -> Self {
        DelayQueue {
            heap: Mutex::new(Heap {
                entries: Vec::new(),
            }),
            available: Condvar::new(),
            clock,
        }
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Inserts an entry.
    /// Wakes blocked consumers if the entry becomes the new head.
    ///
    /// Entry with a [`HeapIndex`] must not be enqueued already.
    ///
    /// # Panics
    ///
    /// Panics if the heap capacity overflows `usize`.
    /// Debug builds also panic if the entry is enqueued already.
    pub fn offer(&self, entry: Arc<T>) {
        debug_assert!(
            entry.heap_index().and_then(HeapIndex::get).is_none(),
            "entry is already enqueued"
        );

        let mut heap = self.heap.lock();
        let now = self.clock.now();
        if heap.push(entry, now) == 0 {
            self.available.notify_all();
        }
    }

    /// Removes and returns the head if its delay has expired.
    pub fn poll(&self) -> Option<Arc<T>> {
        let mut heap = self.heap.lock();
        let now = self.clock.now();
        match heap.head_delay(now) {
            Some(delay) if delay <= 0 => Some(self.pop_head(&mut heap, now)),
            _ => None,
        }
    }

    /// Removes and returns the head, waiting until its delay expires.
    ///
    /// # Errors
    ///
    /// Returns [`Interrupted`] if the calling thread was interrupted before or while waiting.
    pub fn take(&self) -> Result<Arc<T>, Interrupted> {
        interrupt::check()?;
        loop {
            if let Some(entry) = interrupt::with_blocker(self, || self.wait_head(None, |_| false))? {
                return Ok(entry);
            }
        }
    }

    /// Removes and returns the head, waiting up to `timeout` for its delay to expire.
    /// Returns `None` if the timeout elapsed first.
    ///
    /// # Errors
    ///
    /// Returns [`Interrupted`] if the calling thread was interrupted before or while waiting.
    pub fn poll_timeout(&self, timeout: Duration) -> Result<Option<Arc<T>>, Interrupted> {
        interrupt::check()?;
        if timeout.is_zero() {
            return Ok(self.poll());
        }

        match deadline_after(timeout) {
            None => self.take().map(Some),
            Some(deadline) => {
                interrupt::with_blocker(self, || self.wait_head(Some(deadline), |_| false))
            }
        }
    }

    /// Like [`take`](Self::take) but gives up and returns `None`
    /// as soon as `abort` returns `true`.
    /// `abort` receives whether the queue is empty and is called under the queue lock.
    pub(crate) fn take_or_abort(
        &self,
        abort: impl Fn(bool) -> bool,
    ) -> Result<Option<Arc<T>>, Interrupted> {
        interrupt::check()?;
        interrupt::with_blocker(self, || self.wait_head(None, abort))
    }

    fn wait_head(
        &self,
        deadline: Option<Instant>,
        abort: impl Fn(bool) -> bool,
    ) -> Result<Option<Arc<T>>, Interrupted> {
        let mut heap = self.heap.lock();
        loop {
            if interrupt::interrupted() {
                return Err(Interrupted);
            }

            if abort(heap.entries.is_empty()) {
                return Ok(None);
            }

            let now = self.clock.now();
            let head_due = match heap.head_delay(now) {
                Some(delay) if delay <= 0 => return Ok(Some(self.pop_head(&mut heap, now))),
                Some(delay) => deadline_after(Duration::from_nanos(delay.unsigned_abs())),
                None => None,
            };

            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Ok(None);
                }
            }

            let wake_at = match (head_due, deadline) {
                (Some(head_due), Some(deadline)) => Some(head_due.min(deadline)),
                (head_due, deadline) => head_due.or(deadline),
            };

            match wake_at {
                None => self.available.wait(&mut heap),
                Some(wake_at) => {
                    let _ = self.available.wait_until(&mut heap, wake_at);
                }
            }
        }
    }

    fn pop_head(&self, heap: &mut MutexGuard<'_, Heap<T>>, now: u64) -> Arc<T> {
        let head = heap.remove_at(0, now);
        if !heap.entries.is_empty() {
            self.available.notify_all();
        }
        head
    }

    /// Returns the head without removing it, whether or not it has expired.
    pub fn peek(&self) -> Option<Arc<T>> {
        self.heap.lock().entries.first().cloned()
    }

    /// Removes this particular entry from the queue.
    /// Returns `false` if it was not enqueued.
    pub fn remove(&self, entry: &T) -> bool {
        let mut heap = self.heap.lock();
        let Some(index) = heap.index_of(entry) else {
            return false;
        };

        let now = self.clock.now();
        heap.remove_at(index, now);
        if index == 0 && !heap.entries.is_empty() {
            self.available.notify_all();
        }
        true
    }

    #[must_use]
    pub fn contains(&self, entry: &T) -> bool {
        self.heap.lock().index_of(entry).is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.heap.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.heap.lock().entries.is_empty()
    }

    /// Removes all entries.
    pub fn clear(&self) {
        drop(self.heap.lock().take_all());
    }

    /// Removes all entries, expired or not, and returns them in heap order.
    pub fn drain_all(&self) -> Vec<Arc<T>> {
        self.heap.lock().take_all()
    }

    /// Moves up to `max` expired entries into `sink`, head first.
    /// Stops at the first entry that has not expired yet.
    /// Returns number of moved entries.
    pub fn drain_to(&self, sink: &mut impl Extend<Arc<T>>, max: usize) -> usize {
        let mut heap = self.heap.lock();
        let now = self.clock.now();

        let mut drained = 0;
        while drained < max {
            match heap.head_delay(now) {
                Some(delay) if delay <= 0 => {
                    sink.extend(Some(heap.remove_at(0, now)));
                    drained += 1;
                }
                _ => break,
            }
        }

        if drained > 0 && !heap.entries.is_empty() {
            self.available.notify_all();
        }
        drained
    }

    /// Removes and returns all expired entries, head first.
    pub fn drain_expired(&self) -> Vec<Arc<T>> {
        let mut expired = Vec::new();
        self.drain_to(&mut expired, usize::MAX);
        expired
    }

    /// Returns a copy of all enqueued entries in heap order.
    pub fn snapshot(&self) -> Vec<Arc<T>> {
        self.heap.lock().entries.clone()
    }

    /// Wakes all blocked consumers to re-check the head and their wake conditions.
    pub fn wake_all(&self) {
        self.wake();
    }
}
