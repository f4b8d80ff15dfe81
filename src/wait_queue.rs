//! FIFO queue of blocked waiters used by fair synchronizers.
//!
//! Each blocked thread owns a [`WaitNode`] with an atomic tri-state status.
//! The queue itself is not synchronized, it is always accessed under the
//! owning synchronizer's lock. The node status is the hand-off point between
//! a releasing thread and the waiter and may be changed without that lock.

use crate::{
    backoff::BackOff,
    interrupt,
    park::park_until,
    sync::{Arc, AtomicU8, Instant, Ordering, Thread, current},
};

const WAITING: u8 = 0;
const SIGNALLED: u8 = 1;
const CANCELLED: u8 = 2;

/// How a wait on a [`WaitNode`] ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum WaitOutcome {
    /// Releaser handed ownership over to this waiter.
    Signalled,
    /// Deadline passed before a hand-off, the node is cancelled.
    TimedOut,
    /// Thread was interrupted before a hand-off, the node is cancelled
    /// and the interruption status cleared.
    Interrupted,
}

/// One blocked waiter.
#[derive(Debug)]
pub(crate) struct WaitNode {
    status: AtomicU8,
    owner: Thread,
}

impl WaitNode {
    /// Creates node owned by the calling thread.
    pub fn new() -> Arc<Self> {
        Arc::new(WaitNode {
            status: AtomicU8::new(WAITING),
            owner: current(),
        })
    }

    #[inline]
    pub fn is_waiting(&self) -> bool {
        self.status.load(Ordering::Acquire) == WAITING
    }

    pub fn owner(&self) -> &Thread {
        &self.owner
    }

    /// Hands ownership over to the waiter and wakes it.
    /// Returns `false` if the waiter already gave up.
    pub fn signal(&self) -> bool {
        let signalled = self
            .status
            .compare_exchange(WAITING, SIGNALLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();

        if signalled {
            self.owner.unpark();
        }
        signalled
    }

    /// Withdraws the waiter.
    /// Returns `false` if the hand-off already happened.
    fn cancel(&self) -> bool {
        self.status
            .compare_exchange(WAITING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Blocks the owning thread until signalled.
    ///
    /// Gives up when `deadline` passes, or on interruption when `interruptible` is set.
    /// A hand-off that won the race against a give-up is always honoured,
    /// in which case the interruption status is left set.
    pub fn wait(&self, deadline: Option<Instant>, interruptible: bool) -> WaitOutcome {
        debug_assert_eq!(self.owner.id(), current().id());

        let mut backoff = BackOff::new();

        loop {
            if self.status.load(Ordering::Acquire) == SIGNALLED {
                return WaitOutcome::Signalled;
            }

            if interruptible && interrupt::is_interrupted() {
                if self.cancel() {
                    interrupt::interrupted();
                    tracing::trace!("waiter interrupted, node cancelled");
                    return WaitOutcome::Interrupted;
                }
                return WaitOutcome::Signalled;
            }

            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    if self.cancel() {
                        tracing::trace!("waiter timed out, node cancelled");
                        return WaitOutcome::TimedOut;
                    }
                    return WaitOutcome::Signalled;
                }
            }

            if backoff.should_park() {
                park_until(deadline);
            } else {
                backoff.snooze();
            }
        }
    }
}

/// Ring-buffer of wait nodes.
///
/// Nodes are pushed to the tail and popped from the head.
/// Cancelled nodes are skipped by the popping side. They are dropped
/// when they reach the head or when the ring runs out of room.
#[derive(Debug)]
pub(crate) struct WaitQueue {
    head: usize,
    len: usize,
    slots: Vec<Option<Arc<WaitNode>>>,
}

impl WaitQueue {
    const MIN_NON_ZERO_CAP: usize = 4;

    pub const fn new() -> Self {
        WaitQueue {
            head: 0,
            len: 0,
            slots: Vec::new(),
        }
    }

    pub fn push(&mut self, node: Arc<WaitNode>) {
        while self.front().is_some_and(|front| !front.is_waiting()) {
            self.pop();
        }

        if self.len == self.slots.len() {
            self.grow();
        }

        let idx = ring_index(self.head, self.len, self.slots.len());
        debug_assert!(self.slots[idx].is_none());
        self.slots[idx] = Some(node);
        self.len += 1;
    }

    pub fn pop(&mut self) -> Option<Arc<WaitNode>> {
        if self.len == 0 {
            return None;
        }

        let node = self.slots[self.head].take();
        debug_assert!(node.is_some());

        self.head = (self.head + 1) % self.slots.len();
        self.len -= 1;
        node
    }

    fn front(&self) -> Option<&Arc<WaitNode>> {
        if self.len == 0 {
            None
        } else {
            self.slots[self.head].as_ref()
        }
    }

    /// Iterates over nodes in arrival order, including cancelled ones.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<WaitNode>> + '_ {
        (0..self.len).filter_map(move |offset| {
            self.slots[ring_index(self.head, offset, self.slots.len())].as_ref()
        })
    }

    /// Number of nodes still waiting.
    pub fn waiting(&self) -> usize {
        self.iter().filter(|node| node.is_waiting()).count()
    }

    pub fn has_waiting(&self) -> bool {
        self.iter().any(|node| node.is_waiting())
    }

    /// Threads that own still waiting nodes, in arrival order.
    pub fn waiting_threads(&self) -> Vec<Thread> {
        self.iter()
            .filter(|node| node.is_waiting())
            .map(|node| node.owner().clone())
            .collect()
    }

    /// Makes room for one more node.
    /// Drops cancelled nodes and doubles capacity only if that freed nothing.
    #[cold]
    fn grow(&mut self) {
        let cap = self.slots.len();
        let head = self.head;

        let mut slots: Vec<_> = (0..self.len)
            .filter_map(|offset| self.slots[ring_index(head, offset, cap)].take())
            .filter(|node| node.is_waiting())
            .map(Some)
            .collect();

        let new_cap = if slots.len() < cap {
            cap
        } else {
            match cap.checked_add(cap) {
                Some(new_cap) => new_cap.max(Self::MIN_NON_ZERO_CAP),
                None => crate::capacity_overflow(),
            }
        };

        if slots.len() < self.len {
            tracing::trace!(dropped = self.len - slots.len(), "dropped cancelled wait nodes");
        }

        self.len = slots.len();
        slots.resize_with(new_cap, || None);

        self.head = 0;
        self.slots = slots;
    }
}

#[inline(always)]
fn ring_index(head: usize, offset: usize, cap: usize) -> usize {
    let (sum, wrap) = head.overflowing_add(offset);
    let sum = if wrap { dewrap(sum, cap) } else { sum };
    sum % cap
}

#[inline(always)]
#[cold]
fn dewrap(sum: usize, cap: usize) -> usize {
    (sum % cap).wrapping_sub(cap)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::Duration;

    #[test]
    fn test_queue_is_fifo_across_growth() {
        let mut queue = WaitQueue::new();
        let nodes: Vec<_> = (0..10).map(|_| WaitNode::new()).collect();

        // Interleave pops to make the ring wrap before it grows.
        queue.push(nodes[0].clone());
        queue.push(nodes[1].clone());
        assert!(Arc::ptr_eq(&queue.pop().unwrap(), &nodes[0]));
        for node in &nodes[2..] {
            queue.push(node.clone());
        }

        for node in &nodes[1..] {
            assert!(Arc::ptr_eq(&queue.pop().unwrap(), node));
        }
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_cancelled_nodes_are_not_counted() {
        let mut queue = WaitQueue::new();
        let a = WaitNode::new();
        let b = WaitNode::new();
        queue.push(a.clone());
        queue.push(b.clone());

        assert!(a.cancel());
        assert_eq!(queue.waiting(), 1);
        assert!(queue.has_waiting());

        // Popping side skips the cancelled node.
        assert!(!queue.pop().unwrap().signal());
        assert!(queue.pop().unwrap().signal());
        assert!(!queue.has_waiting());
    }

    #[test]
    fn test_cancelled_head_is_dropped_on_push() {
        let mut queue = WaitQueue::new();
        let gone = WaitNode::new();
        let live = WaitNode::new();

        queue.push(gone.clone());
        assert!(gone.cancel());
        queue.push(live.clone());

        assert_eq!(queue.len, 1);
        assert!(Arc::ptr_eq(&queue.pop().unwrap(), &live));
    }

    #[test]
    fn test_cancelled_nodes_do_not_grow_the_ring() {
        let mut queue = WaitQueue::new();
        let live = WaitNode::new();
        queue.push(live.clone());

        // Live node at the head keeps the cancelled ones behind it from being popped.
        for _ in 0..100 {
            let node = WaitNode::new();
            queue.push(node.clone());
            assert!(node.cancel());
        }

        assert_eq!(queue.slots.len(), WaitQueue::MIN_NON_ZERO_CAP);
        assert_eq!(queue.waiting(), 1);
        assert!(Arc::ptr_eq(&queue.pop().unwrap(), &live));
    }

    #[test]
    fn test_signal_wins_over_timeout() {
        let node = WaitNode::new();
        assert!(node.signal());
        assert!(!node.cancel());
        assert_eq!(
            node.wait(Some(Instant::now()), true),
            WaitOutcome::Signalled
        );
    }

    #[test]
    fn test_wait_times_out_and_cancels() {
        let node = WaitNode::new();
        let deadline = Instant::now() + Duration::from_millis(5);
        assert_eq!(node.wait(Some(deadline), true), WaitOutcome::TimedOut);
        assert!(!node.is_waiting());
        assert!(!node.signal());
    }

    #[test]
    fn test_interrupted_wait_clears_status() {
        let node = WaitNode::new();
        interrupt::current().interrupt();
        assert_eq!(node.wait(None, true), WaitOutcome::Interrupted);
        assert!(!interrupt::is_interrupted());
    }

    #[test]
    fn test_signalled_wait_keeps_interrupt() {
        let node = WaitNode::new();
        assert!(node.signal());
        interrupt::current().interrupt();
        assert_eq!(node.wait(None, true), WaitOutcome::Signalled);
        assert!(interrupt::interrupted());
    }
}
