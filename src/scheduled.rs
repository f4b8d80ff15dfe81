//! Tasks that run after a delay, once or periodically.
//!
//! [`ScheduledTask`] is the entry type of the scheduler's [`DelayQueue`](crate::delay_queue::DelayQueue).
//! It does not know the queue directly, everything it needs from its
//! executor goes through the [`TaskHost`] trait.
//!
//! [`TaskHandle`] wraps a one-shot task that produces a value.

use core::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};

use crate::{
    clock::duration_nanos,
    delay_queue::{Delayed, HeapIndex, SortKey, delay_until},
    error::{Interrupted, TaskError},
    interrupt::{self, Interrupter, Wake},
    park::deadline_after,
    sync::{Arc, AtomicU8, AtomicU64, Condvar, Duration, Instant, Mutex, Ordering, Weak},
};

const NEW: u8 = 0;
const RUNNING: u8 = 1;
const COMPLETED: u8 = 2;
const FAILED: u8 = 3;
const CANCELLED: u8 = 4;

/// Tie-breaker for tasks with equal trigger times.
static SEQUENCER: AtomicU64 = AtomicU64::new(0);

/// How a task repeats.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum Period {
    OneShot,

    /// Next run is scheduled `period` after the previous trigger time,
    /// regardless of how late that run started.
    FixedRate(Duration),

    /// Next run is scheduled `delay` after the previous run completed.
    FixedDelay(Duration),
}

impl Period {
    fn encode(self) -> i64 {
        let nanos = |duration| i64::try_from(duration_nanos(duration)).unwrap_or(i64::MAX);
        match self {
            Period::OneShot => 0,
            Period::FixedRate(period) => nanos(period),
            Period::FixedDelay(delay) => -nanos(delay),
        }
    }

    fn decode(period: i64) -> Self {
        match period {
            0 => Period::OneShot,
            1.. => Period::FixedRate(Duration::from_nanos(period.unsigned_abs())),
            _ => Period::FixedDelay(Duration::from_nanos(period.unsigned_abs())),
        }
    }
}

/// Executor side of a [`ScheduledTask`].
pub trait TaskHost: Send + Sync {
    /// Returns `true` if a task of the given kind may still run.
    fn can_run_in_current_state(&self, periodic: bool) -> bool;

    /// Current time of the host's clock in nanoseconds.
    fn now(&self) -> u64;

    /// Puts a periodic task back after it was rescheduled.
    fn re_execute_periodic(&self, task: Arc<ScheduledTask>);

    /// Whether cancelled tasks should be removed from the queue immediately.
    fn remove_on_cancel(&self) -> bool;

    /// Removes the task from the host's queue.
    fn remove(&self, task: &ScheduledTask) -> bool;
}

/// Computes trigger time `delay` after `now`.
///
/// Delays are capped so that the difference between any two trigger times fits into `i64`.
pub(crate) fn trigger_time(now: u64, delay: Duration) -> u64 {
    let delay = duration_nanos(delay).min(i64::MAX.unsigned_abs());
    now.saturating_add(delay)
}

enum Job {
    Once(Option<Box<dyn FnOnce() + Send>>),
    Repeat(Box<dyn FnMut() + Send>),
}

impl Job {
    fn call(&mut self) {
        match self {
            Job::Once(f) => {
                if let Some(f) = f.take() {
                    f();
                }
            }
            Job::Repeat(f) => f(),
        }
    }
}

/// Delayed or periodic unit of work.
pub struct ScheduledTask {
    sequence: u64,
    trigger: AtomicU64,

    /// Zero for one-shot, positive for fixed-rate, negative for fixed-delay.
    period: i64,

    heap_index: HeapIndex,
    state: AtomicU8,
    job: Mutex<Job>,

    /// Thread running the job right now.
    runner: Mutex<Option<Interrupter>>,

    completion: Mutex<()>,
    completed: Condvar,

    host: Weak<dyn TaskHost>,
}

impl fmt::Debug for ScheduledTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledTask")
            .field("sequence", &self.sequence)
            .field("trigger", &self.trigger_time())
            .field("period", &self.period())
            .field("state", &self.state.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl ScheduledTask {
    /// Creates task that runs `f` once at `trigger`.
    pub fn one_shot(
        trigger: u64,
        host: Weak<dyn TaskHost>,
        f: impl FnOnce() + Send + 'static,
    ) -> Arc<Self> {
        Self::with_job(trigger, 0, host, Job::Once(Some(Box::new(f))))
    }

    /// Creates task that runs `f` first at `trigger` and then repeats with `period`.
    pub fn periodic(
        trigger: u64,
        period: Period,
        host: Weak<dyn TaskHost>,
        f: impl FnMut() + Send + 'static,
    ) -> Arc<Self> {
        Self::with_job(trigger, period.encode(), host, Job::Repeat(Box::new(f)))
    }

    fn with_job(trigger: u64, period: i64, host: Weak<dyn TaskHost>, job: Job) -> Arc<Self> {
        Arc::new(ScheduledTask {
            sequence: SEQUENCER.fetch_add(1, Ordering::Relaxed),
            trigger: AtomicU64::new(trigger),
            period,
            heap_index: HeapIndex::new(),
            state: AtomicU8::new(NEW),
            job: Mutex::new(job),
            runner: Mutex::new(None),
            completion: Mutex::new(()),
            completed: Condvar::new(),
            host,
        })
    }

    /// Creates task that runs `f` once at `trigger` and keeps its return value.
    pub fn with_result<R>(
        trigger: u64,
        host: Weak<dyn TaskHost>,
        f: impl FnOnce() -> R + Send + 'static,
    ) -> TaskHandle<R>
    where
        R: Send + 'static,
    {
        let value = Arc::new(Mutex::new(None));
        let slot = value.clone();
        let task = Self::one_shot(trigger, host, move || {
            let result = f();
            *slot.lock() = Some(result);
        });
        TaskHandle { task, value }
    }

    /// Runs the task on the calling thread.
    ///
    /// Does nothing if the task is already done.
    /// Periodic task that completes normally is rescheduled and handed back to its host.
    /// Task that may not run in the host's current state is cancelled instead.
    pub fn run(self: &Arc<Self>) {
        let periodic = self.is_periodic();

        let host = match self.host.upgrade() {
            Some(host) if host.can_run_in_current_state(periodic) => host,
            _ => {
                self.cancel(false);
                return;
            }
        };

        if !periodic {
            self.run_once();
        } else if self.run_and_reset() {
            self.set_next_run_time(host.now());
            host.re_execute_periodic(self.clone());
        }
    }

    /// Attempts to cancel the task.
    ///
    /// Fails if the task already completed or was cancelled.
    /// If `may_interrupt_if_running` is set and the job is running,
    /// the thread running it is interrupted.
    pub fn cancel(&self, may_interrupt_if_running: bool) -> bool {
        let cancelled = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| {
                matches!(state, NEW | RUNNING).then_some(CANCELLED)
            })
            .is_ok();

        if !cancelled {
            return false;
        }
        self.notify_done();

        if may_interrupt_if_running {
            // The runner may be blocked on something that takes this lock to wake it.
            let runner = self.runner.lock().clone();
            if let Some(runner) = runner {
                runner.interrupt();
            }
        }

        if self.heap_index.get().is_some() {
            if let Some(host) = self.host.upgrade() {
                if host.remove_on_cancel() {
                    host.remove(self);
                }
            }
        }
        true
    }

    /// Returns remaining delay in nanoseconds according to the host's clock.
    #[must_use]
    pub fn remaining_delay(&self) -> Option<i64> {
        let host = self.host.upgrade()?;
        Some(self.delay(host.now()))
    }

    #[must_use]
    pub fn trigger_time(&self) -> u64 {
        self.trigger.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn period(&self) -> Period {
        Period::decode(self.period)
    }

    #[must_use]
    pub fn is_periodic(&self) -> bool {
        self.period != 0
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == CANCELLED
    }

    /// Returns `true` if the job panicked.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.state.load(Ordering::Acquire) == FAILED
    }

    /// Returns `true` if the task completed, failed or was cancelled.
    #[must_use]
    pub fn is_done(&self) -> bool {
        matches!(
            self.state.load(Ordering::Acquire),
            COMPLETED | FAILED | CANCELLED
        )
    }

    #[must_use]
    pub fn sequence_number(&self) -> u64 {
        self.sequence
    }

    /// Blocks until the task completes, fails or is cancelled.
    ///
    /// A periodic task is done only after it failed or was cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`Interrupted`] if the calling thread was interrupted before or while waiting.
    pub fn wait(&self) -> Result<(), Interrupted> {
        self.wait_until(None).map(|_| ())
    }

    /// Like [`wait`](Self::wait) but gives up after `timeout`.
    /// Returns `false` on timeout.
    ///
    /// # Errors
    ///
    /// Returns [`Interrupted`] if the calling thread was interrupted before or while waiting.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<bool, Interrupted> {
        self.wait_until(deadline_after(timeout))
    }

    fn wait_until(&self, deadline: Option<Instant>) -> Result<bool, Interrupted> {
        interrupt::check()?;

        interrupt::with_blocker(self, || {
            let mut completion = self.completion.lock();
            loop {
                if interrupt::interrupted() {
                    return Err(Interrupted);
                }
                if self.is_done() {
                    return Ok(true);
                }

                match deadline {
                    None => self.completed.wait(&mut completion),
                    Some(deadline) => {
                        if Instant::now() >= deadline {
                            return Ok(false);
                        }
                        let _ = self.completed.wait_until(&mut completion, deadline);
                    }
                }
            }
        })
    }

    fn notify_done(&self) {
        let _completion = self.completion.lock();
        self.completed.notify_all();
    }

    fn start(&self) -> bool {
        self.state
            .compare_exchange(NEW, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn finish(&self, state: u8) -> bool {
        let finished = self
            .state
            .compare_exchange(RUNNING, state, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if finished && state != NEW {
            self.notify_done();
        }
        finished
    }

    fn run_once(&self) {
        if self.start() {
            let state = if self.invoke() { COMPLETED } else { FAILED };
            self.finish(state);
        }
    }

    /// Runs the job leaving the task ready to run again.
    /// Returns `false` if it did not run, panicked or was cancelled while running.
    fn run_and_reset(&self) -> bool {
        if !self.start() {
            return false;
        }
        if self.invoke() {
            self.finish(NEW)
        } else {
            self.finish(FAILED);
            false
        }
    }

    /// Calls the job, returns `false` if it panicked.
    fn invoke(&self) -> bool {
        *self.runner.lock() = Some(interrupt::current());
        let result = {
            let mut job = self.job.lock();
            catch_unwind(AssertUnwindSafe(|| job.call()))
        };
        *self.runner.lock() = None;

        if result.is_err() {
            tracing::warn!(sequence = self.sequence, "scheduled job panicked");
        }
        result.is_ok()
    }

    fn set_next_run_time(&self, now: u64) {
        let next = if self.period > 0 {
            self.trigger_time().saturating_add(self.period.unsigned_abs())
        } else {
            trigger_time(now, Duration::from_nanos(self.period.unsigned_abs()))
        };
        self.trigger.store(next, Ordering::Release);
    }
}

impl Wake for ScheduledTask {
    fn wake(&self) {
        self.notify_done();
    }
}

impl Delayed for ScheduledTask {
    #[inline]
    fn delay(&self, now: u64) -> i64 {
        delay_until(self.trigger_time(), now)
    }

    #[inline]
    fn sort_key(&self) -> Option<SortKey> {
        Some(SortKey {
            trigger: self.trigger_time(),
            sequence: self.sequence,
        })
    }

    #[inline]
    fn heap_index(&self) -> Option<&HeapIndex> {
        Some(&self.heap_index)
    }
}

/// One-shot task that produces a value of type `R`.
///
/// Created by [`Scheduler::schedule_fn`](crate::scheduler::Scheduler::schedule_fn)
/// and [`ScheduledTask::with_result`].
#[must_use]
pub struct TaskHandle<R> {
    task: Arc<ScheduledTask>,
    value: Arc<Mutex<Option<R>>>,
}

impl<R> fmt::Debug for TaskHandle<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle").field("task", &self.task).finish()
    }
}

impl<R> TaskHandle<R> {
    /// Returns the underlying task.
    #[must_use]
    pub fn task(&self) -> &Arc<ScheduledTask> {
        &self.task
    }

    /// See [`ScheduledTask::cancel`].
    pub fn cancel(&self, may_interrupt_if_running: bool) -> bool {
        self.task.cancel(may_interrupt_if_running)
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.task.is_done()
    }

    /// See [`ScheduledTask::wait_timeout`].
    ///
    /// # Errors
    ///
    /// Returns [`Interrupted`] if the calling thread was interrupted before or while waiting.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<bool, Interrupted> {
        self.task.wait_timeout(timeout)
    }

    /// Blocks until the task is done and returns the value it produced.
    ///
    /// # Errors
    ///
    /// Fails if the task was cancelled, the job panicked
    /// or the calling thread was interrupted while waiting.
    pub fn get(self) -> Result<R, TaskError> {
        self.task.wait()?;
        self.outcome()
    }

    /// Like [`get`](Self::get) but gives up after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::TimedOut`] if the task is not done in time,
    /// otherwise fails like [`get`](Self::get).
    pub fn get_timeout(self, timeout: Duration) -> Result<R, TaskError> {
        if self.task.wait_timeout(timeout)? {
            self.outcome()
        } else {
            Err(TaskError::TimedOut)
        }
    }

    fn outcome(&self) -> Result<R, TaskError> {
        match self.task.state.load(Ordering::Acquire) {
            CANCELLED => Err(TaskError::Cancelled),
            FAILED => Err(TaskError::Panicked),
            _ => self.value.lock().take().ok_or(TaskError::Cancelled),
        }
    }
}
