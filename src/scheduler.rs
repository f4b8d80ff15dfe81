//! Executor of delayed and periodic tasks.
//!
//! [`Scheduler`] owns a [`DelayQueue`] of [`ScheduledTask`]s.
//! It never spawns threads, instead callers donate threads by calling
//! [`Scheduler::run_worker`], or run due tasks in place with [`Scheduler::run_pending`].
//!
//! ```rust
//! use std::{sync::{Arc, atomic::{AtomicUsize, Ordering}}, time::Duration};
//! use waitline::scheduler::Scheduler;
//!
//! let scheduler = Scheduler::new();
//! let counter = Arc::new(AtomicUsize::new(0));
//!
//! std::thread::scope(|scope| {
//!     scope.spawn(|| scheduler.run_worker());
//!
//!     for _ in 0..10 {
//!         let counter = counter.clone();
//!         scheduler
//!             .schedule(Duration::from_millis(1), move || {
//!                 counter.fetch_add(1, Ordering::Relaxed);
//!             })
//!             .unwrap();
//!     }
//!
//!     // Delayed tasks still run after shutdown by default.
//!     scheduler.shutdown();
//! });
//!
//! assert!(scheduler.is_terminated());
//! assert_eq!(counter.load(Ordering::Relaxed), 10);
//! ```

use core::fmt;

use crate::{
    clock::{Clock, MonotonicClock},
    delay_queue::DelayQueue,
    error::{Interrupted, ScheduleError},
    interrupt::{self, Interrupter, Wake},
    park::deadline_after,
    scheduled::{Period, ScheduledTask, TaskHandle, TaskHost, trigger_time},
    sync::{Arc, AtomicBool, AtomicU8, Condvar, Duration, Instant, Mutex, Ordering, Weak, current},
};

const RUNNING: u8 = 0;
const SHUTDOWN: u8 = 1;
const STOP: u8 = 2;
const TERMINATED: u8 = 3;

/// What happens to queued tasks when a [`Scheduler`] shuts down.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ShutdownPolicy {
    /// Keep running periodic tasks after shutdown.
    pub continue_periodic_after_shutdown: bool,

    /// Run already queued one-shot tasks after shutdown.
    pub execute_delayed_after_shutdown: bool,

    /// Remove cancelled tasks from the queue right away
    /// instead of when their trigger time comes.
    pub remove_on_cancel: bool,
}

impl Default for ShutdownPolicy {
    fn default() -> Self {
        ShutdownPolicy {
            continue_periodic_after_shutdown: false,
            execute_delayed_after_shutdown: true,
            remove_on_cancel: false,
        }
    }
}

impl ShutdownPolicy {
    #[must_use]
    pub const fn with_continue_periodic_after_shutdown(mut self, value: bool) -> Self {
        self.continue_periodic_after_shutdown = value;
        self
    }

    #[must_use]
    pub const fn with_execute_delayed_after_shutdown(mut self, value: bool) -> Self {
        self.execute_delayed_after_shutdown = value;
        self
    }

    #[must_use]
    pub const fn with_remove_on_cancel(mut self, value: bool) -> Self {
        self.remove_on_cancel = value;
        self
    }
}

#[derive(Default)]
struct Workers {
    active: usize,
    interrupters: Vec<Interrupter>,
}

struct Inner<C> {
    queue: DelayQueue<ScheduledTask, C>,
    state: AtomicU8,

    continue_periodic: AtomicBool,
    execute_delayed: AtomicBool,
    remove_on_cancel: AtomicBool,

    workers: Mutex<Workers>,
    terminated: Condvar,
}

impl<C> Inner<C>
where
    C: Clock,
{
    #[inline]
    fn run_state(&self) -> u8 {
        self.state.load(Ordering::Acquire)
    }

    fn advance_state(&self, target: u8) {
        self.state.fetch_max(target, Ordering::AcqRel);
    }

    fn is_running_or_shutdown(&self, shutdown_ok: bool) -> bool {
        match self.run_state() {
            RUNNING => true,
            SHUTDOWN => shutdown_ok,
            _ => false,
        }
    }

    /// Removes tasks that must not run after shutdown.
    fn on_shutdown(&self) {
        let keep_delayed = self.execute_delayed.load(Ordering::Acquire);
        let keep_periodic = self.continue_periodic.load(Ordering::Acquire);

        let mut dropped = 0usize;
        if !keep_delayed && !keep_periodic {
            for task in self.queue.drain_all() {
                task.cancel(false);
                dropped += 1;
            }
        } else {
            for task in self.queue.snapshot() {
                let keep = if task.is_periodic() {
                    keep_periodic
                } else {
                    keep_delayed
                };

                if (!keep || task.is_cancelled()) && self.queue.remove(&task) {
                    task.cancel(false);
                    dropped += 1;
                }
            }
        }

        tracing::debug!(dropped, remaining = self.queue.len(), "swept queue on shutdown");
        self.try_terminate();
    }

    fn try_terminate(&self) {
        match self.run_state() {
            RUNNING | TERMINATED => return,
            SHUTDOWN if !self.queue.is_empty() => return,
            _ => {}
        }

        let workers = self.workers.lock();
        if workers.active > 0 {
            return;
        }

        self.advance_state(TERMINATED);
        self.terminated.notify_all();
        drop(workers);

        tracing::debug!("scheduler terminated");
    }

    /// Counts the calling thread as running tasks until the returned guard drops.
    /// Interruptible workers are interrupted by `shutdown_now`.
    fn register_worker(&self, interruptible: bool) -> Option<Registration<'_, C>> {
        let mut workers = self.workers.lock();
        if self.run_state() >= STOP {
            return None;
        }
        workers.active += 1;
        if interruptible {
            workers.interrupters.push(interrupt::current());
        }
        Some(Registration {
            inner: self,
            interruptible,
        })
    }

    fn deregister_worker(&self, interruptible: bool) {
        {
            let mut workers = self.workers.lock();
            workers.active -= 1;

            if interruptible {
                let id = current().id();
                if let Some(idx) = workers
                    .interrupters
                    .iter()
                    .position(|interrupter| interrupter.thread().id() == id)
                {
                    workers.interrupters.swap_remove(idx);
                }
            }
        }
        self.try_terminate();
    }
}

struct Registration<'a, C: Clock> {
    inner: &'a Inner<C>,
    interruptible: bool,
}

impl<C: Clock> Drop for Registration<'_, C> {
    fn drop(&mut self) {
        self.inner.deregister_worker(self.interruptible);
    }
}

impl<C> Wake for Inner<C> {
    fn wake(&self) {
        let _workers = self.workers.lock();
        self.terminated.notify_all();
    }
}

impl<C> TaskHost for Inner<C>
where
    C: Clock,
{
    fn can_run_in_current_state(&self, periodic: bool) -> bool {
        let keep = if periodic {
            &self.continue_periodic
        } else {
            &self.execute_delayed
        };
        self.is_running_or_shutdown(keep.load(Ordering::Acquire))
    }

    fn now(&self) -> u64 {
        self.queue.clock().now()
    }

    fn re_execute_periodic(&self, task: Arc<ScheduledTask>) {
        if self.can_run_in_current_state(true) {
            self.queue.offer(task.clone());
            if !self.can_run_in_current_state(true) && self.queue.remove(&task) {
                task.cancel(false);
            }
        }
    }

    fn remove_on_cancel(&self) -> bool {
        self.remove_on_cancel.load(Ordering::Acquire)
    }

    fn remove(&self, task: &ScheduledTask) -> bool {
        let removed = self.queue.remove(task);
        self.try_terminate();
        removed
    }
}

/// Runs tasks after a delay or periodically on caller-provided threads.
///
/// Cloning produces another handle to the same scheduler.
pub struct Scheduler<C = MonotonicClock> {
    inner: Arc<Inner<C>>,
}

impl<C> Clone for Scheduler<C> {
    fn clone(&self) -> Self {
        Scheduler {
            inner: self.inner.clone(),
        }
    }
}

impl<C> fmt::Debug for Scheduler<C>
where
    C: Clock + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("state", &self.inner.run_state())
            .field("queued", &self.inner.queue.len())
            .field("policy", &self.policy())
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Creates scheduler with [`MonotonicClock`] and default [`ShutdownPolicy`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(MonotonicClock)
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> Scheduler<C>
where
    C: Clock + 'static,
{
    pub fn with_clock(clock: C) -> Self {
        Self::with_config(clock, ShutdownPolicy::default())
    }

    pub fn with_config(clock: C, policy: ShutdownPolicy) -> Self {
        Scheduler {
            inner: Arc::new(Inner {
                queue: DelayQueue::with_clock(clock),
                state: AtomicU8::new(RUNNING),
                continue_periodic: AtomicBool::new(policy.continue_periodic_after_shutdown),
                execute_delayed: AtomicBool::new(policy.execute_delayed_after_shutdown),
                remove_on_cancel: AtomicBool::new(policy.remove_on_cancel),
                workers: Mutex::new(Workers::default()),
                terminated: Condvar::new(),
            }),
        }
    }

    pub fn clock(&self) -> &C {
        self.inner.queue.clock()
    }

    /// Returns the queue of pending tasks.
    pub fn queue(&self) -> &DelayQueue<ScheduledTask, C> {
        &self.inner.queue
    }

    fn host(&self) -> Weak<dyn TaskHost> {
        let host: Weak<dyn TaskHost> = Arc::<Inner<C>>::downgrade(&self.inner);
        host
    }

    fn trigger_after(&self, delay: Duration) -> u64 {
        trigger_time(self.inner.queue.clock().now(), delay)
    }

    /// Runs `f` once after `delay`.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError::Rejected`] if the scheduler is shut down.
    pub fn schedule(
        &self,
        delay: Duration,
        f: impl FnOnce() + Send + 'static,
    ) -> Result<Arc<ScheduledTask>, ScheduleError> {
        let task = ScheduledTask::one_shot(self.trigger_after(delay), self.host(), f);
        self.delayed_execute(task)
    }

    /// Runs `f` as soon as possible.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError::Rejected`] if the scheduler is shut down.
    pub fn execute(
        &self,
        f: impl FnOnce() + Send + 'static,
    ) -> Result<Arc<ScheduledTask>, ScheduleError> {
        self.schedule(Duration::ZERO, f)
    }

    /// Runs `f` once after `delay` and keeps what it returns.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError::Rejected`] if the scheduler is shut down.
    pub fn schedule_fn<R>(
        &self,
        delay: Duration,
        f: impl FnOnce() -> R + Send + 'static,
    ) -> Result<TaskHandle<R>, ScheduleError>
    where
        R: Send + 'static,
    {
        let handle = ScheduledTask::with_result(self.trigger_after(delay), self.host(), f);
        self.delayed_execute(handle.task().clone())?;
        Ok(handle)
    }

    /// Runs `f` as soon as possible and keeps what it returns.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError::Rejected`] if the scheduler is shut down.
    pub fn submit<R>(
        &self,
        f: impl FnOnce() -> R + Send + 'static,
    ) -> Result<TaskHandle<R>, ScheduleError>
    where
        R: Send + 'static,
    {
        self.schedule_fn(Duration::ZERO, f)
    }

    /// Runs `f` first after `initial_delay` and then every `period`
    /// counted from the previous trigger time.
    ///
    /// If a run takes longer than `period` subsequent runs start late
    /// but never concurrently.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError::InvalidPeriod`] if `period` is zero
    /// and [`ScheduleError::Rejected`] if the scheduler is shut down.
    pub fn schedule_at_fixed_rate(
        &self,
        initial_delay: Duration,
        period: Duration,
        f: impl FnMut() + Send + 'static,
    ) -> Result<Arc<ScheduledTask>, ScheduleError> {
        if period.is_zero() {
            return Err(ScheduleError::InvalidPeriod);
        }
        let task = ScheduledTask::periodic(
            self.trigger_after(initial_delay),
            Period::FixedRate(period),
            self.host(),
            f,
        );
        self.delayed_execute(task)
    }

    /// Runs `f` first after `initial_delay` and then `delay` after each run completes.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError::InvalidPeriod`] if `delay` is zero
    /// and [`ScheduleError::Rejected`] if the scheduler is shut down.
    pub fn schedule_with_fixed_delay(
        &self,
        initial_delay: Duration,
        delay: Duration,
        f: impl FnMut() + Send + 'static,
    ) -> Result<Arc<ScheduledTask>, ScheduleError> {
        if delay.is_zero() {
            return Err(ScheduleError::InvalidPeriod);
        }
        let task = ScheduledTask::periodic(
            self.trigger_after(initial_delay),
            Period::FixedDelay(delay),
            self.host(),
            f,
        );
        self.delayed_execute(task)
    }

    fn delayed_execute(
        &self,
        task: Arc<ScheduledTask>,
    ) -> Result<Arc<ScheduledTask>, ScheduleError> {
        let inner = &*self.inner;
        if inner.run_state() != RUNNING {
            return Err(ScheduleError::Rejected);
        }

        inner.queue.offer(task.clone());

        // Shutdown may have swept the queue before the task got in.
        if inner.run_state() != RUNNING
            && !inner.can_run_in_current_state(task.is_periodic())
            && inner.remove(&task)
        {
            task.cancel(false);
        }
        Ok(task)
    }

    /// Turns the calling thread into a worker of this scheduler.
    ///
    /// Runs due tasks until the scheduler is stopped,
    /// or shut down and no queued tasks are left.
    pub fn run_worker(&self) {
        let inner = &*self.inner;
        let Some(_registration) = inner.register_worker(true) else {
            return;
        };
        tracing::debug!("worker started");

        loop {
            let next = inner.queue.take_or_abort(|empty| match inner.run_state() {
                RUNNING => false,
                SHUTDOWN => empty,
                _ => true,
            });

            let task = match next {
                Ok(Some(task)) => task,
                Ok(None) => break,
                Err(Interrupted) => continue,
            };

            if inner.run_state() < STOP {
                // Interruptions meant for previous tasks must not leak into this one.
                interrupt::interrupted();
            }
            task.run();
        }

        tracing::debug!("worker exiting");
    }

    /// Runs all tasks that are due now on the calling thread.
    /// Returns number of tasks taken from the queue.
    ///
    /// The scheduler does not terminate while this runs.
    pub fn run_pending(&self) -> usize {
        let Some(_registration) = self.inner.register_worker(false) else {
            return 0;
        };

        let due = self.inner.queue.drain_expired();
        for task in &due {
            task.run();
        }
        due.len()
    }

    /// Initiates orderly shutdown.
    ///
    /// No new tasks are accepted.
    /// Queued tasks keep running or are cancelled according to the [`ShutdownPolicy`].
    pub fn shutdown(&self) {
        let inner = &*self.inner;
        inner.advance_state(SHUTDOWN);
        tracing::debug!("scheduler shutdown");

        inner.on_shutdown();
        inner.queue.wake_all();
    }

    /// Stops the scheduler immediately.
    ///
    /// Interrupts all workers and returns tasks that never ran.
    pub fn shutdown_now(&self) -> Vec<Arc<ScheduledTask>> {
        let inner = &*self.inner;
        inner.advance_state(STOP);
        tracing::debug!("scheduler stop");

        // Interrupting wakes threads blocked in `await_termination`,
        // which takes the workers lock.
        let interrupters = inner.workers.lock().interrupters.clone();
        for interrupter in &interrupters {
            interrupter.interrupt();
        }

        let pending = inner.queue.drain_all();
        inner.queue.wake_all();
        inner.try_terminate();
        pending
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.inner.run_state() != RUNNING
    }

    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.inner.run_state() == TERMINATED
    }

    /// Blocks until the scheduler terminates or `timeout` elapses.
    /// Returns `false` on timeout.
    ///
    /// # Errors
    ///
    /// Returns [`Interrupted`] if the calling thread was interrupted before or while waiting.
    pub fn await_termination(&self, timeout: Duration) -> Result<bool, Interrupted> {
        interrupt::check()?;

        let inner = &*self.inner;
        let deadline = deadline_after(timeout);

        interrupt::with_blocker(inner, || {
            let mut workers = inner.workers.lock();
            loop {
                if interrupt::interrupted() {
                    return Err(Interrupted);
                }
                if inner.run_state() == TERMINATED {
                    return Ok(true);
                }

                match deadline {
                    None => inner.terminated.wait(&mut workers),
                    Some(deadline) => {
                        if Instant::now() >= deadline {
                            return Ok(false);
                        }
                        let _ = inner.terminated.wait_until(&mut workers, deadline);
                    }
                }
            }
        })
    }

    /// Returns current policy flags.
    #[must_use]
    pub fn policy(&self) -> ShutdownPolicy {
        ShutdownPolicy {
            continue_periodic_after_shutdown: self.continue_periodic_after_shutdown(),
            execute_delayed_after_shutdown: self.execute_delayed_after_shutdown(),
            remove_on_cancel: self.remove_on_cancel(),
        }
    }

    #[must_use]
    pub fn continue_periodic_after_shutdown(&self) -> bool {
        self.inner.continue_periodic.load(Ordering::Acquire)
    }

    /// Sets whether periodic tasks keep running after shutdown.
    /// Turning it off after shutdown cancels queued periodic tasks.
    pub fn set_continue_periodic_after_shutdown(&self, value: bool) {
        self.inner.continue_periodic.store(value, Ordering::Release);
        if !value && self.is_shutdown() {
            self.inner.on_shutdown();
        }
    }

    #[must_use]
    pub fn execute_delayed_after_shutdown(&self) -> bool {
        self.inner.execute_delayed.load(Ordering::Acquire)
    }

    /// Sets whether queued one-shot tasks run after shutdown.
    /// Turning it off after shutdown cancels them.
    pub fn set_execute_delayed_after_shutdown(&self, value: bool) {
        self.inner.execute_delayed.store(value, Ordering::Release);
        if !value && self.is_shutdown() {
            self.inner.on_shutdown();
        }
    }

    #[must_use]
    pub fn remove_on_cancel(&self) -> bool {
        self.inner.remove_on_cancel.load(Ordering::Acquire)
    }

    pub fn set_remove_on_cancel(&self, value: bool) {
        self.inner.remove_on_cancel.store(value, Ordering::Release);
    }
}
