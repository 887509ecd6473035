//! Timer and clock abstraction.
//!
//! Every delay in the realtime layer (batch flushes, reconnect backoff,
//! heartbeats, typing timeouts) goes through a [`Scheduler`]. Production code
//! uses [`TokioScheduler`]; tests drive a [`ManualClock`] forward explicitly so
//! nothing waits on wall-clock time.

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use futures_util::task::noop_waker;
use log::*;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;

/// One-shot timer callback.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Callback run on every tick of a repeating timer.
pub type RepeatingTask = Arc<dyn Fn() + Send + Sync + 'static>;

/// Cancels a scheduled timer. Cloning shares the same timer.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
    abort: Option<AbortHandle>,
}

impl TimerHandle {
    fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            abort: None,
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Some(abort) = &self.abort {
            abort.abort();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Source of time and deferred execution.
pub trait Scheduler: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Run `task` once after `delay` unless cancelled first.
    fn schedule(&self, delay: Duration, task: Task) -> TimerHandle;

    /// Run `task` every `interval`, first tick one interval from now.
    fn schedule_repeating(&self, interval: Duration, task: RepeatingTask) -> TimerHandle;

    /// Drive a fire-and-forget future (transport sends from timer callbacks).
    fn spawn(&self, future: BoxFuture<'static, ()>);
}

/// Scheduler backed by the Tokio runtime timer.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    handle: Handle,
}

impl TokioScheduler {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Scheduler bound to the runtime of the calling task.
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn current() -> Self {
        Self::new(Handle::current())
    }
}

impl Scheduler for TokioScheduler {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn schedule(&self, delay: Duration, task: Task) -> TimerHandle {
        let mut timer = TimerHandle::new();
        let cancelled = Arc::clone(&timer.cancelled);
        let join = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if !cancelled.load(Ordering::SeqCst) {
                task();
            }
        });
        timer.abort = Some(join.abort_handle());
        timer
    }

    fn schedule_repeating(&self, interval: Duration, task: RepeatingTask) -> TimerHandle {
        let mut timer = TimerHandle::new();
        let cancelled = Arc::clone(&timer.cancelled);
        let join = self.handle.spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if cancelled.load(Ordering::SeqCst) {
                    break;
                }
                task();
            }
        });
        timer.abort = Some(join.abort_handle());
        timer
    }

    fn spawn(&self, future: BoxFuture<'static, ()>) {
        self.handle.spawn(future);
    }
}

enum TimerKind {
    Once(Task),
    Repeating {
        interval: Duration,
        task: RepeatingTask,
    },
}

struct PendingTimer {
    due: DateTime<Utc>,
    seq: u64,
    handle: TimerHandle,
    kind: TimerKind,
}

struct ManualState {
    now: DateTime<Utc>,
    next_seq: u64,
    timers: Vec<PendingTimer>,
    futures: Vec<BoxFuture<'static, ()>>,
}

/// Deterministic scheduler for tests and simulations.
///
/// Time only moves when [`ManualClock::advance`] is called. Due timers fire in
/// `(due time, scheduling order)` order, each with the clock set to its due
/// time. Spawned futures are polled immediately and again after every timer.
pub struct ManualClock {
    state: Mutex<ManualState>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    pub fn starting_at(now: DateTime<Utc>) -> Self {
        Self {
            state: Mutex::new(ManualState {
                now,
                next_seq: 0,
                timers: Vec::new(),
                futures: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ManualState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn push_timer(&self, due: DateTime<Utc>, handle: TimerHandle, kind: TimerKind) {
        let mut state = self.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.timers.push(PendingTimer {
            due,
            seq,
            handle,
            kind,
        });
    }

    /// Number of timers that are scheduled and not cancelled.
    pub fn pending_timers(&self) -> usize {
        self.lock()
            .timers
            .iter()
            .filter(|t| !t.handle.is_cancelled())
            .count()
    }

    /// Move time forward by `by`, firing every timer that falls due.
    pub fn advance(&self, by: Duration) {
        let target = self.lock().now + to_chrono(by);

        loop {
            let next = {
                let mut state = self.lock();
                state.timers.retain(|t| !t.handle.is_cancelled());
                let index = state
                    .timers
                    .iter()
                    .enumerate()
                    .filter(|(_, t)| t.due <= target)
                    .min_by_key(|(_, t)| (t.due, t.seq))
                    .map(|(i, _)| i);
                let timer = index.map(|i| state.timers.swap_remove(i));
                if let Some(timer) = &timer {
                    state.now = timer.due;
                }
                timer
            };

            let Some(timer) = next else {
                break;
            };

            match timer.kind {
                TimerKind::Once(task) => task(),
                TimerKind::Repeating { interval, task } => {
                    task();
                    if !timer.handle.is_cancelled() {
                        let due = timer.due + to_chrono(interval);
                        self.push_timer(
                            due,
                            timer.handle,
                            TimerKind::Repeating { interval, task },
                        );
                    }
                }
            }
            self.poll_spawned();
        }

        self.lock().now = target;
        self.poll_spawned();
    }

    fn poll_spawned(&self) {
        let mut futures = std::mem::take(&mut self.lock().futures);
        if futures.is_empty() {
            return;
        }

        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        futures.retain_mut(|future| future.as_mut().poll(&mut cx).is_pending());

        if !futures.is_empty() {
            trace!("{} spawned futures still pending", futures.len());
        }
        self.lock().futures.extend(futures);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.lock().now
    }

    fn schedule(&self, delay: Duration, task: Task) -> TimerHandle {
        let handle = TimerHandle::new();
        let due = self.now() + to_chrono(delay);
        self.push_timer(due, handle.clone(), TimerKind::Once(task));
        handle
    }

    fn schedule_repeating(&self, interval: Duration, task: RepeatingTask) -> TimerHandle {
        // A zero interval would never let time advance.
        let interval = interval.max(Duration::from_millis(1));
        let handle = TimerHandle::new();
        let due = self.now() + to_chrono(interval);
        self.push_timer(
            due,
            handle.clone(),
            TimerKind::Repeating { interval, task },
        );
        handle
    }

    fn spawn(&self, mut future: BoxFuture<'static, ()>) {
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        if let Poll::Pending = future.as_mut().poll(&mut cx) {
            self.lock().futures.push(future);
        }
    }
}

pub(crate) fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}
