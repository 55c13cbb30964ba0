//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    fail::Fail,
    reactor::SharedReactor,
    registry::OpId,
    scheduler::yielder::Yielder,
};
use ::async_trait::async_trait;
use ::futures::{
    future::FusedFuture,
    FutureExt,
};
use ::std::{
    collections::BTreeMap,
    future::Future,
    time::{
        Duration,
        Instant,
    },
};

//======================================================================================================================
// Types
//======================================================================================================================

/// Callback fired when a timer expires.
pub type TimerCallback = Box<dyn FnMut() -> Result<(), Fail>>;

//======================================================================================================================
// Structures
//======================================================================================================================

/// A scheduled callback keyed by an absolute deadline. One-shot timers carry no interval; repeating timers re-arm
/// after each firing and self-remove once `remaining` (if bounded) reaches zero.
pub struct Timer {
    /// Absolute expiry time.
    deadline: Instant,
    /// Callback to fire at expiry.
    callback: TimerCallback,
    /// Re-arm period. `None` marks a one-shot timer.
    interval: Option<Duration>,
    /// Firings left for a bounded repeating timer. `None` repeats until cancelled.
    remaining: Option<u64>,
}

/// Table of live timers, keyed by operation identifier so that timers due in the same pass fire in insertion order.
#[derive(Default)]
pub struct TimerTable {
    timers: BTreeMap<OpId, Timer>,
}

//======================================================================================================================
// Constants
//======================================================================================================================

/// Cap on any single delay or interval. Delays beyond this (including infinity) saturate here.
const MAX_DELAY: Duration = Duration::from_secs(86_400 * 365 * 100);

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Converts a relative delay to a duration. Registration accepts any `f64`: zero, negative and NaN delays map to zero
/// (already due), and delays too large to represent saturate at [MAX_DELAY].
fn sanitize_delay(seconds: f64) -> Duration {
    if seconds.is_nan() || seconds <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(seconds).unwrap_or(MAX_DELAY).min(MAX_DELAY)
}

/// Computes an absolute deadline from a relative delay. Zero and negative delays are legal and produce a deadline
/// that is already due.
fn deadline_after(now: Instant, seconds: f64) -> Instant {
    now + sanitize_delay(seconds)
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl TimerTable {
    pub fn insert(&mut self, id: OpId, timer: Timer) {
        self.timers.insert(id, timer);
    }

    pub fn remove(&mut self, id: OpId) -> Option<Timer> {
        self.timers.remove(&id)
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    /// Removes and returns every timer whose deadline is at or before `now`, in ascending identifier order.
    pub fn take_due(&mut self, now: Instant) -> Vec<(OpId, Timer)> {
        let due_ids: Vec<OpId> = self
            .timers
            .iter()
            .filter(|(_, timer)| timer.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        due_ids
            .into_iter()
            .map(|id| (id, self.timers.remove(&id).expect("due timer must be present")))
            .collect()
    }

    /// Minimum non-negative time remaining until the earliest deadline. `Some(ZERO)` if a timer is overdue, `None` if
    /// no timers are scheduled.
    pub fn next_delay(&self, now: Instant) -> Option<Duration> {
        self.timers
            .values()
            .map(|timer| timer.deadline.saturating_duration_since(now))
            .min()
    }
}

/// Timer engine operations on the reactor.
impl SharedReactor {
    /// Schedules a one-shot callback. Zero and negative delays fire on the next timer pass.
    pub fn after<F>(&mut self, callback: F, delay_seconds: f64) -> OpId
    where
        F: FnMut() -> Result<(), Fail> + 'static,
    {
        let id: OpId = self.issue_id();
        trace!("after(): id={:?} delay={:?}s", id, delay_seconds);
        self.timers.insert(
            id,
            Timer {
                deadline: deadline_after(Instant::now(), delay_seconds),
                callback: Box::new(callback),
                interval: None,
                remaining: None,
            },
        );
        id
    }

    /// Schedules a repeating callback. With `times = Some(n)` the timer self-removes after `n` firings; `Some(0)`
    /// never fires. With `times = None` it fires until cancelled.
    pub fn repeat<F>(&mut self, interval_seconds: f64, callback: F, times: Option<u64>) -> OpId
    where
        F: FnMut() -> Result<(), Fail> + 'static,
    {
        let id: OpId = self.issue_id();
        trace!("repeat(): id={:?} interval={:?}s times={:?}", id, interval_seconds, times);
        if times == Some(0) {
            return id;
        }
        let interval: Duration = sanitize_delay(interval_seconds);
        self.timers.insert(
            id,
            Timer {
                deadline: deadline_after(Instant::now(), interval_seconds),
                callback: Box::new(callback),
                interval: Some(interval),
                remaining: times,
            },
        );
        id
    }

    /// Schedules an unbounded repeating callback.
    pub fn set_interval<F>(&mut self, interval_seconds: f64, callback: F) -> OpId
    where
        F: FnMut() -> Result<(), Fail> + 'static,
    {
        self.repeat(interval_seconds, callback, None)
    }

    /// Cooperative, non-blocking wait. Schedules an internal one-shot that wakes the given yielder, then suspends
    /// until it fires. Usable only from inside a coroutine.
    pub async fn sleep(&mut self, seconds: f64, yielder: &Yielder) -> Result<(), Fail> {
        let mut handle: crate::YielderHandle = yielder.get_handle();
        self.after(
            move || {
                handle.wake_with(Ok(()));
                Ok(())
            },
            seconds,
        );
        yielder.yield_until_wake().await
    }

    /// Minimum non-negative time until the earliest deadline, used to bound idle sleeps.
    pub fn next_timer_delay(&self) -> Option<Duration> {
        self.timers.next_delay(Instant::now())
    }

    /// Fires every timer due at a single timestamp sample taken at the start of the pass. Callback errors are recorded
    /// against the timer's identifier and do not prevent re-arm or removal bookkeeping.
    pub(crate) fn run_timer_phase(&mut self) -> bool {
        let now: Instant = Instant::now();
        let due: Vec<(OpId, Timer)> = self.timers.take_due(now);
        let mut did_work: bool = false;
        for (id, mut timer) in due {
            if self.is_cancelled(id) {
                continue;
            }
            did_work = true;
            if let Err(e) = (timer.callback)() {
                self.record_error(id, e);
            }
            if let Some(interval) = timer.interval {
                if let Some(remaining) = timer.remaining.as_mut() {
                    *remaining -= 1;
                    if *remaining == 0 {
                        trace!("run_timer_phase(): bounded repeat exhausted (id={:?})", id);
                        continue;
                    }
                }
                if !self.is_cancelled(id) {
                    timer.deadline = now + interval;
                    self.timers.insert(id, timer);
                }
            }
        }
        did_work
    }
}

//======================================================================================================================
// Traits
//======================================================================================================================

/// Provides useful high-level future-related methods.
#[async_trait(?Send)]
pub trait UtilityMethods: Future + FusedFuture + Unpin {
    /// Transforms our current future to include a deadline. We either return the result of the future finishing or a
    /// timed-out error, whichever happens first.
    async fn with_timeout<T>(&mut self, timer: T) -> Result<Self::Output, Fail>
    where
        T: Future<Output = Result<(), Fail>>,
    {
        futures::select! {
            result = self => Ok(result),
            result = timer.fuse() => match result {
                Ok(()) => Err(Fail::timed_out("timer expired")),
                Err(e) => Err(e),
            },
        }
    }
}

// Implement UtilityMethods for any Future that implements Unpin and FusedFuture.
impl<F: ?Sized> UtilityMethods for F where F: Future + Unpin + FusedFuture {}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
