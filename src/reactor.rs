//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    fail::Fail,
    logging,
    metrics::Metrics,
    profile::OptimizationLevel,
    registry::{
        IdRegistry,
        OpId,
    },
    scheduler::{
        DeferredQueue,
        TaskTable,
    },
    shared::SharedObject,
    stream::StreamTable,
    timer::TimerTable,
};
use ::libc::{
    c_int,
    EAGAIN,
    EALREADY,
    EINPROGRESS,
    EWOULDBLOCK,
};
use ::std::{
    collections::HashMap,
    ops::{
        Deref,
        DerefMut,
    },
    thread,
    time::{
        Duration,
        Instant,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// State of one single-threaded reactor instance. All registered work (tasks, deferred callbacks, timers and stream
/// watchers) lives in the per-kind tables and is driven by [SharedReactor::run].
pub struct Reactor {
    /// Issues operation identifiers and remembers cancellations.
    pub(crate) registry: IdRegistry,
    /// Live coroutine tasks.
    pub(crate) tasks: TaskTable,
    /// Run-once callbacks awaiting the next deferred drain.
    pub(crate) deferred: DeferredQueue,
    /// Scheduled timers.
    pub(crate) timers: TimerTable,
    /// Accept, read and write watchers.
    pub(crate) streams: StreamTable,
    /// Failures recorded against the operation that raised them. Last failure per identifier wins.
    errors: HashMap<OpId, Fail>,
    /// Scheduling counters.
    pub(crate) metrics: Metrics,
    /// Active optimization profile.
    pub(crate) profile: OptimizationLevel,
    /// Cleared by [SharedReactor::stop]; checked at the top of every iteration.
    running: bool,
    /// Consecutive iterations in which no phase reported work.
    empty_streak: usize,
    /// When the last productive iteration finished. Drives the adaptive idle back-off.
    last_work: Instant,
}

/// Handle to a reactor shared between the scheduling loop and the callbacks it runs. Callbacks registering or
/// cancelling work from inside the loop hold clones of this handle.
#[derive(Clone)]
pub struct SharedReactor(SharedObject<Reactor>);

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Reactor {
    /// Checks whether an errno signals that a non-blocking operation should simply be retried later.
    pub fn should_retry(errno: c_int) -> bool {
        errno == EINPROGRESS || errno == EWOULDBLOCK || errno == EAGAIN || errno == EALREADY
    }
}

impl SharedReactor {
    /// Creates a reactor with the profile named by `FIBERLOOP_PROFILE`, falling back to `balanced`.
    pub fn new() -> Self {
        logging::initialize();
        Self(SharedObject::new(Reactor {
            registry: IdRegistry::default(),
            tasks: TaskTable::default(),
            deferred: DeferredQueue::default(),
            timers: TimerTable::default(),
            streams: StreamTable::default(),
            errors: HashMap::new(),
            metrics: Metrics::default(),
            profile: OptimizationLevel::from_env(),
            running: false,
            empty_streak: 0,
            last_work: Instant::now(),
        }))
    }

    /// Drives every registered operation to completion. Returns when no work remains or [SharedReactor::stop] is
    /// called; both are observed at iteration boundaries, so the scan in flight always finishes first.
    pub fn run(&mut self) {
        self.running = true;
        self.last_work = Instant::now();
        while self.running && self.has_work() {
            let scan_start: Instant = Instant::now();
            let mut did_work: bool = false;
            did_work |= self.run_accept_phase();
            did_work |= self.run_read_phase();
            did_work |= self.run_write_phase();
            did_work |= self.run_task_phase();
            did_work |= self.run_timer_phase();
            did_work |= self.run_deferred_phase();

            self.metrics.iterations += 1;
            if did_work {
                self.metrics.work_cycles += 1;
                self.metrics.last_work_duration = scan_start.elapsed();
                self.empty_streak = 0;
                self.last_work = Instant::now();
            } else {
                self.metrics.empty_iterations += 1;
                self.empty_streak += 1;
                self.idle();
            }
        }
        self.running = false;
        trace!("run(): loop exited after {:?} iterations", self.metrics.iterations);
    }

    /// Requests loop exit. Registered work is kept, so a later `run()` resumes where this one left off.
    pub fn stop(&mut self) {
        trace!("stop()");
        self.running = false;
    }

    /// Checks whether any operation is still registered.
    pub fn has_work(&self) -> bool {
        !self.tasks.is_empty()
            || !self.deferred.is_empty()
            || !self.timers.is_empty()
            || self.streams.has_accepts()
            || self.streams.has_reads()
            || self.streams.has_writes()
    }

    /// Cancels an operation of any kind: the identifier is marked so in-flight snapshots skip it, and whatever table
    /// holds it drops the entry. Unknown and already-cancelled identifiers are a silent no-op.
    pub fn cancel(&mut self, id: OpId) {
        trace!("cancel(): id={:?}", id);
        self.registry.cancel(id);
        self.tasks.remove(id);
        self.deferred.remove(id);
        self.timers.remove(id);
        self.streams.remove(id);
    }

    /// Checks whether an identifier has been cancelled. Long-running coroutines consult this between suspension
    /// points.
    pub fn is_cancelled(&self, id: OpId) -> bool {
        self.registry.is_cancelled(&id)
    }

    /// Snapshot of the error log, rendered for display.
    pub fn get_errors(&self) -> HashMap<OpId, String> {
        self.errors.iter().map(|(id, e)| (*id, e.to_string())).collect()
    }

    /// Error code of the failure recorded against an identifier, if any.
    pub fn last_errno(&self, id: OpId) -> Option<c_int> {
        self.errors.get(&id).map(|e| e.errno)
    }

    /// Snapshot of the scheduling counters.
    pub fn get_metrics(&self) -> Metrics {
        self.metrics
    }

    /// Swaps the active optimization profile by name. Unknown names fall back to `balanced`. Takes effect at the next
    /// iteration, so it is safe to call from inside a callback.
    pub fn set_optimization_level(&mut self, name: &str) {
        self.profile = OptimizationLevel::from_name(name);
        debug!("set_optimization_level(): {:?}", self.profile);
    }

    pub fn get_optimization_level(&self) -> OptimizationLevel {
        self.profile
    }

    /// Issues an identifier for a new operation.
    pub(crate) fn issue_id(&mut self) -> OpId {
        self.registry.issue()
    }

    /// Records a failure against the operation that raised it. Failures never unwind the loop.
    pub(crate) fn record_error(&mut self, id: OpId, error: Fail) {
        warn!("record_error(): id={:?} error={:?}", id, error);
        self.errors.insert(id, error);
    }

    /// Sleeps after an unproductive iteration. The adaptive policy backs off with the time since the last productive
    /// cycle; the fixed policy steps through two nap lengths on streak thresholds alone. Either way the nap is clamped
    /// so the earliest timer never fires late because of it.
    fn idle(&mut self) {
        const SHORT_NAP: Duration = Duration::from_micros(10);
        const MEDIUM_NAP: Duration = Duration::from_micros(100);
        const LONG_NAP: Duration = Duration::from_millis(1);

        let threshold: usize = self.profile.empty_iteration_threshold;
        let nap: Option<Duration> = if self.profile.adaptive_idle {
            if self.empty_streak > threshold {
                let idle_for: Duration = self.last_work.elapsed();
                if idle_for <= Duration::from_millis(1) {
                    Some(SHORT_NAP)
                } else if idle_for <= Duration::from_millis(100) {
                    Some(MEDIUM_NAP)
                } else {
                    Some(LONG_NAP)
                }
            } else {
                None
            }
        } else if self.empty_streak > threshold {
            Some(MEDIUM_NAP)
        } else if self.empty_streak > threshold / 2 {
            Some(SHORT_NAP)
        } else {
            None
        };

        if let Some(mut nap) = nap {
            if let Some(due_in) = self.next_timer_delay() {
                nap = nap.min(due_in);
            }
            if !nap.is_zero() {
                thread::sleep(nap);
            }
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for SharedReactor {
    fn default() -> Self {
        Self::new()
    }
}

impl Deref for SharedReactor {
    type Target = Reactor;

    fn deref(&self) -> &Self::Target {
        self.0.deref()
    }
}

impl DerefMut for SharedReactor {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.0.deref_mut()
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
