pub mod task;
pub mod yielder;

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    fail::Fail,
    reactor::SharedReactor,
    registry::OpId,
    scheduler::task::{
        Coroutine,
        Task,
    },
};
use ::std::{
    collections::{
        BTreeMap,
        VecDeque,
    },
    mem,
};

//======================================================================================================================
// Types
//======================================================================================================================

/// A run-once unit of work with no suspension capability.
pub type DeferredCallback = Box<dyn FnOnce() -> Result<(), Fail>>;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Table of live coroutine tasks, keyed by operation identifier. Iteration order is ascending identifier order, which
/// is the order tasks are resumed in.
#[derive(Default)]
pub struct TaskTable {
    tasks: BTreeMap<OpId, Task>,
}

/// Queue of deferred callbacks, drained once per iteration in submission order.
#[derive(Default)]
pub struct DeferredQueue {
    items: VecDeque<(OpId, DeferredCallback)>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl TaskTable {
    pub fn insert(&mut self, task: Task) {
        self.tasks.insert(task.get_id(), task);
    }

    /// Takes a task out of the table for polling. The caller reinserts it if it stays suspended.
    pub fn take(&mut self, id: OpId) -> Option<Task> {
        self.tasks.remove(&id)
    }

    pub fn remove(&mut self, id: OpId) -> Option<Task> {
        self.tasks.remove(&id)
    }

    pub fn ids(&self) -> Vec<OpId> {
        self.tasks.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl DeferredQueue {
    pub fn push(&mut self, id: OpId, callback: DeferredCallback) {
        self.items.push_back((id, callback));
    }

    /// Swaps the queue out atomically. Callbacks enqueued while the snapshot is drained land in the fresh queue and
    /// run on a later iteration, which bounds each drain.
    pub fn take_all(&mut self) -> VecDeque<(OpId, DeferredCallback)> {
        mem::take(&mut self.items)
    }

    pub fn remove(&mut self, id: OpId) {
        self.items.retain(|(item_id, _)| *item_id != id);
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Coroutine manager operations on the reactor.
impl SharedReactor {
    /// Enqueues a non-suspendable callback for the next deferred drain.
    pub fn defer<F>(&mut self, callback: F) -> OpId
    where
        F: FnOnce() -> Result<(), Fail> + 'static,
    {
        let id: OpId = self.issue_id();
        trace!("defer(): id={:?}", id);
        self.deferred.push(id, Box::new(callback));
        id
    }

    /// Creates a suspendable task. The factory receives the task's own identifier so the coroutine can consult the
    /// cancellation set between suspension points.
    pub fn spawn<F>(&mut self, factory: F) -> OpId
    where
        F: FnOnce(OpId) -> Coroutine,
    {
        let id: OpId = self.issue_id();
        trace!("spawn(): id={:?}", id);
        let task: Task = Task::new(id, factory(id));
        self.tasks.insert(task);
        id
    }

    /// Starts or resumes every live task once. A task whose identifier is cancelled is dropped unpolled; a task that
    /// terminates with an error has the error recorded against its identifier and never propagates further.
    pub(crate) fn run_task_phase(&mut self) -> bool {
        let ids: Vec<OpId> = self.tasks.ids();
        let mut did_work: bool = false;
        for id in ids {
            if self.is_cancelled(id) {
                self.tasks.remove(id);
                continue;
            }
            let mut task: Task = match self.tasks.take(id) {
                Some(task) => task,
                None => continue,
            };
            did_work = true;
            match task.poll_once() {
                None => {
                    // Still suspended; keep it unless the coroutine cancelled itself while running.
                    if !self.is_cancelled(id) {
                        self.tasks.insert(task);
                    }
                },
                Some(Ok(())) => trace!("run_task_phase(): task completed (id={:?})", id),
                Some(Err(e)) => self.record_error(id, e),
            }
        }
        did_work
    }

    /// Drains the deferred queue snapshot taken at the start of the pass, in submission order.
    pub(crate) fn run_deferred_phase(&mut self) -> bool {
        let snapshot: VecDeque<(OpId, DeferredCallback)> = self.deferred.take_all();
        let mut did_work: bool = false;
        for (id, callback) in snapshot {
            if self.is_cancelled(id) {
                continue;
            }
            did_work = true;
            if let Err(e) = callback() {
                self.record_error(id, e);
            }
        }
        did_work
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
