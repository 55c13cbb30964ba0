//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    fail::Fail,
    registry::OpId,
};
use ::futures::{
    future::FusedFuture,
    task::noop_waker_ref,
};
use ::std::{
    pin::Pin,
    task::{
        Context,
        Poll,
    },
};

//======================================================================================================================
// Types
//======================================================================================================================

/// The kind of coroutine a task runs: a fused future that resolves to the task's final outcome.
pub type Coroutine = Pin<Box<dyn FusedFuture<Output = Result<(), Fail>>>>;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Lifecycle of a coroutine task.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TaskState {
    /// Created but never polled.
    NotStarted,
    /// Polled at least once, not yet complete.
    Suspended,
    /// Ran to completion (successfully or with an error).
    Terminated,
}

/// A suspendable unit of work. Polling the coroutine starts or resumes it; `Poll::Pending` leaves it suspended until
/// the next scheduling pass, `Poll::Ready` terminates it.
pub struct Task {
    /// Task identifier, drawn from the reactor-wide counter.
    id: OpId,
    /// Where in its lifecycle this task is.
    state: TaskState,
    /// Underlying coroutine to run.
    coroutine: Coroutine,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Task {
    pub fn new(id: OpId, coroutine: Coroutine) -> Self {
        Self {
            id,
            state: TaskState::NotStarted,
            coroutine,
        }
    }

    pub fn get_id(&self) -> OpId {
        self.id
    }

    pub fn get_state(&self) -> TaskState {
        self.state
    }

    /// Starts or resumes the task for one quantum. Returns `None` while the task remains suspended and `Some(outcome)`
    /// once it terminates. Safe to call again after termination: a terminated coroutine is never re-polled.
    pub fn poll_once(&mut self) -> Option<Result<(), Fail>> {
        if self.state == TaskState::Terminated {
            return Some(Ok(()));
        }
        let mut ctx: Context = Context::from_waker(noop_waker_ref());
        match self.coroutine.as_mut().poll(&mut ctx) {
            Poll::Pending => {
                self.state = TaskState::Suspended;
                None
            },
            Poll::Ready(result) => {
                self.state = TaskState::Terminated;
                Some(result)
            },
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
