//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    fail::Fail,
    shared::SharedObject,
};
use ::std::{
    future::Future,
    pin::Pin,
    task::{
        Context,
        Poll,
        Waker,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Yield is a future that lets the currently running coroutine cooperatively suspend because it cannot make progress.
/// Coroutines are expected to use the [Yielder] methods to create yield points.
struct Yield {
    /// How many times have we already yielded?
    already_yielded: usize,
    /// How many times should we yield? If none, then we yield until a wake signal.
    yield_quanta: Option<usize>,
    /// Shared handle used to wake the suspended coroutine with either an Ok to indicate there is work to be done or an
    /// error to unwind the coroutine.
    yielder_handle: YielderHandle,
}

/// Shared handle to a suspended coroutine. Cloned by whoever will resume it (a timer callback, an I/O event) and used
/// to deliver the resume value.
#[derive(Clone)]
pub struct YielderHandle {
    result_handle: SharedObject<Option<Result<(), Fail>>>,
    waker_handle: SharedObject<Option<Waker>>,
}

/// Yielder lets a single coroutine suspend back to the scheduler. The handle obtained from it can be used to wake the
/// coroutine with a value.
pub struct Yielder {
    yielder_handle: YielderHandle,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Yield {
    fn new(yield_quanta: Option<usize>, yielder_handle: YielderHandle) -> Self {
        Self {
            already_yielded: 0,
            yield_quanta,
            yielder_handle,
        }
    }
}

impl YielderHandle {
    pub fn new() -> Self {
        Self {
            result_handle: SharedObject::new(None),
            waker_handle: SharedObject::new(None),
        }
    }

    /// Wake this yielded coroutine: Ok indicates there is work to be done and Fail indicates the coroutine should exit
    /// with an error.
    pub fn wake_with(&mut self, result: Result<(), Fail>) {
        if let Some(old_result) = self.result_handle.replace(result) {
            debug!(
                "wake_with(): already scheduled, overwriting result (old={:?})",
                old_result
            );
        } else if let Some(waker) = self.waker_handle.take() {
            waker.wake();
        }
    }

    /// Get the result this coroutine should be woken with.
    pub fn get_result(&mut self) -> Option<Result<(), Fail>> {
        self.result_handle.take()
    }

    /// Set the waker for this Yielder.
    pub fn set_waker(&mut self, waker: Waker) {
        *self.waker_handle = Some(waker);
    }
}

impl Yielder {
    /// Creates a new Yielder object for a specific coroutine to yield with.
    pub fn new() -> Self {
        Self {
            yielder_handle: YielderHandle::new(),
        }
    }

    /// Returns a handle to this Yielder for waking the yielded coroutine.
    pub fn get_handle(&self) -> YielderHandle {
        self.yielder_handle.clone()
    }

    /// Yields for exactly one scheduling quantum.
    pub async fn yield_once(&self) -> Result<(), Fail> {
        Yield::new(Some(1), self.yielder_handle.clone()).await
    }

    /// Yields for n scheduling quanta.
    pub async fn yield_times(&self, n: usize) -> Result<(), Fail> {
        Yield::new(Some(n), self.yielder_handle.clone()).await
    }

    /// Yields until woken with a signal.
    pub async fn yield_until_wake(&self) -> Result<(), Fail> {
        Yield::new(None, self.yielder_handle.clone()).await
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for Yielder {
    fn default() -> Self {
        Self::new()
    }
}

impl Default for YielderHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl Future for Yield {
    type Output = Result<(), Fail>;

    fn poll(self: Pin<&mut Self>, context: &mut Context) -> Poll<Self::Output> {
        let self_: &mut Self = self.get_mut();

        // First check if we've been woken to do some work.
        if let Some(result) = self_.yielder_handle.get_result() {
            return Poll::Ready(result);
        }

        // Stash the waker.
        self_.yielder_handle.set_waker(context.waker().clone());

        // If we are waiting for a fixed quanta, then always wake up.
        if let Some(budget) = self_.yield_quanta {
            self_.already_yielded += 1;
            if self_.already_yielded < budget {
                context.waker().wake_by_ref();
            } else {
                self_.yielder_handle.wake_with(Ok(()));
            }
        }

        Poll::Pending
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::{
        Yielder,
        YielderHandle,
    };
    use crate::fail::Fail;
    use ::anyhow::Result;
    use ::futures::task::noop_waker_ref;
    use ::libc::ECANCELED;
    use ::std::{
        future::Future,
        pin::Pin,
        task::Context,
    };

    #[test]
    fn yield_once_completes_on_second_poll() -> Result<()> {
        let mut ctx: Context = Context::from_waker(noop_waker_ref());
        let yielder: Yielder = Yielder::new();
        let future = yielder.yield_once();
        futures::pin_mut!(future);

        crate::ensure_eq!(Future::poll(Pin::new(&mut future), &mut ctx).is_pending(), true);
        crate::ensure_eq!(Future::poll(Pin::new(&mut future), &mut ctx).is_ready(), true);
        Ok(())
    }

    #[test]
    fn yield_until_wake_stays_pending_until_woken() -> Result<()> {
        let mut ctx: Context = Context::from_waker(noop_waker_ref());
        let yielder: Yielder = Yielder::new();
        let mut handle: YielderHandle = yielder.get_handle();
        let future = yielder.yield_until_wake();
        futures::pin_mut!(future);

        crate::ensure_eq!(Future::poll(Pin::new(&mut future), &mut ctx).is_pending(), true);
        crate::ensure_eq!(Future::poll(Pin::new(&mut future), &mut ctx).is_pending(), true);

        handle.wake_with(Ok(()));
        match Future::poll(Pin::new(&mut future), &mut ctx) {
            std::task::Poll::Ready(Ok(())) => Ok(()),
            other => anyhow::bail!("expected Ready(Ok), got {:?}", other.is_ready()),
        }
    }

    #[test]
    fn wake_with_error_unwinds_the_wait() -> Result<()> {
        let mut ctx: Context = Context::from_waker(noop_waker_ref());
        let yielder: Yielder = Yielder::new();
        let mut handle: YielderHandle = yielder.get_handle();
        let future = yielder.yield_until_wake();
        futures::pin_mut!(future);

        crate::ensure_eq!(Future::poll(Pin::new(&mut future), &mut ctx).is_pending(), true);
        handle.wake_with(Err(Fail::new(ECANCELED, "cancelled")));
        match Future::poll(Pin::new(&mut future), &mut ctx) {
            std::task::Poll::Ready(Err(e)) => {
                crate::ensure_eq!(e.errno, ECANCELED);
                Ok(())
            },
            _ => anyhow::bail!("expected Ready(Err)"),
        }
    }
}
