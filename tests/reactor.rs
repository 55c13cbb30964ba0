//======================================================================================================================
// Imports
//======================================================================================================================

use ::anyhow::Result;
use ::fiberloop::{
    ensure_eq,
    OpId,
    SharedReactor,
    UtilityMethods,
    Yielder,
};
use ::futures::FutureExt;
use ::libc::ETIMEDOUT;
use ::socket2::Socket;
use ::std::{
    cell::RefCell,
    net::{
        SocketAddr,
        TcpListener,
        TcpStream,
    },
    rc::Rc,
};

//======================================================================================================================
// Tests
//======================================================================================================================

/// Tests that an accept watcher delivers every queued connection and that cancelling it from its own callback ends the
/// watch.
#[test]
fn accept_delivers_queued_connections() -> Result<()> {
    let listener: TcpListener = TcpListener::bind("127.0.0.1:0")?;
    let addr: SocketAddr = listener.local_addr()?;

    // Connect before the loop starts; the kernel backlog holds both until the accept phase runs.
    let _clients: Vec<TcpStream> = vec![TcpStream::connect(addr)?, TcpStream::connect(addr)?];

    let mut reactor: SharedReactor = SharedReactor::new();
    let accepted: Rc<RefCell<Vec<Socket>>> = Rc::new(RefCell::new(vec![]));

    let accepted_ref: Rc<RefCell<Vec<Socket>>> = accepted.clone();
    let mut reactor_ref: SharedReactor = reactor.clone();
    let id_slot: Rc<RefCell<Option<OpId>>> = Rc::new(RefCell::new(None));
    let id_slot_ref: Rc<RefCell<Option<OpId>>> = id_slot.clone();
    let id: OpId = reactor.listen(Socket::from(listener), move |client| {
        accepted_ref.borrow_mut().push(client);
        if accepted_ref.borrow().len() == 2 {
            let id: OpId = id_slot_ref.borrow().expect("id was stored before run");
            reactor_ref.cancel(id);
        }
        Ok(())
    })?;
    *id_slot.borrow_mut() = Some(id);
    reactor.run();

    ensure_eq!(accepted.borrow().len(), 2);
    ensure_eq!(reactor.get_errors().is_empty(), true);
    ensure_eq!(reactor.has_work(), false);
    Ok(())
}

/// Tests a full write-then-read exchange over a local TCP pair: the write watcher pushes a payload larger than one
/// chunk, the read watcher reassembles it, and dropping the writer's socket delivers the terminal empty chunk.
#[test]
fn write_then_read_reassembles_the_payload() -> Result<()> {
    let listener: TcpListener = TcpListener::bind("127.0.0.1:0")?;
    let addr: SocketAddr = listener.local_addr()?;
    let client: TcpStream = TcpStream::connect(addr)?;
    let (server, _): (TcpStream, SocketAddr) = listener.accept()?;

    let payload: Vec<u8> = (0..100_000usize).map(|i| (i % 251) as u8).collect();

    let mut reactor: SharedReactor = SharedReactor::new();
    let received: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(vec![]));
    let chunk_sizes: Rc<RefCell<Vec<usize>>> = Rc::new(RefCell::new(vec![]));
    let progress: Rc<RefCell<Vec<(usize, usize)>>> = Rc::new(RefCell::new(vec![]));

    let received_ref: Rc<RefCell<Vec<u8>>> = received.clone();
    let chunk_sizes_ref: Rc<RefCell<Vec<usize>>> = chunk_sizes.clone();
    reactor.on_readable(
        Socket::from(server),
        move |chunk| {
            received_ref.borrow_mut().extend_from_slice(chunk);
            chunk_sizes_ref.borrow_mut().push(chunk.len());
            Ok(())
        },
        None,
    )?;

    let progress_ref: Rc<RefCell<Vec<(usize, usize)>>> = progress.clone();
    reactor.on_writable(Socket::from(client), payload.clone(), move |written, total| {
        progress_ref.borrow_mut().push((written, total));
        Ok(())
    })?;
    reactor.run();

    ensure_eq!(reactor.get_errors().is_empty(), true);
    ensure_eq!(*received.borrow() == payload, true);

    // The writer's socket closed when its watcher completed, so the reader saw a terminal empty chunk.
    ensure_eq!(chunk_sizes.borrow().last().copied(), Some(0));

    // Progress reports are monotonic and end at the full payload.
    let progress: Vec<(usize, usize)> = progress.borrow().clone();
    ensure_eq!(progress.last().copied(), Some((payload.len(), payload.len())));
    for pair in progress.windows(2) {
        ensure_eq!(pair[0].0 < pair[1].0, true);
        ensure_eq!(pair[0].1, payload.len());
    }
    Ok(())
}

/// Tests that a coroutine waiting on a handle that is never woken unwinds with a timeout once the deadline timer
/// fires.
#[test]
fn wait_with_deadline_times_out() -> Result<()> {
    let mut reactor: SharedReactor = SharedReactor::new();
    let outcome: Rc<RefCell<Option<i32>>> = Rc::new(RefCell::new(None));

    let outcome_ref: Rc<RefCell<Option<i32>>> = outcome.clone();
    let reactor_task: SharedReactor = reactor.clone();
    reactor.spawn(move |_id| {
        let mut reactor: SharedReactor = reactor_task.clone();
        Box::pin(
            async move {
                let waiter: Yielder = Yielder::new();
                let mut never = Box::pin(waiter.yield_until_wake().fuse());
                let deadline_yielder: Yielder = Yielder::new();
                let deadline = async { reactor.sleep(0.01, &deadline_yielder).await };
                if let Err(e) = never.with_timeout(deadline).await {
                    *outcome_ref.borrow_mut() = Some(e.errno);
                }
                Ok(())
            }
            .fuse(),
        )
    });
    reactor.run();

    ensure_eq!(*outcome.borrow(), Some(ETIMEDOUT));
    Ok(())
}

/// Tests one run that mixes every operation kind: a multi-yield coroutine, a one-shot timer and a deferred callback
/// all complete in the same loop with a clean error log.
#[test]
fn mixed_workload_drains_cleanly() -> Result<()> {
    let mut reactor: SharedReactor = SharedReactor::new();
    let completions: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(vec![]));

    let completions_task: Rc<RefCell<Vec<&'static str>>> = completions.clone();
    reactor.spawn(move |_id| {
        Box::pin(
            async move {
                let yielder: Yielder = Yielder::new();
                for _ in 0..3 {
                    yielder.yield_once().await?;
                }
                completions_task.borrow_mut().push("task");
                Ok(())
            }
            .fuse(),
        )
    });

    let completions_timer: Rc<RefCell<Vec<&'static str>>> = completions.clone();
    reactor.after(
        move || {
            completions_timer.borrow_mut().push("timer");
            Ok(())
        },
        0.005,
    );

    let completions_deferred: Rc<RefCell<Vec<&'static str>>> = completions.clone();
    reactor.defer(move || {
        completions_deferred.borrow_mut().push("deferred");
        Ok(())
    });
    reactor.run();

    let seen: Vec<&'static str> = completions.borrow().clone();
    ensure_eq!(seen.contains(&"task"), true);
    ensure_eq!(seen.contains(&"timer"), true);
    ensure_eq!(seen.contains(&"deferred"), true);
    ensure_eq!(seen.first().copied(), Some("deferred"));
    ensure_eq!(reactor.get_errors().is_empty(), true);
    ensure_eq!(reactor.get_metrics().iterations > 0, true);
    Ok(())
}
