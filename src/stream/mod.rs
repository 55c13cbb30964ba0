//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    fail::Fail,
    reactor::{
        Reactor,
        SharedReactor,
    },
    registry::OpId,
    scheduler::yielder::Yielder,
};
use ::socket2::{
    Socket,
    Type,
};
use ::std::{
    collections::BTreeMap,
    fs::File,
    io::{
        self,
        Read,
    },
    mem::MaybeUninit,
    slice,
};

//======================================================================================================================
// Types
//======================================================================================================================

/// Callback fired once per accepted connection.
pub type AcceptCallback = Box<dyn FnMut(Socket) -> Result<(), Fail>>;
/// Callback fired with each chunk of bytes read. An empty payload signals end of stream.
pub type ReadCallback = Box<dyn FnMut(&[u8]) -> Result<(), Fail>>;
/// Progress callback fired after every successful partial write with `(written_so_far, total)`.
pub type WriteCallback = Box<dyn FnMut(usize, usize) -> Result<(), Fail>>;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Registered accept interest on a listening socket.
pub struct AcceptWatcher {
    server: Socket,
    callback: AcceptCallback,
}

/// Registered read interest on a stream socket.
pub struct ReadWatcher {
    stream: Socket,
    callback: ReadCallback,
    /// Scratch buffer sized to the watcher's chunk size. Filled by each non-blocking read attempt.
    buffer: Vec<u8>,
}

/// Registered write interest on a stream socket, tracking the unsent suffix of the payload.
pub struct WriteWatcher {
    stream: Socket,
    data: Vec<u8>,
    written: usize,
    callback: WriteCallback,
}

/// Per-kind watcher tables, keyed by operation identifier. Each phase visits its table in ascending identifier order.
#[derive(Default)]
pub struct StreamTable {
    accepts: BTreeMap<OpId, AcceptWatcher>,
    reads: BTreeMap<OpId, ReadWatcher>,
    writes: BTreeMap<OpId, WriteWatcher>,
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Checks whether a handle is a genuine, still-open stream socket.
fn validate_stream(socket: &Socket) -> Result<(), Fail> {
    match socket.r#type() {
        Ok(kind) if kind == Type::STREAM => Ok(()),
        Ok(_) => Err(Fail::invalid_resource("not a stream resource")),
        Err(_) => Err(Fail::invalid_resource("invalid stream resource")),
    }
}

/// Puts a socket into non-blocking mode and applies the tuning from the current optimization profile. Tuning failures
/// are logged but not fatal; the non-blocking switch is the one thing registration depends on.
fn configure_stream(socket: &Socket, buffer_size: usize) -> Result<(), Fail> {
    if let Err(e) = socket.set_nonblocking(true) {
        error!("cannot set NONBLOCK option ({:?})", e);
        return Err(Fail::invalid_resource("cannot set stream non-blocking"));
    }
    if socket.set_nodelay(true).is_err() {
        warn!("cannot set TCP_NODELAY option");
    }
    if socket.set_keepalive(true).is_err() {
        warn!("cannot set SO_KEEPALIVE option");
    }
    if socket.set_recv_buffer_size(buffer_size).is_err() {
        warn!("cannot set SO_RCVBUF option");
    }
    if socket.set_send_buffer_size(buffer_size).is_err() {
        warn!("cannot set SO_SNDBUF option");
    }
    Ok(())
}

/// Checks whether an I/O error just means the non-blocking attempt should be retried on a later iteration.
fn is_retryable(e: &io::Error) -> bool {
    match e.raw_os_error() {
        Some(errno) => Reactor::should_retry(errno),
        None => e.kind() == io::ErrorKind::WouldBlock,
    }
}

/// Reads one chunk from a file into `buffer`, mapping failures to the reactor's error taxonomy.
fn read_file_chunk(file: &mut File, buffer: &mut [u8], path: &str) -> Result<usize, Fail> {
    match file.read(buffer) {
        Ok(nbytes) => Ok(nbytes),
        Err(e) => {
            error!("read_file_chunk(): error reading {:?} ({:?})", path, e);
            Err(Fail::from(e))
        },
    }
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl StreamTable {
    pub fn has_accepts(&self) -> bool {
        !self.accepts.is_empty()
    }

    pub fn has_reads(&self) -> bool {
        !self.reads.is_empty()
    }

    pub fn has_writes(&self) -> bool {
        !self.writes.is_empty()
    }

    /// Drops whatever watcher holds this identifier, closing its socket.
    pub fn remove(&mut self, id: OpId) {
        self.accepts.remove(&id);
        self.reads.remove(&id);
        self.writes.remove(&id);
    }

    fn accept_ids(&self) -> Vec<OpId> {
        self.accepts.keys().copied().collect()
    }

    fn read_ids(&self) -> Vec<OpId> {
        self.reads.keys().copied().collect()
    }

    fn write_ids(&self) -> Vec<OpId> {
        self.writes.keys().copied().collect()
    }
}

/// Stream watcher operations on the reactor.
impl SharedReactor {
    /// Registers accept interest on a listening socket. Fails fast if the handle is not a live stream socket.
    pub fn listen<F>(&mut self, server: Socket, callback: F) -> Result<OpId, Fail>
    where
        F: FnMut(Socket) -> Result<(), Fail> + 'static,
    {
        validate_stream(&server)?;
        configure_stream(&server, self.profile.io_buffer_size)?;
        let id: OpId = self.issue_id();
        trace!("listen(): id={:?}", id);
        self.streams.accepts.insert(
            id,
            AcceptWatcher {
                server,
                callback: Box::new(callback),
            },
        );
        Ok(id)
    }

    /// Registers read interest on a stream socket. The callback receives each chunk read; an empty payload signals
    /// end of stream, after which the watcher is gone.
    pub fn on_readable<F>(&mut self, stream: Socket, callback: F, chunk_size: Option<usize>) -> Result<OpId, Fail>
    where
        F: FnMut(&[u8]) -> Result<(), Fail> + 'static,
    {
        validate_stream(&stream)?;
        configure_stream(&stream, self.profile.io_buffer_size)?;
        let chunk_size: usize = chunk_size.unwrap_or(self.profile.io_buffer_size).max(1);
        let id: OpId = self.issue_id();
        trace!("on_readable(): id={:?} chunk_size={:?}", id, chunk_size);
        self.streams.reads.insert(
            id,
            ReadWatcher {
                stream,
                callback: Box::new(callback),
                buffer: vec![0u8; chunk_size],
            },
        );
        Ok(id)
    }

    /// Registers write interest on a stream socket for the given payload. The progress callback fires after every
    /// successful partial write; the watcher is removed once the whole payload is on the wire.
    pub fn on_writable<F>(&mut self, stream: Socket, data: Vec<u8>, callback: F) -> Result<OpId, Fail>
    where
        F: FnMut(usize, usize) -> Result<(), Fail> + 'static,
    {
        validate_stream(&stream)?;
        configure_stream(&stream, self.profile.io_buffer_size)?;
        let id: OpId = self.issue_id();
        trace!("on_writable(): id={:?} total={:?}", id, data.len());
        self.streams.writes.insert(
            id,
            WriteWatcher {
                stream,
                data,
                written: 0,
                callback: Box::new(callback),
            },
        );
        Ok(id)
    }

    /// Spawns a coroutine that reads a file in fixed-size chunks, invoking the callback for each non-empty chunk and
    /// yielding between reads. Setup failures (missing, unreadable, or unopenable path) are recorded asynchronously in
    /// the error log keyed by the returned task identifier. The file handle closes on every exit path.
    pub fn on_read_file<F>(&mut self, path: &str, callback: F, chunk_size: Option<usize>) -> OpId
    where
        F: FnMut(&[u8]) -> Result<(), Fail> + 'static,
    {
        let chunk_size: usize = chunk_size.unwrap_or(self.profile.io_buffer_size).max(1);
        let path: String = path.to_string();
        let reactor: SharedReactor = self.clone();
        self.spawn(move |task_id| {
            Box::pin(::futures::FutureExt::fuse(read_file_coroutine(
                reactor,
                task_id,
                path,
                chunk_size,
                Box::new(callback),
            )))
        })
    }

    /// Accepts as many pending connections per watcher as the profile allows, so one busy listener cannot starve the
    /// rest of the scan.
    pub(crate) fn run_accept_phase(&mut self) -> bool {
        let max_accepts: usize = self.profile.max_accepts_per_iteration;
        let buffer_size: usize = self.profile.io_buffer_size;
        let ids: Vec<OpId> = self.streams.accept_ids();
        let mut did_work: bool = false;
        for id in ids {
            if self.is_cancelled(id) {
                self.streams.accepts.remove(&id);
                continue;
            }
            let mut watcher: AcceptWatcher = match self.streams.accepts.remove(&id) {
                Some(watcher) => watcher,
                None => continue,
            };
            let mut keep: bool = true;
            for _ in 0..max_accepts {
                match watcher.server.accept() {
                    Ok((client, _addr)) => {
                        did_work = true;
                        if let Err(e) = configure_stream(&client, buffer_size) {
                            warn!("run_accept_phase(): dropping misconfigured client (id={:?})", id);
                            self.record_error(id, e);
                            continue;
                        }
                        if let Err(e) = (watcher.callback)(client) {
                            self.record_error(id, e);
                            keep = false;
                            break;
                        }
                    },
                    Err(ref e) if is_retryable(e) => break,
                    Err(e) => {
                        error!("run_accept_phase(): accept failed (id={:?}, error={:?})", id, e);
                        did_work = true;
                        self.record_error(id, Fail::from(e));
                        keep = false;
                        break;
                    },
                }
            }
            if keep && !self.is_cancelled(id) {
                self.streams.accepts.insert(id, watcher);
            }
        }
        did_work
    }

    /// One non-blocking read attempt per watcher. An empty read at end-of-stream delivers a terminal empty payload and
    /// removes the watcher.
    pub(crate) fn run_read_phase(&mut self) -> bool {
        let ids: Vec<OpId> = self.streams.read_ids();
        let mut did_work: bool = false;
        for id in ids {
            if self.is_cancelled(id) {
                self.streams.reads.remove(&id);
                continue;
            }
            let mut watcher: ReadWatcher = match self.streams.reads.remove(&id) {
                Some(watcher) => watcher,
                None => continue,
            };
            let buffer: &mut [MaybeUninit<u8>] = unsafe {
                slice::from_raw_parts_mut(watcher.buffer.as_mut_ptr() as *mut MaybeUninit<u8>, watcher.buffer.len())
            };
            match watcher.stream.recv(buffer) {
                Ok(0) => {
                    trace!("run_read_phase(): end of stream (id={:?})", id);
                    did_work = true;
                    if let Err(e) = (watcher.callback)(&[]) {
                        self.record_error(id, e);
                    }
                },
                Ok(nbytes) => {
                    did_work = true;
                    if let Err(e) = (watcher.callback)(&watcher.buffer[..nbytes]) {
                        self.record_error(id, e);
                    } else if !self.is_cancelled(id) {
                        self.streams.reads.insert(id, watcher);
                    }
                },
                Err(ref e) if is_retryable(e) => {
                    if !self.is_cancelled(id) {
                        self.streams.reads.insert(id, watcher);
                    }
                },
                Err(e) => {
                    error!("run_read_phase(): read failed (id={:?}, error={:?})", id, e);
                    did_work = true;
                    self.record_error(id, Fail::from(e));
                },
            }
        }
        did_work
    }

    /// One non-blocking write attempt per watcher, bounded by the profile's buffer size. The watcher is removed once
    /// the whole payload has been written.
    pub(crate) fn run_write_phase(&mut self) -> bool {
        let buffer_size: usize = self.profile.io_buffer_size;
        let ids: Vec<OpId> = self.streams.write_ids();
        let mut did_work: bool = false;
        for id in ids {
            if self.is_cancelled(id) {
                self.streams.writes.remove(&id);
                continue;
            }
            let mut watcher: WriteWatcher = match self.streams.writes.remove(&id) {
                Some(watcher) => watcher,
                None => continue,
            };
            let total: usize = watcher.data.len();
            if watcher.written >= total {
                trace!("run_write_phase(): nothing left to write (id={:?})", id);
                did_work = true;
                continue;
            }
            let end: usize = total.min(watcher.written + buffer_size);
            match watcher.stream.send(&watcher.data[watcher.written..end]) {
                Ok(0) => {
                    if !self.is_cancelled(id) {
                        self.streams.writes.insert(id, watcher);
                    }
                },
                Ok(nbytes) => {
                    did_work = true;
                    watcher.written += nbytes;
                    trace!(
                        "run_write_phase(): data pushed (id={:?}, {:?}/{:?} bytes)",
                        id,
                        watcher.written,
                        total
                    );
                    if let Err(e) = (watcher.callback)(watcher.written, total) {
                        self.record_error(id, e);
                    } else if watcher.written < total && !self.is_cancelled(id) {
                        self.streams.writes.insert(id, watcher);
                    }
                },
                Err(ref e) if is_retryable(e) => {
                    if !self.is_cancelled(id) {
                        self.streams.writes.insert(id, watcher);
                    }
                },
                Err(e) => {
                    error!("run_write_phase(): write failed (id={:?}, error={:?})", id, e);
                    did_work = true;
                    self.record_error(id, Fail::from(e));
                },
            }
        }
        did_work
    }
}

//======================================================================================================================
// Coroutines
//======================================================================================================================

/// Body of the chunked file-read task. Validates the path, then loops reading fixed-size chunks, yielding between
/// reads and honoring cancellation between chunks.
async fn read_file_coroutine(
    reactor: SharedReactor,
    task_id: OpId,
    path: String,
    chunk_size: usize,
    mut callback: ReadCallback,
) -> Result<(), Fail> {
    let metadata = match ::std::fs::metadata(&path) {
        Ok(metadata) => metadata,
        Err(_) => return Err(Fail::file_not_found(&path)),
    };
    if !metadata.is_file() {
        return Err(Fail::not_readable(&path));
    }
    let mut file: File = match File::open(&path) {
        Ok(file) => file,
        Err(e) => {
            return Err(match e.kind() {
                io::ErrorKind::NotFound => Fail::file_not_found(&path),
                io::ErrorKind::PermissionDenied => Fail::not_readable(&path),
                _ => Fail::open_failed(&path),
            })
        },
    };

    let yielder: Yielder = Yielder::new();
    let mut buffer: Vec<u8> = vec![0u8; chunk_size];
    loop {
        if reactor.is_cancelled(task_id) {
            trace!("read_file_coroutine(): cancelled (id={:?})", task_id);
            break;
        }
        let nbytes: usize = read_file_chunk(&mut file, &mut buffer, &path)?;
        if nbytes == 0 {
            break;
        }
        callback(&buffer[..nbytes])?;
        yielder.yield_once().await?;
    }
    Ok(())
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use crate::{
        reactor::SharedReactor,
        registry::OpId,
    };
    use ::anyhow::Result;
    use ::libc::{
        EBADF,
        ENOENT,
    };
    use ::socket2::{
        Domain,
        Socket,
        Type,
    };
    use ::std::{
        cell::RefCell,
        fs,
        io::Write,
        net::{
            TcpListener,
            TcpStream,
        },
        rc::Rc,
    };

    fn scratch_file(name: &str, contents: &[u8]) -> Result<String> {
        let path: std::path::PathBuf = std::env::temp_dir().join(format!("fiberloop-test-{}-{}", std::process::id(), name));
        fs::write(&path, contents)?;
        Ok(path.to_string_lossy().to_string())
    }

    #[test]
    fn listen_rejects_non_stream_sockets() -> Result<()> {
        let mut reactor: SharedReactor = SharedReactor::new();
        let datagram: Socket = Socket::new(Domain::IPV4, Type::DGRAM, None)?;
        match reactor.listen(datagram, |_client| Ok(())) {
            Err(e) => crate::ensure_eq!(e.errno, EBADF),
            Ok(_) => anyhow::bail!("datagram socket must be rejected"),
        }
        Ok(())
    }

    #[test]
    fn on_read_file_reproduces_file_contents() -> Result<()> {
        let contents: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
        let path: String = scratch_file("roundtrip", &contents)?;

        for chunk_size in [1usize, 7, 512, 8192] {
            let mut reactor: SharedReactor = SharedReactor::new();
            let collected: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(vec![]));
            let collected_ref: Rc<RefCell<Vec<u8>>> = collected.clone();
            reactor.on_read_file(
                &path,
                move |chunk| {
                    collected_ref.borrow_mut().extend_from_slice(chunk);
                    Ok(())
                },
                Some(chunk_size),
            );
            reactor.run();

            crate::ensure_eq!(reactor.get_errors().is_empty(), true);
            crate::ensure_eq!(*collected.borrow() == contents, true);
        }

        fs::remove_file(&path)?;
        Ok(())
    }

    #[test]
    fn on_read_file_missing_path_is_recorded_asynchronously() -> Result<()> {
        let mut reactor: SharedReactor = SharedReactor::new();
        let invoked: Rc<RefCell<bool>> = Rc::new(RefCell::new(false));
        let invoked_ref: Rc<RefCell<bool>> = invoked.clone();
        let id: OpId = reactor.on_read_file(
            "/nonexistent/fiberloop-test-file",
            move |_chunk| {
                *invoked_ref.borrow_mut() = true;
                Ok(())
            },
            None,
        );
        reactor.run();

        crate::ensure_eq!(*invoked.borrow(), false);
        let errors = reactor.get_errors();
        crate::ensure_eq!(errors.len(), 1);
        crate::ensure_eq!(errors.contains_key(&id), true);

        // The raw failure must carry the file-not-found errno.
        crate::ensure_eq!(reactor.last_errno(id), Some(ENOENT));
        Ok(())
    }

    #[test]
    fn cancelled_file_read_stops_between_chunks() -> Result<()> {
        let contents: Vec<u8> = vec![42u8; 4096];
        let path: String = scratch_file("cancel", &contents)?;

        let mut reactor: SharedReactor = SharedReactor::new();
        let chunks: Rc<RefCell<usize>> = Rc::new(RefCell::new(0));

        let chunks_ref: Rc<RefCell<usize>> = chunks.clone();
        let mut reactor_ref: SharedReactor = reactor.clone();
        let id_slot: Rc<RefCell<Option<OpId>>> = Rc::new(RefCell::new(None));
        let id_slot_ref: Rc<RefCell<Option<OpId>>> = id_slot.clone();
        let id: OpId = reactor.on_read_file(
            &path,
            move |_chunk| {
                *chunks_ref.borrow_mut() += 1;
                let id: OpId = id_slot_ref.borrow().expect("id was stored before run");
                reactor_ref.cancel(id);
                Ok(())
            },
            Some(64),
        );
        *id_slot.borrow_mut() = Some(id);
        reactor.run();

        // The first chunk cancels the task, so no further chunks are delivered.
        crate::ensure_eq!(*chunks.borrow(), 1);
        fs::remove_file(&path)?;
        Ok(())
    }

    #[test]
    fn watchers_cancelled_before_the_loop_never_fire() -> Result<()> {
        // A connected pair with bytes already pending for the read watcher.
        let listener: TcpListener = TcpListener::bind("127.0.0.1:0")?;
        let mut client: TcpStream = TcpStream::connect(listener.local_addr()?)?;
        client.write_all(b"pending bytes")?;
        let (server, _) = listener.accept()?;

        // A second listener with a connection queued in its backlog for the accept watcher.
        let backlog_listener: TcpListener = TcpListener::bind("127.0.0.1:0")?;
        let _queued: TcpStream = TcpStream::connect(backlog_listener.local_addr()?)?;

        let mut reactor: SharedReactor = SharedReactor::new();
        let fired: Rc<RefCell<u32>> = Rc::new(RefCell::new(0));

        let fired_accept: Rc<RefCell<u32>> = fired.clone();
        let accept_id: OpId = reactor.listen(Socket::from(backlog_listener), move |_client| {
            *fired_accept.borrow_mut() += 1;
            Ok(())
        })?;
        let fired_read: Rc<RefCell<u32>> = fired.clone();
        let read_id: OpId = reactor.on_readable(
            Socket::from(server),
            move |_chunk| {
                *fired_read.borrow_mut() += 1;
                Ok(())
            },
            None,
        )?;
        let fired_write: Rc<RefCell<u32>> = fired.clone();
        let write_id: OpId = reactor.on_writable(Socket::from(client), b"reply".to_vec(), move |_written, _total| {
            *fired_write.borrow_mut() += 1;
            Ok(())
        })?;
        crate::ensure_eq!(reactor.has_work(), true);

        reactor.cancel(accept_id);
        reactor.cancel(read_id);
        reactor.cancel(write_id);

        // Cancellation removed all three watchers, so the loop has nothing to scan.
        crate::ensure_eq!(reactor.has_work(), false);
        reactor.run();

        crate::ensure_eq!(*fired.borrow(), 0);
        crate::ensure_eq!(reactor.get_errors().is_empty(), true);
        Ok(())
    }
}
