//! Connection: buffers, state and the blocking bridge
//!
//! A [`Connection`] is a cheap handle over shared per-socket state. The
//! ring's reaping thread fills the input buffer and drains the output
//! buffer through completions (see `reactor`); user code on the
//! processing thread reads and writes the buffers directly and blocks on
//! triggers when it needs more than is there.
//!
//! ```text
//!  kernel ──recv──► input ──read_*()──► on_request ──write_*()──► output ──send──► kernel
//!                     ▲ read_trigger                     flush() ▲ write_trigger
//! ```

use std::fmt;
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use tracing::debug;

use ringnet_core::{Buffer, CloseOwner, Error, Keychain, Result, Trigger, Wake};
use ringnet_ring::{on_ring_thread, Operator, OperatorHandler, RingManager};

use crate::callback::{CallbackChain, CloseCallback};
use crate::options::{non_zero, OnConnect, OnRequest, Options};

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

/// Non-blocking and blocking reads over the input buffer
pub trait Reader {
    /// Copy of the next `n` unread bytes, not consumed
    fn seek(&self, n: usize) -> Result<Vec<u8>>;
    /// Consume `n` bytes previously seen with `seek`
    fn seek_ack(&self, n: usize) -> Result<()>;
    fn seek_all(&self) -> Vec<u8>;
    fn read_all(&self) -> Vec<u8>;
    /// Block until `delim` arrives; the result includes it
    fn read_until(&self, delim: u8) -> Result<Vec<u8>>;
    /// Block until `n` bytes are available
    fn read_bytes(&self, n: usize) -> Result<Vec<u8>>;
    fn read_string(&self, n: usize) -> Result<String>;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// Compact consumed space
    fn release(&self);
}

/// Buffered writes, sent on `flush`
pub trait Writer {
    /// Writable region of exactly `n` bytes; commit with `book_ack`
    fn book(&self, n: usize) -> Result<MappedMutexGuard<'_, [u8]>>;
    fn book_ack(&self, n: usize) -> Result<()>;
    fn write_bytes(&self, src: &[u8]) -> Result<()>;
    fn write_string(&self, src: &str) -> Result<()>;
    /// Block until everything buffered so far is sent
    fn flush(&self) -> Result<()>;
}

/// Result of one check of the input buffer
pub(crate) enum Take<T> {
    Ready(Result<T>),
    /// Wake me when at least this many bytes are buffered
    Need(usize),
}

pub(crate) struct Shared {
    pub(crate) id: String,
    pub(crate) fd: RawFd,
    stream: Mutex<Option<TcpStream>>,
    peer: Option<SocketAddr>,
    local: Option<SocketAddr>,

    pub(crate) op: Arc<Operator>,
    pub(crate) input: Mutex<Buffer>,
    pub(crate) output: Mutex<Buffer>,
    pub(crate) keys: Keychain,
    pub(crate) read_size: usize,
    /// Bytes a blocked reader waits for; zero when nobody waits
    pub(crate) wait_read_size: AtomicUsize,
    read_timeout: Mutex<Option<Duration>>,
    write_timeout: Mutex<Option<Duration>>,

    pub(crate) read_trigger: Trigger,
    pub(crate) write_trigger: Trigger,
    /// Fired terminal once teardown is done
    pub(crate) closed: Trigger,

    pub(crate) callbacks: CallbackChain,
    pub(crate) on_request: Option<OnRequest>,
    pub(crate) on_connect: Option<OnConnect>,

    /// Ring requests this connection issued and has not finished handling
    pub(crate) inflight: AtomicUsize,
    pub(crate) torn_down: AtomicBool,
    pub(crate) finalized: AtomicBool,
    pub(crate) me: Weak<Shared>,
}

/// One accepted TCP connection
#[derive(Clone)]
pub struct Connection {
    pub(crate) shared: Arc<Shared>,
}

impl Connection {
    /// Bind `stream` to the next ring and start receiving
    pub(crate) fn open(
        stream: TcpStream,
        manager: &RingManager,
        on_request: Option<OnRequest>,
        options: &Options,
    ) -> Result<Connection> {
        let ring = manager.pick()?;
        let op = ring.alloc()?;
        let fd = stream.as_raw_fd();
        op.set_fd(fd);

        let serial = NEXT_SERIAL.fetch_add(1, Ordering::Relaxed);
        let peer = stream.peer_addr().ok();
        let local = stream.local_addr().ok();
        let shared = Arc::new_cyclic(|me| Shared {
            id: format!("{:08x}", serial),
            fd,
            stream: Mutex::new(Some(stream)),
            peer,
            local,
            op: Arc::clone(&op),
            input: Mutex::new(Buffer::new(options.buffer_size)),
            output: Mutex::new(Buffer::new(options.buffer_size)),
            keys: Keychain::new(),
            read_size: options.read_size,
            wait_read_size: AtomicUsize::new(0),
            read_timeout: Mutex::new(options.read_timeout),
            write_timeout: Mutex::new(options.write_timeout),
            read_trigger: Trigger::new(),
            write_trigger: Trigger::new(),
            closed: Trigger::new(),
            callbacks: CallbackChain::new(),
            on_request,
            on_connect: options.on_connect.clone(),
            inflight: AtomicUsize::new(0),
            torn_down: AtomicBool::new(false),
            finalized: AtomicBool::new(false),
            me: me.clone(),
        });

        op.set_handler(Arc::clone(&shared) as Arc<dyn OperatorHandler>);
        if let Err(e) = op.register() {
            op.free();
            return Err(e);
        }
        debug!(conn = %shared.id, fd, ring = ring.id(), peer = ?peer, "conn: opened");

        if shared.on_connect.is_none() {
            shared.keys.try_connect();
        }
        shared.arm_read();
        if shared.on_connect.is_some() {
            shared.start_processing();
        }
        Ok(Connection { shared })
    }

    /// A connection with no socket and no ring, for unit tests
    #[cfg(test)]
    pub(crate) fn detached() -> Connection {
        let op = ringnet_ring::OperatorCache::new().alloc();
        op.set_fd(-1);
        let shared = Arc::new_cyclic(|me| Shared {
            id: "detached".to_string(),
            fd: -1,
            stream: Mutex::new(None),
            peer: None,
            local: None,
            op,
            input: Mutex::new(Buffer::new(64)),
            output: Mutex::new(Buffer::new(64)),
            keys: Keychain::new(),
            read_size: 64,
            wait_read_size: AtomicUsize::new(0),
            read_timeout: Mutex::new(None),
            write_timeout: Mutex::new(None),
            read_trigger: Trigger::new(),
            write_trigger: Trigger::new(),
            closed: Trigger::new(),
            callbacks: CallbackChain::new(),
            on_request: None,
            on_connect: None,
            inflight: AtomicUsize::new(0),
            torn_down: AtomicBool::new(false),
            finalized: AtomicBool::new(false),
            me: me.clone(),
        });
        Connection { shared }
    }

    /// Short unique id, for logs
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn reader(&self) -> &dyn Reader {
        self
    }

    pub fn writer(&self) -> &dyn Writer {
        self
    }

    /// Zero disables the timeout
    pub fn set_read_timeout(&self, timeout: Duration) {
        *self.shared.read_timeout.lock() = non_zero(timeout);
    }

    /// Zero disables the timeout
    pub fn set_write_timeout(&self, timeout: Duration) {
        *self.shared.write_timeout.lock() = non_zero(timeout);
    }

    /// Run `callback` once at teardown, before earlier-added callbacks.
    /// On an already closed connection it runs right away.
    pub fn add_close_callback<F>(&self, callback: F) -> Result<()>
    where
        F: FnOnce(&Connection) -> Result<()> + Send + 'static,
    {
        let callback: CloseCallback = Box::new(callback);
        match self.shared.callbacks.push(callback) {
            None => Ok(()),
            Some(late) => late(self),
        }
    }

    /// Send what is buffered, then tear down. Blocks until the connection
    /// is gone; with a write timeout set, gives up on the drain after it.
    ///
    /// From a close callback running on a ring thread the drain needs that
    /// very thread, so there it only starts the close.
    pub fn close(&self) -> Result<()> {
        let s = &self.shared;
        s.close_async();
        if on_ring_thread() {
            return Ok(());
        }
        let deadline = s.write_timeout.lock().map(|d| Instant::now() + d);
        if let Wake::TimedOut = s.closed.wait(deadline) {
            debug!(conn = %s.id, "conn: drain timed out, forcing close");
            s.teardown(Error::ConnectionClosed(s.keys.closed_by()));
        }
        Ok(())
    }

    /// Neither side has started closing
    pub fn is_active(&self) -> bool {
        !self.shared.keys.is_closing()
    }

    pub fn closed_by(&self) -> CloseOwner {
        self.shared.keys.closed_by()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.shared.peer
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.local
    }

    // ---- reading ----

    pub fn seek(&self, n: usize) -> Result<Vec<u8>> {
        self.shared.input.lock().seek(n).map(<[u8]>::to_vec)
    }

    pub fn seek_ack(&self, n: usize) -> Result<()> {
        self.shared.input.lock().seek_ack(n)
    }

    pub fn seek_all(&self) -> Vec<u8> {
        self.shared.input.lock().seek_all().to_vec()
    }

    pub fn read_all(&self) -> Vec<u8> {
        self.shared.input.lock().read_all()
    }

    pub fn read_until(&self, delim: u8) -> Result<Vec<u8>> {
        self.wait_input(|input| match input.find(delim) {
            Some(pos) => Take::Ready(input.read_bytes(pos + 1)),
            None => Take::Need(input.len() + 1),
        })
    }

    pub fn read_bytes(&self, n: usize) -> Result<Vec<u8>> {
        self.wait_input(|input| {
            if input.len() >= n {
                Take::Ready(input.read_bytes(n))
            } else {
                Take::Need(n)
            }
        })
    }

    /// `InvalidUtf8` leaves the bytes unread
    pub fn read_string(&self, n: usize) -> Result<String> {
        self.wait_input(|input| {
            if input.len() >= n {
                Take::Ready(input.read_string(n))
            } else {
                Take::Need(n)
            }
        })
    }

    pub fn len(&self) -> usize {
        self.shared.input.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn release(&self) {
        self.shared.input.lock().release();
    }

    /// Check the input buffer, and block on the read trigger until `take`
    /// is satisfied, the read timeout passes or the connection is gone.
    /// Input buffered before teardown can still be taken afterwards.
    fn wait_input<T>(&self, mut take: impl FnMut(&mut Buffer) -> Take<T>) -> Result<T> {
        let s = &self.shared;
        let deadline = s.read_timeout.lock().map(|d| Instant::now() + d);
        loop {
            {
                let mut input = s.input.lock();
                match take(&mut input) {
                    Take::Ready(result) => {
                        s.wait_read_size.store(0, Ordering::SeqCst);
                        return result;
                    }
                    // published under the lock the read completion takes
                    Take::Need(n) => s.wait_read_size.store(n, Ordering::SeqCst),
                }
            }

            match s.read_trigger.wait(deadline) {
                Wake::Fired => {}
                Wake::TimedOut => {
                    s.wait_read_size.store(0, Ordering::SeqCst);
                    return Err(Error::ReadTimeout);
                }
                Wake::Terminal(err) => {
                    s.wait_read_size.store(0, Ordering::SeqCst);
                    return match take(&mut s.input.lock()) {
                        Take::Ready(result) => result,
                        Take::Need(_) => Err(err),
                    };
                }
            }
        }
    }

    // ---- writing ----

    pub fn book(&self, n: usize) -> Result<MappedMutexGuard<'_, [u8]>> {
        self.shared.check_writable()?;
        MutexGuard::try_map(self.shared.output.lock(), |out| out.book(n).ok())
            .map_err(|_| Error::Outstanding)
    }

    pub fn book_ack(&self, n: usize) -> Result<()> {
        self.shared.output.lock().book_ack(n)
    }

    pub fn write_bytes(&self, src: &[u8]) -> Result<()> {
        self.shared.check_writable()?;
        self.shared.output.lock().write_bytes(src)
    }

    pub fn write_string(&self, src: &str) -> Result<()> {
        self.write_bytes(src.as_bytes())
    }

    pub fn flush(&self) -> Result<()> {
        let s = &self.shared;
        let deadline = s.write_timeout.lock().map(|d| Instant::now() + d);
        loop {
            if s.output.lock().is_empty() {
                return Ok(());
            }
            s.arm_write();
            match s.write_trigger.wait(deadline) {
                Wake::Fired => {}
                Wake::TimedOut => return Err(Error::WriteTimeout),
                Wake::Terminal(err) => {
                    return if s.output.lock().is_empty() { Ok(()) } else { Err(err) };
                }
            }
        }
    }
}

impl Shared {
    fn check_writable(&self) -> Result<()> {
        if !self.torn_down.load(Ordering::SeqCst) {
            return Ok(());
        }
        Err(self
            .closed
            .terminal()
            .unwrap_or(Error::ConnectionClosed(self.keys.closed_by())))
    }

    /// Give the socket up. The fd closes when the last handle to the
    /// stream goes away.
    pub(crate) fn drop_stream(&self) {
        drop(self.stream.lock().take());
    }
}

impl Reader for Connection {
    fn seek(&self, n: usize) -> Result<Vec<u8>> {
        Connection::seek(self, n)
    }
    fn seek_ack(&self, n: usize) -> Result<()> {
        Connection::seek_ack(self, n)
    }
    fn seek_all(&self) -> Vec<u8> {
        Connection::seek_all(self)
    }
    fn read_all(&self) -> Vec<u8> {
        Connection::read_all(self)
    }
    fn read_until(&self, delim: u8) -> Result<Vec<u8>> {
        Connection::read_until(self, delim)
    }
    fn read_bytes(&self, n: usize) -> Result<Vec<u8>> {
        Connection::read_bytes(self, n)
    }
    fn read_string(&self, n: usize) -> Result<String> {
        Connection::read_string(self, n)
    }
    fn len(&self) -> usize {
        Connection::len(self)
    }
    fn release(&self) {
        Connection::release(self)
    }
}

impl Writer for Connection {
    fn book(&self, n: usize) -> Result<MappedMutexGuard<'_, [u8]>> {
        Connection::book(self, n)
    }
    fn book_ack(&self, n: usize) -> Result<()> {
        Connection::book_ack(self, n)
    }
    fn write_bytes(&self, src: &[u8]) -> Result<()> {
        Connection::write_bytes(self, src)
    }
    fn write_string(&self, src: &str) -> Result<()> {
        Connection::write_string(self, src)
    }
    fn flush(&self) -> Result<()> {
        Connection::flush(self)
    }
}

/// Reads whatever is buffered, blocking only when nothing is. Peer EOF
/// reads as `Ok(0)`.
impl io::Read for Connection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let taken = self.wait_input(|input| {
            if input.is_empty() {
                return Take::Need(1);
            }
            let n = buf.len().min(input.len());
            if let Ok(src) = input.seek(n) {
                buf[..n].copy_from_slice(src);
            }
            Take::Ready(input.seek_ack(n).map(|()| n))
        });
        match taken {
            Ok(n) => Ok(n),
            Err(Error::EndOfStream) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }
}

impl io::Write for Connection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_bytes(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(Connection::flush(self)?)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = &self.shared;
        f.debug_struct("Connection")
            .field("id", &s.id)
            .field("fd", &s.fd)
            .field("closed_by", &s.keys.closed_by())
            .field("inflight", &s.inflight.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::thread;

    fn feed(conn: &Connection, data: &[u8]) {
        conn.shared.input.lock().write_bytes(data).unwrap();
        let wait = conn.shared.wait_read_size.load(Ordering::SeqCst);
        if wait > 0 && conn.len() >= wait {
            conn.shared.read_trigger.fire();
        }
    }

    #[test]
    fn test_seek_does_not_consume() {
        let conn = Connection::detached();
        feed(&conn, b"abcdef");
        assert_eq!(conn.seek(3).unwrap(), b"abc");
        assert_eq!(conn.len(), 6);
        conn.seek_ack(3).unwrap();
        assert_eq!(conn.seek_all(), b"def");
        assert_eq!(
            conn.seek(4),
            Err(Error::InsufficientData { requested: 4, available: 3 })
        );
        assert_eq!(conn.read_all(), b"def");
        assert!(conn.is_empty());
    }

    #[test]
    fn test_read_until_blocks_for_delimiter() {
        let conn = Connection::detached();
        feed(&conn, b"hel");
        let reader = {
            let conn = conn.clone();
            thread::spawn(move || conn.read_until(b'\n'))
        };
        thread::sleep(Duration::from_millis(10));
        feed(&conn, b"lo\nrest");
        assert_eq!(reader.join().unwrap().unwrap(), b"hello\n");
        assert_eq!(conn.seek_all(), b"rest");
    }

    #[test]
    fn test_read_timeout_keeps_buffer() {
        let conn = Connection::detached();
        conn.set_read_timeout(Duration::from_millis(5));
        feed(&conn, b"ab");
        assert_eq!(conn.read_bytes(3), Err(Error::ReadTimeout));
        assert_eq!(conn.len(), 2);
        feed(&conn, b"c");
        assert_eq!(conn.read_string(3).unwrap(), "abc");
    }

    #[test]
    fn test_buffered_input_survives_close() {
        let conn = Connection::detached();
        feed(&conn, b"tail");
        conn.shared.read_trigger.fire_terminal(Error::EndOfStream);
        assert_eq!(conn.read_bytes(2).unwrap(), b"ta");
        assert_eq!(conn.read_bytes(3), Err(Error::EndOfStream));

        let mut rest = Vec::new();
        let mut handle = conn.clone();
        handle.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, b"il");
    }

    #[test]
    fn test_book_then_ack() {
        let conn = Connection::detached();
        {
            let mut region = conn.book(5).unwrap();
            region.copy_from_slice(b"hello");
        }
        conn.book_ack(5).unwrap();
        conn.write_string(" world").unwrap();
        assert_eq!(conn.shared.output.lock().seek_all(), b"hello world");
    }

    #[test]
    fn test_flush_empty_output_is_immediate() {
        let conn = Connection::detached();
        conn.flush().unwrap();
    }

    #[test]
    fn test_late_close_callback_runs_at_once() {
        let conn = Connection::detached();
        conn.shared.callbacks.run(&conn).unwrap();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        conn.add_close_callback(move |_| {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
        assert!(ran.load(Ordering::SeqCst));
    }
}
