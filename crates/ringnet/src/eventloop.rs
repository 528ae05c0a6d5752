//! Event loop: accept connections and hand them to the rings
//!
//! ```ignore
//! let manager = RingManager::from_env()?;
//! let evl = EventLoop::new(manager, |conn: &Connection| {
//!     let line = conn.read_until(b'\n')?;
//!     conn.write_bytes(&line)?;
//!     conn.flush()
//! }, [with_read_timeout(Duration::from_secs(30))]);
//! evl.serve(create_listener("tcp", "0.0.0.0:7000")?)?;
//! ```

use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use ringnet_core::{Error, Result};
use ringnet_ring::RingManager;

use crate::connection::Connection;
use crate::net::Listener;
use crate::options::{LoopOption, OnRequest, Options};

/// Pause after a failed accept before trying again
const ACCEPT_RETRY: Duration = Duration::from_millis(10);

/// How often shutdown re-closes live connections and checks for drain
const SHUTDOWN_POLL: Duration = Duration::from_millis(10);

pub struct EventLoop {
    inner: Arc<Inner>,
}

struct Inner {
    manager: Arc<RingManager>,
    on_request: OnRequest,
    options: Options,
    connections: DashMap<String, Connection>,
    listener: Mutex<Option<Arc<Listener>>>,
    quit: AtomicBool,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
}

impl EventLoop {
    pub fn new<F, I>(manager: Arc<RingManager>, on_request: F, opts: I) -> EventLoop
    where
        F: Fn(&Connection) -> Result<()> + Send + Sync + 'static,
        I: IntoIterator<Item = LoopOption>,
    {
        EventLoop {
            inner: Arc::new(Inner {
                manager,
                on_request: Arc::new(on_request),
                options: Options::new(opts),
                connections: DashMap::new(),
                listener: Mutex::new(None),
                quit: AtomicBool::new(false),
                accept_thread: Mutex::new(None),
            }),
        }
    }

    /// Accept on `listener` until shutdown. Blocks.
    pub fn serve(&self, listener: Listener) -> Result<()> {
        let listener = self.inner.install(listener)?;
        self.inner.accept_loop(&listener);
        Ok(())
    }

    /// Run the accept loop on a background thread
    pub fn serve_non_blocking(&self, listener: Listener) -> Result<()> {
        let listener = self.inner.install(listener)?;
        let inner = Arc::clone(&self.inner);
        let handle = thread::Builder::new()
            .name("ringnet-accept".into())
            .spawn(move || inner.accept_loop(&listener))?;
        *self.inner.accept_thread.lock() = Some(handle);
        Ok(())
    }

    /// Address of the listener being served
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.listener.lock().as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Connections accepted and not yet torn down
    pub fn running_connections(&self) -> usize {
        self.inner.connections.len()
    }

    /// Resize the ring set connections are spread over
    pub fn set_num_loops(&self, num_loops: usize) -> Result<()> {
        self.inner.manager.resize(num_loops)
    }

    /// Stop accepting and close every connection, waiting as long as it
    /// takes for their output to drain
    pub fn shutdown(&self) -> Result<()> {
        self.inner.shutdown(None)
    }

    /// Like `shutdown`, but gives up with `DeadlineExceeded` at `deadline`.
    /// Connections still draining then keep draining in the background.
    pub fn shutdown_with_deadline(&self, deadline: Instant) -> Result<()> {
        self.inner.shutdown(Some(deadline))
    }

    pub fn shutdown_timeout(&self, timeout: Duration) -> Result<()> {
        self.shutdown_with_deadline(Instant::now() + timeout)
    }
}

impl Inner {
    fn install(&self, listener: Listener) -> Result<Arc<Listener>> {
        let listener = Arc::new(listener);
        *self.listener.lock() = Some(Arc::clone(&listener));
        // shutdown may have come first
        if self.quit.load(Ordering::SeqCst) {
            listener.shutdown()?;
        }
        info!(addr = ?listener.local_addr().ok(), "eventloop: serving");
        Ok(listener)
    }

    fn accept_loop(self: &Arc<Self>, listener: &Listener) {
        while !self.quit.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok((stream, peer)) => {
                    if self.quit.load(Ordering::SeqCst) {
                        break;
                    }
                    self.accept_one(stream, peer);
                }
                Err(e) => {
                    if self.quit.load(Ordering::SeqCst) {
                        break;
                    }
                    warn!(error = %e, "eventloop: accept failed");
                    thread::sleep(ACCEPT_RETRY);
                }
            }
        }
        debug!("eventloop: accept loop stopped");
    }

    fn accept_one(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let on_request = Some(Arc::clone(&self.on_request));
        let conn = match Connection::open(stream, &self.manager, on_request, &self.options) {
            Ok(conn) => conn,
            Err(e) => {
                warn!(%peer, error = %e, "eventloop: cannot open connection");
                return;
            }
        };

        let key = conn.id().to_string();
        self.connections.insert(key.clone(), conn.clone());
        let me: Weak<Inner> = Arc::downgrade(self);
        let untracked = conn.add_close_callback(move |_| {
            if let Some(inner) = me.upgrade() {
                inner.connections.remove(&key);
            }
            Ok(())
        });
        if let Err(e) = untracked {
            warn!(conn = conn.id(), error = %e, "eventloop: close callback failed");
        }
    }

    fn live(&self) -> Vec<Connection> {
        self.connections.iter().map(|entry| entry.value().clone()).collect()
    }

    fn shutdown(&self, deadline: Option<Instant>) -> Result<()> {
        if !self.quit.swap(true, Ordering::SeqCst) {
            info!(connections = self.connections.len(), "eventloop: shutting down");
        }
        let listener = self.listener.lock().clone();
        if let Some(listener) = listener {
            listener.shutdown()?;
        }

        loop {
            // close outside the map: teardown removes entries
            let live = self.live();
            if live.is_empty() {
                break;
            }
            for conn in &live {
                conn.shared.close_async();
            }
            let now = Instant::now();
            let pause = match deadline {
                Some(at) if now >= at => {
                    warn!(remaining = live.len(), "eventloop: shutdown deadline exceeded");
                    return Err(Error::DeadlineExceeded);
                }
                Some(at) => SHUTDOWN_POLL.min(at - now),
                None => SHUTDOWN_POLL,
            };
            thread::sleep(pause);
        }

        let accept = self.accept_thread.lock().take();
        if let Some(handle) = accept {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
        info!("eventloop: shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::create_listener;
    use crate::options::{with_on_connect, with_read_timeout};
    use ringnet_core::CloseOwner;
    use ringnet_ring::RingConfig;
    use std::io::{Read, Write};
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    /// io_uring may be disabled in the sandbox; tests skip then
    fn try_manager(num_loops: usize) -> Option<Arc<RingManager>> {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
        match RingManager::new(num_loops, RingConfig::from_env().sq_entries(256)) {
            Ok(m) => Some(m),
            Err(e) => {
                eprintln!("skipping: io_uring unavailable ({})", e);
                None
            }
        }
    }

    fn start<F>(on_request: F) -> Option<(EventLoop, SocketAddr, Arc<RingManager>)>
    where
        F: Fn(&Connection) -> Result<()> + Send + Sync + 'static,
    {
        start_with(2, on_request, [])
    }

    fn start_with<F, I>(
        num_loops: usize,
        on_request: F,
        opts: I,
    ) -> Option<(EventLoop, SocketAddr, Arc<RingManager>)>
    where
        F: Fn(&Connection) -> Result<()> + Send + Sync + 'static,
        I: IntoIterator<Item = LoopOption>,
    {
        let manager = try_manager(num_loops)?;
        let opts = std::iter::once(with_read_timeout(Duration::from_secs(10))).chain(opts);
        let evl = EventLoop::new(Arc::clone(&manager), on_request, opts);
        let listener = create_listener("tcp", "127.0.0.1:0").unwrap();
        evl.serve_non_blocking(listener).unwrap();
        let addr = evl.local_addr().unwrap();
        Some((evl, addr, manager))
    }

    fn connect(addr: SocketAddr) -> TcpStream {
        let stream = TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
        stream
    }

    fn echo_line(conn: &Connection) -> Result<()> {
        let line = conn.read_until(b'\n')?;
        conn.write_bytes(&line)?;
        conn.flush()
    }

    fn wait_drained(evl: &EventLoop) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while evl.running_connections() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_echo_hello() {
        let Some((evl, addr, manager)) = start(echo_line) else { return };
        let mut client = connect(addr);
        client.write_all(b"hello\n").unwrap();
        let mut got = [0u8; 6];
        client.read_exact(&mut got).unwrap();
        assert_eq!(&got, b"hello\n");

        drop(client);
        evl.shutdown_timeout(Duration::from_secs(10)).unwrap();
        manager.shutdown();
    }

    #[test]
    fn test_echo_thousand_messages_in_order() {
        const MESSAGES: usize = 1000;
        const LEN: usize = 48;

        let Some((evl, addr, manager)) = start(echo_line) else { return };

        let mut seed = 0x2545_f491_4f6c_dd1du64;
        let mut payload = Vec::with_capacity(MESSAGES * LEN);
        for _ in 0..MESSAGES {
            for _ in 0..LEN - 1 {
                seed ^= seed << 13;
                seed ^= seed >> 7;
                seed ^= seed << 17;
                payload.push(b'a' + (seed % 26) as u8);
            }
            payload.push(b'\n');
        }

        let client = connect(addr);
        let mut writer = client.try_clone().unwrap();
        let sent = payload.clone();
        let sender = thread::spawn(move || {
            for msg in sent.chunks(LEN) {
                writer.write_all(msg).unwrap();
            }
        });

        let mut echoed = vec![0u8; payload.len()];
        (&client).read_exact(&mut echoed).unwrap();
        sender.join().unwrap();
        assert!(echoed == payload, "echo diverged");

        drop(client);
        evl.shutdown_timeout(Duration::from_secs(10)).unwrap();
        manager.shutdown();
    }

    #[test]
    fn test_shutdown_waits_for_pending_flush() {
        let (written_tx, written_rx) = mpsc::channel::<()>();
        let written_tx = Mutex::new(written_tx);
        let Some((evl, addr, manager)) = start(move |conn| {
            conn.read_until(b'\n')?;
            conn.write_bytes(&[b'x'; 4096])?;
            let _ = written_tx.lock().send(());
            conn.flush()
        }) else {
            return;
        };

        let mut client = connect(addr);
        client.write_all(b"go\n").unwrap();
        written_rx.recv_timeout(Duration::from_secs(10)).unwrap();

        evl.shutdown_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(evl.running_connections(), 0);

        let mut got = Vec::new();
        client.read_to_end(&mut got).unwrap();
        assert_eq!(got.len(), 4096);
        assert!(got.iter().all(|&b| b == b'x'));
        manager.shutdown();
    }

    #[test]
    fn test_shutdown_deadline_against_stalled_flush() {
        const STALL: usize = 32 << 20;

        let (written_tx, written_rx) = mpsc::channel::<()>();
        let written_tx = Mutex::new(written_tx);
        let Some((evl, addr, manager)) = start(move |conn| {
            conn.read_until(b'\n')?;
            conn.write_bytes(&vec![b'y'; STALL])?;
            let _ = written_tx.lock().send(());
            conn.flush()
        }) else {
            return;
        };

        // never reads, so the send cannot finish
        let mut client = connect(addr);
        client.write_all(b"go\n").unwrap();
        written_rx.recv_timeout(Duration::from_secs(10)).unwrap();

        assert_eq!(
            evl.shutdown_timeout(Duration::from_millis(1)),
            Err(Error::DeadlineExceeded)
        );
        assert_eq!(evl.running_connections(), 1);

        drop(client);
        wait_drained(&evl);
        assert_eq!(evl.running_connections(), 0);
        manager.shutdown();
    }

    #[test]
    fn test_close_runs_callbacks_once() {
        let ran = Arc::new(AtomicUsize::new(0));
        let owner = Arc::new(Mutex::new(CloseOwner::None));
        let (counter, seen) = (Arc::clone(&ran), Arc::clone(&owner));
        let Some((evl, addr, manager)) = start(move |conn| {
            conn.read_until(b'\n')?;
            let (counter, seen) = (Arc::clone(&counter), Arc::clone(&seen));
            conn.add_close_callback(move |c| {
                counter.fetch_add(1, Ordering::SeqCst);
                *seen.lock() = c.closed_by();
                Ok(())
            })?;
            conn.close()?;
            assert!(!conn.is_active());
            Ok(())
        }) else {
            return;
        };

        let mut client = connect(addr);
        client.write_all(b"bye\n").unwrap();
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).unwrap();
        assert!(rest.is_empty());
        drop(client);

        wait_drained(&evl);
        assert_eq!(evl.running_connections(), 0);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(*owner.lock(), CloseOwner::User);

        evl.shutdown_timeout(Duration::from_secs(10)).unwrap();
        manager.shutdown();
    }

    #[test]
    fn test_peer_hangup_closes_by_ring() {
        let owner = Arc::new(Mutex::new(CloseOwner::None));
        let seen = Arc::clone(&owner);
        let Some((evl, addr, manager)) = start(move |conn| {
            let seen = Arc::clone(&seen);
            conn.add_close_callback(move |c| {
                *seen.lock() = c.closed_by();
                Ok(())
            })?;
            conn.read_all();
            Ok(())
        }) else {
            return;
        };

        let mut client = connect(addr);
        client.write_all(b"x").unwrap();
        thread::sleep(Duration::from_millis(20));
        drop(client);

        wait_drained(&evl);
        assert_eq!(evl.running_connections(), 0);
        assert_eq!(*owner.lock(), CloseOwner::Ring);

        evl.shutdown_timeout(Duration::from_secs(10)).unwrap();
        manager.shutdown();
    }

    fn roundtrip(addr: SocketAddr, line: &[u8]) -> TcpStream {
        let mut client = connect(addr);
        client.write_all(line).unwrap();
        let mut got = vec![0u8; line.len()];
        client.read_exact(&mut got).unwrap();
        assert_eq!(got, line);
        client
    }

    #[test]
    fn test_close_from_close_callback_on_hangup() {
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        // one ring: a stuck reaper would stall every later connection
        let Some((evl, addr, manager)) = start_with(
            1,
            move |conn| {
                let counter = Arc::clone(&counter);
                conn.add_close_callback(move |c| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    c.close()
                })?;
                echo_line(conn)
            },
            [],
        ) else {
            return;
        };

        let first = roundtrip(addr, b"x\n");
        // let the handler return so the hang-up runs the callbacks inline
        thread::sleep(Duration::from_millis(20));
        drop(first);

        let second = roundtrip(addr, b"hello\n");
        drop(second);

        wait_drained(&evl);
        assert_eq!(evl.running_connections(), 0);
        assert_eq!(ran.load(Ordering::SeqCst), 2);

        evl.shutdown_timeout(Duration::from_secs(10)).unwrap();
        manager.shutdown();
    }

    #[test]
    fn test_close_other_connection_from_close_callback() {
        const STALL: usize = 32 << 20;

        let stalled: Arc<Mutex<Option<Connection>>> = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&stalled);
        let (written_tx, written_rx) = mpsc::channel::<()>();
        let written_tx = Mutex::new(written_tx);
        let Some((evl, addr, manager)) = start_with(
            1,
            move |conn| {
                let line = conn.read_until(b'\n')?;
                match line.as_slice() {
                    b"stall\n" => {
                        *slot.lock() = Some(conn.clone());
                        conn.write_bytes(&vec![b'z'; STALL])?;
                        let _ = written_tx.lock().send(());
                        conn.flush()
                    }
                    b"pair\n" => {
                        let slot = Arc::clone(&slot);
                        conn.add_close_callback(move |_| match slot.lock().take() {
                            Some(other) => other.close(),
                            None => Ok(()),
                        })?;
                        conn.write_bytes(&line)?;
                        conn.flush()
                    }
                    _ => {
                        conn.write_bytes(&line)?;
                        conn.flush()
                    }
                }
            },
            [],
        ) else {
            return;
        };

        // never reads, so its output stays pending on the ring
        let mut slow = connect(addr);
        slow.write_all(b"stall\n").unwrap();
        written_rx.recv_timeout(Duration::from_secs(10)).unwrap();

        let pair = roundtrip(addr, b"pair\n");
        thread::sleep(Duration::from_millis(20));
        drop(pair);

        let third = roundtrip(addr, b"hello\n");
        drop(third);
        assert!(stalled.lock().is_none());

        drop(slow);
        wait_drained(&evl);
        assert_eq!(evl.running_connections(), 0);

        evl.shutdown_timeout(Duration::from_secs(10)).unwrap();
        manager.shutdown();
    }

    #[test]
    fn test_close_racing_hangup_runs_callbacks_once() {
        const ROUNDS: usize = 50;

        let runs: Arc<Mutex<Vec<(String, CloseOwner)>>> = Arc::new(Mutex::new(Vec::new()));
        let record = Arc::clone(&runs);
        let Some((evl, addr, manager)) = start_with(
            2,
            |conn| {
                let _ = conn.read_until(b'\n');
                conn.close()
            },
            [with_on_connect(move |conn| {
                let record = Arc::clone(&record);
                let registered = conn.add_close_callback(move |c| {
                    record.lock().push((c.id().to_string(), c.closed_by()));
                    Ok(())
                });
                assert!(registered.is_ok());
            })],
        ) else {
            return;
        };

        for _ in 0..ROUNDS {
            let mut client = connect(addr);
            client.write_all(b"go\n").unwrap();
            drop(client);
        }

        let deadline = Instant::now() + Duration::from_secs(10);
        while runs.lock().len() < ROUNDS && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        wait_drained(&evl);
        assert_eq!(evl.running_connections(), 0);

        let runs = runs.lock();
        assert_eq!(runs.len(), ROUNDS);
        let mut ids: Vec<&str> = runs.iter().map(|(id, _)| id.as_str()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), ROUNDS, "a close callback ran twice");
        for (id, owner) in runs.iter() {
            assert!(
                matches!(owner, CloseOwner::User | CloseOwner::Ring),
                "{} closed by {:?}",
                id,
                owner
            );
        }
        drop(runs);

        evl.shutdown_timeout(Duration::from_secs(10)).unwrap();
        manager.shutdown();
    }

    #[test]
    fn test_set_num_loops() {
        let Some((evl, _addr, manager)) = start(echo_line) else { return };
        assert_eq!(evl.set_num_loops(0), Err(Error::InvalidNumLoops(0)));
        evl.set_num_loops(3).unwrap();
        assert_eq!(manager.num_loops(), 3);
        evl.set_num_loops(1).unwrap();
        assert_eq!(manager.num_loops(), 1);
        evl.shutdown().unwrap();
        manager.shutdown();
    }
}
