//! Ring: one io_uring instance, its operator registry and its two threads
//!
//! ```text
//!  callers ──submit()──► SegQueue ──► submission thread ──► SQ ──► kernel
//!                                     (batch, reclaim)              │
//!  handlers ◄── dispatch ◄── reaping thread ◄── CQ ◄────────────────┘
//! ```
//!
//! Only the submission thread touches the SQ and only the reaping thread
//! touches the CQ, so both use the io-uring crate's shared accessors
//! without further locking.
//!
//! # Shutdown
//!
//! `close()` is graceful: the ring stops accepting registrations, keeps
//! serving the operators it has, and once the registry drains the
//! submission thread posts a NOP tagged [`WAKE_USER_DATA`]. The reaper
//! exits when it sees that tag.
//!
//! A failing `io_uring_enter` is fatal: every registered operator gets
//! `Error::RingFatal` for its outstanding requests and the failure hook
//! (installed by the manager) removes the ring from rotation.

use std::cell::Cell;
use std::fmt;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, Thread};
use std::time::{Duration, Instant};

use crossbeam_queue::SegQueue;
use dashmap::DashMap;
use io_uring::{opcode, types, IoUring};
use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use ringnet_core::{Error, Result};

use crate::config::RingConfig;
use crate::event::{decode_user_data, encode_user_data, RingEvent, RingRequest, WAKE_USER_DATA};
use crate::operator::Operator;
use crate::operator_cache::OperatorCache;

/// `IORING_ENTER_GETEVENTS`
const IORING_ENTER_GETEVENTS: u32 = 1;

/// Submission thread sleep when there is nothing to do; every state
/// change that needs it awake unparks it
const IDLE_PARK: Duration = Duration::from_millis(10);

/// Called with the ring id when the ring fails
pub type FailureHook = Box<dyn FnOnce(usize) + Send>;

thread_local! {
    static RING_THREAD: Cell<bool> = const { Cell::new(false) };
}

/// True on a ring's submission or reaping thread. Handlers run there and
/// must not block on anything only a ring thread can complete.
pub fn on_ring_thread() -> bool {
    RING_THREAD.with(Cell::get)
}

fn mark_ring_thread() {
    RING_THREAD.with(|flag| flag.set(true));
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RingState {
    /// Accepting registrations
    Running = 0,
    /// Serving existing operators until the registry drains
    Closing = 1,
    /// `io_uring_enter` failed; nothing more is served
    Failed = 2,
    /// Reaper exited after a graceful close
    Closed = 3,
}

impl From<u8> for RingState {
    fn from(v: u8) -> Self {
        match v {
            0 => RingState::Running,
            1 => RingState::Closing,
            2 => RingState::Failed,
            _ => RingState::Closed,
        }
    }
}

/// A request waiting for the submission thread
struct Submission {
    op: Arc<Operator>,
    event: RingEvent,
}

pub struct Ring {
    id: usize,
    uring: IoUring,
    config: RingConfig,
    registry: DashMap<RawFd, Arc<Operator>>,
    queue: SegQueue<Submission>,
    cache: OperatorCache,
    state: AtomicU8,
    submitter: Mutex<Option<Thread>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    on_failure: Mutex<Option<FailureHook>>,
}

impl Ring {
    /// Create the io_uring instance and start both threads
    pub fn open(id: usize, config: RingConfig) -> Result<Arc<Ring>> {
        if let Err(reason) = config.validate() {
            warn!(ring = id, reason, "ring: invalid config");
            return Err(Error::Os(libc::EINVAL));
        }

        let uring = IoUring::builder().build(config.sq_entries)?;

        let ring = Arc::new(Ring {
            id,
            uring,
            config,
            registry: DashMap::new(),
            queue: SegQueue::new(),
            cache: OperatorCache::new(),
            state: AtomicU8::new(RingState::Running as u8),
            submitter: Mutex::new(None),
            threads: Mutex::new(Vec::with_capacity(2)),
            on_failure: Mutex::new(None),
        });

        let submit = {
            let ring = Arc::clone(&ring);
            thread::Builder::new()
                .name(format!("ringnet-ring-{}-submit", id))
                .spawn(move || {
                    mark_ring_thread();
                    ring.submit_loop()
                })?
        };
        *ring.submitter.lock() = Some(submit.thread().clone());
        ring.threads.lock().push(submit);

        let reaper = {
            let ring2 = Arc::clone(&ring);
            thread::Builder::new()
                .name(format!("ringnet-ring-{}-wait", id))
                .spawn(move || {
                    mark_ring_thread();
                    if let Err(e) = ring2.wait() {
                        error!(ring = ring2.id, error = %e, "ring: reaper stopped");
                    }
                })
        };
        match reaper {
            Ok(handle) => ring.threads.lock().push(handle),
            Err(e) => {
                ring.state.store(RingState::Failed as u8, Ordering::SeqCst);
                ring.wake();
                return Err(e.into());
            }
        }

        info!(
            ring = id,
            sq_entries = ring.config.sq_entries,
            batch_size = ring.config.batch_size,
            "ring: started"
        );
        Ok(ring)
    }

    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }

    #[inline]
    pub fn state(&self) -> RingState {
        RingState::from(self.state.load(Ordering::SeqCst))
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.state() == RingState::Running
    }

    /// Registered operators
    #[inline]
    pub fn len(&self) -> usize {
        self.registry.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    /// Operator pool, for inspection
    pub fn cache(&self) -> &OperatorCache {
        &self.cache
    }

    /// Install the hook run once if the ring fails
    pub fn set_failure_hook(&self, hook: FailureHook) {
        *self.on_failure.lock() = Some(hook);
    }

    /// Take an operator from the pool, pointed back at this ring
    pub fn alloc(self: &Arc<Self>) -> Result<Arc<Operator>> {
        if !self.is_running() {
            return Err(Error::RingClosed);
        }
        let op = self.cache.alloc();
        op.set_ring(self);
        Ok(op)
    }

    /// Make `op`'s fd visible to the reaper
    pub fn register(&self, op: &Arc<Operator>) -> Result<()> {
        if !self.is_running() {
            return Err(Error::RingClosed);
        }
        let fd = op.fd();
        encode_user_data(RingEvent::Read, fd)?;

        if let Some(stale) = self.registry.insert(fd, Arc::clone(op)) {
            warn!(ring = self.id, fd, stale = stale.index(), "ring: fd registered twice");
        }

        // close() may have raced with the insert
        if !self.is_running() {
            self.registry.remove_if(&fd, |_, v| Arc::ptr_eq(v, op));
            return Err(Error::RingClosed);
        }
        trace!(ring = self.id, fd, "ring: registered");
        Ok(())
    }

    /// Unregister `op`, reset it and return it to the pool.
    ///
    /// Callers free an operator only after all of its requests completed.
    pub fn free(&self, op: &Arc<Operator>) {
        let fd = op.fd();
        self.registry.remove_if(&fd, |_, v| Arc::ptr_eq(v, op));
        if op.inflight() > 0 {
            warn!(ring = self.id, fd, inflight = op.inflight(), "ring: freeing busy operator");
        }
        self.cache.free(op);
        trace!(ring = self.id, fd, "ring: freed");

        // a closing ring may just have drained
        if !self.is_running() {
            self.wake();
        }
    }

    /// Stage `request` on `op` and hand it to the submission thread
    pub fn submit(&self, op: &Arc<Operator>, request: RingRequest) -> Result<()> {
        match self.state() {
            RingState::Failed | RingState::Closed => return Err(Error::RingClosed),
            _ => {}
        }
        encode_user_data(request.event, op.fd())?;
        if !op.stage(request) {
            return Err(Error::Outstanding);
        }

        // fail() may have swept the operators before the stage landed
        if self.state() == RingState::Failed && op.complete(request.event).is_some() {
            return Err(Error::RingClosed);
        }

        self.queue.push(Submission {
            op: Arc::clone(op),
            event: request.event,
        });
        self.wake();
        Ok(())
    }

    /// Stop accepting registrations; threads exit once the registry drains
    pub fn close(&self) {
        if self
            .state
            .compare_exchange(
                RingState::Running as u8,
                RingState::Closing as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
        {
            info!(ring = self.id, registered = self.len(), "ring: closing");
            self.wake();
        }
    }

    /// Join both threads. Blocks until the ring is closed and drained,
    /// or failed. Must not be called from a ring thread.
    pub fn join(&self) {
        let handles: Vec<_> = self.threads.lock().drain(..).collect();
        let mut handles = handles.into_iter();
        if let Some(submitter) = handles.next() {
            let _ = submitter.join();
        }
        for reaper in handles {
            // a failure on the submission side leaves the reaper in GETEVENTS;
            // with the submitter gone this thread is the only SQ producer
            if self.state() == RingState::Failed && !reaper.is_finished() && !self.post_wake() {
                warn!(ring = self.id, "ring: cannot wake reaper of failed ring, detaching");
                continue;
            }
            let _ = reaper.join();
        }
    }

    fn wake(&self) {
        if let Some(thread) = self.submitter.lock().as_ref() {
            thread.unpark();
        }
    }

    // ── submission thread ────────────────────────────────────────────

    fn submit_loop(self: Arc<Self>) {
        let batch_size = self.config.batch_size;
        let batch_timeout = self.config.batch_timeout;
        let mut batched = 0usize;
        let mut batch_started: Option<Instant> = None;
        let mut stalled: Option<Submission> = None;

        loop {
            self.cache.reclaim();

            match self.state() {
                RingState::Failed | RingState::Closed => break,
                RingState::Closing
                    if stalled.is_none() && self.queue.is_empty() && self.registry.is_empty() =>
                {
                    self.flush(&mut batched, &mut batch_started);
                    let _ = self.post_wake();
                    break;
                }
                _ => {}
            }

            while let Some(sub) = stalled.take().or_else(|| self.queue.pop()) {
                match self.push_sqe(&sub) {
                    Ok(true) => {
                        batched += 1;
                        batch_started.get_or_insert_with(Instant::now);
                    }
                    Ok(false) => {}
                    Err(Error::RingQueueExhausted) => {
                        trace!(ring = self.id, "ring: SQ full");
                        stalled = Some(sub);
                        self.flush(&mut batched, &mut batch_started);
                        break;
                    }
                    Err(e) => self.reject(&sub, e),
                }
                if batched >= batch_size {
                    self.flush(&mut batched, &mut batch_started);
                }
            }

            if stalled.is_some() {
                thread::yield_now();
                continue;
            }

            if batched > 0 {
                let waited = batch_started.map_or(Duration::ZERO, |t| t.elapsed());
                if waited >= batch_timeout {
                    self.flush(&mut batched, &mut batch_started);
                } else {
                    thread::park_timeout(batch_timeout - waited);
                }
                continue;
            }

            thread::park_timeout(IDLE_PARK);
        }

        debug!(ring = self.id, "ring: submission thread stopped");
    }

    /// Turn a staged request into an SQE. `Ok(false)` if it was withdrawn.
    fn push_sqe(&self, sub: &Submission) -> Result<bool> {
        let Some(request) = sub.op.pending(sub.event) else {
            return Ok(false);
        };
        let fd = sub.op.fd();
        let user_data = encode_user_data(request.event, fd)?;

        let sqe = match request.event {
            RingEvent::Read => opcode::Recv::new(types::Fd(fd), request.ptr, request.len).build(),
            RingEvent::Write => opcode::Send::new(types::Fd(fd), request.ptr as *const u8, request.len)
                .flags(libc::MSG_NOSIGNAL)
                .build(),
        }
        .user_data(user_data);

        // Safety: the submission thread is the only SQ producer, and the
        // request's memory stays valid until its completion is dispatched
        unsafe {
            let mut sq = self.uring.submission_shared();
            sq.push(&sqe).map_err(|_| Error::RingQueueExhausted)?;
        }
        Ok(true)
    }

    /// Hand a request that could not be turned into an SQE back to its owner
    fn reject(&self, sub: &Submission, err: Error) {
        warn!(ring = self.id, fd = sub.op.fd(), error = %err, "ring: request rejected");
        if sub.op.complete(sub.event).is_none() {
            return;
        }
        if let Some(handler) = sub.op.handler() {
            match sub.event {
                RingEvent::Read => handler.on_read(Err(err)),
                RingEvent::Write => handler.on_write(Err(err)),
            }
        }
    }

    fn flush(&self, batched: &mut usize, batch_started: &mut Option<Instant>) {
        if *batched == 0 {
            return;
        }
        match self.uring.submit() {
            Ok(n) => trace!(ring = self.id, submitted = n, "ring: batch submitted"),
            Err(e) => match e.raw_os_error() {
                Some(libc::EINTR) | Some(libc::EAGAIN) | Some(libc::EBUSY) => {
                    debug!(ring = self.id, error = %e, "ring: submit deferred");
                    return;
                }
                errno => {
                    error!(ring = self.id, error = %e, "ring: submit failed");
                    self.fail(errno.unwrap_or(libc::EIO));
                }
            },
        }
        *batched = 0;
        *batch_started = None;
    }

    /// Post a NOP the reaper recognises as a wake-up. Callers must be the
    /// only SQ producer: the submission thread, or `join` once it exited.
    fn post_wake(&self) -> bool {
        let nop = opcode::Nop::new().build().user_data(WAKE_USER_DATA);
        // Safety: see above
        let pushed = unsafe { self.uring.submission_shared().push(&nop).is_ok() };
        if !pushed {
            warn!(ring = self.id, "ring: no SQ slot for wake-up NOP");
        }
        match self.uring.submit() {
            Ok(_) => pushed,
            Err(e) => {
                warn!(ring = self.id, error = %e, "ring: wake-up submit failed");
                false
            }
        }
    }

    // ── reaping thread ───────────────────────────────────────────────

    /// Reap completions and dispatch them until the ring closes or fails.
    /// Runs on the `-wait` thread started by `open`.
    pub(crate) fn wait(&self) -> Result<()> {
        let mut completions: Vec<(u64, i32)> = Vec::with_capacity(256);

        loop {
            // Safety: GETEVENTS with to_submit = 0 never touches the SQ
            let waited = unsafe {
                self.uring
                    .submitter()
                    .enter::<libc::sigset_t>(0, 1, IORING_ENTER_GETEVENTS, None)
            };
            if let Err(e) = waited {
                match e.raw_os_error() {
                    Some(libc::EINTR) | Some(libc::EAGAIN) | Some(libc::EBUSY) => {}
                    errno => {
                        let errno = errno.unwrap_or(libc::EIO);
                        error!(ring = self.id, error = %e, "ring: wait failed");
                        self.fail(errno);
                        return Err(Error::RingFatal(errno));
                    }
                }
            }

            completions.clear();
            // Safety: the reaping thread is the only CQ consumer
            unsafe {
                let cq = self.uring.completion_shared();
                completions.extend(cq.map(|cqe| (cqe.user_data(), cqe.result())));
            }

            let mut woken = false;
            for &(user_data, res) in &completions {
                if user_data == WAKE_USER_DATA {
                    woken = true;
                    continue;
                }
                self.dispatch(user_data, res);
            }

            if self.state() == RingState::Failed {
                return Err(Error::RingClosed);
            }
            if woken && self.state() != RingState::Running {
                break;
            }
        }

        let _ = self.state.compare_exchange(
            RingState::Closing as u8,
            RingState::Closed as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        info!(ring = self.id, "ring: closed");
        Ok(())
    }

    fn dispatch(&self, user_data: u64, res: i32) {
        let Some((event, fd)) = decode_user_data(user_data) else {
            warn!(ring = self.id, user_data, "ring: completion with foreign tag");
            return;
        };
        let op = match self.registry.get(&fd) {
            Some(entry) => Arc::clone(entry.value()),
            None => {
                debug!(ring = self.id, fd, ?event, "ring: completion for unregistered fd");
                return;
            }
        };

        if res == -libc::EAGAIN && op.pending(event).is_some() {
            trace!(ring = self.id, fd, ?event, "ring: EAGAIN, resubmitting");
            self.queue.push(Submission { op, event });
            self.wake();
            return;
        }

        if op.complete(event).is_none() {
            debug!(ring = self.id, fd, ?event, "ring: completion without request");
            return;
        }

        let result = if res < 0 {
            Err(Error::from_cqe_result(res))
        } else {
            Ok(res as usize)
        };
        match op.handler() {
            Some(handler) => match event {
                RingEvent::Read => handler.on_read(result),
                RingEvent::Write => handler.on_write(result),
            },
            None => debug!(ring = self.id, fd, ?event, "ring: completion without handler"),
        }
    }

    /// Mark the ring failed, error out every outstanding request and tell
    /// the manager
    fn fail(&self, errno: i32) {
        let prev = self.state.swap(RingState::Failed as u8, Ordering::SeqCst);
        if matches!(RingState::from(prev), RingState::Failed | RingState::Closed) {
            self.state.store(prev, Ordering::SeqCst);
            return;
        }

        let ops: Vec<Arc<Operator>> = self.registry.iter().map(|e| Arc::clone(e.value())).collect();
        error!(ring = self.id, errno, operators = ops.len(), "ring: fatal");

        for op in ops {
            for event in [RingEvent::Read, RingEvent::Write] {
                if op.complete(event).is_none() {
                    continue;
                }
                if let Some(handler) = op.handler() {
                    let err = Err(Error::RingFatal(errno));
                    match event {
                        RingEvent::Read => handler.on_read(err),
                        RingEvent::Write => handler.on_write(err),
                    }
                }
            }
        }

        let hook = self.on_failure.lock().take();
        if let Some(hook) = hook {
            hook(self.id);
        }
        self.wake();
    }
}

impl fmt::Debug for Ring {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ring")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("registered", &self.registry.len())
            .field("queued", &self.queue.len())
            .finish()
    }
}
