//! Completion-driven read and write loops
//!
//! Nothing here owns a thread. The read loop re-arms itself from its own
//! completion; the write loop is kicked by `flush()` (or a user close) and
//! keeps itself going from its completion until the output buffer is
//! empty. Both run on the ring's reaping thread.
//!
//! # Lifetime
//!
//! Every arm bumps `inflight` before it looks at the closing state, and
//! every completion drops it as its very last step. Teardown sets
//! `torn_down` first and only frees the operator and closes the fd once
//! `inflight` is back at zero, so the kernel never writes into a buffer
//! (or completes against an fd) that is gone.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;

use nix::sys::socket::{self, Shutdown};
use tracing::{debug, error, trace, warn};

use ringnet_core::{CloseOwner, Error, FlushState, Outstanding, Result};
use ringnet_ring::{OperatorHandler, RingRequest};

use crate::connection::{Connection, Shared};

impl Shared {
    // ---- read loop ----

    pub(crate) fn arm_read(&self) {
        self.inflight.fetch_add(1, Ordering::SeqCst);
        if self.keys.is_closing() || self.torn_down.load(Ordering::SeqCst) {
            self.release_inflight();
            return;
        }

        let request = {
            let mut input = self.input.lock();
            if let Err(e) = input.book(self.read_size).map(|_| ()) {
                drop(input);
                warn!(conn = %self.id, error = %e, "conn: cannot book input");
                self.release_inflight();
                return;
            }
            let ptr = input.booked_ptr();
            input.mark_outstanding(Outstanding::Read);
            RingRequest::read(ptr, self.read_size)
        };

        if let Err(e) = self.op.submit(request) {
            {
                let mut input = self.input.lock();
                input.unbook();
                input.clear_outstanding();
            }
            debug!(conn = %self.id, fd = self.fd, error = %e, "conn: read submit failed");
            self.hang_up(e);
            self.release_inflight();
        }
    }

    fn read_completed(&self, result: Result<usize>) {
        match result {
            Ok(0) => {
                self.clear_input();
                self.hang_up(Error::EndOfStream);
            }
            Ok(n) => {
                let wake = {
                    let mut input = self.input.lock();
                    if let Err(e) = input.book_ack(n) {
                        error!(conn = %self.id, error = %e, "conn: receive overran booking");
                    }
                    input.unbook();
                    input.clear_outstanding();
                    let wait = self.wait_read_size.load(Ordering::SeqCst);
                    wait > 0 && input.len() >= wait
                };
                trace!(conn = %self.id, bytes = n, "conn: received");
                if wake {
                    self.read_trigger.fire();
                }
                self.start_processing();
                self.arm_read();
            }
            Err(e) => {
                self.clear_input();
                self.hang_up(e);
            }
        }
    }

    fn clear_input(&self) {
        let mut input = self.input.lock();
        input.unbook();
        input.clear_outstanding();
    }

    // ---- write loop ----

    /// Send the output buffer unless a send is already outstanding
    pub(crate) fn arm_write(&self) {
        self.inflight.fetch_add(1, Ordering::SeqCst);

        let request = loop {
            if self.torn_down.load(Ordering::SeqCst) || !self.keys.try_flush() {
                self.release_inflight();
                return;
            }
            let mut output = self.output.lock();
            if !output.is_empty() {
                output.mark_outstanding(Outstanding::Write);
                let len = output.len().min(u32::MAX as usize);
                break RingRequest::write(output.unread_ptr(), len);
            }
            drop(output);
            self.keys.flush_done();
            // a flush may have lost the race for the slot in between
            if self.output.lock().is_empty() {
                self.release_inflight();
                return;
            }
        };

        if let Err(e) = self.op.submit(request) {
            self.output.lock().clear_outstanding();
            debug!(conn = %self.id, fd = self.fd, error = %e, "conn: write submit failed");
            self.hang_up(e);
            self.release_inflight();
        }
    }

    fn write_completed(&self, result: Result<usize>) {
        match result {
            Ok(n) => {
                {
                    let mut output = self.output.lock();
                    if let Err(e) = output.seek_ack(n) {
                        error!(conn = %self.id, error = %e, "conn: send overran output");
                    }
                    output.clear_outstanding();
                }
                trace!(conn = %self.id, bytes = n, "conn: sent");
                self.keys.flush_done();
                self.arm_write();
                self.write_trigger.fire();
                self.try_drain_close();
            }
            Err(e) => {
                self.output.lock().clear_outstanding();
                self.hang_up(e);
            }
        }
    }

    // ---- closing ----

    /// The ring side saw the connection end
    pub(crate) fn hang_up(&self, cause: Error) {
        self.keys.seal_flush();
        if self.keys.close_by(CloseOwner::Ring) {
            debug!(conn = %self.id, fd = self.fd, cause = %cause, "conn: hung up");
            let err = match cause {
                Error::EndOfStream => Error::EndOfStream,
                _ => Error::ConnectionClosed(CloseOwner::Ring),
            };
            self.teardown(err);
        } else {
            // a user close was draining; it cannot finish now
            self.teardown(Error::ConnectionClosed(self.keys.closed_by()));
        }
    }

    /// Start a user close without waiting for it
    pub(crate) fn close_async(&self) {
        if self.keys.close_by(CloseOwner::User) {
            debug!(conn = %self.id, fd = self.fd, "conn: closing");
        }
        self.arm_write();
        self.try_drain_close();
    }

    /// Finish a user close once the output is drained
    pub(crate) fn try_drain_close(&self) {
        if self.keys.closed_by() != CloseOwner::User || self.torn_down.load(Ordering::SeqCst) {
            return;
        }
        let drained =
            self.output.lock().is_empty() && self.keys.flush_state() == FlushState::Idle;
        if drained {
            self.teardown(Error::ConnectionClosed(CloseOwner::User));
        }
    }

    /// Runs once: wake everyone blocked (`close()` waiters included), shut
    /// the socket down, run the close callbacks if no handler is running,
    /// and finalize when the last request has completed
    pub(crate) fn teardown(&self, err: Error) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.keys.seal_flush();
        debug!(conn = %self.id, fd = self.fd, reason = %err, "conn: teardown");

        self.read_trigger.fire_terminal(err.clone());
        self.write_trigger.fire_terminal(err.clone());

        if self.fd >= 0 {
            match socket::shutdown(self.fd, Shutdown::Both) {
                Ok(()) | Err(nix::errno::Errno::ENOTCONN) => {}
                Err(errno) => trace!(conn = %self.id, fd = self.fd, %errno, "conn: shutdown"),
            }
        }

        // before the callbacks: one of them may close() this connection
        self.closed.fire_terminal(err);

        // otherwise the processing thread runs them when the handler returns
        if self.keys.try_process() {
            self.run_close_callbacks();
            self.keys.done_processing();
        }

        self.try_finalize();
    }

    fn run_close_callbacks(&self) {
        let Some(me) = self.me.upgrade() else { return };
        let conn = Connection { shared: me };
        if let Err(e) = self.callbacks.run(&conn) {
            warn!(conn = %self.id, error = %e, "conn: close callback failed");
        }
    }

    fn release_inflight(&self) {
        if self.inflight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.try_finalize();
        }
    }

    fn try_finalize(&self) {
        if !self.torn_down.load(Ordering::SeqCst) || self.inflight.load(Ordering::SeqCst) != 0 {
            return;
        }
        if self.finalized.swap(true, Ordering::SeqCst) {
            return;
        }
        // unregister before the fd number can be reused
        self.op.free();
        self.drop_stream();
        trace!(conn = %self.id, fd = self.fd, "conn: finalized");
    }

    // ---- request processing ----

    /// Spawn the processing thread unless one is already running
    pub(crate) fn start_processing(&self) {
        if self.on_request.is_none() && self.keys.is_connected() {
            return;
        }
        if !self.keys.try_process() {
            return;
        }
        let Some(me) = self.me.upgrade() else {
            self.keys.done_processing();
            return;
        };
        let spawned = thread::Builder::new()
            .name(format!("ringnet-conn-{}", self.id))
            .spawn(move || me.process_loop());
        if let Err(e) = spawned {
            error!(conn = %self.id, error = %e, "conn: cannot spawn processing thread");
            self.keys.done_processing();
            self.hang_up(e.into());
        }
    }

    /// Holds the processing slot: `on_connect` once, then `on_request`
    /// while input is buffered and nobody is closing
    fn process_loop(self: Arc<Self>) {
        let conn = Connection {
            shared: Arc::clone(&self),
        };
        loop {
            if self.keys.try_connect() {
                if let Some(on_connect) = &self.on_connect {
                    if panic::catch_unwind(AssertUnwindSafe(|| on_connect(&conn))).is_err() {
                        error!(conn = %self.id, "conn: connect handler panicked");
                        self.close_async();
                    }
                }
            }

            if let Some(on_request) = &self.on_request {
                while !self.keys.is_closing() {
                    let before = self.input.lock().len();
                    if before == 0 {
                        break;
                    }
                    match panic::catch_unwind(AssertUnwindSafe(|| on_request(&conn))) {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            if !e.is_closed() {
                                warn!(conn = %self.id, error = %e, "conn: request handler failed");
                            }
                            self.close_async();
                            break;
                        }
                        Err(_) => {
                            error!(conn = %self.id, "conn: request handler panicked");
                            self.close_async();
                            break;
                        }
                    }
                    if self.input.lock().len() == before {
                        thread::yield_now();
                    }
                }
            }

            self.keys.done_processing();
            if self.torn_down.load(Ordering::SeqCst) {
                if self.keys.try_process() {
                    self.run_close_callbacks();
                    self.keys.done_processing();
                }
                return;
            }
            // input that landed while we held the slot found nobody to start
            if self.keys.is_closing() || self.input.lock().is_empty() || !self.keys.try_process() {
                return;
            }
        }
    }
}

impl OperatorHandler for Shared {
    fn on_read(&self, result: Result<usize>) {
        self.read_completed(result);
        self.release_inflight();
    }

    fn on_write(&self, result: Result<usize>) {
        self.write_completed(result);
        self.release_inflight();
    }
}
