//! Single-slot wake channel for blocking calls
//!
//! Completion callbacks `fire` a trigger after they touched a buffer; a
//! blocked reader or flusher `wait`s on it and re-checks the buffer. A
//! fire with nobody waiting is remembered, so a waiter that checked the
//! buffer just before the completion landed does not sleep through it.
//!
//! A terminal error is sticky: once set, every present and future wait
//! returns it.

use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use crate::error::Error;

/// Why a `wait` returned
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Wake {
    /// Progress was made; re-check the buffer
    Fired,
    /// The connection is gone
    Terminal(Error),
    /// Deadline passed first
    TimedOut,
}

#[derive(Default)]
struct Slot {
    pending: bool,
    terminal: Option<Error>,
}

#[derive(Default)]
pub struct Trigger {
    slot: Mutex<Slot>,
    cond: Condvar,
}

impl Trigger {
    pub fn new() -> Self {
        Trigger::default()
    }

    /// Wake the waiter, or the next one if nobody waits yet
    pub fn fire(&self) {
        let mut slot = self.slot.lock();
        slot.pending = true;
        drop(slot);
        self.cond.notify_all();
    }

    /// Wake every waiter with `err`; the first terminal error wins
    pub fn fire_terminal(&self, err: Error) {
        let mut slot = self.slot.lock();
        if slot.terminal.is_none() {
            slot.terminal = Some(err);
        }
        drop(slot);
        self.cond.notify_all();
    }

    pub fn terminal(&self) -> Option<Error> {
        self.slot.lock().terminal.clone()
    }

    /// Block until fired, terminated, or `deadline` passes
    pub fn wait(&self, deadline: Option<Instant>) -> Wake {
        let mut slot = self.slot.lock();
        loop {
            if let Some(err) = &slot.terminal {
                return Wake::Terminal(err.clone());
            }
            if slot.pending {
                slot.pending = false;
                return Wake::Fired;
            }
            match deadline {
                None => self.cond.wait(&mut slot),
                Some(at) => {
                    if self.cond.wait_until(&mut slot, at).timed_out()
                        && !slot.pending
                        && slot.terminal.is_none()
                    {
                        return Wake::TimedOut;
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let slot = self.slot.lock();
        f.debug_struct("Trigger")
            .field("pending", &slot.pending)
            .field("terminal", &slot.terminal)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::CloseOwner;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_fire_before_wait_is_remembered() {
        let t = Trigger::new();
        t.fire();
        t.fire();
        assert_eq!(t.wait(None), Wake::Fired);
        // fires coalesce
        let soon = Instant::now() + Duration::from_millis(5);
        assert_eq!(t.wait(Some(soon)), Wake::TimedOut);
    }

    #[test]
    fn test_wakes_blocked_waiter() {
        let t = Arc::new(Trigger::new());
        let waiter = {
            let t = Arc::clone(&t);
            thread::spawn(move || t.wait(None))
        };
        thread::sleep(Duration::from_millis(20));
        t.fire();
        assert_eq!(waiter.join().unwrap(), Wake::Fired);
    }

    #[test]
    fn test_terminal_is_sticky() {
        let t = Trigger::new();
        t.fire_terminal(Error::EndOfStream);
        t.fire_terminal(Error::ConnectionClosed(CloseOwner::User));

        assert_eq!(t.wait(None), Wake::Terminal(Error::EndOfStream));
        assert_eq!(t.wait(None), Wake::Terminal(Error::EndOfStream));
        assert_eq!(t.terminal(), Some(Error::EndOfStream));
    }

    #[test]
    fn test_terminal_wakes_all() {
        let t = Arc::new(Trigger::new());
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let t = Arc::clone(&t);
                thread::spawn(move || t.wait(Some(Instant::now() + Duration::from_secs(5))))
            })
            .collect();
        thread::sleep(Duration::from_millis(20));
        t.fire_terminal(Error::ConnectionClosed(CloseOwner::Ring));

        for w in waiters {
            assert_eq!(
                w.join().unwrap(),
                Wake::Terminal(Error::ConnectionClosed(CloseOwner::Ring))
            );
        }
    }
}
