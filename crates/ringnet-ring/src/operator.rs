//! Operator: one registered fd's interest in a ring
//!
//! An operator correlates a file descriptor with the handler that wants
//! its completions. Operators live in a ring's [`OperatorCache`] and are
//! recycled; a connection takes one at open and gives it back at
//! finalize, after every request it issued has completed.
//!
//! [`OperatorCache`]: crate::operator_cache::OperatorCache

use std::fmt;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use ringnet_core::{Error, Result, SpinLock};

use crate::event::{RingEvent, RingRequest};
use crate::ring::Ring;

/// Completion callbacks, invoked on the ring's reaping thread.
///
/// `Ok(n)` carries the kernel's byte count (zero on a read means the
/// peer hung up); `Err` carries the negated CQE result or a ring failure.
pub trait OperatorHandler: Send + Sync {
    fn on_read(&self, result: Result<usize>);
    fn on_write(&self, result: Result<usize>);
}

pub struct Operator {
    /// Slot in the owning cache
    index: usize,
    fd: AtomicI32,
    handler: SpinLock<Option<Arc<dyn OperatorHandler>>>,
    ring: SpinLock<Weak<Ring>>,
    /// Requests staged or in the kernel
    inflight: AtomicUsize,
    /// One outstanding request per event
    pending: [SpinLock<Option<RingRequest>>; 2],
}

impl Operator {
    pub(crate) fn new(index: usize) -> Self {
        Operator {
            index,
            fd: AtomicI32::new(0),
            handler: SpinLock::new(None),
            ring: SpinLock::new(Weak::new()),
            inflight: AtomicUsize::new(0),
            pending: [SpinLock::new(None), SpinLock::new(None)],
        }
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_fd(&self, fd: RawFd) {
        self.fd.store(fd, Ordering::Release);
    }

    pub fn set_handler(&self, handler: Arc<dyn OperatorHandler>) {
        *self.handler.lock() = Some(handler);
    }

    pub fn handler(&self) -> Option<Arc<dyn OperatorHandler>> {
        self.handler.lock().clone()
    }

    /// Owning ring, if the operator is allocated and the ring still exists
    pub fn ring(&self) -> Option<Arc<Ring>> {
        self.ring.lock().upgrade()
    }

    pub(crate) fn set_ring(&self, ring: &Arc<Ring>) {
        *self.ring.lock() = Arc::downgrade(ring);
    }

    /// Requests submitted and not yet completed
    #[inline]
    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::SeqCst)
    }

    /// Insert into the owning ring's registry
    pub fn register(self: &Arc<Self>) -> Result<()> {
        self.ring().ok_or(Error::RingClosed)?.register(self)
    }

    /// Queue `request` on the owning ring
    pub fn submit(self: &Arc<Self>, request: RingRequest) -> Result<()> {
        self.ring().ok_or(Error::RingClosed)?.submit(self, request)
    }

    /// Unregister and hand back to the owning ring's pool
    pub fn free(self: &Arc<Self>) {
        match self.ring() {
            Some(ring) => ring.free(self),
            None => self.reset(),
        }
    }

    /// Stage `request` as the outstanding one for its event
    pub(crate) fn stage(&self, request: RingRequest) -> bool {
        let mut slot = self.pending[request.event.slot()].lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(request);
        self.inflight.fetch_add(1, Ordering::SeqCst);
        true
    }

    /// Outstanding request for `event`, left in place
    pub(crate) fn pending(&self, event: RingEvent) -> Option<RingRequest> {
        *self.pending[event.slot()].lock()
    }

    /// Retire the outstanding request for `event`
    pub(crate) fn complete(&self, event: RingEvent) -> Option<RingRequest> {
        let taken = self.pending[event.slot()].lock().take();
        if taken.is_some() {
            self.inflight.fetch_sub(1, Ordering::SeqCst);
        }
        taken
    }

    /// Back to the freshly allocated state
    pub fn reset(&self) {
        self.fd.store(0, Ordering::Release);
        *self.handler.lock() = None;
        *self.ring.lock() = Weak::new();
        for slot in &self.pending {
            *slot.lock() = None;
        }
        self.inflight.store(0, Ordering::SeqCst);
    }

    /// Nothing references this operator's slot
    pub fn is_reset(&self) -> bool {
        self.fd() == 0
            && self.handler.lock().is_none()
            && self.ring.lock().strong_count() == 0
            && self.inflight() == 0
            && self.pending.iter().all(|slot| slot.lock().is_none())
    }
}

impl fmt::Debug for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operator")
            .field("index", &self.index)
            .field("fd", &self.fd())
            .field("inflight", &self.inflight())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        reads: Mutex<Vec<Result<usize>>>,
    }

    impl OperatorHandler for Recorder {
        fn on_read(&self, result: Result<usize>) {
            self.reads.lock().push(result);
        }
        fn on_write(&self, _result: Result<usize>) {}
    }

    #[test]
    fn test_stage_one_per_event() {
        let op = Operator::new(3);
        let mut a = [0u8; 8];
        let b = [0u8; 8];

        assert!(op.stage(RingRequest::read(a.as_mut_ptr(), a.len())));
        assert!(!op.stage(RingRequest::read(a.as_mut_ptr(), a.len())));
        assert!(op.stage(RingRequest::write(b.as_ptr(), b.len())));
        assert_eq!(op.inflight(), 2);

        assert_eq!(op.pending(RingEvent::Read).map(|r| r.len), Some(8));
        assert!(op.complete(RingEvent::Read).is_some());
        assert!(op.complete(RingEvent::Read).is_none());
        assert_eq!(op.inflight(), 1);
    }

    #[test]
    fn test_reset_clears_everything() {
        let op = Operator::new(0);
        let recorder = Arc::new(Recorder::default());
        op.set_fd(9);
        op.set_handler(recorder.clone());
        let b = [0u8; 4];
        op.stage(RingRequest::write(b.as_ptr(), b.len()));
        assert!(!op.is_reset());

        op.handler().unwrap().on_read(Ok(4));
        assert_eq!(recorder.reads.lock().len(), 1);

        op.reset();
        assert!(op.is_reset());
        assert!(op.handler().is_none());
        assert!(op.ring().is_none());
    }

    #[test]
    fn test_unowned_operator_refuses_io() {
        let op = Arc::new(Operator::new(0));
        let b = [0u8; 4];
        assert_eq!(op.register(), Err(Error::RingClosed));
        assert_eq!(
            op.submit(RingRequest::write(b.as_ptr(), b.len())),
            Err(Error::RingClosed)
        );
    }
}
