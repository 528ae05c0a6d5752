//! Operator pool
//!
//! Slots are allocated a page at a time and never shrink. Freed operators
//! go to a *pending* list first; the ring's submission thread merges that
//! list back into the free list once per batch, so a slot is reused no
//! earlier than one submission pass after it was freed.
//!
//! The free list and the pending list sit behind separate spin locks:
//! `free` never contends with `alloc`.

use std::mem;
use std::sync::Arc;

use ringnet_core::constants::OPERATOR_PAGE_SIZE;
use ringnet_core::SpinLock;

use crate::operator::Operator;

#[derive(Default)]
struct Slots {
    cache: Vec<Arc<Operator>>,
    free: Vec<usize>,
}

#[derive(Default)]
pub struct OperatorCache {
    slots: SpinLock<Slots>,
    pending: SpinLock<Vec<usize>>,
}

impl OperatorCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Operators added per growth
    #[inline]
    pub fn per_page() -> usize {
        (OPERATOR_PAGE_SIZE / mem::size_of::<Operator>()).max(1)
    }

    /// Take a reset operator, growing the pool if the free list is empty
    pub fn alloc(&self) -> Arc<Operator> {
        let mut slots = self.slots.lock();
        if slots.free.is_empty() {
            let base = slots.cache.len();
            let n = Self::per_page();
            slots.cache.reserve(n);
            slots.free.reserve(n);
            for index in base..base + n {
                slots.cache.push(Arc::new(Operator::new(index)));
            }
            // lowest index handed out first
            slots.free.extend((base..base + n).rev());
        }
        let index = match slots.free.pop() {
            Some(index) => index,
            None => unreachable!("operator pool grew by at least one slot"),
        };
        Arc::clone(&slots.cache[index])
    }

    /// Reset `op` and queue its slot for reuse
    pub fn free(&self, op: &Operator) {
        op.reset();
        self.pending.lock().push(op.index());
    }

    /// Make pending slots allocatable; returns how many were merged
    pub fn reclaim(&self) -> usize {
        let pending = {
            let mut pending = self.pending.lock();
            if pending.is_empty() {
                return 0;
            }
            mem::take(&mut *pending)
        };
        let n = pending.len();
        self.slots.lock().free.extend(pending);
        n
    }

    /// Slots ever created
    pub fn capacity(&self) -> usize {
        self.slots.lock().cache.len()
    }

    /// Slots ready for `alloc`
    pub fn available(&self) -> usize {
        self.slots.lock().free.len()
    }

    /// Slots freed but not yet reclaimed
    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }
}
