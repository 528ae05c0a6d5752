//! Connection keychain
//!
//! Four independent slots arbitrate between the request handler, the
//! flush path and the two possible closers. Every transition is a single
//! CAS, so the winner of a slot is always unique.

use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// Who closed a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CloseOwner {
    /// Still open
    None = 0,

    /// `close()` called by application code
    User = 1,

    /// Peer hang-up or a ring-side failure
    Ring = 2,
}

impl CloseOwner {
    #[inline]
    pub const fn is_closed(&self) -> bool {
        !matches!(self, CloseOwner::None)
    }
}

impl From<u8> for CloseOwner {
    fn from(v: u8) -> Self {
        match v {
            1 => CloseOwner::User,
            2 => CloseOwner::Ring,
            _ => CloseOwner::None,
        }
    }
}

impl fmt::Display for CloseOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseOwner::None => write!(f, "none"),
            CloseOwner::User => write!(f, "user"),
            CloseOwner::Ring => write!(f, "ring"),
        }
    }
}

/// State of the output flush slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FlushState {
    /// No write outstanding
    Idle = 0,

    /// A write is in the kernel
    InFlight = 1,

    /// Connection is going away; no more writes
    Terminal = 2,
}

impl From<u8> for FlushState {
    fn from(v: u8) -> Self {
        match v {
            1 => FlushState::InFlight,
            2 => FlushState::Terminal,
            _ => FlushState::Idle,
        }
    }
}

/// Per-connection lock slots
#[derive(Debug)]
pub struct Keychain {
    connecting: AtomicBool,
    processing: AtomicBool,
    flushing: AtomicU8,
    closing: AtomicU8,
}

impl Keychain {
    pub const fn new() -> Self {
        Keychain {
            connecting: AtomicBool::new(false),
            processing: AtomicBool::new(false),
            flushing: AtomicU8::new(FlushState::Idle as u8),
            closing: AtomicU8::new(CloseOwner::None as u8),
        }
    }

    // ---- connecting ----

    /// Claim the one-time `on_connect` slot
    #[inline]
    pub fn try_connect(&self) -> bool {
        self.connecting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.connecting.load(Ordering::Acquire)
    }

    // ---- processing ----

    /// Claim the request-processing slot
    #[inline]
    pub fn try_process(&self) -> bool {
        self.processing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    #[inline]
    pub fn done_processing(&self) {
        self.processing.store(false, Ordering::SeqCst);
    }

    #[inline]
    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::SeqCst)
    }

    // ---- flushing ----

    /// `Idle -> InFlight`; fails if a write is outstanding or the slot is sealed
    #[inline]
    pub fn try_flush(&self) -> bool {
        self.flushing
            .compare_exchange(
                FlushState::Idle as u8,
                FlushState::InFlight as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// `InFlight -> Idle`. A sealed slot stays terminal.
    #[inline]
    pub fn flush_done(&self) -> bool {
        self.flushing
            .compare_exchange(
                FlushState::InFlight as u8,
                FlushState::Idle as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// Force the slot terminal, returning what it was before
    #[inline]
    pub fn seal_flush(&self) -> FlushState {
        FlushState::from(self.flushing.swap(FlushState::Terminal as u8, Ordering::SeqCst))
    }

    #[inline]
    pub fn flush_state(&self) -> FlushState {
        FlushState::from(self.flushing.load(Ordering::SeqCst))
    }

    // ---- closing ----

    /// `None -> owner`, at most once for the lifetime of the connection
    #[inline]
    pub fn close_by(&self, owner: CloseOwner) -> bool {
        debug_assert!(owner.is_closed());
        self.closing
            .compare_exchange(
                CloseOwner::None as u8,
                owner as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    #[inline]
    pub fn closed_by(&self) -> CloseOwner {
        CloseOwner::from(self.closing.load(Ordering::SeqCst))
    }

    #[inline]
    pub fn is_closing(&self) -> bool {
        self.closed_by().is_closed()
    }
}

impl Default for Keychain {
    fn default() -> Self {
        Keychain::new()
    }
}
