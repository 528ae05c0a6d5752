//! Ring events and the `user_data` tag
//!
//! Every SQE carries `user_data = fd | (event << 56)`: the event kind in
//! the high byte, the file descriptor in the low 56 bits. The reaper
//! decodes it back to find the operator and the pending request.

use std::os::unix::io::RawFd;

use ringnet_core::{Error, Result};

/// Bits of `user_data` holding the fd
pub const FD_BITS: u32 = 56;

/// Mask selecting the fd from `user_data`
pub const FD_MASK: u64 = (1 << FD_BITS) - 1;

/// Reserved tag of the NOP that wakes a closing ring's reaper
pub const WAKE_USER_DATA: u64 = u64::MAX;

/// Kind of operation submitted for an operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RingEvent {
    /// Receive into a booked input region
    Read = 0x1,
    /// Send out of unread output bytes
    Write = 0x2,
}

impl RingEvent {
    /// Slot of this event in an operator's pending table
    #[inline]
    pub(crate) const fn slot(self) -> usize {
        match self {
            RingEvent::Read => 0,
            RingEvent::Write => 1,
        }
    }

    #[inline]
    pub const fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x1 => Some(RingEvent::Read),
            0x2 => Some(RingEvent::Write),
            _ => None,
        }
    }
}

/// Tag an SQE for `fd`
#[inline]
pub fn encode_user_data(event: RingEvent, fd: RawFd) -> Result<u64> {
    let wide = fd as i64;
    if wide < 0 || wide as u64 > FD_MASK {
        return Err(Error::InvalidFd(wide));
    }
    Ok(wide as u64 | ((event as u64) << FD_BITS))
}

/// Split a CQE tag into event and fd; `None` for foreign tags
#[inline]
pub fn decode_user_data(data: u64) -> Option<(RingEvent, RawFd)> {
    let event = RingEvent::from_u8((data >> FD_BITS) as u8)?;
    let fd = RawFd::try_from(data & FD_MASK).ok()?;
    Some((event, fd))
}

/// One kernel operation: the event and the memory it reads or fills.
///
/// The memory belongs to a connection buffer marked outstanding for the
/// lifetime of the request, so the pointer stays valid until the
/// completion is dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingRequest {
    pub event: RingEvent,
    pub ptr: *mut u8,
    pub len: u32,
}

// Safety: the pointed-to region is owned by the kernel between submit and
// completion; nothing on the Rust side touches it through this copy
unsafe impl Send for RingRequest {}
unsafe impl Sync for RingRequest {}

impl RingRequest {
    /// Receive up to `len` bytes into `ptr`
    pub fn read(ptr: *mut u8, len: usize) -> Self {
        RingRequest {
            event: RingEvent::Read,
            ptr,
            len: clamp_len(len),
        }
    }

    /// Send up to `len` bytes from `ptr`
    pub fn write(ptr: *const u8, len: usize) -> Self {
        RingRequest {
            event: RingEvent::Write,
            ptr: ptr as *mut u8,
            len: clamp_len(len),
        }
    }
}

#[inline]
fn clamp_len(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}
