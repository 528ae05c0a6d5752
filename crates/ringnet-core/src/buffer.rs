//! Growable byte buffer with book/ack cursors
//!
//! A `Buffer` keeps unread bytes in `[start, end)` of one contiguous
//! allocation. Writers `book` a tail region, fill it (directly or through
//! the kernel), then `book_ack` what they actually wrote. Readers `seek`
//! without consuming or `read_*` to consume.
//!
//! While the kernel owns part of the storage the buffer carries an
//! [`Outstanding`] marker:
//!
//! - `Read`: the kernel is filling the booked tail. Booking again is a
//!   contract violation and the cursors are never reset.
//! - `Write`: the kernel is reading unread bytes. Growth copies into new
//!   storage and keeps the old allocation alive until the marker clears.

use crate::error::{Error, Result};

/// Which kind of kernel operation currently points into the buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outstanding {
    /// A receive into the booked tail
    Read,
    /// A send out of the unread bytes
    Write,
}

pub struct Buffer {
    data: Box<[u8]>,
    start: usize,
    end: usize,
    booked: usize,
    outstanding: Option<Outstanding>,
    /// Storage replaced while a write was outstanding
    retired: Vec<Box<[u8]>>,
}

impl Buffer {
    pub fn new(capacity: usize) -> Self {
        Buffer {
            data: vec![0u8; capacity.max(1)].into_boxed_slice(),
            start: 0,
            end: 0,
            booked: 0,
            outstanding: None,
            retired: Vec::new(),
        }
    }

    /// Unread bytes
    #[inline]
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    // ---- read side ----

    /// Next `n` unread bytes, not consumed
    pub fn seek(&self, n: usize) -> Result<&[u8]> {
        self.check_len(n)?;
        Ok(&self.data[self.start..self.start + n])
    }

    /// All unread bytes, not consumed
    #[inline]
    pub fn seek_all(&self) -> &[u8] {
        &self.data[self.start..self.end]
    }

    /// Consume `n` bytes
    pub fn seek_ack(&mut self, n: usize) -> Result<()> {
        self.check_len(n)?;
        self.start += n;
        self.maybe_reset();
        Ok(())
    }

    /// Consume and return every unread byte
    pub fn read_all(&mut self) -> Vec<u8> {
        let out = self.seek_all().to_vec();
        self.start = self.end;
        self.maybe_reset();
        out
    }

    /// Consume exactly `n` bytes, or nothing
    pub fn read_bytes(&mut self, n: usize) -> Result<Vec<u8>> {
        let out = self.seek(n)?.to_vec();
        self.start += n;
        self.maybe_reset();
        Ok(out)
    }

    /// Consume exactly `n` bytes as UTF-8, or nothing
    pub fn read_string(&mut self, n: usize) -> Result<String> {
        let s = std::str::from_utf8(self.seek(n)?)
            .map_err(|_| Error::InvalidUtf8)?
            .to_owned();
        self.start += n;
        self.maybe_reset();
        Ok(s)
    }

    /// Offset of the first `delim` among the unread bytes
    #[inline]
    pub fn find(&self, delim: u8) -> Option<usize> {
        self.seek_all().iter().position(|&b| b == delim)
    }

    /// Drop consumed space by moving unread bytes to the front
    pub fn release(&mut self) {
        if self.outstanding.is_some() || self.booked > 0 || self.start == 0 {
            return;
        }
        self.data.copy_within(self.start..self.end, 0);
        self.end -= self.start;
        self.start = 0;
    }

    // ---- write side ----

    /// Writable tail of exactly `n` bytes; `end` does not move
    pub fn book(&mut self, n: usize) -> Result<&mut [u8]> {
        if self.outstanding == Some(Outstanding::Read) {
            debug_assert!(false, "buffer: book while a read is outstanding");
            return Err(Error::Outstanding);
        }
        self.reserve(n);
        self.booked = n;
        Ok(&mut self.data[self.end..self.end + n])
    }

    /// Commit `n` bytes of the booked tail
    pub fn book_ack(&mut self, n: usize) -> Result<()> {
        if n > self.booked {
            return Err(Error::OutOfSpace {
                requested: n,
                booked: self.booked,
            });
        }
        self.end += n;
        self.booked -= n;
        Ok(())
    }

    /// Drop whatever is left of the booked tail
    #[inline]
    pub fn unbook(&mut self) {
        self.booked = 0;
    }

    pub fn write_bytes(&mut self, src: &[u8]) -> Result<()> {
        let n = src.len();
        self.book(n)?.copy_from_slice(src);
        self.book_ack(n)
    }

    #[inline]
    pub fn write_string(&mut self, src: &str) -> Result<()> {
        self.write_bytes(src.as_bytes())
    }

    // ---- kernel hand-off ----

    #[inline]
    pub fn outstanding(&self) -> Option<Outstanding> {
        self.outstanding
    }

    pub fn mark_outstanding(&mut self, kind: Outstanding) {
        debug_assert!(self.outstanding.is_none(), "buffer: operation already outstanding");
        self.outstanding = Some(kind);
    }

    /// The kernel is done with the buffer; retired storage can go
    pub fn clear_outstanding(&mut self) {
        self.outstanding = None;
        self.retired.clear();
        self.maybe_reset();
    }

    /// Start of the booked tail, for a receive
    #[inline]
    pub fn booked_ptr(&mut self) -> *mut u8 {
        // end <= capacity, so the offset stays inside (or one past) the allocation
        unsafe { self.data.as_mut_ptr().add(self.end) }
    }

    #[inline]
    pub fn booked_len(&self) -> usize {
        self.booked
    }

    /// Start of the unread bytes, for a send
    #[inline]
    pub fn unread_ptr(&self) -> *const u8 {
        unsafe { self.data.as_ptr().add(self.start) }
    }

    // ---- internals ----

    fn check_len(&self, n: usize) -> Result<()> {
        let available = self.len();
        if n > available {
            return Err(Error::InsufficientData {
                requested: n,
                available,
            });
        }
        Ok(())
    }

    /// Rewind cursors once everything is consumed and nobody points inside
    fn maybe_reset(&mut self) {
        if self.start == self.end && self.outstanding.is_none() && self.booked == 0 {
            self.start = 0;
            self.end = 0;
        }
    }

    /// Make room for `n` bytes after `end`
    fn reserve(&mut self, n: usize) {
        let cap = self.data.len();
        if cap - self.end >= n {
            return;
        }

        let len = self.len();
        match self.outstanding {
            None if cap - len >= n => {
                self.data.copy_within(self.start..self.end, 0);
            }
            None => {
                let mut grown = vec![0u8; 2 * (len + n)].into_boxed_slice();
                grown[..len].copy_from_slice(&self.data[self.start..self.end]);
                self.data = grown;
            }
            Some(_) => {
                // the kernel may be reading [start, end): move, never overwrite
                let mut grown = vec![0u8; (2 * (len + n)).max(cap)].into_boxed_slice();
                grown[..len].copy_from_slice(&self.data[self.start..self.end]);
                let old = std::mem::replace(&mut self.data, grown);
                self.retired.push(old);
            }
        }
        self.start = 0;
        self.end = len;
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("start", &self.start)
            .field("end", &self.end)
            .field("capacity", &self.data.len())
            .field("booked", &self.booked)
            .field("outstanding", &self.outstanding)
            .finish()
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Buffer::new(crate::constants::DEFAULT_BUFFER_SIZE)
    }
}
