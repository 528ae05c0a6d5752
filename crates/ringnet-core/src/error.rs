//! Error types for the ringnet reactor

use std::fmt;
use std::io;

use thiserror::Error;

use crate::state::CloseOwner;

/// Result type for ringnet operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by buffers, rings and connections
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Connection was closed, by the user or by the ring
    #[error("connection has been closed by {0}")]
    ConnectionClosed(CloseOwner),

    /// Blocking read timed out
    #[error("connection read timeout")]
    ReadTimeout,

    /// Blocking flush timed out
    #[error("connection write timeout")]
    WriteTimeout,

    /// Peer hung up
    #[error("EOF")]
    EndOfStream,

    /// Fewer unread bytes than requested
    #[error("not enough bytes in buffer: requested {requested}, available {available}")]
    InsufficientData { requested: usize, available: usize },

    /// Ack larger than the booked region
    #[error("not enough space in buffer: requested {requested}, booked {booked}")]
    OutOfSpace { requested: usize, booked: usize },

    /// Buffer mutated while the kernel owns part of it
    #[error("buffer region is outstanding in the kernel")]
    Outstanding,

    /// `read_string` over bytes that are not UTF-8
    #[error("buffer data is not valid UTF-8")]
    InvalidUtf8,

    /// Submission queue full
    #[error("ring submission queue exhausted")]
    RingQueueExhausted,

    /// Ring failed and was removed
    #[error("ring failed: {}", errno_str(.0))]
    RingFatal(i32),

    /// Ring no longer accepts operators
    #[error("ring closed")]
    RingClosed,

    /// Manager has no active ring to pick
    #[error("no active ring")]
    NoRings,

    /// fd does not fit in the user_data encoding
    #[error("fd {0} cannot be encoded in user_data")]
    InvalidFd(i64),

    /// `set_num_loops` below one
    #[error("set invalid numLoops: {0}")]
    InvalidNumLoops(usize),

    /// `create_listener` with something other than tcp
    #[error("unsupported network {0:?}")]
    UnsupportedNetwork(String),

    /// Shutdown deadline passed before connections drained
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// OS error with errno
    #[error("{}", errno_str(.0))]
    Os(i32),

    /// Error returned by a user handler
    #[error("{0}")]
    Handler(String),

    /// Several errors joined together (close callbacks)
    #[error("{}", JoinedErrors(.0))]
    Multiple(Vec<Error>),
}

impl Error {
    /// Build an `Os` error from the calling thread's errno
    pub fn last_os_error() -> Self {
        Error::Os(io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO))
    }

    /// Build an `Os` error from a negative completion result
    pub fn from_cqe_result(res: i32) -> Self {
        Error::Os(-res)
    }

    /// Whether this error is a read or write timeout
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::ReadTimeout | Error::WriteTimeout => true,
            Error::Os(errno) => *errno == libc::ETIMEDOUT,
            _ => false,
        }
    }

    /// Whether retrying the same call may succeed
    pub fn is_temporary(&self) -> bool {
        match self {
            Error::ReadTimeout | Error::WriteTimeout | Error::RingQueueExhausted => true,
            Error::Os(errno) => matches!(
                *errno,
                libc::EAGAIN | libc::EINTR | libc::ECONNRESET | libc::ECONNABORTED | libc::ETIMEDOUT
            ),
            _ => false,
        }
    }

    /// Whether this error means the connection is gone for good
    pub fn is_closed(&self) -> bool {
        matches!(self, Error::ConnectionClosed(_) | Error::EndOfStream)
    }

    /// Join errors, flattening a single error into itself
    pub fn join(mut errors: Vec<Error>) -> Option<Error> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(Error::Multiple(errors)),
        }
    }
}

fn errno_str(errno: &i32) -> String {
    io::Error::from_raw_os_error(*errno).to_string()
}

struct JoinedErrors<'a>(&'a [Error]);

impl fmt::Display for JoinedErrors<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, e) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("\n")?;
            }
            write!(f, "{}", e)?;
        }
        Ok(())
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.raw_os_error() {
            Some(errno) => Error::Os(errno),
            None => match e.kind() {
                io::ErrorKind::TimedOut => Error::ReadTimeout,
                io::ErrorKind::UnexpectedEof => Error::EndOfStream,
                _ => Error::Handler(e.to_string()),
            },
        }
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        let kind = match &e {
            Error::ConnectionClosed(_) => io::ErrorKind::NotConnected,
            Error::ReadTimeout | Error::WriteTimeout | Error::DeadlineExceeded => io::ErrorKind::TimedOut,
            Error::EndOfStream => io::ErrorKind::UnexpectedEof,
            Error::InsufficientData { .. } | Error::OutOfSpace { .. } => io::ErrorKind::InvalidInput,
            Error::InvalidUtf8 => io::ErrorKind::InvalidData,
            Error::RingQueueExhausted => io::ErrorKind::WouldBlock,
            Error::Os(errno) => return io::Error::from_raw_os_error(*errno),
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, e)
    }
}
