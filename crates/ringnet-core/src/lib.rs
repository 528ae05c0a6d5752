//! # ringnet-core
//!
//! Core types shared by the ringnet reactor crates.
//!
//! This crate is platform-agnostic and contains no io_uring code.
//! The ring itself lives in `ringnet-ring`, the connection layer in `ringnet`.
//!
//! ## Modules
//!
//! - `buffer` - Growable byte buffer with book/ack cursors
//! - `state` - Connection keychain (connecting/processing/flushing/closing)
//! - `trigger` - Single-slot wake channel for blocking calls
//! - `error` - Error types
//! - `spinlock` - Internal spinlock primitive
//! - `env` - Environment variable utilities

pub mod buffer;
pub mod state;
pub mod trigger;
pub mod error;
pub mod spinlock;
pub mod env;

// Re-exports for convenience
pub use buffer::{Buffer, Outstanding};
pub use state::{CloseOwner, FlushState, Keychain};
pub use trigger::{Trigger, Wake};
pub use error::{Error, Result};
pub use spinlock::SpinLock;
pub use env::{env_get, env_get_duration_us, env_get_opt};

/// Constants shared across the workspace
pub mod constants {
    /// Initial capacity of a connection's input and output buffers
    pub const DEFAULT_BUFFER_SIZE: usize = 4096;

    /// Bytes booked for a single receive
    pub const DEFAULT_READ_SIZE: usize = 4096;

    /// Bytes of operator slots added per pool growth
    pub const OPERATOR_PAGE_SIZE: usize = 4096;
}
