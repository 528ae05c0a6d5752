//! Ring configuration
//!
//! Compile-time defaults with runtime environment overrides.
//!
//! ```rust,ignore
//! use ringnet_ring::RingConfig;
//!
//! // defaults with env overrides
//! let config = RingConfig::from_env();
//!
//! // or customize programmatically
//! let config = RingConfig::from_env()
//!     .sq_entries(4096)
//!     .batch_timeout(Duration::from_micros(200));
//! ```

use std::time::Duration;

use ringnet_core::env::{env_get, env_get_duration_us};

/// Library defaults
pub mod defaults {
    /// io_uring SQ entries per ring
    pub const SQ_ENTRIES: u32 = 1024;

    /// SQEs collected before a submit syscall
    pub const BATCH_SIZE: usize = 10;

    /// Longest a partial batch waits before it is submitted, in microseconds
    pub const BATCH_TIMEOUT_US: u64 = 1000;

    /// Rings started by default: one per twenty CPUs, plus one
    pub const CPUS_PER_LOOP: usize = 20;
}

/// Configuration shared by every ring a manager opens
#[derive(Debug, Clone)]
pub struct RingConfig {
    /// io_uring SQ size (rounded up to a power of two by the kernel)
    pub sq_entries: u32,
    /// Submit once this many SQEs are queued
    pub batch_size: usize,
    /// Submit a partial batch after this long
    pub batch_timeout: Duration,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl RingConfig {
    /// Defaults with environment overrides.
    ///
    /// - `RINGNET_SQ_ENTRIES`
    /// - `RINGNET_BATCH_SIZE`
    /// - `RINGNET_BATCH_TIMEOUT_US`
    pub fn from_env() -> Self {
        Self {
            sq_entries: env_get("RINGNET_SQ_ENTRIES", defaults::SQ_ENTRIES),
            batch_size: env_get("RINGNET_BATCH_SIZE", defaults::BATCH_SIZE),
            batch_timeout: env_get_duration_us(
                "RINGNET_BATCH_TIMEOUT_US",
                defaults::BATCH_TIMEOUT_US,
            ),
        }
    }

    pub fn sq_entries(mut self, n: u32) -> Self {
        self.sq_entries = n;
        self
    }

    pub fn batch_size(mut self, n: usize) -> Self {
        self.batch_size = n;
        self
    }

    pub fn batch_timeout(mut self, d: Duration) -> Self {
        self.batch_timeout = d;
        self
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        if self.sq_entries == 0 {
            return Err("sq_entries must be at least 1");
        }
        if self.batch_size == 0 {
            return Err("batch_size must be at least 1");
        }
        Ok(())
    }
}

/// Rings to start when the caller does not say: `RINGNET_NUM_LOOPS`, or
/// one per twenty CPUs plus one
pub fn default_num_loops() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    env_get("RINGNET_NUM_LOOPS", cpus / defaults::CPUS_PER_LOOP + 1).max(1)
}
