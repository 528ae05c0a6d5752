//! # ringnet-ring: io_uring rings and their manager
//!
//! One [`Ring`] owns one io_uring instance and two threads:
//!
//! - a **submission** thread that drains a lock-free request queue, turns
//!   requests into SQEs and calls `io_uring_enter` once per batch;
//! - a **reaping** thread that blocks for completions, decodes
//!   `user_data` back to `(event, fd)` and dispatches to the registered
//!   [`Operator`]'s handler.
//!
//! The [`RingManager`] shards connections across rings with a
//! round-robin [`LoadBalance`].
//!
//! ## Components
//!
//! | Module           | Role                                      |
//! |------------------|-------------------------------------------|
//! | `config`         | `RingConfig` with env overrides           |
//! | `event`          | `RingEvent`, `user_data` codec, requests  |
//! | `operator`       | per-fd interest + handler trait           |
//! | `operator_cache` | bulk-growing operator free list           |
//! | `ring`           | the ring and its two threads              |
//! | `balance`        | `LoadBalance` trait, `RoundRobin`         |
//! | `manager`        | `RingManager` lifecycle                   |

pub mod balance;
pub mod config;

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        pub mod event;
        pub mod operator;
        pub mod operator_cache;
        pub mod ring;
        pub mod manager;

        pub use event::{RingEvent, RingRequest};
        pub use operator::{Operator, OperatorHandler};
        pub use operator_cache::OperatorCache;
        pub use ring::{on_ring_thread, Ring, RingState};
        pub use manager::RingManager;
    } else {
        compile_error!("ringnet-ring requires Linux io_uring");
    }
}

pub use balance::{LoadBalance, RoundRobin};
pub use config::{default_num_loops, RingConfig};
