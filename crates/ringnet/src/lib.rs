//! # ringnet: blocking-style TCP connections on io_uring
//!
//! Accepted sockets are spread over a [`RingManager`]'s rings. Each ring
//! receives into the connection's input buffer and sends out of its
//! output buffer; request handlers run on a per-connection processing
//! thread and use plain blocking calls (`read_until`, `read_bytes`,
//! `flush`) that park on a trigger instead of a syscall.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │   EventLoop: accept loop, live connections, shutdown      │
//! └──────────────────┬───────────────────────────────────────┘
//!                    │ Connection::open (round-robin ring)
//!                    ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │   Connection: input/output Buffer, Keychain, triggers     │
//! │   on_request thread ◄── read_trigger / write_trigger      │
//! └──────────────────┬───────────────────────────────────────┘
//!                    │ Operator::submit(Recv / Send)
//! ┌──────────────────▼───────────────────────────────────────┐
//! │   Ring: submission thread ─► io_uring ─► reaping thread   │
//! │   completions re-arm reads and continue flushes           │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use ringnet::{create_listener, EventLoop, RingManager};
//!
//! fn main() -> ringnet::Result<()> {
//!     let manager = RingManager::from_env()?;
//!     let evl = EventLoop::new(manager.clone(), |conn: &ringnet::Connection| {
//!         let line = conn.read_until(b'\n')?;
//!         conn.write_bytes(&line)?;
//!         conn.flush()
//!     }, []);
//!     evl.serve(create_listener("tcp", "127.0.0.1:7000")?)?;
//!     manager.shutdown();
//!     Ok(())
//! }
//! ```

pub mod callback;
pub mod connection;
pub mod eventloop;
pub mod net;
pub mod options;
mod reactor;

pub use callback::CloseCallback;
pub use connection::{Connection, Reader, Writer};
pub use eventloop::EventLoop;
pub use net::{create_listener, Listener, Network};
pub use options::{
    with_on_connect, with_read_size, with_read_timeout, with_write_timeout, LoopOption, OnConnect,
    OnRequest, Options,
};

pub use ringnet_core::{CloseOwner, Error, Result};
pub use ringnet_ring::{default_num_loops, RingConfig, RingManager};
