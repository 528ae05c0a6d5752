//! ringnet echo server
//!
//! Echoes every newline-terminated line back to the client.
//!
//! Usage:
//!     cargo build --release -p ringnet-echo
//!     RUST_LOG=ringnet=debug ./target/release/ringnet-echo [addr] [num_loops]
//!
//! Test with:
//!     echo "hello" | nc -q1 localhost 9999
//!
//! Close stdin (Ctrl-D) to shut down gracefully.

use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use ringnet::{
    create_listener, default_num_loops, with_on_connect, with_read_timeout, Connection,
    EventLoop, RingConfig, RingManager,
};
use tracing::{error, info};

const DEFAULT_ADDR: &str = "127.0.0.1:9999";

fn echo(conn: &Connection) -> ringnet::Result<()> {
    let line = conn.read_until(b'\n')?;
    conn.write_bytes(&line)?;
    conn.flush()
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let addr = args.next().unwrap_or_else(|| DEFAULT_ADDR.to_string());
    let num_loops = args
        .next()
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(default_num_loops);

    let manager = match RingManager::new(num_loops, RingConfig::from_env()) {
        Ok(m) => m,
        Err(e) => {
            error!(error = %e, "echo: cannot start rings");
            std::process::exit(1);
        }
    };
    let listener = match create_listener("tcp", &addr) {
        Ok(l) => l,
        Err(e) => {
            error!(%addr, error = %e, "echo: cannot listen");
            std::process::exit(1);
        }
    };

    let evl = EventLoop::new(
        Arc::clone(&manager),
        echo,
        [
            with_read_timeout(Duration::from_secs(60)),
            with_on_connect(|conn| info!(conn = conn.id(), peer = ?conn.peer_addr(), "echo: connected")),
        ],
    );
    if let Err(e) = evl.serve_non_blocking(listener) {
        error!(error = %e, "echo: cannot serve");
        std::process::exit(1);
    }
    info!(%addr, num_loops, "echo: listening");

    // block until stdin closes
    let _ = std::io::stdin().read_to_end(&mut Vec::new());

    let drained = match evl.shutdown_timeout(Duration::from_secs(5)) {
        Ok(()) => true,
        Err(e) => {
            error!(error = %e, "echo: shutdown incomplete");
            false
        }
    };
    let rings = manager.rings();
    manager.shutdown();
    if drained {
        for ring in rings {
            ring.join();
        }
    }
    info!("echo: bye");
}
