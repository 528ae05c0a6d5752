//! Event loop options
//!
//! ```rust,ignore
//! let evl = EventLoop::new(manager, on_request, [
//!     with_read_timeout(Duration::from_secs(5)),
//!     with_on_connect(|conn| tracing::info!(conn = conn.id(), "hello")),
//! ]);
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use ringnet_core::constants::{DEFAULT_BUFFER_SIZE, DEFAULT_READ_SIZE};
use ringnet_core::env::env_get;
use ringnet_core::Result;

use crate::connection::Connection;

/// Request handler; runs on the connection's processing thread whenever
/// unread input is available
pub type OnRequest = Arc<dyn Fn(&Connection) -> Result<()> + Send + Sync>;

/// Runs once per connection before the first request
pub type OnConnect = Arc<dyn Fn(&Connection) + Send + Sync>;

/// Settings applied to every accepted connection
#[derive(Clone)]
pub struct Options {
    pub(crate) on_connect: Option<OnConnect>,
    pub(crate) read_timeout: Option<Duration>,
    pub(crate) write_timeout: Option<Duration>,
    /// Bytes booked per receive
    pub(crate) read_size: usize,
    /// Initial capacity of input and output buffers
    pub(crate) buffer_size: usize,
}

impl Default for Options {
    /// `RINGNET_READ_SIZE` and `RINGNET_BUFFER_SIZE` override the sizes
    fn default() -> Self {
        Options {
            on_connect: None,
            read_timeout: None,
            write_timeout: None,
            read_size: env_get("RINGNET_READ_SIZE", DEFAULT_READ_SIZE).max(1),
            buffer_size: env_get("RINGNET_BUFFER_SIZE", DEFAULT_BUFFER_SIZE).max(1),
        }
    }
}

impl Options {
    pub fn new<I: IntoIterator<Item = LoopOption>>(opts: I) -> Self {
        let mut options = Options::default();
        for opt in opts {
            (opt.apply)(&mut options);
        }
        options
    }

    pub fn read_size(&self) -> usize {
        self.read_size
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        self.write_timeout
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("on_connect", &self.on_connect.is_some())
            .field("read_timeout", &self.read_timeout)
            .field("write_timeout", &self.write_timeout)
            .field("read_size", &self.read_size)
            .field("buffer_size", &self.buffer_size)
            .finish()
    }
}

/// One functional option
pub struct LoopOption {
    apply: Box<dyn FnOnce(&mut Options) + Send>,
}

impl LoopOption {
    fn new(apply: impl FnOnce(&mut Options) + Send + 'static) -> Self {
        LoopOption {
            apply: Box::new(apply),
        }
    }
}

pub fn with_on_connect<F>(on_connect: F) -> LoopOption
where
    F: Fn(&Connection) + Send + Sync + 'static,
{
    let on_connect: OnConnect = Arc::new(on_connect);
    LoopOption::new(move |o| o.on_connect = Some(on_connect))
}

/// Zero means no timeout
pub fn with_read_timeout(timeout: Duration) -> LoopOption {
    LoopOption::new(move |o| o.read_timeout = non_zero(timeout))
}

/// Zero means no timeout
pub fn with_write_timeout(timeout: Duration) -> LoopOption {
    LoopOption::new(move |o| o.write_timeout = non_zero(timeout))
}

pub fn with_read_size(size: usize) -> LoopOption {
    LoopOption::new(move |o| o.read_size = size.max(1))
}

pub(crate) fn non_zero(d: Duration) -> Option<Duration> {
    (!d.is_zero()).then_some(d)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_apply_in_order() {
        let options = Options::new([
            with_read_size(512),
            with_read_timeout(Duration::from_millis(5)),
            with_read_size(1024),
            with_write_timeout(Duration::ZERO),
            with_on_connect(|_| {}),
        ]);
        assert_eq!(options.read_size(), 1024);
        assert_eq!(options.read_timeout(), Some(Duration::from_millis(5)));
        assert_eq!(options.write_timeout(), None);
        assert!(options.on_connect.is_some());
    }

    #[test]
    fn test_read_size_floor() {
        assert_eq!(Options::new([with_read_size(0)]).read_size(), 1);
    }
}
