//! Environment variable overrides
//!
//! Every tunable in ringnet has a compile-time default and an optional
//! `RINGNET_*` environment override, read through these helpers.
//!
//! ```ignore
//! use ringnet_core::env::{env_get, env_get_duration_us};
//!
//! let loops: usize = env_get("RINGNET_NUM_LOOPS", 1);
//! let idle = env_get_duration_us("RINGNET_BATCH_TIMEOUT_US", 1000);
//! ```

use std::str::FromStr;
use std::time::Duration;

/// Parse `key` as `T`, falling back to `default` when unset or malformed
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// Parse `key` as `T` if it is set and well-formed
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Duration given in microseconds
#[inline]
pub fn env_get_duration_us(key: &str, default_us: u64) -> Duration {
    Duration::from_micros(env_get(key, default_us))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unset_uses_default() {
        let val: usize = env_get("__RINGNET_TEST_UNSET__", 42);
        assert_eq!(val, 42);
        assert!(env_get_opt::<u32>("__RINGNET_TEST_UNSET__").is_none());
    }

    #[test]
    fn test_parse_and_fallback() {
        std::env::set_var("__RINGNET_TEST_LOOPS__", " 8 ");
        let loops: usize = env_get("__RINGNET_TEST_LOOPS__", 1);
        assert_eq!(loops, 8);

        std::env::set_var("__RINGNET_TEST_LOOPS__", "eight");
        let loops: usize = env_get("__RINGNET_TEST_LOOPS__", 1);
        assert_eq!(loops, 1);
        std::env::remove_var("__RINGNET_TEST_LOOPS__");
    }

    #[test]
    fn test_durations() {
        assert_eq!(
            env_get_duration_us("__RINGNET_TEST_US__", 1000),
            Duration::from_millis(1)
        );

        std::env::set_var("__RINGNET_TEST_US__", "250");
        assert_eq!(
            env_get_duration_us("__RINGNET_TEST_US__", 1000),
            Duration::from_micros(250)
        );
        std::env::remove_var("__RINGNET_TEST_US__");
    }
}
