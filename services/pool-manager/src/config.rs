//! Configuration for the pool manager.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use poolkeeper_id::{SlotNamer, DEFAULT_SLOT_PREFIX};
use poolkeeper_retry::Backoff;

use crate::allocator::AllocatorConfig;
use crate::cleanup::CleanupConfig;
use crate::launcher::LaunchConfig;
use crate::monitor::MonitorConfig;

/// Pool manager configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of slots in the pool.
    pub capacity: u32,

    /// Prefix for slot names (`{prefix}-{n}`).
    pub slot_prefix: String,

    /// Data directory for the resource store.
    pub data_dir: String,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// How long an allocated but unlaunched name stays reserved.
    pub lease_ttl: Duration,

    pub allocator: AllocatorConfig,
    pub launch: LaunchConfig,
    pub monitor: MonitorConfig,
    pub cleanup: CleanupConfig,

    /// Listings a deleted resource stays visible in the simulated cluster.
    pub mock_termination_lists: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            capacity: 8,
            slot_prefix: DEFAULT_SLOT_PREFIX.to_string(),
            data_dir: "/var/lib/poolkeeper".to_string(),
            log_level: "info".to_string(),
            lease_ttl: Duration::from_secs(600),
            allocator: AllocatorConfig::default(),
            launch: LaunchConfig::default(),
            monitor: MonitorConfig::default(),
            cleanup: CleanupConfig::default(),
            mock_termination_lists: 2,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Unset or unparsable values fall back to their defaults.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let slot_prefix = std::env::var("POOLKEEPER_SLOT_PREFIX").unwrap_or(defaults.slot_prefix);
        SlotNamer::new(slot_prefix.as_str()).context("invalid POOLKEEPER_SLOT_PREFIX")?;

        let timeout_secs: u64 = env_or(
            "POOLKEEPER_ALLOCATE_TIMEOUT_SECS",
            defaults
                .allocator
                .timeout
                .map_or(0, |timeout| timeout.as_secs()),
        );

        let allocator = AllocatorConfig {
            poll_interval: Duration::from_millis(env_or(
                "POOLKEEPER_POLL_INTERVAL_MS",
                millis(defaults.allocator.poll_interval),
            )),
            timeout: (timeout_secs > 0).then(|| Duration::from_secs(timeout_secs)),
            max_query_failures: env_or(
                "POOLKEEPER_MAX_QUERY_FAILURES",
                defaults.allocator.max_query_failures,
            ),
        };

        let launch = LaunchConfig {
            max_attempts: env_or("POOLKEEPER_LAUNCH_ATTEMPTS", defaults.launch.max_attempts).max(1),
            backoff: Backoff {
                base: Duration::from_millis(env_or(
                    "POOLKEEPER_BACKOFF_BASE_MS",
                    millis(defaults.launch.backoff.base),
                )),
                max: Duration::from_millis(env_or(
                    "POOLKEEPER_BACKOFF_MAX_MS",
                    millis(defaults.launch.backoff.max),
                )),
                jitter: defaults.launch.backoff.jitter,
            },
        };

        let monitor = MonitorConfig {
            interval: Duration::from_secs(env_or(
                "POOLKEEPER_MONITOR_INTERVAL_SECS",
                defaults.monitor.interval.as_secs(),
            )),
        };

        let cleanup = CleanupConfig {
            interval: Duration::from_secs(env_or(
                "POOLKEEPER_CLEANUP_INTERVAL_SECS",
                defaults.cleanup.interval.as_secs(),
            )),
            ..defaults.cleanup
        };

        Ok(Self {
            capacity: env_or("POOLKEEPER_CAPACITY", defaults.capacity),
            slot_prefix,
            data_dir: std::env::var("POOLKEEPER_DATA_DIR").unwrap_or(defaults.data_dir),
            log_level: std::env::var("POOLKEEPER_LOG_LEVEL").unwrap_or(defaults.log_level),
            lease_ttl: Duration::from_secs(env_or(
                "POOLKEEPER_LEASE_TTL_SECS",
                defaults.lease_ttl.as_secs(),
            )),
            allocator,
            launch,
            monitor,
            cleanup,
            mock_termination_lists: env_or(
                "POOLKEEPER_MOCK_TERMINATION_TICKS",
                defaults.mock_termination_lists,
            ),
        })
    }

    /// Path of the SQLite resource store.
    pub fn store_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("pool.db")
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = Config::default();
        assert_eq!(config.capacity, 8);
        assert_eq!(config.slot_prefix, "slot");
        assert_eq!(config.launch.max_attempts, 3);
        assert_eq!(config.allocator.timeout, Some(Duration::from_secs(300)));
        assert_eq!(config.store_path(), PathBuf::from("/var/lib/poolkeeper/pool.db"));
    }

    #[test]
    fn test_env_or_falls_back_on_garbage() {
        std::env::set_var("POOLKEEPER_TEST_GARBAGE", "not-a-number");
        assert_eq!(env_or("POOLKEEPER_TEST_GARBAGE", 7u32), 7);
        std::env::set_var("POOLKEEPER_TEST_GARBAGE", " 12 ");
        assert_eq!(env_or("POOLKEEPER_TEST_GARBAGE", 7u32), 12);
        std::env::remove_var("POOLKEEPER_TEST_GARBAGE");
        assert_eq!(env_or("POOLKEEPER_TEST_GARBAGE", 7u32), 7);
    }
}
