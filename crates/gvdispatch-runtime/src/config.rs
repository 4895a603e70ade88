//! Runtime configuration
//!
//! Library defaults with runtime environment overrides (environment wins).
//!
//! ```rust,ignore
//! use gvdispatch_runtime::RuntimeConfig;
//!
//! let config = RuntimeConfig::from_env().num_workers(8);
//! gvdispatch_runtime::init(config)?;
//! ```

use gvdispatch_core::env::env_get;
use std::time::Duration;

/// Library defaults
pub mod defaults {
    /// 0 means "one per available CPU"
    pub const NUM_WORKERS: usize = 0;
    pub const MAX_WORKERS: usize = 256;
    pub const IDLE_SPINS: u32 = 64;
    pub const PARK_TIMEOUT_MS: u64 = 10;
    pub const TIMER_MAX_POLL_MS: u64 = 50;
    pub const WORKER_STACK_SIZE: usize = 2 * 1024 * 1024;
    /// Serial queue tasks run per pool turn before yielding the worker
    pub const SERIAL_BATCH: usize = 16;
}

/// Worker pool configuration with builder pattern.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Number of worker threads
    pub num_workers: usize,
    /// Spins before a worker parks
    pub idle_spins: u32,
    /// Upper bound on a single park
    pub park_timeout: Duration,
    /// Longest the timer thread sleeps without re-checking its heap
    pub timer_max_poll: Duration,
    /// Stack size of worker threads
    pub worker_stack_size: usize,
    /// Serial queue tasks run per pool turn
    pub serial_batch: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

fn cpu_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl RuntimeConfig {
    /// Defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `GVD_NUM_WORKERS` - Number of worker threads (0 = CPU count)
    /// - `GVD_IDLE_SPINS` - Spins before parking
    /// - `GVD_PARK_TIMEOUT_MS` - Park timeout in milliseconds
    /// - `GVD_TIMER_MAX_POLL_MS` - Timer thread max sleep in milliseconds
    /// - `GVD_WORKER_STACK_SIZE` - Worker stack size in bytes
    /// - `GVD_SERIAL_BATCH` - Serial tasks per pool turn
    pub fn from_env() -> Self {
        let num_workers = match env_get("GVD_NUM_WORKERS", defaults::NUM_WORKERS) {
            0 => cpu_count().max(2),
            n => n,
        };
        Self {
            num_workers,
            idle_spins: env_get("GVD_IDLE_SPINS", defaults::IDLE_SPINS),
            park_timeout: Duration::from_millis(env_get(
                "GVD_PARK_TIMEOUT_MS",
                defaults::PARK_TIMEOUT_MS,
            )),
            timer_max_poll: Duration::from_millis(env_get(
                "GVD_TIMER_MAX_POLL_MS",
                defaults::TIMER_MAX_POLL_MS,
            )),
            worker_stack_size: env_get("GVD_WORKER_STACK_SIZE", defaults::WORKER_STACK_SIZE),
            serial_batch: env_get("GVD_SERIAL_BATCH", defaults::SERIAL_BATCH),
        }
    }

    /// Defaults only, no environment lookups
    pub fn new() -> Self {
        Self {
            num_workers: cpu_count().max(2),
            idle_spins: defaults::IDLE_SPINS,
            park_timeout: Duration::from_millis(defaults::PARK_TIMEOUT_MS),
            timer_max_poll: Duration::from_millis(defaults::TIMER_MAX_POLL_MS),
            worker_stack_size: defaults::WORKER_STACK_SIZE,
            serial_batch: defaults::SERIAL_BATCH,
        }
    }

    // Builder methods

    pub fn num_workers(mut self, n: usize) -> Self {
        self.num_workers = n;
        self
    }

    pub fn idle_spins(mut self, spins: u32) -> Self {
        self.idle_spins = spins;
        self
    }

    pub fn park_timeout(mut self, d: Duration) -> Self {
        self.park_timeout = d;
        self
    }

    pub fn timer_max_poll(mut self, d: Duration) -> Self {
        self.timer_max_poll = d;
        self
    }

    pub fn worker_stack_size(mut self, size: usize) -> Self {
        self.worker_stack_size = size;
        self
    }

    pub fn serial_batch(mut self, n: usize) -> Self {
        self.serial_batch = n;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_workers == 0 {
            return Err(ConfigError::InvalidValue("num_workers must be > 0"));
        }
        if self.num_workers > defaults::MAX_WORKERS {
            return Err(ConfigError::InvalidValue("num_workers must be <= 256"));
        }
        if self.park_timeout.is_zero() {
            return Err(ConfigError::InvalidValue("park_timeout must be > 0"));
        }
        if self.timer_max_poll.is_zero() {
            return Err(ConfigError::InvalidValue("timer_max_poll must be > 0"));
        }
        if self.worker_stack_size < 64 * 1024 {
            return Err(ConfigError::InvalidValue("worker_stack_size must be >= 64KB"));
        }
        if self.serial_batch == 0 {
            return Err(ConfigError::InvalidValue("serial_batch must be > 0"));
        }
        Ok(())
    }
}

/// Configuration error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    InvalidValue(&'static str),
    /// The worker pool was already started
    AlreadyInitialized,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidValue(msg) => write!(f, "invalid config: {}", msg),
            ConfigError::AlreadyInitialized => write!(f, "runtime already initialized"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_env() {
        let config = RuntimeConfig::from_env();
        assert!(config.num_workers >= 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_override() {
        std::env::set_var("GVD_SERIAL_BATCH", "3");
        let config = RuntimeConfig::from_env();
        std::env::remove_var("GVD_SERIAL_BATCH");
        assert_eq!(config.serial_batch, 3);
    }

    #[test]
    fn test_builder() {
        let config = RuntimeConfig::new()
            .num_workers(8)
            .park_timeout(Duration::from_millis(5))
            .idle_spins(0);

        assert_eq!(config.num_workers, 8);
        assert_eq!(config.park_timeout, Duration::from_millis(5));
        assert_eq!(config.idle_spins, 0);
    }

    #[test]
    fn test_validation() {
        assert!(RuntimeConfig::new().num_workers(0).validate().is_err());
        assert!(RuntimeConfig::new().num_workers(1000).validate().is_err());
        assert!(RuntimeConfig::new().worker_stack_size(1024).validate().is_err());
        assert_eq!(
            RuntimeConfig::new().serial_batch(0).validate(),
            Err(ConfigError::InvalidValue("serial_batch must be > 0"))
        );
    }
}
