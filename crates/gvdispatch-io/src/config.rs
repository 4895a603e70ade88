//! Reactor configuration

use gvdispatch_core::env::env_get;
use gvdispatch_runtime::ConfigError;
use std::time::Duration;

/// Library defaults
pub mod defaults {
    /// Upper bound on one `poll(2)` call; wakeups normally come from the eventfd
    pub const POLL_MS: u64 = 100;
    /// Syscalls issued per direction per channel in one reactor turn
    pub const SYSCALL_BUDGET: usize = 16;
}

#[derive(Debug, Clone)]
pub struct ReactorConfig {
    pub poll_timeout: Duration,
    pub syscall_budget: usize,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl ReactorConfig {
    /// Defaults with environment overrides.
    ///
    /// - `GVD_REACTOR_POLL_MS` - Longest single poll in milliseconds
    /// - `GVD_REACTOR_BUDGET` - Syscalls per channel per reactor turn
    pub fn from_env() -> Self {
        Self {
            poll_timeout: Duration::from_millis(env_get("GVD_REACTOR_POLL_MS", defaults::POLL_MS)),
            syscall_budget: env_get("GVD_REACTOR_BUDGET", defaults::SYSCALL_BUDGET),
        }
    }

    pub fn new() -> Self {
        Self {
            poll_timeout: Duration::from_millis(defaults::POLL_MS),
            syscall_budget: defaults::SYSCALL_BUDGET,
        }
    }

    pub fn poll_timeout(mut self, d: Duration) -> Self {
        self.poll_timeout = d;
        self
    }

    pub fn syscall_budget(mut self, n: usize) -> Self {
        self.syscall_budget = n;
        self
    }

    /// Poll timeout as the millisecond argument of `poll(2)`
    pub(crate) fn poll_timeout_ms(&self) -> i32 {
        self.poll_timeout.as_millis().min(i32::MAX as u128) as i32
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_timeout.is_zero() {
            return Err(ConfigError::InvalidValue("poll_timeout must be > 0"));
        }
        if self.syscall_budget == 0 {
            return Err(ConfigError::InvalidValue("syscall_budget must be > 0"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_valid() {
        let config = ReactorConfig::new();
        assert!(config.validate().is_ok());
        assert_eq!(config.poll_timeout_ms(), 100);
    }

    #[test]
    fn test_env_override() {
        std::env::set_var("GVD_REACTOR_POLL_MS", "7");
        let config = ReactorConfig::from_env();
        std::env::remove_var("GVD_REACTOR_POLL_MS");
        assert_eq!(config.poll_timeout, Duration::from_millis(7));
    }

    #[test]
    fn test_validation() {
        assert!(ReactorConfig::new().poll_timeout(Duration::ZERO).validate().is_err());
        assert!(ReactorConfig::new().syscall_budget(0).validate().is_err());
        assert_eq!(ReactorConfig::new().poll_timeout(Duration::from_secs(1)).poll_timeout_ms(), 1000);
    }
}
