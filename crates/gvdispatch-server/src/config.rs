//! Server configuration
//!
//! ```rust,ignore
//! use gvdispatch_server::ServerConfig;
//!
//! let config = ServerConfig::from_env().port(0).bind_addr(Ipv4Addr::LOCALHOST);
//! config.validate()?;
//! ```

use gvdispatch_core::env::{env_get, env_get_opt};
use gvdispatch_core::QosClass;
use gvdispatch_runtime::ConfigError;

use std::net::Ipv4Addr;

/// Library defaults
pub mod defaults {
    pub const PORT: u16 = 8080;
    pub const BACKLOG: i32 = 1024;
    /// Bytes one request may occupy before it is rejected
    pub const MAX_REQUEST_BYTES: usize = 1024 * 1024;
    /// Connections accepted per accept-queue turn before yielding
    pub const ACCEPT_BATCH: usize = 64;
    /// Pause after an accept failure before trying again
    pub const ACCEPT_BACKOFF_MS: u64 = 10;
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: Ipv4Addr,
    /// 0 picks an ephemeral port, see `local_port()`
    pub port: u16,
    pub backlog: i32,
    pub max_request_bytes: usize,
    /// QoS of the global queue connections run on
    pub qos: QosClass,
    pub accept_batch: usize,
    pub accept_backoff_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl ServerConfig {
    /// Defaults with environment overrides.
    ///
    /// - `GVD_BIND_ADDR` - IPv4 address to listen on
    /// - `GVD_PORT` - TCP port
    /// - `GVD_BACKLOG` - listen(2) backlog
    /// - `GVD_MAX_REQUEST_BYTES` - Largest accepted request
    /// - `GVD_ACCEPT_BATCH` - Accepts per turn of the accept queue
    pub fn from_env() -> Self {
        Self {
            bind_addr: env_get_opt("GVD_BIND_ADDR").unwrap_or(Ipv4Addr::UNSPECIFIED),
            port: env_get("GVD_PORT", defaults::PORT),
            backlog: env_get("GVD_BACKLOG", defaults::BACKLOG),
            max_request_bytes: env_get("GVD_MAX_REQUEST_BYTES", defaults::MAX_REQUEST_BYTES),
            qos: QosClass::UserInitiated,
            accept_batch: env_get("GVD_ACCEPT_BATCH", defaults::ACCEPT_BATCH),
            accept_backoff_ms: defaults::ACCEPT_BACKOFF_MS,
        }
    }

    /// Defaults only, no environment lookups
    pub fn new() -> Self {
        Self {
            bind_addr: Ipv4Addr::UNSPECIFIED,
            port: defaults::PORT,
            backlog: defaults::BACKLOG,
            max_request_bytes: defaults::MAX_REQUEST_BYTES,
            qos: QosClass::UserInitiated,
            accept_batch: defaults::ACCEPT_BATCH,
            accept_backoff_ms: defaults::ACCEPT_BACKOFF_MS,
        }
    }

    // Builder methods

    pub fn bind_addr(mut self, addr: Ipv4Addr) -> Self {
        self.bind_addr = addr;
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn backlog(mut self, backlog: i32) -> Self {
        self.backlog = backlog;
        self
    }

    pub fn max_request_bytes(mut self, n: usize) -> Self {
        self.max_request_bytes = n;
        self
    }

    pub fn qos(mut self, qos: QosClass) -> Self {
        self.qos = qos;
        self
    }

    pub fn accept_batch(mut self, n: usize) -> Self {
        self.accept_batch = n;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backlog <= 0 {
            return Err(ConfigError::InvalidValue("backlog must be > 0"));
        }
        if self.max_request_bytes == 0 {
            return Err(ConfigError::InvalidValue("max_request_bytes must be > 0"));
        }
        if self.accept_batch == 0 {
            return Err(ConfigError::InvalidValue("accept_batch must be > 0"));
        }
        Ok(())
    }
}
