//! Server error type

use core::fmt;

use gvdispatch_core::IoError;
use gvdispatch_runtime::ConfigError;

/// Errors seen by the server, per connection or in the accept loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerError {
    /// Stream or channel failure on a connection
    Io(IoError),

    /// Request bytes the parser rejected
    Parse(&'static str),

    /// Error returned by a fallible responder, or a responder panic
    Responder(String),

    /// Accepting a connection failed
    Accept(IoError),

    /// Invalid server configuration
    Config(ConfigError),
}

impl ServerError {
    /// True for errors that belong to one connection's request cycle
    pub fn is_connection_error(&self) -> bool {
        matches!(self, ServerError::Io(_) | ServerError::Parse(_) | ServerError::Responder(_))
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::Io(e) => write!(f, "connection i/o: {}", e),
            ServerError::Parse(msg) => write!(f, "bad request: {}", msg),
            ServerError::Responder(msg) => write!(f, "responder failed: {}", msg),
            ServerError::Accept(e) => write!(f, "accept: {}", e),
            ServerError::Config(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Io(e) | ServerError::Accept(e) => Some(e),
            ServerError::Config(e) => Some(e),
            _ => None,
        }
    }
}

impl From<IoError> for ServerError {
    fn from(e: IoError) -> Self {
        ServerError::Io(e)
    }
}

impl From<ConfigError> for ServerError {
    fn from(e: ConfigError) -> Self {
        ServerError::Config(e)
    }
}
