//! Error types for channel and stream I/O

use core::fmt;
use nix::errno::Errno;

/// Result type for stream-level operations
pub type IoResult<T> = Result<T, IoError>;

/// Errors surfaced by channels and streams
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoError {
    /// Descriptor-level failure, translated from the OS error code
    Os(Errno),

    /// Operation terminated by an explicit close
    Canceled,

    /// Channel was already closed when the operation was submitted
    Closed,
}

impl IoError {
    /// Build from a raw errno value. `ECANCELED` maps to `Canceled`.
    pub fn from_raw(errno: i32) -> Self {
        match Errno::from_raw(errno) {
            Errno::ECANCELED => IoError::Canceled,
            e => IoError::Os(e),
        }
    }

    /// Capture the calling thread's last OS error
    pub fn last_os_error() -> Self {
        IoError::from_raw(Errno::last_raw())
    }

    /// Raw errno for this error
    pub fn raw_os_error(&self) -> i32 {
        match self {
            IoError::Os(e) => *e as i32,
            IoError::Canceled => Errno::ECANCELED as i32,
            IoError::Closed => Errno::EBADF as i32,
        }
    }

    /// True for the cancellation produced by `close()`
    #[inline]
    pub fn is_canceled(&self) -> bool {
        matches!(self, IoError::Canceled)
    }
}

impl fmt::Display for IoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoError::Os(e) => write!(f, "os error: {} ({})", e.desc(), *e as i32),
            IoError::Canceled => write!(f, "operation canceled"),
            IoError::Closed => write!(f, "channel closed"),
        }
    }
}

impl std::error::Error for IoError {}

impl From<Errno> for IoError {
    fn from(e: Errno) -> Self {
        IoError::from_raw(e as i32)
    }
}

impl From<std::io::Error> for IoError {
    fn from(e: std::io::Error) -> Self {
        IoError::from_raw(e.raw_os_error().unwrap_or(Errno::EIO as i32))
    }
}

impl From<IoError> for std::io::Error {
    fn from(e: IoError) -> Self {
        std::io::Error::from_raw_os_error(e.raw_os_error())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_raw() {
        assert_eq!(IoError::from_raw(Errno::ECANCELED as i32), IoError::Canceled);
        assert_eq!(IoError::from_raw(Errno::EPIPE as i32), IoError::Os(Errno::EPIPE));
    }

    #[test]
    fn test_error_display() {
        assert_eq!(format!("{}", IoError::Canceled), "operation canceled");
        let e = IoError::Os(Errno::ECONNRESET);
        assert!(format!("{}", e).starts_with("os error: "));
    }

    #[test]
    fn test_into_std_io_error() {
        let e: std::io::Error = IoError::Os(Errno::EPIPE).into();
        assert_eq!(e.raw_os_error(), Some(Errno::EPIPE as i32));

        let back: IoError = e.into();
        assert_eq!(back, IoError::Os(Errno::EPIPE));
        let custom: IoError = std::io::Error::new(std::io::ErrorKind::Other, "x").into();
        assert_eq!(custom, IoError::Os(Errno::EIO));
    }
}
