//! Channel kinds and the tagged outcomes delivered to channel handlers
//!
//! Success, cancellation and failure are all routine results of
//! asynchronous I/O, so they travel as one enum instead of as errors.

use crate::error::IoError;

/// How a channel addresses its descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// Sequential byte stream (sockets, pipes). Offsets are ignored and
    /// operations complete in submission order.
    Stream,

    /// Random-access file. Every operation carries its own offset.
    RandomAccess,
}

/// One delivery to a channel read or write handler
///
/// A single operation may produce several `Success { done: false, .. }`
/// deliveries. It ends with exactly one terminal delivery: `Success` with
/// `done == true`, `Canceled`, or `Failure`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IoOutcome {
    /// Progress or completion.
    ///
    /// For reads `data` holds the bytes read since the previous delivery.
    /// For writes it holds the bytes still waiting to be written.
    Success { done: bool, data: Vec<u8> },

    /// The channel was closed while the operation was outstanding.
    /// `data` holds whatever had been buffered (reads) or not yet written
    /// (writes).
    Canceled { data: Vec<u8> },

    /// Descriptor error. The operation is over.
    Failure(IoError),
}

impl IoOutcome {
    /// True if no further delivery will follow for this operation
    #[inline]
    pub fn is_terminal(&self) -> bool {
        match self {
            IoOutcome::Success { done, .. } => *done,
            IoOutcome::Canceled { .. } | IoOutcome::Failure(_) => true,
        }
    }

    /// Bytes carried by the outcome, empty for failures
    pub fn data(&self) -> &[u8] {
        match self {
            IoOutcome::Success { data, .. } | IoOutcome::Canceled { data } => data,
            IoOutcome::Failure(_) => &[],
        }
    }

    /// Fold into a stream-level result: cancellation becomes an error
    pub fn into_result(self) -> Result<(bool, Vec<u8>), IoError> {
        match self {
            IoOutcome::Success { done, data } => Ok((done, data)),
            IoOutcome::Canceled { .. } => Err(IoError::Canceled),
            IoOutcome::Failure(e) => Err(e),
        }
    }
}

/// Delivered once to a channel's cleanup handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupOutcome {
    /// Closed cleanly (including the cancellation caused by `close()`)
    Success,

    /// Torn down by a descriptor error
    Failure(IoError),
}

impl CleanupOutcome {
    #[inline]
    pub fn is_success(&self) -> bool {
        matches!(self, CleanupOutcome::Success)
    }

    /// Map a close status to an outcome. Cancellation counts as success.
    pub fn from_error(error: Option<IoError>) -> Self {
        match error {
            None | Some(IoError::Canceled) => CleanupOutcome::Success,
            Some(e) => CleanupOutcome::Failure(e),
        }
    }
}
