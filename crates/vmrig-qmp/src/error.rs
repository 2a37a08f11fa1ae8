//! Error types for the protocol client.

use thiserror::Error;

use crate::transport::TransportError;
use crate::wire::ErrorPayload;

/// Errors raised by the protocol client and the job tracker.
#[derive(Debug, Error)]
pub enum QmpError {
    /// The greeting was malformed or advertised an unrecognized
    /// capability. The session is unusable; no retry.
    #[error("handshake failed: {message}")]
    Handshake {
        /// What was wrong with the greeting.
        message: String,
    },

    /// The peer answered a command with an error outcome.
    #[error("command failed: {0}")]
    Command(ErrorPayload),

    /// A background job aborted with a recorded failure reason.
    #[error("job '{id}' failed: {reason}")]
    JobFailed {
        /// Job id.
        id: String,
        /// Failure reason reported by the job list.
        reason: String,
    },

    /// The channel produced a frame that does not fit the protocol at
    /// this point; the stream is desynchronized.
    #[error("protocol violation: {message}")]
    Violation {
        /// Description of the offending frame.
        message: String,
    },

    /// Transport-level failure, including channel closure.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}
