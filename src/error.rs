//! Error taxonomy for conversation operations.

use thiserror::Error;

/// Errors surfaced through completion callbacks, the unhandled sink, or
/// directly from engine entry points.
///
/// `Display` renderings are stable; hosts match on them across the wire.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatError {
    /// The receive timer expired before the operation completed.
    #[error("timed out")]
    Timeout,

    /// The attempted operation requires an idle instance.
    #[error("AT busy")]
    Busy,

    /// `stop` (or an internal completion splice) found no live operation.
    #[error("AT not busy")]
    NotBusy,

    /// An ordered expectation saw a token its cursor spec rejects.
    #[error("expected {expected:?} but got {got:?}")]
    Mismatch { expected: String, got: String },

    /// An unordered expectation saw a token no remaining spec accepts.
    #[error("no match for data {got:?}")]
    NoMatch { got: String },

    /// A match spec could not be built from the given representation.
    #[error("cannot match against {kind} {repr:?}")]
    CannotMatch { kind: String, repr: String },

    /// A user handler reported failure.
    #[error("{0}")]
    Handler(String),

    /// The transport writer failed; propagates to the caller of `send`.
    #[error("transport error: {0}")]
    Transport(String),
}

impl ChatError {
    /// Wrap a user handler failure message.
    pub fn handler(msg: impl Into<String>) -> Self {
        ChatError::Handler(msg.into())
    }

    pub(crate) fn transport(err: std::io::Error) -> Self {
        ChatError::Transport(err.to_string())
    }
}
