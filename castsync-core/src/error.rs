//! Error types for the sync core.

use thiserror::Error;

/// Errors raised by the core's own bookkeeping.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoreError {
    #[error("sync session is not enabled")]
    NotEnabled,

    #[error("command was emitted before the session was enabled")]
    StaleCommand,

    #[error("command targets a playlist item that is not playing")]
    MismatchedItem,

    #[error("queue update is older than the last applied update")]
    StaleUpdate,

    #[error("missing {0} access")]
    AccessDenied(&'static str),

    #[error("invariant violated: {0}")]
    Invariant(&'static str),
}

/// Failures reported by a player capability.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlayerError {
    #[error("item cannot be seeked")]
    NotSeekable,

    #[error("player rejected the command: {0}")]
    Rejected(String),

    #[error("timed out waiting for player event")]
    Timeout,

    #[error("player is no longer bound")]
    Detached,
}

/// Failures reported by the transport capability.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("server is not reachable")]
    Unreachable,

    #[error("server error: {0}")]
    Api(String),

    #[error("request was cancelled")]
    Cancelled,
}
