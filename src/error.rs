//! Error taxonomy for remote calls and ticks.

use thiserror::Error;

/// Outcome tag of a failed remote call.
///
/// Only [`RemoteError::Transport`] is worth retrying. A rejection is a
/// well-formed answer from the venue and a malformed body may still hide
/// an accepted order, so neither is ever replayed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RemoteError {
    /// Network failure, timeout, or a gateway error with no venue payload
    #[error("transport failure: {0}")]
    Transport(String),

    /// Venue answered with `success = false`
    #[error("rejected by venue (code {code:?}): {message}")]
    Rejected { code: Option<i64>, message: String },

    /// 2xx response whose body could not be decoded
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl RemoteError {
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn rejected(code: Option<i64>, message: impl Into<String>) -> Self {
        Self::Rejected {
            code,
            message: message.into(),
        }
    }

    /// True for failures the retry wrapper may replay.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            RemoteError::Malformed(e.to_string())
        } else {
            RemoteError::Transport(e.to_string())
        }
    }
}

/// Errors that abort a whole tick.
#[derive(Error, Debug, Clone)]
pub enum EngineError {
    /// Leader snapshot could not be fetched; tracked state is left untouched
    #[error("leader snapshot fetch failed: {0}")]
    SnapshotFetch(#[source] RemoteError),
}

/// Delivery failure of a notification sink. Logged, never fatal.
#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("notification request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("notification rejected: {0}")]
    Rejected(String),
}
