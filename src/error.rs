use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Wire-stable error kind, mirrored verbatim in `signal_error` frames.
///
/// These strings are part of the client contract — renaming one breaks
/// every client matching on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Unauthenticated,
    Forbidden,
    NotFound,
    Conflict,
    PayloadTooLarge,
    RateLimited,
    ValidationFailed,
    AlreadyInVoice,
    NotInVoice,
    UnknownAction,
    UnsupportedCodec,
    Timeout,
    UpstreamUnavailable,
    Internal,
}

/// Internal hub error. Converted to an `ErrorKind` + client-safe message at
/// the gateway boundary; never serialized directly to a client.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("unauthenticated")]
    Unauthenticated,

    #[error("forbidden")]
    Forbidden,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("payload too large: {0}")]
    PayloadTooLarge(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("validation failed: {0}")]
    ValidationFailed(String),

    #[error("already in voice")]
    AlreadyInVoice,

    #[error("not in voice")]
    NotInVoice,

    #[error("unknown action: {0}")]
    UnknownAction(String),

    #[error("unsupported codec: {0}")]
    UnsupportedCodec(String),

    #[error("request timed out")]
    Timeout,

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl HubError {
    /// Classify into the wire-stable (kind, message) pair. Internal details
    /// are logged by the caller, never echoed to the client.
    pub fn as_wire(&self) -> (ErrorKind, String) {
        match self {
            HubError::Unauthenticated => (ErrorKind::Unauthenticated, "not authenticated".into()),
            HubError::Forbidden => (ErrorKind::Forbidden, "forbidden".into()),
            HubError::NotFound(m) => (ErrorKind::NotFound, m.clone()),
            HubError::Conflict(m) => (ErrorKind::Conflict, m.clone()),
            HubError::PayloadTooLarge(m) => (ErrorKind::PayloadTooLarge, m.clone()),
            HubError::RateLimited(m) => (ErrorKind::RateLimited, m.clone()),
            HubError::ValidationFailed(m) => (ErrorKind::ValidationFailed, m.clone()),
            HubError::AlreadyInVoice => (ErrorKind::AlreadyInVoice, "already in voice".into()),
            HubError::NotInVoice => (ErrorKind::NotInVoice, "not in voice".into()),
            HubError::UnknownAction(m) => (ErrorKind::UnknownAction, m.clone()),
            HubError::UnsupportedCodec(m) => (ErrorKind::UnsupportedCodec, m.clone()),
            HubError::Timeout => (ErrorKind::Timeout, "request timed out".into()),
            HubError::UpstreamUnavailable(m) => (ErrorKind::UpstreamUnavailable, m.clone()),
            HubError::Internal(e) => {
                tracing::error!(error = ?e, "internal hub error");
                (ErrorKind::Internal, "internal error".into())
            }
        }
    }

    /// Whether this error, if it cannot be bound to a `request_id`, is severe
    /// enough protocol misuse to close the connection (close code 4002).
    pub fn is_protocol_fatal(&self) -> bool {
        matches!(self, HubError::UnknownAction(_) | HubError::ValidationFailed(_))
    }
}

pub type HubResult<T> = Result<T, HubError>;
