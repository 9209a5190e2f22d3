use thiserror::Error;

use crate::peer::chunk::ChunkError;

/// Failures surfaced by [`crate::VaultConnection`] and its channels.
///
/// `AuthenticationFailed`, `ServiceUnreachable` and `ConnectionFailed` end a
/// `connect` call. `RequestTimeout`, `NotConnected` and `Transport` only fail
/// the request they belong to; the session stays up.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("authentication failed")]
    AuthenticationFailed,
    #[error("connection service unreachable: {0}")]
    ServiceUnreachable(String),
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("request '{cmd}' timed out")]
    RequestTimeout { cmd: String },
    #[error("not connected")]
    NotConnected,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("no vault selected")]
    MissingVault,
    #[error("signaling error: {0}")]
    Signaling(String),
    #[error("peer engine error: {0}")]
    Engine(String),
    #[error("reassembly error: {0}")]
    Chunk(#[from] ChunkError),
    #[error("config error: {0}")]
    Config(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type LinkResult<T> = Result<T, LinkError>;

impl LinkError {
    /// True for failures that only affect a single request.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            LinkError::RequestTimeout { .. } | LinkError::NotConnected | LinkError::Transport(_)
        )
    }
}

pub(crate) fn to_engine_error(err: impl std::error::Error) -> LinkError {
    LinkError::Engine(err.to_string())
}

pub(crate) fn to_signaling_error(err: impl std::error::Error) -> LinkError {
    LinkError::Signaling(err.to_string())
}
