//! Error types for chatsync.

use thiserror::Error;

/// Code reported for failures that carry no backend error code.
pub const GENERIC_ERROR_CODE: i64 = 0;

/// Errors surfaced by chatsync operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatError {
    /// Operation attempted before the required synchronization status.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Channel, member or message does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The backend refused the request.
    #[error("backend rejected request ({code}): {message}")]
    BackendRejected {
        /// Backend error code.
        code: i64,
        /// Backend error message.
        message: String,
    },

    /// The transport collaborator failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// Unclassified local failure.
    #[error("{0}")]
    Generic(String),
}

impl ChatError {
    /// The backend error code, or [`GENERIC_ERROR_CODE`] for local failures.
    pub fn code(&self) -> i64 {
        match self {
            ChatError::BackendRejected { code, .. } => *code,
            _ => GENERIC_ERROR_CODE,
        }
    }
}
