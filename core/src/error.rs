//! Error types for the TaskFlow client core.
//!
//! # Design
//! A single enum covers the three failure families the containers surface:
//! authentication failures from the auth endpoints (`Auth`), the local
//! "no identity" precondition (`NotAuthenticated`, raised before any network
//! call), and remote data failures (`Database`, `NotFound`, `HttpError`,
//! `Transport`). Remote messages are carried verbatim. Nothing here is
//! retried or treated as fatal.

use thiserror::Error;

/// Errors returned by the client, the remote service and the state containers.
#[derive(Debug, Error)]
pub enum ApiError {
    /// An operation that needs a signed-in user was called without one.
    #[error("user not authenticated")]
    NotAuthenticated,

    /// The auth service rejected the request (bad credentials, duplicate
    /// account, revoked session).
    #[error("auth error ({status}): {message}")]
    Auth { status: u16, message: String },

    /// The data API returned a structured error (constraint or row-level
    /// security violation).
    #[error("database error ({status}, {code}): {message}")]
    Database {
        status: u16,
        code: String,
        message: String,
    },

    /// The server returned 404.
    #[error("resource not found")]
    NotFound,

    /// The server returned a non-2xx status with an unrecognised body.
    #[error("HTTP {status}: {body}")]
    HttpError { status: u16, body: String },

    /// The request never produced a response.
    #[error("transport failed: {0}")]
    Transport(String),

    /// The response body could not be deserialized into the expected type.
    #[error("deserialization failed: {0}")]
    DeserializationError(String),

    /// The request payload could not be serialized to JSON.
    #[error("serialization failed: {0}")]
    SerializationError(String),

    /// Input rejected locally before any network call.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The durable key-value store failed.
    #[error("storage error: {0}")]
    Storage(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl ApiError {
    /// HTTP status carried by the error, if it came from a response.
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Auth { status, .. }
            | ApiError::Database { status, .. }
            | ApiError::HttpError { status, .. } => Some(*status),
            ApiError::NotFound => Some(404),
            _ => None,
        }
    }

    /// True when the remote side reported the caller's session as invalid.
    pub fn is_unauthorized(&self) -> bool {
        self.status() == Some(401)
    }
}
