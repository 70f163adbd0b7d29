//! Error types for the stream and action API

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Result type for API operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for API operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A required query parameter or body field is absent or empty
    #[error("missing required parameter: {0}")]
    MissingParameter(&'static str),

    /// A parameter is present but unusable
    #[error("invalid parameter {name}: {reason}")]
    InvalidParameter {
        /// Parameter name
        name: &'static str,
        /// Why the value was rejected
        reason: String,
    },

    /// `since` is neither an RFC3339 timestamp nor a duration
    #[error("invalid timestamp {0:?}: expected RFC3339 or a duration such as 5m")]
    InvalidTimestamp(String),

    /// The pod has already completed and cannot run commands
    #[error("cannot exec into a container in a completed pod; current phase is {0}")]
    TargetNotExecutable(String),

    /// The addressed resource does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// The WebSocket transport failed
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// The remote exec or log stream failed
    #[error("remote stream error: {0}")]
    RemoteStream(String),

    /// A chart release action failed
    #[error(transparent)]
    Release(#[from] wharf_release::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal server error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// HTTP status used when the error is returned before a WebSocket upgrade
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::MissingParameter(_)
            | Error::InvalidParameter { .. }
            | Error::InvalidTimestamp(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Release(wharf_release::Error::NotFound(_)) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // K8s-style Status response
        let body = serde_json::json!({
            "kind": "Status",
            "apiVersion": "v1",
            "status": "Failure",
            "message": self.to_string(),
            "code": status.as_u16()
        });

        (status, axum::Json(body)).into_response()
    }
}

impl From<kube::Error> for Error {
    fn from(e: kube::Error) -> Self {
        match e {
            kube::Error::Api(ref resp) if resp.code == 404 => Error::NotFound(resp.message.clone()),
            other => Error::Internal(other.to_string()),
        }
    }
}
