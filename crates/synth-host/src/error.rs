//! Error taxonomy shared by the registry, the runner and the HTTP surface.

use std::io;
use std::path::PathBuf;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

pub type Result<T, E = SynthError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum SynthError {
    /// Malformed or missing request fields.
    #[error("{0}")]
    InvalidArgument(String),

    /// Unknown session id, or a missing file/directory target.
    #[error("{0}")]
    NotFound(String),

    /// The task could not be launched. Surfaced through the session stream,
    /// never as a request error once an id exists.
    #[error("failed to start task: {0}")]
    SpawnFailure(String),

    /// Reading task output failed mid-run.
    #[error("failed to read task output: {source}")]
    StreamIo {
        #[source]
        source: io::Error,
    },

    #[error("path traversal detected: {}", .0.display())]
    PathTraversal(PathBuf),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid JSON in {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl SynthError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    /// Wrap an I/O error on `path`, promoting `ENOENT` to `NotFound`.
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        let path = path.into();
        if source.kind() == io::ErrorKind::NotFound {
            return Self::NotFound(format!("not found: {}", path.display()));
        }
        Self::Io { path, source }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidArgument(_) | Self::PathTraversal(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::SpawnFailure(_) | Self::StreamIo { .. } | Self::Io { .. } | Self::Json { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for SynthError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
