//! Error types for the service.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Errors that can occur across the VM lifecycle and its HTTP surface.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The request carries a bad image id, template id or hostname.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The operation conflicts with current state (one VM per client,
    /// stop on an already-stopped VM, and so on).
    #[error("{0}")]
    Conflict(String),

    /// The requested VM id is unknown.
    #[error("not found: {0}")]
    NotFound(String),

    /// A host requirement is missing (external tool, /dev/kvm).
    #[error("preflight check failed: {0}")]
    Preflight(String),

    /// An external tool (wget, qemu-img, genisoimage, qemu, websockify)
    /// exited with an error. `detail` carries captured stderr or a log tail.
    #[error("{tool} failed: {detail}")]
    Tool { tool: &'static str, detail: String },

    /// QMP framing or command error.
    #[error("qmp: {0}")]
    Protocol(String),

    /// A bounded wait elapsed (pidfile appearance, QMP exchange).
    #[error("timed out: {0}")]
    Timeout(String),

    /// Invariant violation.
    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    fn status(&self) -> StatusCode {
        match self {
            Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Preflight(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Tool { .. }
            | Error::Protocol(_)
            | Error::Timeout(_)
            | Error::Internal(_)
            | Error::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

// Errors go out as plain text; successful reads are JSON.
impl IntoResponse for Error {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}
