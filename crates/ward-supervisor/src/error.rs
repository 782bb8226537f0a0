use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

use ward_types::control::ErrorBody;

/// Failures that cross the control boundary. Everything else is either
/// recovered in place or wrapped in `Internal`.
#[derive(Debug, Error)]
pub enum WardenError {
    #[error("Unauthorized")]
    Unauthorized,

    #[error("A gateway restart is already in progress")]
    RestartInProgress,

    #[error("Gateway launch failed: {0}")]
    GatewayLaunchFailed(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Process discovery failed: {0}")]
    Discovery(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl WardenError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::RestartInProgress => StatusCode::CONFLICT,
            Self::SessionNotFound(_) => StatusCode::NOT_FOUND,
            Self::GatewayLaunchFailed(_) | Self::Discovery(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Message shown to API callers. Auth and lookup failures carry no detail.
    pub fn public_message(&self) -> String {
        match self {
            Self::Unauthorized => "Unauthorized".to_string(),
            Self::SessionNotFound(_) => "Session not found".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for WardenError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("Control request failed: {self:#}");
        }
        (status, Json(ErrorBody { error: self.public_message() })).into_response()
    }
}

pub type WardenResult<T> = std::result::Result<T, WardenError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes() {
        assert_eq!(WardenError::Unauthorized.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(WardenError::RestartInProgress.status_code(), StatusCode::CONFLICT);
        assert_eq!(
            WardenError::SessionNotFound("k".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            WardenError::GatewayLaunchFailed("port in use".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn session_key_is_not_echoed() {
        let err = WardenError::SessionNotFound("agent:main:secret".into());
        assert_eq!(err.public_message(), "Session not found");
    }

    #[test]
    fn launch_failure_keeps_detail() {
        let err = WardenError::GatewayLaunchFailed("address in use".into());
        assert!(err.public_message().contains("address in use"));
    }
}
