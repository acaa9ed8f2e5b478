use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tickd_core::TickdError;

/// Carries an explicit 400 through the `anyhow::Error` chain for request
/// problems that never reach the core (malformed ids, bad query values).
#[derive(Debug)]
struct BadRequestError(String);

impl std::fmt::Display for BadRequestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for BadRequestError {}

// ---------------------------------------------------------------------------
// AppError: unified error type for HTTP responses
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl AppError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self(BadRequestError(msg.into()).into())
    }

    pub fn status(&self) -> StatusCode {
        if self.0.downcast_ref::<BadRequestError>().is_some() {
            return StatusCode::BAD_REQUEST;
        }
        match self.0.downcast_ref::<TickdError>() {
            Some(e) => match e {
                TickdError::ActionNotFound(_) => StatusCode::NOT_FOUND,
                TickdError::InvalidTransition { .. } => StatusCode::CONFLICT,
                TickdError::Config(_)
                | TickdError::InvalidActionType(_)
                | TickdError::InvalidMode(_) => StatusCode::BAD_REQUEST,
                TickdError::Store(_)
                | TickdError::Io(_)
                | TickdError::Yaml(_)
                | TickdError::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            None => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        }
        let body = serde_json::json!({ "error": self.0.to_string() });
        (status, axum::Json(body)).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
