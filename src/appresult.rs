use axum::{Json, http::StatusCode, response::{IntoResponse, Response}};
use serde_json::json;
use tracing::error;

use crate::error::LogError;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self.0.downcast_ref::<LogError>() {
            Some(LogError::InvalidArgument(_)) => StatusCode::BAD_REQUEST,
            Some(LogError::Storage(_) | LogError::Interrupted(_)) => StatusCode::SERVICE_UNAVAILABLE,
            Some(LogError::SubscriptionBroken { .. }) => StatusCode::GONE,
            None => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let retryable = self
            .0
            .downcast_ref::<LogError>()
            .is_some_and(LogError::is_retryable);

        if status.is_server_error() {
            error!(error = %self.0, backtrace = %self.0.backtrace(), "request failed");
        }

        (
            status,
            Json(json!({
                "error": self.0.to_string(),
                "retryable": retryable,
            })),
        )
            .into_response()
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
