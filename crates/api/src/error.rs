use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use dream_core::error::CoreError;
use dream_engine::EngineError;
use serde_json::json;

/// Application-level error type for HTTP handlers.
///
/// Wraps [`CoreError`] for request validation failures and [`EngineError`]
/// for pipeline failures. Implements [`IntoResponse`] to produce consistent
/// JSON error responses.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// A domain-level error from `dream_core`.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// A pipeline error from `dream_engine`.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// A bad request with a human-readable message.
    #[error("Bad request: {0}")]
    BadRequest(String),
}

/// Convenience type alias for handler return values.
pub type AppResult<T> = Result<T, AppError>;

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::Core(core) => match core {
                CoreError::Validation(msg) => {
                    (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone())
                }
                CoreError::Internal(msg) => {
                    tracing::error!(error = %msg, "Internal core error");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "INTERNAL_ERROR",
                        "An internal error occurred".to_string(),
                    )
                }
            },

            AppError::Engine(engine) => match engine {
                EngineError::QueueFull { capacity } => (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "QUEUE_FULL",
                    format!("Generation queue is full ({capacity} jobs waiting)"),
                ),
                EngineError::QueueClosed => (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "QUEUE_CLOSED",
                    "Generation service is shutting down".to_string(),
                ),
                other => {
                    tracing::error!(error = %other, "Engine error");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "INTERNAL_ERROR",
                        "An internal error occurred".to_string(),
                    )
                }
            },

            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
        };

        let body = json!({
            "error": message,
            "code": code,
        });

        (status, axum::Json(body)).into_response()
    }
}
