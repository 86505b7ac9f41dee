use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::orchestration::{ReplayError, ValuationError};

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Internal server error: {0}")]
    Internal(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Bad request: {0}")]
    BadRequest(String),
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<ReplayError> for AppError {
    fn from(err: ReplayError) -> Self {
        match err {
            ReplayError::PortfolioNotFound(id) => {
                AppError::NotFound(format!("portfolio {} not found", id))
            }
            ReplayError::EmptyLedger | ReplayError::InvalidRange { .. } => {
                AppError::BadRequest(err.to_string())
            }
            ReplayError::Store(_) => AppError::Internal(err.to_string()),
        }
    }
}

impl From<ValuationError> for AppError {
    fn from(err: ValuationError) -> Self {
        match err {
            ValuationError::Replay(inner) => inner.into(),
            ValuationError::Store(e) => e.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
        };

        let body = Json(json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}
