//! Engine-error to HTTP mapping.
//!
//! 400 bad request data, 404 unknown swap, 409 state conflict, 503 for
//! transient chain trouble before the retry budget runs out, 500 for
//! permanent chain failures and invariant violations.

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use thiserror::Error;

use flowswap_core::EngineError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("forbidden")]
    Forbidden,

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::Engine(e) => match e {
                EngineError::UnknownSwap(_) => StatusCode::NOT_FOUND,
                EngineError::StateConflict(_) | EngineError::InvalidTransition { .. } => {
                    StatusCode::CONFLICT
                }
                EngineError::Inventory(_) => StatusCode::CONFLICT,
                EngineError::Chain { source, .. } if source.is_transient() => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        self.status()
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status()).json(json!({ "error": self.to_string() }))
    }
}
