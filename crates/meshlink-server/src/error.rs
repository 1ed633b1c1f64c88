use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use meshlink_store::api::{
    ErrorBody, CODE_ACCESS_DENIED, CODE_INTERNAL, CODE_INVALID, CODE_PARTICIPANT_NOT_FOUND,
    CODE_RATE_LIMITED, CODE_SESSION_FULL, CODE_SESSION_NOT_FOUND,
};
use meshlink_store::StoreError;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Rate limit exceeded")]
    RateLimited,
}

impl ServerError {
    fn parts(&self) -> (StatusCode, &'static str, Option<usize>) {
        match self {
            ServerError::Store(e) => match e {
                StoreError::SessionNotFound(_) => (StatusCode::NOT_FOUND, CODE_SESSION_NOT_FOUND, None),
                StoreError::ParticipantNotFound { .. } => {
                    (StatusCode::NOT_FOUND, CODE_PARTICIPANT_NOT_FOUND, None)
                }
                StoreError::AccessDenied(_) => (StatusCode::FORBIDDEN, CODE_ACCESS_DENIED, None),
                StoreError::SessionFull { max, .. } => {
                    (StatusCode::CONFLICT, CODE_SESSION_FULL, Some(*max))
                }
                StoreError::Invalid(_) => (StatusCode::BAD_REQUEST, CODE_INVALID, None),
                StoreError::Unavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, CODE_INTERNAL, None),
            },
            ServerError::BadRequest(_) => (StatusCode::BAD_REQUEST, CODE_INVALID, None),
            ServerError::RateLimited => (StatusCode::TOO_MANY_REQUESTS, CODE_RATE_LIMITED, None),
        }
    }

    fn retryable(&self) -> bool {
        match self {
            ServerError::Store(e) => e.is_retryable(),
            ServerError::RateLimited => true,
            ServerError::BadRequest(_) => false,
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, code, limit) = self.parts();
        let body = ErrorBody {
            error: self.to_string(),
            code: code.to_string(),
            retryable: self.retryable(),
            limit,
        };

        (status, axum::Json(body)).into_response()
    }
}
