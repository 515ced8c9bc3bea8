//! HTTP error type: maps domain errors onto status codes and the shared JSON
//! error envelope.

use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use domain::{CoreError, ErrorKind};

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized", message)
    }
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorKind::Forbidden => StatusCode::FORBIDDEN,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::GenerationExhausted => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Store => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn code_for(e: &CoreError) -> &'static str {
    match e {
        CoreError::InvalidUrl(_) | CoreError::DisallowedScheme(_) | CoreError::SelfReferential => {
            "invalid_url"
        }
        CoreError::InvalidToken(_) => "invalid_token",
        CoreError::TokenTaken => "token_taken",
        CoreError::InvalidKeyName(_) => "invalid_key_name",
        CoreError::KeyNameTaken => "key_name_taken",
        CoreError::NoFieldsToUpdate => "no_fields_to_update",
        CoreError::RootKeyProtected => "root_key_protected",
        CoreError::MissingRootSecret => "bad_request",
        CoreError::NotFound => "not_found",
        CoreError::Unauthorized => "unauthorized",
        CoreError::Forbidden => "forbidden",
        CoreError::Conflict | CoreError::AlreadyExists => "conflict",
        CoreError::GenerationExhausted(_) => "unavailable",
        CoreError::InvalidRedirect | CoreError::Repository(_) => "internal",
    }
}

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        let status = status_for(e.kind());
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            // Store details stay in the logs.
            tracing::error!(err = ?e, "request failed");
            "Internal server error".to_string()
        } else {
            e.to_string()
        };
        Self::new(status, code_for(&e), message)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(format!("Invalid request body: {}", rejection.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(http_common::json_error_with_message(self.code, &self.message)),
        )
            .into_response()
    }
}
