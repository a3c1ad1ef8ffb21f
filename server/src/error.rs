use axum::{
    extract::rejection::PathRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use miam_execution::{DrawError, RegistryError};
use miam_types::api::ErrorResponse;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("malformed request: {0}")]
    BadRequest(String),

    #[error("admin session missing or expired")]
    Unauthorized,

    #[error("incorrect password")]
    IncorrectPassword,

    #[error("admin access is not configured")]
    AdminDisabled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Registry(err) => match err {
                RegistryError::Validation(_) => (StatusCode::BAD_REQUEST, "validation_failed"),
                RegistryError::DuplicateEmail => (StatusCode::CONFLICT, "duplicate_email"),
                RegistryError::RegistrationClosed => (StatusCode::CONFLICT, "registration_closed"),
                RegistryError::UnknownParticipant(_) => (StatusCode::NOT_FOUND, "not_found"),
                RegistryError::RemovalAfterDraw => (StatusCode::CONFLICT, "removal_after_draw"),
                RegistryError::AlreadyDrawn => (StatusCode::CONFLICT, "already_drawn"),
                RegistryError::Draw(DrawError::TooFewParticipants { .. }) => {
                    (StatusCode::UNPROCESSABLE_ENTITY, "too_few_participants")
                }
                RegistryError::Draw(DrawError::DuplicateParticipant(_)) => {
                    (StatusCode::UNPROCESSABLE_ENTITY, "duplicate_participant")
                }
                RegistryError::Draw(DrawError::NoDerangement { .. }) => {
                    (StatusCode::UNPROCESSABLE_ENTITY, "draw_failed")
                }
            },
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized"),
            ApiError::IncorrectPassword => (StatusCode::UNAUTHORIZED, "incorrect_password"),
            ApiError::AdminDisabled => (StatusCode::FORBIDDEN, "admin_disabled"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        }
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::BadRequest(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        let body = ErrorResponse {
            error: code.to_string(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use miam_types::ValidationError;

    #[test]
    fn maps_registry_errors_to_statuses() {
        let cases = [
            (
                ApiError::from(RegistryError::Validation(ValidationError::InvalidEmail)),
                StatusCode::BAD_REQUEST,
            ),
            (
                ApiError::from(RegistryError::DuplicateEmail),
                StatusCode::CONFLICT,
            ),
            (
                ApiError::from(RegistryError::Draw(DrawError::NoDerangement { attempts: 100 })),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (ApiError::Unauthorized, StatusCode::UNAUTHORIZED),
            (
                ApiError::BadRequest("missing field `email`".to_string()),
                StatusCode::BAD_REQUEST,
            ),
            (ApiError::AdminDisabled, StatusCode::FORBIDDEN),
        ];
        for (err, expected) in cases {
            assert_eq!(err.into_response().status(), expected);
        }
    }

    #[test]
    fn message_comes_from_display() {
        let err = ApiError::from(RegistryError::Draw(DrawError::NoDerangement { attempts: 100 }));
        assert_eq!(
            err.to_string(),
            "could not generate valid assignments after 100 attempts"
        );
    }
}
