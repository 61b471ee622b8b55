//! Application error type shared by the auth and registration flows.

use axum::{
    extract::Request,
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("An account with this email already exists")]
    DuplicateEmail,

    /// Same message for unknown email, wrong password and federated-only accounts.
    #[error("Invalid email or password")]
    InvalidCredentials,

    #[error("Invalid Google token")]
    InvalidFederatedToken,

    #[error("This Google account is already linked to another user")]
    DuplicateGoogleAccount,

    #[error("Refresh token not found")]
    MissingToken,

    #[error("Invalid or expired token")]
    InvalidToken,

    #[error("Invalid refresh token")]
    TokenMismatch,

    #[error("Invalid or expired verification token")]
    InvalidVerificationToken,

    #[error("Invalid or expired reset token")]
    InvalidResetToken,

    #[error("{0}")]
    NotAuthenticated(&'static str),

    #[error("Admin access required")]
    Forbidden,

    #[error("{0}")]
    NotFound(&'static str),

    #[error("Course not found")]
    CourseNotFound,

    #[error("Course is full")]
    CourseFull,

    #[error("Already registered for this course")]
    AlreadyRegistered,

    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type AppResult<T> = Result<T, AppError>;

impl From<sqlx::Error> for AppError {
    fn from(e: sqlx::Error) -> Self {
        AppError::Internal(e.into())
    }
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::DuplicateEmail
            | AppError::DuplicateGoogleAccount
            | AppError::AlreadyRegistered => StatusCode::CONFLICT,
            AppError::InvalidCredentials
            | AppError::MissingToken
            | AppError::InvalidToken
            | AppError::TokenMismatch
            | AppError::NotAuthenticated(_) => StatusCode::UNAUTHORIZED,
            AppError::InvalidFederatedToken
            | AppError::InvalidVerificationToken
            | AppError::InvalidResetToken
            | AppError::CourseFull
            | AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Forbidden => StatusCode::FORBIDDEN,
            AppError::NotFound(_) | AppError::CourseNotFound => StatusCode::NOT_FOUND,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

/// Raw detail of an internal error, attached to the response so that
/// [`expose_internal_errors`] can surface it outside production.
#[derive(Debug, Clone)]
pub struct InternalDetail(pub String);

const GENERIC_INTERNAL: &str = "Internal server error";

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        match self {
            AppError::Internal(e) => {
                error!(error = ?e, "internal error");
                let mut res = (
                    status,
                    Json(ErrorBody {
                        error: GENERIC_INTERNAL.into(),
                    }),
                )
                    .into_response();
                res.extensions_mut().insert(InternalDetail(format!("{e:#}")));
                res
            }
            other => (
                status,
                Json(ErrorBody {
                    error: other.to_string(),
                }),
            )
                .into_response(),
        }
    }
}

/// Development-only layer: replaces the generic 500 body with the raw message.
pub async fn expose_internal_errors(req: Request, next: Next) -> Response {
    let res = next.run(req).await;
    match res.extensions().get::<InternalDetail>().cloned() {
        Some(InternalDetail(detail)) => {
            (res.status(), Json(ErrorBody { error: detail })).into_response()
        }
        None => res,
    }
}
