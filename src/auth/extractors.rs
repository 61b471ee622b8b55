use async_trait::async_trait;
use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts},
};

use super::{claims::TokenPayload, repo_types::Role};
use crate::{error::AppError, state::AppState};

/// Extracts and validates the access token, yielding the caller's identity.
#[derive(Debug, Clone, Copy)]
pub struct AuthUser(pub TokenPayload);

#[async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        // Expect "Bearer <token>"
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|h| h.to_str().ok())
            .and_then(|auth| {
                auth.strip_prefix("Bearer ")
                    .or_else(|| auth.strip_prefix("bearer "))
            })
            .filter(|t| !t.is_empty())
            .ok_or(AppError::NotAuthenticated("Access token required"))?;

        let claims = state.jwt.verify_access(token)?;
        Ok(AuthUser(claims.payload()))
    }
}

/// Like [`AuthUser`], but only for tokens carrying the ADMIN role.
#[derive(Debug, Clone, Copy)]
pub struct AdminUser(pub TokenPayload);

#[async_trait]
impl FromRequestParts<AppState> for AdminUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let AuthUser(payload) = AuthUser::from_request_parts(parts, state).await?;
        if payload.role != Role::Admin {
            return Err(AppError::Forbidden);
        }
        Ok(AdminUser(payload))
    }
}

#[cfg(test)]
mod tests {
    use axum::http::Request;
    use uuid::Uuid;

    use super::*;

    fn parts_with(auth: Option<&str>) -> Parts {
        let mut builder = Request::builder().uri("/");
        if let Some(value) = auth {
            builder = builder.header(AUTHORIZATION, value);
        }
        builder.body(()).unwrap().into_parts().0
    }

    fn token(state: &AppState, role: Role) -> String {
        state
            .jwt
            .sign_access(TokenPayload {
                user_id: Uuid::new_v4(),
                role,
            })
            .unwrap()
    }

    #[tokio::test]
    async fn missing_or_malformed_header_is_unauthenticated() {
        let state = AppState::fake();
        for header in [None, Some("Basic abc"), Some("Bearer ")] {
            let mut parts = parts_with(header);
            let err = AuthUser::from_request_parts(&mut parts, &state)
                .await
                .unwrap_err();
            assert!(matches!(err, AppError::NotAuthenticated(_)), "{header:?}");
        }
    }

    #[tokio::test]
    async fn bad_token_is_invalid() {
        let state = AppState::fake();
        let refresh = state
            .jwt
            .sign_refresh(TokenPayload {
                user_id: Uuid::new_v4(),
                role: Role::User,
            })
            .unwrap();
        for t in ["nope".to_owned(), refresh] {
            let mut parts = parts_with(Some(&format!("Bearer {t}")));
            let err = AuthUser::from_request_parts(&mut parts, &state)
                .await
                .unwrap_err();
            assert!(matches!(err, AppError::InvalidToken));
        }
    }

    #[tokio::test]
    async fn admin_requires_admin_role() {
        let state = AppState::fake();

        let mut parts = parts_with(Some(&format!("Bearer {}", token(&state, Role::User))));
        AuthUser::from_request_parts(&mut parts, &state).await.unwrap();
        let err = AdminUser::from_request_parts(&mut parts, &state)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Forbidden));

        let mut parts = parts_with(Some(&format!("Bearer {}", token(&state, Role::Admin))));
        let AdminUser(payload) = AdminUser::from_request_parts(&mut parts, &state)
            .await
            .unwrap();
        assert_eq!(payload.role, Role::Admin);
    }
}
