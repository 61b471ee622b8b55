//! Refresh-token cookie: `refreshToken`, HttpOnly, SameSite=Lax, path `/`,
//! Secure in production, lifetime equal to the refresh token's.

use axum::http::{header, HeaderMap, HeaderValue};
use cookie::{Cookie, SameSite};

use crate::{
    config::AppConfig,
    error::{AppError, AppResult},
};

pub const REFRESH_COOKIE: &str = "refreshToken";

pub fn refresh_cookie(cfg: &AppConfig, token: &str) -> AppResult<HeaderValue> {
    let cookie = Cookie::build((REFRESH_COOKIE, token.to_owned()))
        .http_only(true)
        .secure(cfg.is_production())
        .same_site(SameSite::Lax)
        .path("/")
        .max_age(cookie::time::Duration::minutes(cfg.jwt.refresh_ttl_minutes))
        .build();
    to_header(cookie)
}

pub fn expired_refresh_cookie(cfg: &AppConfig) -> AppResult<HeaderValue> {
    let cookie = Cookie::build((REFRESH_COOKIE, ""))
        .http_only(true)
        .secure(cfg.is_production())
        .same_site(SameSite::Lax)
        .path("/")
        .max_age(cookie::time::Duration::ZERO)
        .build();
    to_header(cookie)
}

fn to_header(cookie: Cookie<'_>) -> AppResult<HeaderValue> {
    HeaderValue::from_str(&cookie.to_string())
        .map_err(|e| AppError::Internal(anyhow::anyhow!("cookie header: {e}")))
}

/// Reads the refresh token from the request's `Cookie` headers.
pub fn read_refresh_cookie(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|raw| Cookie::split_parse(raw.to_owned()))
        .filter_map(Result::ok)
        .find(|c| c.name() == REFRESH_COOKIE && !c.value().is_empty())
        .map(|c| c.value().to_owned())
}
