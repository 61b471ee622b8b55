use axum::{
    extract::State,
    http::{header::SET_COOKIE, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use tracing::instrument;

use crate::{
    auth::{
        cookies::{expired_refresh_cookie, read_refresh_cookie, refresh_cookie},
        dto::{
            AuthResponse, ForgotPasswordRequest, GoogleLoginRequest, LoginRequest, MeResponse,
            MessageResponse, ResetPasswordRequest, SessionUser, SignupRequest, SignupResponse,
            VerifyEmailQuery,
        },
        extractors::AuthUser,
        services::{self, IssuedSession},
    },
    error::AppResult,
    extract::{AppJson, AppQuery},
    state::AppState,
};

pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/auth/signup", post(signup))
        .route("/auth/login", post(login))
        .route("/auth/google", post(google_login))
        .route("/auth/refresh", post(refresh))
        .route("/auth/logout", post(logout))
        .route("/auth/verify-email", get(verify_email))
        .route("/auth/forgot-password", post(forgot_password))
        .route("/auth/reset-password", post(reset_password))
}

pub fn me_routes() -> Router<AppState> {
    Router::new().route("/auth/me", get(get_me))
}

/// Body plus the refresh cookie for a freshly issued session.
fn session_response(state: &AppState, session: IssuedSession) -> AppResult<impl IntoResponse> {
    let cookie = refresh_cookie(&state.config, &session.refresh_token)?;
    Ok((
        [(SET_COOKIE, cookie)],
        Json(AuthResponse {
            access_token: session.access_token,
            user: SessionUser::from(&session.user),
        }),
    ))
}

#[instrument(skip(state, payload))]
pub async fn signup(
    State(state): State<AppState>,
    AppJson(payload): AppJson<SignupRequest>,
) -> AppResult<(StatusCode, Json<SignupResponse>)> {
    let res = services::signup(&state, payload).await?;
    Ok((StatusCode::CREATED, Json(res)))
}

#[instrument(skip(state, payload))]
pub async fn login(
    State(state): State<AppState>,
    AppJson(payload): AppJson<LoginRequest>,
) -> AppResult<impl IntoResponse> {
    let session = services::login(&state, payload).await?;
    session_response(&state, session)
}

#[instrument(skip(state, payload))]
pub async fn google_login(
    State(state): State<AppState>,
    AppJson(payload): AppJson<GoogleLoginRequest>,
) -> AppResult<impl IntoResponse> {
    let session = services::google_login(&state, &payload.id_token).await?;
    session_response(&state, session)
}

#[instrument(skip(state, headers))]
pub async fn refresh(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> AppResult<impl IntoResponse> {
    let session = services::refresh(&state, read_refresh_cookie(&headers)).await?;
    session_response(&state, session)
}

#[instrument(skip(state, headers))]
pub async fn logout(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> AppResult<impl IntoResponse> {
    services::logout(&state, read_refresh_cookie(&headers)).await?;
    Ok((
        [(SET_COOKIE, expired_refresh_cookie(&state.config)?)],
        Json(MessageResponse::new("Logged out")),
    ))
}

#[instrument(skip(state, query))]
pub async fn verify_email(
    State(state): State<AppState>,
    AppQuery(query): AppQuery<VerifyEmailQuery>,
) -> AppResult<Json<MessageResponse>> {
    Ok(Json(services::verify_email(&state, query.token).await?))
}

#[instrument(skip(state, payload))]
pub async fn forgot_password(
    State(state): State<AppState>,
    AppJson(payload): AppJson<ForgotPasswordRequest>,
) -> AppResult<Json<MessageResponse>> {
    Ok(Json(services::forgot_password(&state, &payload.email).await?))
}

#[instrument(skip(state, payload))]
pub async fn reset_password(
    State(state): State<AppState>,
    AppJson(payload): AppJson<ResetPasswordRequest>,
) -> AppResult<Json<MessageResponse>> {
    Ok(Json(services::reset_password(&state, payload).await?))
}

#[instrument(skip(state, user))]
pub async fn get_me(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> AppResult<Json<MeResponse>> {
    let profile = services::me(&state, user.user_id).await?;
    Ok(Json(MeResponse { user: profile }))
}
