//! Signup, login, Google login, refresh, email verification, password reset,
//! logout and profile lookup. All state lives in the user store; nothing is
//! kept between calls.

use lazy_static::lazy_static;
use rand::{rngs::OsRng, RngCore};
use regex::Regex;
use tokio::sync::OnceCell;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    auth::{
        claims::TokenPayload,
        dto::{
            LoginRequest, MessageResponse, NewAccount, Profile, ResetPasswordRequest,
            SignupRequest, SignupResponse,
        },
        google::GoogleIdentity,
        password::{hash_password_blocking, verify_password_blocking},
        repo_types::{AuthProvider, NewUser, User},
    },
    config::HashingConfig,
    error::{AppError, AppResult},
    mail,
    state::AppState,
};

pub const SIGNUP_MESSAGE: &str =
    "Account created. Please check your email to verify your account.";
pub const FORGOT_PASSWORD_MESSAGE: &str = "If an account exists, a reset link has been sent.";
pub const MIN_PASSWORD_LEN: usize = 6;

/// Verified against when the account has no usable hash, so a missing user
/// costs the same as a wrong password.
static DUMMY_HASH: OnceCell<String> = OnceCell::const_new();

async fn dummy_hash(cfg: HashingConfig) -> AppResult<String> {
    let hash = DUMMY_HASH
        .get_or_try_init(|| hash_password_blocking(random_token(), cfg))
        .await?;
    Ok(hash.clone())
}

pub(crate) fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    EMAIL_RE.is_match(email)
}

/// 32 random bytes, hex encoded.
pub(crate) fn random_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn validate_password(password: &str) -> AppResult<()> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(AppError::Validation(format!(
            "Password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    Ok(())
}

/// Token pair minted for a user; the refresh token is already persisted.
#[derive(Debug)]
pub struct IssuedSession {
    pub access_token: String,
    pub refresh_token: String,
    pub user: User,
}

fn sign_pair(state: &AppState, user: &User) -> AppResult<(String, String)> {
    let payload = TokenPayload {
        user_id: user.id,
        role: user.role,
    };
    Ok((state.jwt.sign_access(payload)?, state.jwt.sign_refresh(payload)?))
}

/// Issue a fresh pair and overwrite the stored refresh token, which
/// invalidates whatever token was current before.
async fn issue_session(state: &AppState, user: User) -> AppResult<IssuedSession> {
    let (access_token, refresh_token) = sign_pair(state, &user)?;
    state
        .users
        .set_refresh_token(user.id, Some(&refresh_token))
        .await?;
    Ok(IssuedSession {
        access_token,
        refresh_token,
        user,
    })
}

pub async fn signup(state: &AppState, req: SignupRequest) -> AppResult<SignupResponse> {
    let email = req.email.trim().to_owned();
    let name = req.name.trim().to_owned();
    if name.is_empty() {
        return Err(AppError::Validation("Name is required".into()));
    }
    if !is_valid_email(&email) {
        warn!(email = %email, "invalid email");
        return Err(AppError::Validation("Invalid email".into()));
    }
    validate_password(&req.password)?;

    if state.users.find_by_email(&email).await?.is_some() {
        warn!(email = %email, "email already registered");
        return Err(AppError::DuplicateEmail);
    }

    let password_hash = hash_password_blocking(req.password, state.config.hashing).await?;
    let verify_token = random_token();

    // A concurrent signup for the same email is caught by the unique constraint.
    let user = state
        .users
        .create(NewUser {
            name,
            email,
            phone: req.phone.filter(|p| !p.trim().is_empty()),
            password_hash: Some(password_hash),
            auth_provider: AuthProvider::Email,
            google_id: None,
            avatar_url: None,
            email_verified: false,
            email_verify_token: Some(verify_token.clone()),
        })
        .await?;

    mail::dispatch(
        state.mailer.clone(),
        mail::verification_email(&state.config, &user.email, &user.name, &verify_token),
    );

    info!(user_id = %user.id, "user signed up");
    Ok(SignupResponse {
        message: SIGNUP_MESSAGE.into(),
        user: NewAccount {
            id: user.id,
            name: user.name,
            email: user.email,
            email_verified: user.email_verified,
        },
    })
}

pub async fn login(state: &AppState, req: LoginRequest) -> AppResult<IssuedSession> {
    let email = req.email.trim();
    let user = state.users.find_by_email(email).await?;

    let stored_hash = match user.as_ref().and_then(|u| u.password_hash.clone()) {
        Some(hash) => hash,
        None => dummy_hash(state.config.hashing).await?,
    };
    let password_ok = verify_password_blocking(req.password, stored_hash).await?;

    let user = match user {
        Some(u) if u.password_hash.is_some() && password_ok => u,
        Some(u) => {
            warn!(user_id = %u.id, "login rejected");
            return Err(AppError::InvalidCredentials);
        }
        None => {
            warn!("login for unknown email");
            return Err(AppError::InvalidCredentials);
        }
    };

    let session = issue_session(state, user).await?;
    info!(user_id = %session.user.id, "user logged in");
    Ok(session)
}

pub async fn google_login(state: &AppState, id_token: &str) -> AppResult<IssuedSession> {
    let identity = state.google.verify(id_token).await?;

    // The Google subject is the stable key; the email may change upstream.
    let user = match state.users.find_by_google_id(&identity.google_id).await? {
        Some(linked) => linked,
        None => match link_or_create_google_user(state, &identity).await {
            Ok(u) => u,
            // Another first login for this subject won the race.
            Err(AppError::DuplicateGoogleAccount) => state
                .users
                .find_by_google_id(&identity.google_id)
                .await?
                .ok_or(AppError::DuplicateGoogleAccount)?,
            Err(e) => return Err(e),
        },
    };

    let session = issue_session(state, user).await?;
    info!(user_id = %session.user.id, "user logged in with google");
    Ok(session)
}

/// Upgrades the account holding the Google email, or creates one.
async fn link_or_create_google_user(
    state: &AppState,
    identity: &GoogleIdentity,
) -> AppResult<User> {
    if let Some(existing) = state.users.find_by_email(&identity.email).await? {
        return state
            .users
            .link_google(existing.id, &identity.google_id, identity.picture.as_deref())
            .await;
    }

    let created = state
        .users
        .create(NewUser {
            name: identity.name.clone().unwrap_or_else(|| "User".into()),
            email: identity.email.clone(),
            phone: None,
            password_hash: None,
            auth_provider: AuthProvider::Google,
            google_id: Some(identity.google_id.clone()),
            avatar_url: identity.picture.clone(),
            email_verified: true,
            email_verify_token: None,
        })
        .await;
    match created {
        // Lost a race with a signup for this email.
        Err(AppError::DuplicateEmail) => {
            let existing = state
                .users
                .find_by_email(&identity.email)
                .await?
                .ok_or(AppError::DuplicateEmail)?;
            state
                .users
                .link_google(existing.id, &identity.google_id, identity.picture.as_deref())
                .await
        }
        other => other,
    }
}

/// Rotate both tokens. Only the currently stored refresh token is accepted;
/// presenting an older one fails with `TokenMismatch`.
pub async fn refresh(state: &AppState, presented: Option<String>) -> AppResult<IssuedSession> {
    let presented = presented.ok_or(AppError::MissingToken)?;
    let claims = state.jwt.verify_refresh(&presented)?;

    let user = state
        .users
        .find_by_id(claims.sub)
        .await?
        .ok_or(AppError::TokenMismatch)?;
    if user.refresh_token.as_deref() != Some(presented.as_str()) {
        warn!(user_id = %user.id, "stale refresh token presented");
        return Err(AppError::TokenMismatch);
    }

    let (access_token, refresh_token) = sign_pair(state, &user)?;
    let rotated = state
        .users
        .rotate_refresh_token(user.id, &presented, &refresh_token)
        .await?;
    if !rotated {
        warn!(user_id = %user.id, "refresh token rotated concurrently");
        return Err(AppError::TokenMismatch);
    }

    info!(user_id = %user.id, "session refreshed");
    Ok(IssuedSession {
        access_token,
        refresh_token,
        user,
    })
}

/// Clears the stored refresh token when the presented one is current.
/// Always succeeds; the caller expires the cookie regardless.
pub async fn logout(state: &AppState, presented: Option<String>) -> AppResult<()> {
    let Some(token) = presented else {
        return Ok(());
    };
    let Ok(claims) = state.jwt.verify_refresh(&token) else {
        return Ok(());
    };
    if let Some(user) = state.users.find_by_id(claims.sub).await? {
        if user.refresh_token.as_deref() == Some(token.as_str()) {
            state.users.set_refresh_token(user.id, None).await?;
            info!(user_id = %user.id, "user logged out");
        }
    }
    Ok(())
}

pub async fn verify_email(state: &AppState, token: Option<String>) -> AppResult<MessageResponse> {
    let token = token
        .filter(|t| !t.is_empty())
        .ok_or(AppError::InvalidVerificationToken)?;
    let user = state
        .users
        .find_by_email_verify_token(&token)
        .await?
        .ok_or(AppError::InvalidVerificationToken)?;

    state.users.mark_email_verified(user.id).await?;
    info!(user_id = %user.id, "email verified");
    Ok(MessageResponse::new("Email verified successfully"))
}

/// Same response whether or not the account exists.
pub async fn forgot_password(state: &AppState, email: &str) -> AppResult<MessageResponse> {
    let reset_token = random_token();
    // Shares the column with email verification, replacing any pending token.
    if let Some(user) = state
        .users
        .issue_reset_token(email.trim(), &reset_token)
        .await?
    {
        mail::dispatch(
            state.mailer.clone(),
            mail::password_reset_email(&state.config, &user.email, &user.name, &reset_token),
        );
        info!(user_id = %user.id, "password reset requested");
    }
    Ok(MessageResponse::new(FORGOT_PASSWORD_MESSAGE))
}

pub async fn reset_password(
    state: &AppState,
    req: ResetPasswordRequest,
) -> AppResult<MessageResponse> {
    if req.token.is_empty() {
        return Err(AppError::InvalidResetToken);
    }
    let user = state
        .users
        .find_by_email_verify_token(&req.token)
        .await?
        .ok_or(AppError::InvalidResetToken)?;
    validate_password(&req.password)?;

    let password_hash = hash_password_blocking(req.password, state.config.hashing).await?;
    state.users.reset_password(user.id, &password_hash).await?;
    info!(user_id = %user.id, "password reset");
    Ok(MessageResponse::new("Password reset successfully"))
}

pub async fn me(state: &AppState, user_id: Uuid) -> AppResult<Profile> {
    state
        .users
        .find_by_id(user_id)
        .await?
        .map(Profile::from)
        .ok_or(AppError::NotFound("User not found"))
}
