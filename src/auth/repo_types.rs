use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "user_role", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    User,
    Admin,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "auth_provider", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum AuthProvider {
    Email,
    Google,
}

/// User record in the database.
#[derive(Debug, Clone, FromRow)]
pub struct User {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
    pub password_hash: Option<String>, // absent for Google-only accounts
    pub role: Role,
    pub auth_provider: AuthProvider,
    pub google_id: Option<String>,
    pub avatar_url: Option<String>,
    pub email_verified: bool,
    pub email_verify_token: Option<String>, // also holds password reset tokens
    pub refresh_token: Option<String>,      // last issued refresh token
    pub created_at: OffsetDateTime,
}

/// Insert payload for a new user row.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
    pub password_hash: Option<String>,
    pub auth_provider: AuthProvider,
    pub google_id: Option<String>,
    pub avatar_url: Option<String>,
    pub email_verified: bool,
    pub email_verify_token: Option<String>,
}
