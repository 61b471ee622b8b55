use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    auth::repo_types::{NewUser, User},
    db::violated_unique_constraint,
    error::{AppError, AppResult},
};

/// Credential store. Each method is a single-row read or write.
#[async_trait]
pub trait UserRepo: Send + Sync {
    async fn find_by_email(&self, email: &str) -> AppResult<Option<User>>;
    async fn find_by_id(&self, id: Uuid) -> AppResult<Option<User>>;
    async fn find_by_google_id(&self, google_id: &str) -> AppResult<Option<User>>;
    async fn find_by_email_verify_token(&self, token: &str) -> AppResult<Option<User>>;

    /// Fails with `DuplicateEmail` when the email is taken and with
    /// `DuplicateGoogleAccount` when the Google id is.
    async fn create(&self, user: NewUser) -> AppResult<User>;

    /// Attach a Google identity to an existing row and mark the email verified.
    /// Fails with `DuplicateGoogleAccount` when another row holds `google_id`.
    async fn link_google(
        &self,
        id: Uuid,
        google_id: &str,
        avatar_url: Option<&str>,
    ) -> AppResult<User>;

    /// Unconditionally store (or clear) the current refresh token.
    async fn set_refresh_token(&self, id: Uuid, token: Option<&str>) -> AppResult<()>;

    /// Replace `expected` with `next`; returns false if `expected` is no longer stored.
    async fn rotate_refresh_token(&self, id: Uuid, expected: &str, next: &str) -> AppResult<bool>;

    /// Stores `token` as the pending reset token of the account with `email`,
    /// in one statement. `None` when no account has that email.
    async fn issue_reset_token(&self, email: &str, token: &str) -> AppResult<Option<User>>;

    /// Marks the email verified and consumes the token.
    async fn mark_email_verified(&self, id: Uuid) -> AppResult<()>;

    /// Replaces the password hash and consumes the token.
    async fn reset_password(&self, id: Uuid, password_hash: &str) -> AppResult<()>;
}

const USERS_EMAIL_KEY: &str = "users_email_key";
const USERS_GOOGLE_ID_KEY: &str = "users_google_id_key";

/// Maps a unique violation on `users` to the conflict it represents.
fn user_conflict(e: sqlx::Error) -> AppError {
    match violated_unique_constraint(&e) {
        Some(USERS_EMAIL_KEY) => AppError::DuplicateEmail,
        Some(USERS_GOOGLE_ID_KEY) => AppError::DuplicateGoogleAccount,
        _ => e.into(),
    }
}

const USER_COLUMNS: &str = r#"
    id, name, email, phone, password_hash, role, auth_provider, google_id,
    avatar_url, email_verified, email_verify_token, refresh_token, created_at
"#;

#[derive(Clone)]
pub struct PgUserRepo {
    db: PgPool,
}

impl PgUserRepo {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    async fn find_where(&self, clause: &str, value: &str) -> AppResult<Option<User>> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE {clause} = $1");
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(value)
            .fetch_optional(&self.db)
            .await?;
        Ok(user)
    }
}

#[async_trait]
impl UserRepo for PgUserRepo {
    async fn find_by_email(&self, email: &str) -> AppResult<Option<User>> {
        self.find_where("email", email).await
    }

    async fn find_by_id(&self, id: Uuid) -> AppResult<Option<User>> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1");
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(id)
            .fetch_optional(&self.db)
            .await?;
        Ok(user)
    }

    async fn find_by_google_id(&self, google_id: &str) -> AppResult<Option<User>> {
        self.find_where("google_id", google_id).await
    }

    async fn find_by_email_verify_token(&self, token: &str) -> AppResult<Option<User>> {
        self.find_where("email_verify_token", token).await
    }

    async fn create(&self, user: NewUser) -> AppResult<User> {
        let sql = format!(
            r#"
            INSERT INTO users (name, email, phone, password_hash, auth_provider, google_id,
                               avatar_url, email_verified, email_verify_token)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING {USER_COLUMNS}
            "#
        );
        sqlx::query_as::<_, User>(&sql)
            .bind(&user.name)
            .bind(&user.email)
            .bind(&user.phone)
            .bind(&user.password_hash)
            .bind(user.auth_provider)
            .bind(&user.google_id)
            .bind(&user.avatar_url)
            .bind(user.email_verified)
            .bind(&user.email_verify_token)
            .fetch_one(&self.db)
            .await
            .map_err(user_conflict)
    }

    async fn link_google(
        &self,
        id: Uuid,
        google_id: &str,
        avatar_url: Option<&str>,
    ) -> AppResult<User> {
        let sql = format!(
            r#"
            UPDATE users
               SET google_id = $2,
                   avatar_url = COALESCE($3, avatar_url),
                   email_verified = TRUE
             WHERE id = $1
            RETURNING {USER_COLUMNS}
            "#
        );
        sqlx::query_as::<_, User>(&sql)
            .bind(id)
            .bind(google_id)
            .bind(avatar_url)
            .fetch_one(&self.db)
            .await
            .map_err(user_conflict)
    }

    async fn set_refresh_token(&self, id: Uuid, token: Option<&str>) -> AppResult<()> {
        sqlx::query("UPDATE users SET refresh_token = $2 WHERE id = $1")
            .bind(id)
            .bind(token)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn rotate_refresh_token(&self, id: Uuid, expected: &str, next: &str) -> AppResult<bool> {
        let res = sqlx::query(
            "UPDATE users SET refresh_token = $3 WHERE id = $1 AND refresh_token = $2",
        )
        .bind(id)
        .bind(expected)
        .bind(next)
        .execute(&self.db)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    async fn issue_reset_token(&self, email: &str, token: &str) -> AppResult<Option<User>> {
        let sql = format!(
            "UPDATE users SET email_verify_token = $2 WHERE email = $1 RETURNING {USER_COLUMNS}"
        );
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(email)
            .bind(token)
            .fetch_optional(&self.db)
            .await?;
        Ok(user)
    }

    async fn mark_email_verified(&self, id: Uuid) -> AppResult<()> {
        sqlx::query(
            "UPDATE users SET email_verified = TRUE, email_verify_token = NULL WHERE id = $1",
        )
        .bind(id)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn reset_password(&self, id: Uuid, password_hash: &str) -> AppResult<()> {
        sqlx::query(
            "UPDATE users SET password_hash = $2, email_verify_token = NULL WHERE id = $1",
        )
        .bind(id)
        .bind(password_hash)
        .execute(&self.db)
        .await?;
        Ok(())
    }
}
