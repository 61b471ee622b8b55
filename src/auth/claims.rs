use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::repo_types::Role;

/// Type of JWT: access or refresh.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Access,
    Refresh,
}

/// Identity carried by both token kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenPayload {
    pub user_id: Uuid,
    pub role: Role,
}

/// JWT payload used for authentication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,       // user ID
    pub role: Role,
    pub iat: usize,      // issued at (unix timestamp)
    pub exp: usize,      // expires at (unix timestamp)
    pub iss: String,
    pub aud: String,
    pub jti: Uuid,       // keeps tokens minted in the same second distinct
    pub kind: TokenKind,
}

impl Claims {
    pub fn payload(&self) -> TokenPayload {
        TokenPayload {
            user_id: self.sub,
            role: self.role,
        }
    }
}
