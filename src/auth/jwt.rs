use std::time::Duration;

use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use time::{Duration as TimeDuration, OffsetDateTime};
use tracing::debug;
use uuid::Uuid;

use crate::{
    auth::claims::{Claims, TokenKind, TokenPayload},
    config::JwtConfig,
    error::{AppError, AppResult},
};

#[derive(Clone)]
struct KeyPair {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl KeyPair {
    fn from_secret(secret: &str) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
        }
    }
}

/// Signing and verification keys for both token classes. Access and refresh
/// tokens use different secrets.
#[derive(Clone)]
pub struct JwtKeys {
    access: KeyPair,
    refresh: KeyPair,
    pub issuer: String,
    pub audience: String,
    pub access_ttl: Duration,
    pub refresh_ttl: Duration,
}

impl JwtKeys {
    pub fn new(cfg: &JwtConfig) -> Self {
        Self {
            access: KeyPair::from_secret(&cfg.access_secret),
            refresh: KeyPair::from_secret(&cfg.refresh_secret),
            issuer: cfg.issuer.clone(),
            audience: cfg.audience.clone(),
            access_ttl: Duration::from_secs((cfg.ttl_minutes.max(0) as u64) * 60),
            refresh_ttl: Duration::from_secs((cfg.refresh_ttl_minutes.max(0) as u64) * 60),
        }
    }

    fn keys_for(&self, kind: TokenKind) -> &KeyPair {
        match kind {
            TokenKind::Access => &self.access,
            TokenKind::Refresh => &self.refresh,
        }
    }

    fn sign_with_kind(&self, payload: TokenPayload, kind: TokenKind) -> AppResult<String> {
        let now = OffsetDateTime::now_utc();
        let ttl = match kind {
            TokenKind::Access => self.access_ttl,
            TokenKind::Refresh => self.refresh_ttl,
        };
        let exp = now + TimeDuration::seconds(ttl.as_secs() as i64);
        let claims = Claims {
            sub: payload.user_id,
            role: payload.role,
            iat: now.unix_timestamp() as usize,
            exp: exp.unix_timestamp() as usize,
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            jti: Uuid::new_v4(),
            kind,
        };
        let token = encode(&Header::default(), &claims, &self.keys_for(kind).encoding)
            .map_err(|e| AppError::Internal(e.into()))?;
        debug!(user_id = %payload.user_id, kind = ?kind, "jwt signed");
        Ok(token)
    }

    pub fn sign_access(&self, payload: TokenPayload) -> AppResult<String> {
        self.sign_with_kind(payload, TokenKind::Access)
    }

    pub fn sign_refresh(&self, payload: TokenPayload) -> AppResult<String> {
        self.sign_with_kind(payload, TokenKind::Refresh)
    }

    fn verify(&self, token: &str, kind: TokenKind) -> AppResult<Claims> {
        let mut validation = Validation::default();
        validation.set_audience(std::slice::from_ref(&self.audience));
        validation.set_issuer(std::slice::from_ref(&self.issuer));
        let data = decode::<Claims>(token, &self.keys_for(kind).decoding, &validation)
            .map_err(|e| {
                debug!(error = %e, kind = ?kind, "jwt rejected");
                AppError::InvalidToken
            })?;
        if data.claims.kind != kind {
            return Err(AppError::InvalidToken);
        }
        debug!(user_id = %data.claims.sub, kind = ?kind, "jwt verified");
        Ok(data.claims)
    }

    pub fn verify_access(&self, token: &str) -> AppResult<Claims> {
        self.verify(token, TokenKind::Access)
    }

    pub fn verify_refresh(&self, token: &str) -> AppResult<Claims> {
        self.verify(token, TokenKind::Refresh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::repo_types::Role;

    fn cfg(issuer: &str, audience: &str) -> JwtConfig {
        JwtConfig {
            access_secret: "access-secret".into(),
            refresh_secret: "refresh-secret".into(),
            issuer: issuer.into(),
            audience: audience.into(),
            ttl_minutes: 5,
            refresh_ttl_minutes: 60,
        }
    }

    fn payload() -> TokenPayload {
        TokenPayload {
            user_id: Uuid::new_v4(),
            role: Role::User,
        }
    }

    #[test]
    fn sign_and_verify_access_token() {
        let keys = JwtKeys::new(&cfg("test-issuer", "test-aud"));
        let p = payload();
        let token = keys.sign_access(p).expect("sign access");
        let claims = keys.verify_access(&token).expect("verify token");
        assert_eq!(claims.payload(), p);
        assert_eq!(claims.iss, "test-issuer");
        assert_eq!(claims.aud, "test-aud");
        assert_eq!(claims.kind, TokenKind::Access);
    }

    #[test]
    fn sign_and_verify_refresh_token() {
        let keys = JwtKeys::new(&cfg("iss", "aud"));
        let p = TokenPayload {
            role: Role::Admin,
            ..payload()
        };
        let token = keys.sign_refresh(p).expect("sign refresh");
        let claims = keys.verify_refresh(&token).expect("verify refresh");
        assert_eq!(claims.payload(), p);
        assert_eq!(claims.kind, TokenKind::Refresh);
    }

    #[test]
    fn token_classes_are_not_interchangeable() {
        let keys = JwtKeys::new(&cfg("iss", "aud"));
        let access = keys.sign_access(payload()).unwrap();
        let refresh = keys.sign_refresh(payload()).unwrap();
        assert!(matches!(keys.verify_refresh(&access), Err(AppError::InvalidToken)));
        assert!(matches!(keys.verify_access(&refresh), Err(AppError::InvalidToken)));
    }

    #[test]
    fn tokens_minted_together_differ() {
        let keys = JwtKeys::new(&cfg("iss", "aud"));
        let p = payload();
        assert_ne!(keys.sign_refresh(p).unwrap(), keys.sign_refresh(p).unwrap());
    }

    #[test]
    fn verify_rejects_wrong_issuer_or_audience() {
        let good = JwtKeys::new(&cfg("good-iss", "good-aud"));
        let bad = JwtKeys::new(&cfg("bad-iss", "bad-aud"));
        let token = good.sign_access(payload()).unwrap();
        assert!(matches!(bad.verify_access(&token), Err(AppError::InvalidToken)));
    }

    #[test]
    fn verify_rejects_expired_token() {
        let keys = JwtKeys::new(&cfg("iss", "aud"));
        let now = OffsetDateTime::now_utc().unix_timestamp() as usize;
        let claims = Claims {
            sub: Uuid::new_v4(),
            role: Role::User,
            iat: now - 7200,
            exp: now - 3600,
            iss: "iss".into(),
            aud: "aud".into(),
            jti: Uuid::new_v4(),
            kind: TokenKind::Access,
        };
        let token = encode(&Header::default(), &claims, &keys.access.encoding).unwrap();
        assert!(matches!(keys.verify_access(&token), Err(AppError::InvalidToken)));
    }

    #[test]
    fn verify_rejects_garbage() {
        let keys = JwtKeys::new(&cfg("iss", "aud"));
        assert!(keys.verify_access("not.a.jwt").is_err());
    }
}
