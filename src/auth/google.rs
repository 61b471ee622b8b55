//! Google ID-token verification against Google's published signing keys.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use anyhow::Context;
use async_trait::async_trait;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{AppError, AppResult};

pub const GOOGLE_JWKS_URL: &str = "https://www.googleapis.com/oauth2/v3/certs";
const GOOGLE_ISSUERS: [&str; 2] = ["accounts.google.com", "https://accounts.google.com"];
const KEY_CACHE_TTL: Duration = Duration::from_secs(300);
/// Minimum spacing between refetches triggered by an unknown `kid`.
const ON_DEMAND_COOLDOWN: Duration = Duration::from_secs(60);

/// Identity asserted by a verified Google ID token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GoogleIdentity {
    pub google_id: String,
    pub email: String,
    pub name: Option<String>,
    pub picture: Option<String>,
}

#[async_trait]
pub trait GoogleTokenVerifier: Send + Sync {
    /// Fails with `InvalidFederatedToken` on a bad signature, audience or expiry,
    /// or when the token carries no email.
    async fn verify(&self, id_token: &str) -> AppResult<GoogleIdentity>;
}

#[derive(Debug, Deserialize)]
struct Jwk {
    kid: String,
    kty: String,
    n: String,
    e: String,
}

#[derive(Debug, Deserialize)]
struct JwksResponse {
    keys: Vec<Jwk>,
}

#[derive(Debug, Deserialize)]
struct GoogleClaims {
    sub: String,
    email: Option<String>,
    name: Option<String>,
    picture: Option<String>,
}

#[derive(Default)]
struct KeyCache {
    keys: HashMap<String, DecodingKey>,
    fetched_at: Option<Instant>,
    last_on_demand_refresh: Option<Instant>,
}

impl KeyCache {
    fn is_fresh(&self) -> bool {
        self.fetched_at.is_some_and(|t| t.elapsed() < KEY_CACHE_TTL)
    }
}

pub struct GoogleJwksVerifier {
    client_id: String,
    jwks_url: String,
    http: reqwest::Client,
    cache: RwLock<KeyCache>,
    on_demand_cooldown: Duration,
}

impl GoogleJwksVerifier {
    pub fn new(client_id: impl Into<String>) -> anyhow::Result<Self> {
        Self::with_jwks_url(client_id, GOOGLE_JWKS_URL)
    }

    pub fn with_jwks_url(
        client_id: impl Into<String>,
        jwks_url: impl Into<String>,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("build jwks http client")?;
        Ok(Self {
            client_id: client_id.into(),
            jwks_url: jwks_url.into(),
            http,
            cache: RwLock::new(KeyCache::default()),
            on_demand_cooldown: ON_DEMAND_COOLDOWN,
        })
    }

    pub fn with_on_demand_cooldown(mut self, cooldown: Duration) -> Self {
        self.on_demand_cooldown = cooldown;
        self
    }

    async fn fetch_keys(&self) -> anyhow::Result<HashMap<String, DecodingKey>> {
        let jwks: JwksResponse = self
            .http
            .get(&self.jwks_url)
            .send()
            .await
            .context("fetch google jwks")?
            .error_for_status()
            .context("google jwks status")?
            .json()
            .await
            .context("parse google jwks")?;

        let mut keys = HashMap::new();
        for jwk in jwks.keys.into_iter().filter(|k| k.kty == "RSA") {
            let key = DecodingKey::from_rsa_components(&jwk.n, &jwk.e)
                .with_context(|| format!("invalid rsa key {}", jwk.kid))?;
            keys.insert(jwk.kid, key);
        }
        anyhow::ensure!(!keys.is_empty(), "no RSA keys in google jwks");
        Ok(keys)
    }

    /// Returns the key for `kid`. Refetches when the cache is stale, or when
    /// `kid` is unknown and no on-demand refetch ran within the cooldown.
    async fn key_for(&self, kid: &str) -> anyhow::Result<Option<DecodingKey>> {
        {
            let cache = self.cache.read().await;
            if cache.is_fresh() {
                if let Some(key) = cache.keys.get(kid) {
                    return Ok(Some(key.clone()));
                }
            }
        }

        // Held across the fetch so concurrent misses wait for one refetch.
        let mut cache = self.cache.write().await;
        if cache.is_fresh() {
            if let Some(key) = cache.keys.get(kid) {
                return Ok(Some(key.clone()));
            }
            if let Some(last) = cache.last_on_demand_refresh {
                if last.elapsed() < self.on_demand_cooldown {
                    debug!(kid, "unknown kid; jwks refetch throttled");
                    return Ok(None);
                }
            }
            cache.last_on_demand_refresh = Some(Instant::now());
        }

        let keys = self.fetch_keys().await?;
        debug!(count = keys.len(), "google jwks refreshed");
        cache.keys = keys;
        cache.fetched_at = Some(Instant::now());
        Ok(cache.keys.get(kid).cloned())
    }
}

#[async_trait]
impl GoogleTokenVerifier for GoogleJwksVerifier {
    async fn verify(&self, id_token: &str) -> AppResult<GoogleIdentity> {
        if self.client_id.is_empty() {
            warn!("GOOGLE_CLIENT_ID is not configured; rejecting google login");
            return Err(AppError::InvalidFederatedToken);
        }

        let header = decode_header(id_token).map_err(|_| AppError::InvalidFederatedToken)?;
        let kid = header.kid.ok_or(AppError::InvalidFederatedToken)?;
        let key = self
            .key_for(&kid)
            .await?
            .ok_or(AppError::InvalidFederatedToken)?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(std::slice::from_ref(&self.client_id));
        validation.set_issuer(&GOOGLE_ISSUERS);

        let claims = decode::<GoogleClaims>(id_token, &key, &validation)
            .map_err(|e| {
                debug!(error = %e, "google id token rejected");
                AppError::InvalidFederatedToken
            })?
            .claims;

        let email = claims.email.ok_or(AppError::InvalidFederatedToken)?;
        Ok(GoogleIdentity {
            google_id: claims.sub,
            email,
            name: claims.name,
            picture: claims.picture,
        })
    }
}
