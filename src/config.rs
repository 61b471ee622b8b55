use anyhow::Context;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    pub access_secret: String,
    pub refresh_secret: String,
    pub issuer: String,
    pub audience: String,
    pub ttl_minutes: i64,
    pub refresh_ttl_minutes: i64,
}

/// Argon2id cost parameters.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct HashingConfig {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for HashingConfig {
    fn default() -> Self {
        Self {
            memory_kib: 64 * 1024,
            iterations: 3,
            parallelism: 1,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MailConfig {
    pub resend_api_key: Option<String>,
    pub from_email: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppEnv {
    Development,
    Production,
}

impl AppEnv {
    fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "production" | "prod" => AppEnv::Production,
            _ => AppEnv::Development,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database_url: String,
    pub jwt: JwtConfig,
    pub hashing: HashingConfig,
    pub mail: MailConfig,
    pub google_client_id: String,
    pub client_url: String,
    pub env: AppEnv,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
        let jwt = JwtConfig {
            access_secret: std::env::var("JWT_ACCESS_SECRET")
                .context("JWT_ACCESS_SECRET must be set")?,
            refresh_secret: std::env::var("JWT_REFRESH_SECRET")
                .context("JWT_REFRESH_SECRET must be set")?,
            issuer: std::env::var("JWT_ISSUER").unwrap_or_else(|_| "guidance-zone".into()),
            audience: std::env::var("JWT_AUDIENCE")
                .unwrap_or_else(|_| "guidance-zone-users".into()),
            ttl_minutes: env_parse("JWT_ACCESS_TTL_MINUTES").unwrap_or(15),
            refresh_ttl_minutes: env_parse("JWT_REFRESH_TTL_MINUTES").unwrap_or(60 * 24 * 7),
        };
        anyhow::ensure!(
            jwt.access_secret != jwt.refresh_secret,
            "JWT_ACCESS_SECRET and JWT_REFRESH_SECRET must differ"
        );

        let defaults = HashingConfig::default();
        let hashing = HashingConfig {
            memory_kib: env_parse("PASSWORD_HASH_MEMORY_KIB").unwrap_or(defaults.memory_kib),
            iterations: env_parse("PASSWORD_HASH_ITERATIONS").unwrap_or(defaults.iterations),
            parallelism: defaults.parallelism,
        };

        let mail = MailConfig {
            resend_api_key: std::env::var("RESEND_API_KEY")
                .ok()
                .filter(|k| !k.trim().is_empty()),
            from_email: std::env::var("FROM_EMAIL")
                .unwrap_or_else(|_| "noreply@guidancezone.org".into()),
        };

        Ok(Self {
            database_url,
            jwt,
            hashing,
            mail,
            google_client_id: std::env::var("GOOGLE_CLIENT_ID").unwrap_or_default(),
            client_url: std::env::var("CLIENT_URL")
                .unwrap_or_else(|_| "http://localhost:5173".into())
                .trim_end_matches('/')
                .to_string(),
            env: std::env::var("APP_ENV")
                .map(|v| AppEnv::parse(&v))
                .unwrap_or(AppEnv::Development),
        })
    }

    pub fn is_production(&self) -> bool {
        self.env == AppEnv::Production
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse::<T>().ok())
}
