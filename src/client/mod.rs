//! HTTP client for the auth and registration API.
//!
//! The access token lives in a [`SessionContext`]; the refresh token never
//! leaves the cookie jar. A request rejected with 401 is retried once after
//! the shared refresh completes.

pub mod session;

use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

pub use session::{RefreshFailure, SessionContext};

use crate::{
    auth::dto::{
        AuthResponse, GoogleLoginRequest, LoginRequest, MeResponse, MessageResponse, Profile,
        SessionUser, SignupRequest, SignupResponse,
    },
    error::ErrorBody,
    registrations::dto::{MyRegistration, RegisterRequest, RegistrationDetails},
};
use session::RefreshOutcome;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("{status}: {message}")]
    Api { status: StatusCode, message: String },

    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
}

impl ClientError {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ClientError::Api { status, .. } => Some(*status),
            ClientError::Transport(e) => e.status(),
            ClientError::Url(_) => None,
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status() == Some(StatusCode::UNAUTHORIZED)
    }
}

async fn api_error(res: Response) -> ClientError {
    let status = res.status();
    let message = match res.json::<ErrorBody>().await {
        Ok(body) => body.error,
        Err(_) => status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_owned(),
    };
    ClientError::Api { status, message }
}

async fn decode<T: DeserializeOwned>(res: Response) -> Result<T, ClientError> {
    if !res.status().is_success() {
        return Err(api_error(res).await);
    }
    Ok(res.json::<T>().await?)
}

#[derive(Clone)]
pub struct ApiClient {
    base: Url,
    http: reqwest::Client,
    session: Arc<SessionContext>,
}

impl ApiClient {
    /// `base_url` is the API root, e.g. `http://localhost:8080/api/v1`.
    pub fn new(base_url: &str) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder().cookie_store(true).build()?;
        Self::with_http(base_url, http)
    }

    /// The client must keep cookies, or refresh will always fail.
    pub fn with_http(base_url: &str, http: reqwest::Client) -> Result<Self, ClientError> {
        let mut base = Url::parse(base_url)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self {
            base,
            http,
            session: Arc::new(SessionContext::new()),
        })
    }

    pub fn session(&self) -> &SessionContext {
        &self.session
    }

    fn endpoint(&self, path: &str) -> Result<Url, ClientError> {
        Ok(self.base.join(path)?)
    }

    fn build<B: Serialize + ?Sized>(
        &self,
        method: Method,
        url: Url,
        body: Option<&B>,
        token: Option<&str>,
    ) -> RequestBuilder {
        let mut req = self.http.request(method, url);
        if let Some(token) = token {
            req = req.bearer_auth(token);
        }
        if let Some(body) = body {
            req = req.json(body);
        }
        req
    }

    /// Request without an access token.
    async fn public<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<T, ClientError> {
        let url = self.endpoint(path)?;
        let res = self.build(method, url, body, None).send().await?;
        decode(res).await
    }

    /// Request with the current access token; one refresh-and-retry on 401.
    async fn authed<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<T, ClientError> {
        let url = self.endpoint(path)?;
        let token = self.session.access_token();
        let res = self
            .build(method.clone(), url.clone(), body, token.as_deref())
            .send()
            .await?;
        if res.status() != StatusCode::UNAUTHORIZED {
            return decode(res).await;
        }

        let original = api_error(res).await;
        let fresh = match self
            .session
            .recover(token.as_deref(), || self.start_refresh())
            .await
        {
            Ok(fresh) => fresh,
            Err(failure) => {
                debug!(message = %failure.message, "refresh failed; surfacing original error");
                return Err(original);
            }
        };

        let res = self.build(method, url, body, Some(&fresh)).send().await?;
        decode(res).await
    }

    /// The refresh call itself. Owns everything it needs, since it may
    /// outlive the request that started it.
    fn start_refresh(&self) -> BoxFuture<'static, RefreshOutcome> {
        let http = self.http.clone();
        let url = self.endpoint("auth/refresh");
        let session = self.session.clone();
        async move {
            let outcome = async {
                let url = url.map_err(|e| RefreshFailure {
                    status: None,
                    message: e.to_string(),
                })?;
                let res = http.post(url).send().await.map_err(|e| RefreshFailure {
                    status: e.status(),
                    message: e.to_string(),
                })?;
                match decode::<AuthResponse>(res).await {
                    Ok(body) => Ok(body.access_token),
                    Err(e) => Err(RefreshFailure {
                        status: e.status(),
                        message: e.to_string(),
                    }),
                }
            }
            .await;
            if let Err(failure) = &outcome {
                warn!(message = %failure.message, "session refresh failed");
            }
            session.finish_refresh(&outcome);
            outcome
        }
        .boxed()
    }

    fn start_session(&self, res: AuthResponse) -> SessionUser {
        self.session.set_access_token(res.access_token);
        res.user
    }

    pub async fn signup(&self, req: &SignupRequest) -> Result<SignupResponse, ClientError> {
        self.public(Method::POST, "auth/signup", Some(req)).await
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<SessionUser, ClientError> {
        let req = LoginRequest {
            email: email.to_owned(),
            password: password.to_owned(),
        };
        let res: AuthResponse = self.public(Method::POST, "auth/login", Some(&req)).await?;
        Ok(self.start_session(res))
    }

    pub async fn google_login(&self, id_token: &str) -> Result<SessionUser, ClientError> {
        let req = GoogleLoginRequest {
            id_token: id_token.to_owned(),
        };
        let res: AuthResponse = self.public(Method::POST, "auth/google", Some(&req)).await?;
        Ok(self.start_session(res))
    }

    /// Restores a session from the refresh cookie, e.g. on startup.
    pub async fn refresh(&self) -> Result<String, ClientError> {
        self.session
            .force_refresh(|| self.start_refresh())
            .await
            .map_err(|f| ClientError::Api {
                status: f.status.unwrap_or(StatusCode::UNAUTHORIZED),
                message: f.message,
            })
    }

    /// Ends the session on the server and clears the in-memory token.
    pub async fn logout(&self) -> Result<(), ClientError> {
        let res: Result<MessageResponse, _> =
            self.public(Method::POST, "auth/logout", None::<&()>).await;
        self.session.clear();
        res.map(|_| ())
    }

    pub async fn me(&self) -> Result<Profile, ClientError> {
        let res: MeResponse = self.authed(Method::GET, "auth/me", None::<&()>).await?;
        Ok(res.user)
    }

    pub async fn register_for_course(
        &self,
        course_id: Uuid,
    ) -> Result<RegistrationDetails, ClientError> {
        self.authed(
            Method::POST,
            "registrations",
            Some(&RegisterRequest { course_id }),
        )
        .await
    }

    pub async fn my_registrations(&self) -> Result<Vec<MyRegistration>, ClientError> {
        self.authed(Method::GET, "registrations/me", None::<&()>).await
    }
}
