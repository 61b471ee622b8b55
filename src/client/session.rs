//! Client-side session state: the in-memory access token and the single
//! in-flight refresh shared by every request that hit a 401.

use std::sync::{Mutex, MutexGuard};

use futures_util::future::{BoxFuture, FutureExt, Shared};
use reqwest::StatusCode;

/// Why a refresh attempt failed. Cloned out to every waiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshFailure {
    pub status: Option<StatusCode>,
    pub message: String,
}

pub(crate) type RefreshOutcome = Result<String, RefreshFailure>;
type InflightRefresh = Shared<BoxFuture<'static, RefreshOutcome>>;

#[derive(Default)]
pub struct SessionContext {
    access_token: Mutex<Option<String>>,
    inflight: Mutex<Option<InflightRefresh>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SessionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn access_token(&self) -> Option<String> {
        lock(&self.access_token).clone()
    }

    pub fn set_access_token(&self, token: impl Into<String>) {
        *lock(&self.access_token) = Some(token.into());
    }

    pub fn clear(&self) {
        *lock(&self.access_token) = None;
    }

    pub fn is_refreshing(&self) -> bool {
        lock(&self.inflight).is_some()
    }

    /// Called when a request sent with `rejected` came back 401. Returns the
    /// token to retry with: the current one if it was replaced meanwhile,
    /// otherwise the result of the in-flight refresh, starting one with
    /// `start` only if none is running.
    pub(crate) async fn recover(
        &self,
        rejected: Option<&str>,
        start: impl FnOnce() -> BoxFuture<'static, RefreshOutcome>,
    ) -> RefreshOutcome {
        let refresh = {
            let mut inflight = lock(&self.inflight);
            if inflight.is_none() {
                if let Some(current) = self.access_token() {
                    if rejected != Some(current.as_str()) {
                        return Ok(current);
                    }
                }
            }
            join_or_start(&mut inflight, start)
        };
        refresh.await
    }

    /// Refresh regardless of the current token, joining a running refresh.
    pub(crate) async fn force_refresh(
        &self,
        start: impl FnOnce() -> BoxFuture<'static, RefreshOutcome>,
    ) -> RefreshOutcome {
        let refresh = join_or_start(&mut lock(&self.inflight), start);
        refresh.await
    }

    /// Runs at the end of the refresh future, before any waiter sees the
    /// outcome.
    pub(crate) fn finish_refresh(&self, outcome: &RefreshOutcome) {
        match outcome {
            Ok(token) => self.set_access_token(token.clone()),
            Err(_) => self.clear(),
        }
        *lock(&self.inflight) = None;
    }
}

fn join_or_start(
    slot: &mut Option<InflightRefresh>,
    start: impl FnOnce() -> BoxFuture<'static, RefreshOutcome>,
) -> InflightRefresh {
    slot.get_or_insert_with(|| start().shared()).clone()
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };
    use std::time::Duration;

    use super::*;

    fn counting_refresh(
        session: Arc<SessionContext>,
        calls: Arc<AtomicUsize>,
        outcome: RefreshOutcome,
    ) -> BoxFuture<'static, RefreshOutcome> {
        calls.fetch_add(1, Ordering::SeqCst);
        async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            session.finish_refresh(&outcome);
            outcome
        }
        .boxed()
    }

    #[tokio::test]
    async fn concurrent_recoveries_share_one_refresh() {
        let session = Arc::new(SessionContext::new());
        session.set_access_token("old");
        let calls = Arc::new(AtomicUsize::new(0));

        let waiters = (0..5).map(|_| {
            let session = session.clone();
            let calls = calls.clone();
            async move {
                session
                    .recover(Some("old"), || {
                        counting_refresh(session.clone(), calls, Ok("new".into()))
                    })
                    .await
            }
        });
        let results = futures_util::future::join_all(waiters).await;

        assert!(results.iter().all(|r| r.as_deref() == Ok("new")));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(session.access_token().as_deref(), Some("new"));
        assert!(!session.is_refreshing());
    }

    #[tokio::test]
    async fn replaced_token_is_reused_without_refresh() {
        let session = Arc::new(SessionContext::new());
        session.set_access_token("newer");
        let calls = Arc::new(AtomicUsize::new(0));
        let token = session
            .recover(Some("old"), || {
                counting_refresh(session.clone(), calls.clone(), Ok("x".into()))
            })
            .await
            .unwrap();
        assert_eq!(token, "newer");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failed_refresh_clears_token_for_everyone() {
        let session = Arc::new(SessionContext::new());
        session.set_access_token("old");
        let calls = Arc::new(AtomicUsize::new(0));
        let failure = RefreshFailure {
            status: Some(StatusCode::UNAUTHORIZED),
            message: "Invalid refresh token".into(),
        };

        let waiters = (0..3).map(|_| {
            let session = session.clone();
            let calls = calls.clone();
            let failure = failure.clone();
            async move {
                session
                    .recover(Some("old"), || {
                        counting_refresh(session.clone(), calls, Err(failure))
                    })
                    .await
            }
        });
        let results = futures_util::future::join_all(waiters).await;

        assert!(results.iter().all(|r| r.as_ref() == Err(&failure)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(session.access_token().is_none());
    }
}
