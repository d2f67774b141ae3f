//! OAuth2 client-credentials token cache shared by the UPS and FedEx API
//! clients.
//!
//! The cache is a small state machine: empty, fetching, valid-until. The
//! async mutex is held across the refresh, so concurrent callers queue
//! behind one in-flight fetch and the double-check inside hands them the
//! winning token. A 60 second safety margin keeps an about-to-expire token
//! from being handed out.

use std::future::Future;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::TrackError;

const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

#[derive(Debug, Default)]
pub struct TokenCache {
    inner: Mutex<Option<CachedToken>>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached token, or run `fetch` to obtain a fresh one.
    ///
    /// `fetch` resolves to `(access_token, expires_in)`. At most one fetch
    /// is in flight; losers of the race get the winner's token.
    pub async fn get_or_fetch<F, Fut>(&self, fetch: F) -> Result<String, TrackError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(String, Duration), TrackError>>,
    {
        let mut guard = self.inner.lock().await;

        // Double-check: a concurrent caller may have refreshed while we
        // waited on the lock.
        if let Some(cached) = guard.as_ref() {
            if Instant::now() < cached.expires_at {
                return Ok(cached.access_token.clone());
            }
        }

        tracing::debug!("fetching fresh oauth token");
        let (access_token, expires_in) = fetch().await?;
        let ttl = expires_in
            .checked_sub(EXPIRY_MARGIN)
            .unwrap_or(Duration::ZERO);
        *guard = Some(CachedToken {
            access_token: access_token.clone(),
            expires_at: Instant::now() + ttl,
        });
        Ok(access_token)
    }

    /// Drop the cached token. Called after a 401 so the retry fetches a
    /// fresh one.
    pub async fn invalidate(&self) {
        *self.inner.lock().await = None;
    }

    /// Current cached token, if still within its lifetime.
    pub async fn current(&self) -> Option<String> {
        let guard = self.inner.lock().await;
        guard.as_ref().and_then(|cached| {
            (Instant::now() < cached.expires_at).then(|| cached.access_token.clone())
        })
    }
}
