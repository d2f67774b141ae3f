//! Cancellation-carrying context threaded through every tracking call.
//!
//! Every network request, browser operation and token refresh races its
//! future against this context. Observing cancellation or the deadline
//! yields a context error (`TrackError::Cancelled` / `DeadlineExceeded`),
//! never a `CarrierError`.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::TrackError;

#[derive(Debug, Clone, Default)]
pub struct TrackContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl TrackContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            cancel: CancellationToken::new(),
            deadline: Some(Instant::now() + timeout),
        }
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            cancel: CancellationToken::new(),
            deadline: Some(deadline),
        }
    }

    /// A child context sharing this context's cancellation but bounded by
    /// `min(self.deadline, now + timeout)`. Used by components that compose
    /// their own operation budget with the caller's.
    pub fn bounded(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(existing) => existing.min(candidate),
            None => candidate,
        };
        Self {
            cancel: self.cancel.clone(),
            deadline: Some(deadline),
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Fail fast between I/O points.
    pub fn checkpoint(&self) -> Result<(), TrackError> {
        if self.cancel.is_cancelled() {
            return Err(TrackError::Cancelled);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(TrackError::DeadlineExceeded);
            }
        }
        Ok(())
    }

    /// Run a fallible future, racing it against cancellation and the
    /// deadline. This is the single suspension wrapper used at every I/O
    /// point.
    pub async fn run<F, T>(&self, fut: F) -> Result<T, TrackError>
    where
        F: Future<Output = Result<T, TrackError>>,
    {
        self.checkpoint()?;
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.cancel.cancelled() => Err(TrackError::Cancelled),
                    _ = tokio::time::sleep_until(deadline) => Err(TrackError::DeadlineExceeded),
                    result = fut => result,
                }
            }
            None => {
                tokio::select! {
                    _ = self.cancel.cancelled() => Err(TrackError::Cancelled),
                    result = fut => result,
                }
            }
        }
    }

}
