//! Error taxonomy for the tracking core.
//!
//! Two layers: `CarrierError` is the per-number outcome that fills
//! `TrackingResponse::errors` and never aborts a batch; `TrackError` is the
//! fatal layer that does (cancellation, unexpected HTTP status, parse
//! failure of a success body, rate-limit short-circuit).

use std::fmt;
use serde::{Deserialize, Serialize};

use crate::types::Carrier;

/// Stable error codes surfaced on the wire.
pub mod codes {
    pub const INVALID_TRACKING_NUMBER: &str = "INVALID_TRACKING_NUMBER";
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const NO_EVENTS: &str = "NO_EVENTS";
    pub const NO_RESULTS: &str = "NO_RESULTS";
    pub const RATE_LIMIT: &str = "RATE_LIMIT";
    pub const UNAUTHORIZED: &str = "UNAUTHORIZED";
    pub const BOT_DETECTION: &str = "BOT_DETECTION";
    pub const SERVER_ERROR: &str = "SERVER_ERROR";
    pub const DELEGATION_FAILED: &str = "DELEGATION_FAILED";
    pub const HEADLESS_ERROR: &str = "HEADLESS_ERROR";
    pub const NAVIGATION_ERROR: &str = "NAVIGATION_ERROR";
}

/// Page source and screenshot captured when a headless operation fails,
/// truncated to the engine's byte budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugArtifacts {
    #[serde(default)]
    pub page_source: String,
    #[serde(default)]
    pub screenshot_png: Vec<u8>,
}

/// A typed per-number tracking failure. `rate_limit` implies `retryable`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CarrierError {
    pub carrier: Carrier,
    /// The input that produced this error; absent for carrier-wide failures
    /// such as a pre-emptive local throttle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracking_number: Option<String>,
    pub code: String,
    pub message: String,
    pub retryable: bool,
    pub rate_limit: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<DebugArtifacts>,
}

impl CarrierError {
    pub fn new(
        carrier: Carrier,
        tracking_number: Option<String>,
        code: &str,
        message: impl Into<String>,
        retryable: bool,
    ) -> Self {
        Self {
            carrier,
            tracking_number,
            code: code.to_string(),
            message: message.into(),
            retryable,
            rate_limit: false,
            artifacts: None,
        }
    }

    pub fn invalid_number(carrier: Carrier, tracking_number: &str) -> Self {
        Self::new(
            carrier,
            Some(tracking_number.to_string()),
            codes::INVALID_TRACKING_NUMBER,
            format!("invalid {} tracking number: {}", carrier, tracking_number),
            false,
        )
    }

    pub fn not_found(carrier: Carrier, tracking_number: &str) -> Self {
        Self::new(
            carrier,
            Some(tracking_number.to_string()),
            codes::NOT_FOUND,
            format!("no shipment found for {}", tracking_number),
            false,
        )
    }

    pub fn no_events(carrier: Carrier, tracking_number: &str) -> Self {
        Self::new(
            carrier,
            Some(tracking_number.to_string()),
            codes::NO_EVENTS,
            format!("no tracking events for {}", tracking_number),
            true,
        )
    }

    pub fn no_results(carrier: Carrier, tracking_number: &str) -> Self {
        Self::new(
            carrier,
            Some(tracking_number.to_string()),
            codes::NO_RESULTS,
            format!("carrier returned no results for {}", tracking_number),
            false,
        )
    }

    /// HTTP 429 or the pre-emptive local throttle. Always retryable.
    pub fn rate_limited(carrier: Carrier, message: impl Into<String>) -> Self {
        Self {
            carrier,
            tracking_number: None,
            code: codes::RATE_LIMIT.to_string(),
            message: message.into(),
            retryable: true,
            rate_limit: true,
            artifacts: None,
        }
    }

    pub fn with_artifacts(mut self, artifacts: DebugArtifacts) -> Self {
        self.artifacts = Some(artifacts);
        self
    }
}

impl fmt::Display for CarrierError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.tracking_number {
            Some(num) => write!(
                f,
                "{} [{}] {}: {}",
                self.carrier, num, self.code, self.message
            ),
            None => write!(f, "{} {}: {}", self.carrier, self.code, self.message),
        }
    }
}

impl std::error::Error for CarrierError {}

/// Fatal tracking failure: aborts the whole batch.
#[derive(Debug, thiserror::Error)]
pub enum TrackError {
    /// Rate-limit short-circuit and other carrier-wide typed failures that
    /// must surface backoff information to the caller immediately.
    #[error(transparent)]
    Carrier(#[from] CarrierError),

    #[error("operation cancelled")]
    Cancelled,

    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// Non-2xx status outside the mapped set (429/401/404).
    #[error("HTTP error {status}")]
    Http { status: u16 },

    #[error("transport error: {0}")]
    Transport(String),

    /// A success response whose body could not be decoded.
    #[error("parse error: {0}")]
    Parse(String),

    #[error("browser error: {0}")]
    Browser(String),

    #[error("browser pool exhausted")]
    PoolExhausted,

    #[error("browser pool closed")]
    PoolClosed,

    #[error("unsupported carrier: {0}")]
    UnsupportedCarrier(Carrier),

    #[error("missing credentials for {0} api client")]
    MissingCredentials(Carrier),
}

impl TrackError {
    /// True when this is the rate-limit short-circuit, which callers back
    /// off from instead of retrying per-number.
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, Self::Carrier(err) if err.rate_limit)
    }
}

impl From<reqwest::Error> for TrackError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}
