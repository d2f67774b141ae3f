use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Parcel delivery carriers, plus Amazon as a quasi-carrier that either
/// synthesises placeholder data or delegates to the real last-mile carrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Carrier {
    Usps,
    Ups,
    FedEx,
    Dhl,
    Amazon,
}

impl Carrier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Usps => "usps",
            Self::Ups => "ups",
            Self::FedEx => "fedex",
            Self::Dhl => "dhl",
            Self::Amazon => "amazon",
        }
    }
}

impl fmt::Display for Carrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Carrier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "usps" => Ok(Self::Usps),
            "ups" => Ok(Self::Ups),
            "fedex" => Ok(Self::FedEx),
            "dhl" => Ok(Self::Dhl),
            "amazon" => Ok(Self::Amazon),
            other => Err(format!("unknown carrier: {}", other)),
        }
    }
}

/// Shipment status, used both per-event and as the shipment-level roll-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingStatus {
    #[default]
    Unknown,
    PreShip,
    InTransit,
    OutForDelivery,
    Delivered,
    Exception,
    Returned,
}

impl TrackingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::PreShip => "pre_ship",
            Self::InTransit => "in_transit",
            Self::OutForDelivery => "out_for_delivery",
            Self::Delivered => "delivered",
            Self::Exception => "exception",
            Self::Returned => "returned",
        }
    }
}

impl fmt::Display for TrackingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One timestamped status observation attached to a shipment.
///
/// Timestamps are timezone-resolved at construction. When carrier data
/// carries no zone the client interprets the naive time as UTC, consistently
/// across all events of the same info.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackingEvent {
    pub timestamp: DateTime<Utc>,
    pub status: TrackingStatus,
    /// Free-form human location string; may be empty.
    #[serde(default)]
    pub location: String,
    /// Carrier-provided event text.
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Normalised tracking data for one tracking number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingInfo {
    pub tracking_number: String,
    pub carrier: Carrier,
    pub status: TrackingStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_delivery: Option<DateTime<Utc>>,
    /// Set iff `status == Delivered`; equals the newest event's timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_delivery: Option<DateTime<Utc>>,
    /// Events ordered newest first. Strict invariant.
    pub events: Vec<TrackingEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<String>,
    /// Wall clock at construction.
    pub last_updated: DateTime<Utc>,
}

impl TrackingInfo {
    /// An info with no events yet, stamped now.
    pub fn new(tracking_number: impl Into<String>, carrier: Carrier) -> Self {
        Self {
            tracking_number: tracking_number.into(),
            carrier,
            status: TrackingStatus::Unknown,
            estimated_delivery: None,
            actual_delivery: None,
            events: Vec::new(),
            service_type: None,
            weight: None,
            dimensions: None,
            last_updated: Utc::now(),
        }
    }
}

/// A batch of tracking numbers for one carrier. Order is preserved;
/// duplicates are allowed (per-carrier batching may coalesce them).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingRequest {
    pub carrier: Carrier,
    pub tracking_numbers: Vec<String>,
}

impl TrackingRequest {
    pub fn new(carrier: Carrier, tracking_numbers: Vec<String>) -> Self {
        Self {
            carrier,
            tracking_numbers,
        }
    }

    pub fn single(carrier: Carrier, tracking_number: impl Into<String>) -> Self {
        Self {
            carrier,
            tracking_numbers: vec![tracking_number.into()],
        }
    }
}

/// Outcome of one tracking call: per-number results and per-number errors,
/// plus the client's rate-limit snapshot.
///
/// Invariant: every input tracking number produces exactly one outcome,
/// either a result or a typed error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingResponse {
    pub results: Vec<TrackingInfo>,
    pub errors: Vec<crate::error::CarrierError>,
    pub rate_limit: RateLimitInfo,
}

impl TrackingResponse {
    pub fn new(rate_limit: RateLimitInfo) -> Self {
        Self {
            results: Vec::new(),
            errors: Vec::new(),
            rate_limit,
        }
    }
}

/// Last observed carrier rate-limit state. `limit == -1` denotes an
/// unmetered source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitInfo {
    pub limit: i32,
    pub remaining: i32,
    pub reset_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<Duration>,
}

impl RateLimitInfo {
    /// Snapshot for sources with no known metering.
    pub fn unmetered() -> Self {
        Self {
            limit: -1,
            remaining: -1,
            reset_time: Utc::now(),
            retry_after: None,
        }
    }

    /// A fresh local bucket of `limit` requests per minute.
    pub fn per_minute(limit: i32) -> Self {
        Self {
            limit,
            remaining: limit,
            reset_time: Utc::now() + chrono::Duration::seconds(60),
            retry_after: None,
        }
    }
}

impl Default for RateLimitInfo {
    fn default() -> Self {
        Self::unmetered()
    }
}

/// Which backend a client speaks to the carrier through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientKind {
    #[default]
    Api,
    Scraping,
    Headless,
}

impl fmt::Display for ClientKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Api => f.write_str("api"),
            Self::Scraping => f.write_str("scraping"),
            Self::Headless => f.write_str("headless"),
        }
    }
}

impl FromStr for ClientKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "api" => Ok(Self::Api),
            "scraping" => Ok(Self::Scraping),
            "headless" => Ok(Self::Headless),
            other => Err(format!("unknown client kind: {}", other)),
        }
    }
}

/// Per-carrier credentials and transport tuning, owned by the factory.
#[derive(Debug, Clone, Default)]
pub struct CarrierConfig {
    pub usps_user_id: Option<String>,
    pub ups_client_id: Option<String>,
    pub ups_client_secret: Option<String>,
    pub fedex_client_id: Option<String>,
    pub fedex_client_secret: Option<String>,
    pub dhl_api_key: Option<String>,
    /// Select sandbox base URLs per carrier.
    pub use_sandbox: bool,
    /// Overrides the default browser-like user agent.
    pub user_agent: Option<String>,
    pub preferred_kind: ClientKind,
    /// Opt-in to the headless path.
    pub use_headless: bool,
    pub timeout: Option<Duration>,
    pub max_retries: u32,
}

impl CarrierConfig {
    /// The user agent the scraping and headless paths present.
    pub fn user_agent(&self) -> &str {
        self.user_agent.as_deref().unwrap_or(DEFAULT_USER_AGENT)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout.unwrap_or(DEFAULT_TIMEOUT)
    }
}

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
