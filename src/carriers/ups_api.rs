//! UPS Track API client (OAuth2 client-credentials + REST).
//!
//! One tracking number per HTTP call. The token endpoint takes Basic auth
//! of `client_id:client_secret` with a form-encoded
//! `grant_type=client_credentials` body; the access token is cached with a
//! computed expiry. A 401 during tracking refreshes the token and retries
//! the same request exactly once.

use std::sync::Mutex;
use std::time::Duration;

use base64::Engine;
use serde::Deserialize;

use crate::client::TrackingClient;
use crate::ctx::TrackContext;
use crate::error::{codes, CarrierError, TrackError};
use crate::normalize;
use crate::oauth::TokenCache;
use crate::scrape::{format_location, map_scraped_status};
use crate::types::{
    Carrier, CarrierConfig, ClientKind, RateLimitInfo, TrackingEvent, TrackingInfo,
    TrackingRequest, TrackingResponse,
};
use crate::validation;

const UPS_API_BASE: &str = "https://onlinetools.ups.com";
const UPS_SANDBOX_BASE: &str = "https://wwwcie.ups.com";

const TOKEN_PATH: &str = "/security/v1/oauth/token";
const TRACK_PATH: &str = "/track/v1/details";

pub struct UpsApiClient {
    http: reqwest::Client,
    client_id: String,
    client_secret: String,
    base_url: String,
    token: TokenCache,
    rate: Mutex<RateLimitInfo>,
}

impl UpsApiClient {
    pub fn new(config: &CarrierConfig) -> Result<Self, TrackError> {
        let client_id = config
            .ups_client_id
            .clone()
            .filter(|id| !id.is_empty())
            .ok_or(TrackError::MissingCredentials(Carrier::Ups))?;
        let client_secret = config
            .ups_client_secret
            .clone()
            .filter(|secret| !secret.is_empty())
            .ok_or(TrackError::MissingCredentials(Carrier::Ups))?;

        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()?;

        let base_url = if config.use_sandbox {
            UPS_SANDBOX_BASE
        } else {
            UPS_API_BASE
        };

        Ok(Self {
            http,
            client_id,
            client_secret,
            base_url: base_url.to_string(),
            token: TokenCache::new(),
            rate: Mutex::new(RateLimitInfo::unmetered()),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Cached token, if still live. Exposed so tests can assert the cache
    /// holds the refreshed value after a 401 retry.
    pub async fn cached_token(&self) -> Option<String> {
        self.token.current().await
    }

    async fn fetch_token(&self, ctx: &TrackContext) -> Result<(String, Duration), TrackError> {
        let url = format!("{}{}", self.base_url, TOKEN_PATH);
        let basic = base64::engine::general_purpose::STANDARD
            .encode(format!("{}:{}", self.client_id, self.client_secret));

        let request = self
            .http
            .post(&url)
            .header(reqwest::header::AUTHORIZATION, format!("Basic {}", basic))
            .header(
                reqwest::header::CONTENT_TYPE,
                "application/x-www-form-urlencoded",
            )
            .body("grant_type=client_credentials");

        let response = ctx.run(async { Ok(request.send().await?) }).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TrackError::Http {
                status: status.as_u16(),
            });
        }

        let body: serde_json::Value = ctx.run(async { Ok(response.json().await?) }).await?;
        let access_token = body
            .get("access_token")
            .and_then(|v| v.as_str())
            .ok_or_else(|| TrackError::Parse("UPS token response missing access_token".into()))?
            .to_string();
        // UPS serialises expires_in as a string.
        let expires_in = body
            .get("expires_in")
            .and_then(|v| v.as_u64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
            .unwrap_or(3600);

        tracing::debug!(expires_in, "UPS OAuth token acquired");
        Ok((access_token, Duration::from_secs(expires_in)))
    }

    async fn bearer_token(&self, ctx: &TrackContext) -> Result<String, TrackError> {
        self.token.get_or_fetch(|| self.fetch_token(ctx)).await
    }

    fn update_rate_limit_from_headers(&self, headers: &reqwest::header::HeaderMap) {
        let mut rate = self.rate.lock().expect("rate lock poisoned");
        let read = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<i64>().ok())
        };
        if let Some(limit) = read("X-RateLimit-Limit") {
            rate.limit = limit as i32;
        }
        if let Some(remaining) = read("X-RateLimit-Remaining") {
            rate.remaining = remaining.max(0) as i32;
        }
        if let Some(reset) = read("X-RateLimit-Reset") {
            if let Some(ts) = chrono::DateTime::from_timestamp(reset, 0) {
                rate.reset_time = ts;
            }
        }
        rate.retry_after = read("Retry-After").map(|s| Duration::from_secs(s.max(0) as u64));
    }

    /// One tracking GET, with the single 401 -> refresh -> retry sequence.
    async fn fetch_details(
        &self,
        ctx: &TrackContext,
        tracking_number: &str,
    ) -> Result<TrackOutcome, TrackError> {
        let mut refreshed = false;
        loop {
            let token = self.bearer_token(ctx).await?;
            let url = format!("{}{}/{}", self.base_url, TRACK_PATH, tracking_number);
            let request = self
                .http
                .get(&url)
                .header(reqwest::header::AUTHORIZATION, format!("Bearer {}", token))
                .header(reqwest::header::ACCEPT, "application/json");

            let response = ctx.run(async { Ok(request.send().await?) }).await?;
            let status = response.status().as_u16();

            match status {
                401 if !refreshed => {
                    tracing::debug!(tracking_number, "UPS 401, refreshing token once");
                    self.token.invalidate().await;
                    refreshed = true;
                    continue;
                }
                401 => return Ok(TrackOutcome::Unauthorized),
                404 => return Ok(TrackOutcome::NotFound),
                429 => {
                    self.update_rate_limit_from_headers(response.headers());
                    return Err(CarrierError::rate_limited(
                        Carrier::Ups,
                        "UPS returned HTTP 429",
                    )
                    .into());
                }
                s if !(200..300).contains(&s) => return Err(TrackError::Http { status: s }),
                _ => {
                    let body: UpsTrackBody =
                        ctx.run(async { Ok(response.json().await?) })
                            .await
                            .map_err(|e| match e {
                                TrackError::Transport(msg) => {
                                    TrackError::Parse(format!("UPS track response: {}", msg))
                                }
                                other => other,
                            })?;
                    return Ok(TrackOutcome::Body(Box::new(body)));
                }
            }
        }
    }

    fn build_info(&self, tracking_number: &str, body: &UpsTrackBody) -> Option<TrackingInfo> {
        let package = body
            .track_response
            .as_ref()?
            .shipment
            .first()?
            .package
            .first()?;

        let mut info = TrackingInfo::new(tracking_number, Carrier::Ups);
        info.service_type = package
            .service
            .as_ref()
            .map(|s| s.description.clone())
            .filter(|d| !d.is_empty());
        info.weight = package.weight.as_ref().map(|w| {
            format!("{} {}", w.weight, w.unit_of_measurement).trim().to_string()
        });

        // Estimated delivery comes from carrier metadata only; "DEL" rows
        // are confirmed deliveries, not estimates.
        info.estimated_delivery = package
            .delivery_date
            .iter()
            .find(|d| d.kind != "DEL" && !d.date.is_empty())
            .and_then(|d| parse_ups_timestamp(&d.date, ""));

        info.events = package
            .activity
            .iter()
            .filter_map(build_event)
            .collect();

        normalize::finalize(&mut info, None);
        Some(info)
    }
}

enum TrackOutcome {
    Body(Box<UpsTrackBody>),
    NotFound,
    Unauthorized,
}

/// Map a UPS activity status to the canonical set: `D` delivered, `I` in
/// transit (or out-for-delivery when the text says so), `P` pre-ship, `X`
/// exception; anything else falls back to the textual classifier.
fn map_ups_status(kind: &str, description: &str) -> crate::types::TrackingStatus {
    use crate::types::TrackingStatus::*;
    match kind {
        "D" => Delivered,
        "I" => {
            if description.to_lowercase().contains("out for delivery") {
                OutForDelivery
            } else {
                InTransit
            }
        }
        "P" => PreShip,
        "X" => Exception,
        _ => map_scraped_status(description),
    }
}

fn parse_ups_timestamp(date: &str, time: &str) -> Option<chrono::DateTime<chrono::Utc>> {
    use chrono::{NaiveDate, NaiveDateTime, TimeZone, Utc};

    let date = NaiveDate::parse_from_str(date, "%Y%m%d").ok()?;
    let naive: NaiveDateTime = match time.len() {
        6 => date.and_time(chrono::NaiveTime::parse_from_str(time, "%H%M%S").ok()?),
        4 => date.and_time(chrono::NaiveTime::parse_from_str(time, "%H%M").ok()?),
        _ => date.and_hms_opt(0, 0, 0)?,
    };
    Some(Utc.from_utc_datetime(&naive))
}

fn build_event(activity: &UpsActivity) -> Option<TrackingEvent> {
    let status = activity.status.as_ref()?;
    let description = status.description.trim().to_string();
    if description.is_empty() {
        return None;
    }
    let timestamp = parse_ups_timestamp(&activity.date, &activity.time)?;

    let location = activity
        .location
        .as_ref()
        .and_then(|l| l.address.as_ref())
        .map(|a| format_location(&a.city, &a.state_province, &a.postal_code, &a.country))
        .unwrap_or_default();

    Some(TrackingEvent {
        timestamp,
        status: map_ups_status(&status.kind, &description),
        location,
        description,
        details: None,
    })
}

#[derive(Debug, Deserialize)]
struct UpsTrackBody {
    #[serde(rename = "trackResponse", default)]
    track_response: Option<UpsTrackResponse>,
}

#[derive(Debug, Default, Deserialize)]
struct UpsTrackResponse {
    #[serde(default)]
    shipment: Vec<UpsShipment>,
}

#[derive(Debug, Default, Deserialize)]
struct UpsShipment {
    #[serde(default)]
    package: Vec<UpsPackage>,
}

#[derive(Debug, Default, Deserialize)]
struct UpsPackage {
    #[serde(default)]
    activity: Vec<UpsActivity>,
    #[serde(rename = "deliveryDate", default)]
    delivery_date: Vec<UpsDeliveryDate>,
    #[serde(default)]
    service: Option<UpsService>,
    #[serde(default)]
    weight: Option<UpsWeight>,
}

#[derive(Debug, Default, Deserialize)]
struct UpsDeliveryDate {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    date: String,
}

#[derive(Debug, Default, Deserialize)]
struct UpsService {
    #[serde(default)]
    description: String,
}

#[derive(Debug, Default, Deserialize)]
struct UpsWeight {
    #[serde(default)]
    weight: String,
    #[serde(rename = "unitOfMeasurement", default)]
    unit_of_measurement: String,
}

#[derive(Debug, Default, Deserialize)]
struct UpsActivity {
    #[serde(default)]
    location: Option<UpsLocation>,
    #[serde(default)]
    status: Option<UpsStatus>,
    #[serde(default)]
    date: String,
    #[serde(default)]
    time: String,
}

#[derive(Debug, Default, Deserialize)]
struct UpsLocation {
    #[serde(default)]
    address: Option<UpsAddress>,
}

#[derive(Debug, Default, Deserialize)]
struct UpsAddress {
    #[serde(default)]
    city: String,
    #[serde(rename = "stateProvince", default)]
    state_province: String,
    #[serde(rename = "postalCode", default)]
    postal_code: String,
    #[serde(default)]
    country: String,
}

#[derive(Debug, Default, Deserialize)]
struct UpsStatus {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    description: String,
}

#[async_trait::async_trait]
impl TrackingClient for UpsApiClient {
    fn carrier_name(&self) -> &'static str {
        Carrier::Ups.as_str()
    }

    fn kind(&self) -> ClientKind {
        ClientKind::Api
    }

    fn validate_tracking_number(&self, tracking_number: &str) -> bool {
        validation::is_ups(tracking_number)
    }

    fn rate_limit(&self) -> RateLimitInfo {
        self.rate.lock().expect("rate lock poisoned").clone()
    }

    async fn track(
        &self,
        ctx: &TrackContext,
        request: &TrackingRequest,
    ) -> Result<TrackingResponse, TrackError> {
        let mut response = TrackingResponse::new(self.rate_limit());

        for number in &request.tracking_numbers {
            ctx.checkpoint()?;

            match self.fetch_details(ctx, number).await? {
                TrackOutcome::NotFound => response
                    .errors
                    .push(CarrierError::not_found(Carrier::Ups, number)),
                TrackOutcome::Unauthorized => response.errors.push(CarrierError::new(
                    Carrier::Ups,
                    Some(number.clone()),
                    codes::UNAUTHORIZED,
                    "UPS rejected credentials after token refresh",
                    false,
                )),
                TrackOutcome::Body(body) => match self.build_info(number, &body) {
                    Some(info) if !info.events.is_empty() => response.results.push(info),
                    Some(_) => response
                        .errors
                        .push(CarrierError::no_events(Carrier::Ups, number)),
                    None => response
                        .errors
                        .push(CarrierError::no_results(Carrier::Ups, number)),
                },
            }
        }

        response.rate_limit = self.rate_limit();
        Ok(response)
    }
}
