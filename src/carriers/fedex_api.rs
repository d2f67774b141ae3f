//! FedEx Track API client (OAuth2 client-credentials + REST).
//!
//! Up to 30 tracking numbers per `POST /track/v1/trackingnumbers`. The
//! token endpoint takes a form-encoded body carrying `client_id` and
//! `client_secret` (no Basic auth, unlike UPS); the single
//! 401 -> refresh -> retry rule applies per batch request. A 429 anywhere
//! short-circuits the remaining batches with a rate-limit error.

use std::sync::Mutex;
use std::time::Duration;

use serde::Deserialize;

use crate::client::TrackingClient;
use crate::ctx::TrackContext;
use crate::error::{codes, CarrierError, TrackError};
use crate::normalize;
use crate::oauth::TokenCache;
use crate::scrape::{format_location, map_scraped_status, parse_date_time};
use crate::types::{
    Carrier, CarrierConfig, ClientKind, RateLimitInfo, TrackingEvent, TrackingInfo,
    TrackingRequest, TrackingResponse,
};
use crate::validation;

const FEDEX_API_BASE: &str = "https://apis.fedex.com";
const FEDEX_SANDBOX_BASE: &str = "https://apis-sandbox.fedex.com";

const TOKEN_PATH: &str = "/oauth/token";
const TRACK_PATH: &str = "/track/v1/trackingnumbers";

/// FedEx caps the tracking endpoint at 30 numbers per call.
const MAX_BATCH: usize = 30;

pub struct FedExApiClient {
    http: reqwest::Client,
    client_id: String,
    client_secret: String,
    base_url: String,
    token: TokenCache,
    rate: Mutex<RateLimitInfo>,
}

impl FedExApiClient {
    pub fn new(config: &CarrierConfig) -> Result<Self, TrackError> {
        let client_id = config
            .fedex_client_id
            .clone()
            .filter(|id| !id.is_empty())
            .ok_or(TrackError::MissingCredentials(Carrier::FedEx))?;
        let client_secret = config
            .fedex_client_secret
            .clone()
            .filter(|secret| !secret.is_empty())
            .ok_or(TrackError::MissingCredentials(Carrier::FedEx))?;

        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()?;

        let base_url = if config.use_sandbox {
            FEDEX_SANDBOX_BASE
        } else {
            FEDEX_API_BASE
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

    pub async fn cached_token(&self) -> Option<String> {
        self.token.current().await
    }

    async fn fetch_token(&self, ctx: &TrackContext) -> Result<(String, Duration), TrackError> {
        let url = format!("{}{}", self.base_url, TOKEN_PATH);
        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ];

        let request = self.http.post(&url).form(&form);
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
            .ok_or_else(|| TrackError::Parse("FedEx token response missing access_token".into()))?
            .to_string();
        let expires_in = body
            .get("expires_in")
            .and_then(|v| v.as_u64())
            .unwrap_or(3600);

        tracing::debug!(expires_in, "FedEx OAuth token acquired");
        Ok((access_token, Duration::from_secs(expires_in)))
    }

    fn throttle_error(&self, body: &str) -> TrackError {
        let wire_code = serde_json::from_str::<FedExErrorBody>(body)
            .ok()
            .and_then(|b| b.errors.into_iter().next())
            .map(|e| e.code)
            .unwrap_or_else(|| "RATE.LIMIT.EXCEEDED".to_string());

        {
            let mut rate = self.rate.lock().expect("rate lock poisoned");
            rate.remaining = 0;
            rate.reset_time = chrono::Utc::now() + chrono::Duration::seconds(60);
        }
        CarrierError::rate_limited(Carrier::FedEx, format!("FedEx returned 429 ({})", wire_code))
            .into()
    }

    /// One batch POST, with the single 401 -> refresh -> retry sequence.
    async fn send_batch(
        &self,
        ctx: &TrackContext,
        tracking_numbers: &[String],
    ) -> Result<FedExTrackBody, TrackError> {
        let payload = serde_json::json!({
            "includeDetailedScans": true,
            "trackingInfo": tracking_numbers
                .iter()
                .map(|n| serde_json::json!({"trackingNumberInfo": {"trackingNumber": n}}))
                .collect::<Vec<_>>(),
        });

        let mut refreshed = false;
        loop {
            let token = self.token.get_or_fetch(|| self.fetch_token(ctx)).await?;
            let url = format!("{}{}", self.base_url, TRACK_PATH);
            let request = self
                .http
                .post(&url)
                .header(reqwest::header::AUTHORIZATION, format!("Bearer {}", token))
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .header("X-locale", "en_US")
                .json(&payload);

            let response = ctx.run(async { Ok(request.send().await?) }).await?;
            let status = response.status().as_u16();

            match status {
                401 if !refreshed => {
                    tracing::debug!("FedEx 401, refreshing token once");
                    self.token.invalidate().await;
                    refreshed = true;
                    continue;
                }
                429 => {
                    let body = ctx
                        .run(async { Ok(response.text().await?) })
                        .await
                        .unwrap_or_default();
                    return Err(self.throttle_error(&body));
                }
                s if !(200..300).contains(&s) => return Err(TrackError::Http { status: s }),
                _ => {
                    return ctx
                        .run(async { Ok(response.json::<FedExTrackBody>().await?) })
                        .await
                        .map_err(|e| match e {
                            TrackError::Transport(msg) => {
                                TrackError::Parse(format!("FedEx track response: {}", msg))
                            }
                            other => other,
                        });
                }
            }
        }
    }

    fn build_info(&self, tracking_number: &str, result: &FedExTrackResult) -> TrackingInfo {
        let mut info = TrackingInfo::new(tracking_number, Carrier::FedEx);
        info.service_type = result
            .service_detail
            .as_ref()
            .map(|s| s.description.clone())
            .filter(|d| !d.is_empty());

        if let Some(pkg) = &result.package_details {
            info.weight = pkg
                .weight_and_dimensions
                .as_ref()
                .and_then(|w| w.weight.first())
                .map(|w| format!("{} {}", w.value, w.units).trim().to_string());
            info.dimensions = pkg
                .weight_and_dimensions
                .as_ref()
                .and_then(|w| w.dimensions.first())
                .map(|d| format!("{}x{}x{} {}", d.length, d.width, d.height, d.units));
        }

        info.estimated_delivery = result
            .date_and_times
            .iter()
            .find(|d| d.kind == "ESTIMATED_DELIVERY" && !d.date_time.is_empty())
            .and_then(|d| parse_date_time(&d.date_time).ok());

        info.events = result.scan_events.iter().filter_map(build_event).collect();

        let carrier_latest = result
            .latest_status_detail
            .as_ref()
            .map(|s| map_fedex_status(&s.code, &s.description));
        normalize::finalize(&mut info, carrier_latest);
        info
    }
}

/// Map a FedEx scan event-type code, falling back to text classification
/// for codes outside the documented set.
fn map_fedex_status(code: &str, description: &str) -> crate::types::TrackingStatus {
    use crate::types::TrackingStatus::*;
    match code {
        "DL" => Delivered,
        "OD" => OutForDelivery,
        "IT" | "DP" | "AR" | "AF" => InTransit,
        "PU" => PreShip,
        "DE" | "CA" | "DY" => Exception,
        _ => map_scraped_status(description),
    }
}

fn build_event(scan: &FedExScanEvent) -> Option<TrackingEvent> {
    let description = scan.event_description.trim().to_string();
    if description.is_empty() {
        return None;
    }
    let timestamp = match parse_date_time(&scan.date) {
        Ok(timestamp) => timestamp,
        Err(e) => {
            tracing::debug!(event = %description, "dropping event with unparseable date: {}", e);
            return None;
        }
    };

    let location = scan
        .scan_location
        .as_ref()
        .map(|l| {
            format_location(
                &l.city,
                &l.state_or_province_code,
                &l.postal_code,
                &l.country_code,
            )
        })
        .unwrap_or_default();

    Some(TrackingEvent {
        timestamp,
        status: map_fedex_status(&scan.event_type, &description),
        location,
        description,
        details: scan.exception_description.clone().filter(|d| !d.is_empty()),
    })
}

#[derive(Debug, Default, Deserialize)]
struct FedExErrorBody {
    #[serde(default)]
    errors: Vec<FedExWireError>,
}

#[derive(Debug, Default, Deserialize)]
struct FedExWireError {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Default, Deserialize)]
struct FedExTrackBody {
    #[serde(default)]
    output: FedExOutput,
}

#[derive(Debug, Default, Deserialize)]
struct FedExOutput {
    #[serde(rename = "completeTrackResults", default)]
    complete_track_results: Vec<FedExCompleteResult>,
}

#[derive(Debug, Default, Deserialize)]
struct FedExCompleteResult {
    #[serde(rename = "trackingNumber", default)]
    tracking_number: String,
    #[serde(rename = "trackResults", default)]
    track_results: Vec<FedExTrackResult>,
}

#[derive(Debug, Default, Deserialize)]
struct FedExTrackResult {
    #[serde(rename = "latestStatusDetail", default)]
    latest_status_detail: Option<FedExStatusDetail>,
    #[serde(rename = "scanEvents", default)]
    scan_events: Vec<FedExScanEvent>,
    #[serde(rename = "dateAndTimes", default)]
    date_and_times: Vec<FedExDateAndTime>,
    #[serde(rename = "serviceDetail", default)]
    service_detail: Option<FedExServiceDetail>,
    #[serde(rename = "packageDetails", default)]
    package_details: Option<FedExPackageDetails>,
    #[serde(default)]
    error: Option<FedExWireError>,
}

#[derive(Debug, Default, Deserialize)]
struct FedExStatusDetail {
    #[serde(default)]
    code: String,
    #[serde(default)]
    description: String,
}

#[derive(Debug, Default, Deserialize)]
struct FedExScanEvent {
    #[serde(default)]
    date: String,
    #[serde(rename = "eventType", default)]
    event_type: String,
    #[serde(rename = "eventDescription", default)]
    event_description: String,
    #[serde(rename = "exceptionDescription", default)]
    exception_description: Option<String>,
    #[serde(rename = "scanLocation", default)]
    scan_location: Option<FedExScanLocation>,
}

#[derive(Debug, Default, Deserialize)]
struct FedExScanLocation {
    #[serde(default)]
    city: String,
    #[serde(rename = "stateOrProvinceCode", default)]
    state_or_province_code: String,
    #[serde(rename = "postalCode", default)]
    postal_code: String,
    #[serde(rename = "countryCode", default)]
    country_code: String,
}

#[derive(Debug, Default, Deserialize)]
struct FedExDateAndTime {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(rename = "dateTime", default)]
    date_time: String,
}

#[derive(Debug, Default, Deserialize)]
struct FedExServiceDetail {
    #[serde(default)]
    description: String,
}

#[derive(Debug, Default, Deserialize)]
struct FedExPackageDetails {
    #[serde(rename = "weightAndDimensions", default)]
    weight_and_dimensions: Option<FedExWeightAndDimensions>,
}

#[derive(Debug, Default, Deserialize)]
struct FedExWeightAndDimensions {
    #[serde(default)]
    weight: Vec<FedExWeight>,
    #[serde(default)]
    dimensions: Vec<FedExDimensions>,
}

#[derive(Debug, Default, Deserialize)]
struct FedExWeight {
    #[serde(default)]
    value: String,
    #[serde(default)]
    units: String,
}

#[derive(Debug, Default, Deserialize)]
struct FedExDimensions {
    #[serde(default)]
    length: i64,
    #[serde(default)]
    width: i64,
    #[serde(default)]
    height: i64,
    #[serde(default)]
    units: String,
}

#[async_trait::async_trait]
impl TrackingClient for FedExApiClient {
    fn carrier_name(&self) -> &'static str {
        Carrier::FedEx.as_str()
    }

    fn kind(&self) -> ClientKind {
        ClientKind::Api
    }

    fn validate_tracking_number(&self, tracking_number: &str) -> bool {
        validation::is_fedex(tracking_number)
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

        for chunk in request.tracking_numbers.chunks(MAX_BATCH) {
            ctx.checkpoint()?;

            let body = self.send_batch(ctx, chunk).await?;

            for number in chunk {
                let matched = body
                    .output
                    .complete_track_results
                    .iter()
                    .find(|r| &r.tracking_number == number)
                    .and_then(|r| r.track_results.first());

                match matched {
                    None => response
                        .errors
                        .push(CarrierError::no_results(Carrier::FedEx, number)),
                    Some(result) => {
                        if let Some(error) = &result.error {
                            let not_found = error.code.contains("NOTFOUND");
                            tracing::debug!(
                                tracking_number = %number,
                                fedex_code = %error.code,
                                "FedEx reported per-number error"
                            );
                            response.errors.push(CarrierError::new(
                                Carrier::FedEx,
                                Some(number.clone()),
                                if not_found {
                                    codes::NOT_FOUND
                                } else {
                                    codes::NO_RESULTS
                                },
                                if error.message.is_empty() {
                                    error.code.clone()
                                } else {
                                    error.message.clone()
                                },
                                false,
                            ));
                        } else {
                            let info = self.build_info(number, result);
                            if info.events.is_empty()
                                && info.status == crate::types::TrackingStatus::Unknown
                            {
                                response
                                    .errors
                                    .push(CarrierError::no_events(Carrier::FedEx, number));
                            } else {
                                response.results.push(info);
                            }
                        }
                    }
                }
            }
        }

        response.rate_limit = self.rate_limit();
        Ok(response)
    }
}
