//! DHL Shipment Tracking - Unified API client (API key + REST).
//!
//! `GET /track/shipments?trackingNumber={n}` with the `DHL-API-Key`
//! header, one number per call. Error bodies are RFC 7807 style
//! `{title, status, detail}`; 401 is non-retryable, 429 is a rate-limit
//! short-circuit.

use std::sync::Mutex;

use serde::Deserialize;

use crate::client::TrackingClient;
use crate::ctx::TrackContext;
use crate::error::{codes, CarrierError, TrackError};
use crate::normalize;
use crate::scrape::{map_scraped_status, parse_date_time};
use crate::types::{
    Carrier, CarrierConfig, ClientKind, RateLimitInfo, TrackingEvent, TrackingInfo,
    TrackingRequest, TrackingResponse, TrackingStatus,
};
use crate::validation;

const DHL_API_BASE: &str = "https://api-eu.dhl.com";
const DHL_SANDBOX_BASE: &str = "https://api-sandbox.dhl.com";

const TRACK_PATH: &str = "/track/shipments";

pub struct DhlApiClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    rate: Mutex<RateLimitInfo>,
}

impl DhlApiClient {
    pub fn new(config: &CarrierConfig) -> Result<Self, TrackError> {
        let api_key = config
            .dhl_api_key
            .clone()
            .filter(|key| !key.is_empty())
            .ok_or(TrackError::MissingCredentials(Carrier::Dhl))?;

        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()?;

        let base_url = if config.use_sandbox {
            DHL_SANDBOX_BASE
        } else {
            DHL_API_BASE
        };

        Ok(Self {
            http,
            api_key,
            base_url: base_url.to_string(),
            rate: Mutex::new(RateLimitInfo::unmetered()),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn fetch_shipments(
        &self,
        ctx: &TrackContext,
        tracking_number: &str,
    ) -> Result<DhlOutcome, TrackError> {
        let url = format!("{}{}", self.base_url, TRACK_PATH);
        let request = self
            .http
            .get(&url)
            .query(&[("trackingNumber", tracking_number)])
            .header("DHL-API-Key", &self.api_key)
            .header(reqwest::header::ACCEPT, "application/json");

        let response = ctx.run(async { Ok(request.send().await?) }).await?;
        let status = response.status().as_u16();

        match status {
            401 => {
                let detail = read_problem_detail(ctx, response).await;
                Ok(DhlOutcome::Unauthorized(detail))
            }
            404 => Ok(DhlOutcome::NotFound),
            429 => {
                let retry_after = response
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .map(std::time::Duration::from_secs);
                {
                    let mut rate = self.rate.lock().expect("rate lock poisoned");
                    rate.remaining = 0;
                    rate.reset_time = chrono::Utc::now() + chrono::Duration::seconds(60);
                    rate.retry_after = retry_after;
                }
                Err(CarrierError::rate_limited(Carrier::Dhl, "DHL returned HTTP 429").into())
            }
            s if !(200..300).contains(&s) => Err(TrackError::Http { status: s }),
            _ => {
                let body: DhlTrackBody = ctx
                    .run(async { Ok(response.json().await?) })
                    .await
                    .map_err(|e| match e {
                        TrackError::Transport(msg) => {
                            TrackError::Parse(format!("DHL track response: {}", msg))
                        }
                        other => other,
                    })?;
                Ok(DhlOutcome::Body(Box::new(body)))
            }
        }
    }

    fn build_info(&self, tracking_number: &str, shipment: &DhlShipment) -> TrackingInfo {
        let mut info = TrackingInfo::new(tracking_number, Carrier::Dhl);
        info.service_type = shipment
            .details
            .as_ref()
            .and_then(|d| d.product.as_ref())
            .map(|p| p.product_name.clone())
            .filter(|n| !n.is_empty());
        info.weight = shipment
            .details
            .as_ref()
            .and_then(|d| d.weight.as_ref())
            .map(|w| {
                format!("{} {}", w.value, w.unit_text.as_deref().unwrap_or(""))
                    .trim()
                    .to_string()
            });

        if let Some(eta) = shipment
            .estimated_time_of_delivery
            .as_deref()
            .filter(|eta| !eta.is_empty())
        {
            info.estimated_delivery = parse_date_time(eta).ok();
        }

        info.events = shipment.events.iter().filter_map(build_event).collect();

        let carrier_latest = shipment
            .status
            .as_ref()
            .map(|s| map_dhl_status(s.status_code.as_deref(), &s.description()));
        normalize::finalize(&mut info, carrier_latest);
        info
    }
}

enum DhlOutcome {
    Body(Box<DhlTrackBody>),
    NotFound,
    Unauthorized(String),
}

async fn read_problem_detail(ctx: &TrackContext, response: reqwest::Response) -> String {
    let body = ctx
        .run(async { Ok(response.text().await?) })
        .await
        .unwrap_or_default();
    serde_json::from_str::<DhlProblem>(&body)
        .ok()
        .map(|p| {
            if p.detail.is_empty() {
                p.title
            } else {
                p.detail
            }
        })
        .filter(|d| !d.is_empty())
        .unwrap_or_else(|| "DHL rejected the API key".to_string())
}

/// DHL uses semantic status codes; free text only fills the gaps.
fn map_dhl_status(status_code: Option<&str>, description: &str) -> TrackingStatus {
    match status_code.unwrap_or("") {
        "pre-transit" => TrackingStatus::PreShip,
        "transit" => TrackingStatus::InTransit,
        "delivered" => TrackingStatus::Delivered,
        "failure" => TrackingStatus::Exception,
        _ => map_scraped_status(description),
    }
}

fn build_event(event: &DhlEvent) -> Option<TrackingEvent> {
    let description = event.description.trim().to_string();
    if description.is_empty() {
        return None;
    }
    let timestamp = match parse_date_time(&event.timestamp) {
        Ok(timestamp) => timestamp,
        Err(e) => {
            tracing::debug!(event = %description, "dropping event with unparseable date: {}", e);
            return None;
        }
    };

    let location = event
        .location
        .as_ref()
        .and_then(|l| l.address.as_ref())
        .map(|a| a.address_locality.clone())
        .unwrap_or_default();

    let status = map_dhl_status(event.status_code.as_deref(), &description);

    Some(TrackingEvent {
        timestamp,
        status,
        location,
        description,
        details: event.remark.clone().filter(|r| !r.is_empty()),
    })
}

#[derive(Debug, Default, Deserialize)]
struct DhlProblem {
    #[serde(default)]
    title: String,
    #[serde(default)]
    detail: String,
}

#[derive(Debug, Default, Deserialize)]
struct DhlTrackBody {
    #[serde(default)]
    shipments: Vec<DhlShipment>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DhlShipment {
    #[serde(default)]
    status: Option<DhlStatus>,
    #[serde(default)]
    estimated_time_of_delivery: Option<String>,
    #[serde(default)]
    details: Option<DhlDetails>,
    #[serde(default)]
    events: Vec<DhlEvent>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DhlStatus {
    #[serde(default)]
    status_code: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

impl DhlStatus {
    fn description(&self) -> String {
        self.description
            .clone()
            .or_else(|| self.status.clone())
            .unwrap_or_default()
    }
}

#[derive(Debug, Default, Deserialize)]
struct DhlDetails {
    #[serde(default)]
    product: Option<DhlProduct>,
    #[serde(default)]
    weight: Option<DhlWeight>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DhlProduct {
    #[serde(default)]
    product_name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DhlWeight {
    #[serde(default)]
    value: f64,
    #[serde(default)]
    unit_text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DhlEvent {
    #[serde(default)]
    timestamp: String,
    #[serde(default)]
    status_code: Option<String>,
    #[serde(default)]
    description: String,
    #[serde(default)]
    remark: Option<String>,
    #[serde(default)]
    location: Option<DhlLocation>,
}

#[derive(Debug, Default, Deserialize)]
struct DhlLocation {
    #[serde(default)]
    address: Option<DhlAddress>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DhlAddress {
    #[serde(default)]
    address_locality: String,
}

#[async_trait::async_trait]
impl TrackingClient for DhlApiClient {
    fn carrier_name(&self) -> &'static str {
        Carrier::Dhl.as_str()
    }

    fn kind(&self) -> ClientKind {
        ClientKind::Api
    }

    fn validate_tracking_number(&self, tracking_number: &str) -> bool {
        validation::is_dhl(tracking_number)
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

            match self.fetch_shipments(ctx, number).await? {
                DhlOutcome::NotFound => response
                    .errors
                    .push(CarrierError::not_found(Carrier::Dhl, number)),
                DhlOutcome::Unauthorized(detail) => response.errors.push(CarrierError::new(
                    Carrier::Dhl,
                    Some(number.clone()),
                    codes::UNAUTHORIZED,
                    detail,
                    false,
                )),
                DhlOutcome::Body(body) => match body.shipments.first() {
                    None => response
                        .errors
                        .push(CarrierError::no_results(Carrier::Dhl, number)),
                    Some(shipment) => {
                        let info = self.build_info(number, shipment);
                        if info.events.is_empty() && info.status == TrackingStatus::Unknown {
                            response
                                .errors
                                .push(CarrierError::no_events(Carrier::Dhl, number));
                        } else {
                            response.results.push(info);
                        }
                    }
                },
            }
        }

        response.rate_limit = self.rate_limit();
        Ok(response)
    }
}
