//! USPS Track/Confirm API client (legacy XML over HTTPS GET).
//!
//! Requests go out as a URL-encoded `XML=` query on
//! `shippingapi.dll?API=TrackV2`, batched at ten tracking IDs per call with
//! batches issued sequentially. `Revision=1` selects the field-structured
//! response, one `TrackSummary` (most recent) plus zero-or-more
//! `TrackDetail` elements per ID.

use std::sync::Mutex;

use serde::Deserialize;

use crate::client::TrackingClient;
use crate::ctx::TrackContext;
use crate::error::{codes, CarrierError, TrackError};
use crate::normalize;
use crate::scrape::{format_location, map_scraped_status, parse_date_time};
use crate::types::{
    Carrier, CarrierConfig, ClientKind, RateLimitInfo, TrackingEvent, TrackingInfo,
    TrackingRequest, TrackingResponse,
};
use crate::validation;

const USPS_API_BASE: &str = "https://secure.shippingapis.com";
const USPS_SANDBOX_BASE: &str = "https://stg-secure.shippingapis.com";

/// USPS caps TrackV2 at ten IDs per call.
const MAX_BATCH: usize = 10;

const SOURCE_ID: &str = "shiptrack";

pub struct UspsApiClient {
    http: reqwest::Client,
    user_id: String,
    base_url: String,
    rate: Mutex<RateLimitInfo>,
}

impl UspsApiClient {
    pub fn new(config: &CarrierConfig) -> Result<Self, TrackError> {
        let user_id = config
            .usps_user_id
            .clone()
            .filter(|id| !id.is_empty())
            .ok_or(TrackError::MissingCredentials(Carrier::Usps))?;

        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()?;

        let base_url = if config.use_sandbox {
            USPS_SANDBOX_BASE
        } else {
            USPS_API_BASE
        };

        Ok(Self {
            http,
            user_id,
            base_url: base_url.to_string(),
            rate: Mutex::new(RateLimitInfo::unmetered()),
        })
    }

    /// Point the client at a different endpoint (fixture servers in tests).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn build_request_xml(&self, tracking_numbers: &[String]) -> String {
        let mut xml = format!(
            r#"<TrackFieldRequest USERID="{}">"#,
            xml_escape(&self.user_id)
        );
        xml.push_str("<Revision>1</Revision>");
        xml.push_str("<ClientIp>127.0.0.1</ClientIp>");
        xml.push_str(&format!("<SourceId>{}</SourceId>", SOURCE_ID));
        for number in tracking_numbers {
            xml.push_str(&format!(r#"<TrackID ID="{}"/>"#, xml_escape(number)));
        }
        xml.push_str("</TrackFieldRequest>");
        xml
    }

    async fn send_batch(&self, ctx: &TrackContext, xml: &str) -> Result<String, TrackError> {
        let url = format!("{}/shippingapi.dll", self.base_url);
        let request = self
            .http
            .get(&url)
            .query(&[("API", "TrackV2"), ("XML", xml)]);

        let response = ctx.run(async { Ok(request.send().await?) }).await?;
        let status = response.status();

        if status.as_u16() == 429 {
            let mut rate = self.rate.lock().expect("rate lock poisoned");
            rate.remaining = 0;
            rate.reset_time = chrono::Utc::now() + chrono::Duration::seconds(60);
            return Err(
                CarrierError::rate_limited(Carrier::Usps, "USPS returned HTTP 429").into(),
            );
        }
        if !status.is_success() {
            return Err(TrackError::Http {
                status: status.as_u16(),
            });
        }

        ctx.run(async { Ok(response.text().await?) }).await
    }

    fn build_info(&self, tracking_number: &str, xml_info: &TrackInfoXml) -> TrackingInfo {
        let mut info = TrackingInfo::new(tracking_number, Carrier::Usps);
        info.service_type = xml_info.class.clone().filter(|c| !c.is_empty());

        if let Some(expected) = xml_info
            .expected_delivery_date
            .as_deref()
            .filter(|d| !d.is_empty())
        {
            info.estimated_delivery = parse_date_time(expected).ok();
        }

        let mut events = Vec::new();
        if let Some(summary) = &xml_info.summary {
            if let Some(event) = build_event(summary) {
                events.push(event);
            }
        }
        for detail in &xml_info.details {
            if let Some(event) = build_event(detail) {
                events.push(event);
            }
        }
        info.events = events;

        normalize::finalize(&mut info, None);
        info
    }
}

/// Build one event from the field-structured XML element. Events whose
/// date cannot be recovered are dropped rather than stamped with "now".
fn build_event(xml_event: &TrackEventXml) -> Option<TrackingEvent> {
    let description = xml_event.event.clone().unwrap_or_default();
    if description.trim().is_empty() {
        return None;
    }

    let date = xml_event.event_date.as_deref().unwrap_or("").trim();
    let time = xml_event.event_time.as_deref().unwrap_or("").trim();
    let combined = format!("{} {}", date, time);
    let timestamp = match parse_date_time(combined.trim()) {
        Ok(timestamp) => timestamp,
        Err(e) => {
            tracing::debug!(event = %description, "dropping event with unparseable date: {}", e);
            return None;
        }
    };

    let location = format_location(
        xml_event.event_city.as_deref().unwrap_or(""),
        xml_event.event_state.as_deref().unwrap_or(""),
        xml_event.event_zip.as_deref().unwrap_or(""),
        xml_event.event_country.as_deref().unwrap_or(""),
    );

    Some(TrackingEvent {
        timestamp,
        status: map_scraped_status(&description),
        location,
        description,
        details: None,
    })
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

#[derive(Debug, Deserialize)]
struct TrackResponseXml {
    #[serde(rename = "TrackInfo", default)]
    track_info: Vec<TrackInfoXml>,
}

#[derive(Debug, Deserialize)]
struct TrackInfoXml {
    #[serde(rename = "@ID")]
    id: String,
    #[serde(rename = "Class", default)]
    class: Option<String>,
    #[serde(rename = "ExpectedDeliveryDate", default)]
    expected_delivery_date: Option<String>,
    #[serde(rename = "TrackSummary", default)]
    summary: Option<TrackEventXml>,
    #[serde(rename = "TrackDetail", default)]
    details: Vec<TrackEventXml>,
    #[serde(rename = "Error", default)]
    error: Option<UspsErrorXml>,
}

#[derive(Debug, Default, Deserialize)]
struct TrackEventXml {
    #[serde(rename = "EventTime", default)]
    event_time: Option<String>,
    #[serde(rename = "EventDate", default)]
    event_date: Option<String>,
    #[serde(rename = "Event", default)]
    event: Option<String>,
    #[serde(rename = "EventCity", default)]
    event_city: Option<String>,
    #[serde(rename = "EventState", default)]
    event_state: Option<String>,
    #[serde(rename = "EventZIPCode", default)]
    event_zip: Option<String>,
    #[serde(rename = "EventCountry", default)]
    event_country: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UspsErrorXml {
    #[serde(rename = "Number", default)]
    number: Option<String>,
    #[serde(rename = "Description", default)]
    description: Option<String>,
}

#[async_trait::async_trait]
impl TrackingClient for UspsApiClient {
    fn carrier_name(&self) -> &'static str {
        Carrier::Usps.as_str()
    }

    fn kind(&self) -> ClientKind {
        ClientKind::Api
    }

    fn validate_tracking_number(&self, tracking_number: &str) -> bool {
        validation::is_usps(tracking_number)
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

            let xml = self.build_request_xml(chunk);
            let body = self.send_batch(ctx, &xml).await?;

            let parsed: TrackResponseXml = quick_xml::de::from_str(&body)
                .map_err(|e| TrackError::Parse(format!("USPS TrackResponse: {}", e)))?;

            for number in chunk {
                let matched = parsed.track_info.iter().find(|info| &info.id == number);
                match matched {
                    None => response
                        .errors
                        .push(CarrierError::no_results(Carrier::Usps, number)),
                    Some(xml_info) => {
                        if let Some(error) = &xml_info.error {
                            let message = error
                                .description
                                .clone()
                                .unwrap_or_else(|| "tracking information unavailable".to_string());
                            tracing::debug!(
                                tracking_number = %number,
                                usps_error = error.number.as_deref().unwrap_or("-"),
                                "USPS reported per-number error"
                            );
                            response.errors.push(CarrierError::new(
                                Carrier::Usps,
                                Some(number.clone()),
                                codes::NOT_FOUND,
                                message,
                                false,
                            ));
                        } else {
                            response.results.push(self.build_info(number, xml_info));
                        }
                    }
                }
            }
        }

        response.rate_limit = self.rate_limit();
        Ok(response)
    }
}
