//! UPS tracking-page scraper.
//!
//! UPS serves a progress table in its legacy markup and activity cards in
//! the newer one; both rotate in production, so the ladder carries both.

use crate::client::TrackingClient;
use crate::ctx::TrackContext;
use crate::error::{CarrierError, TrackError};
use crate::normalize;
use crate::scrape::PageFetcher;
use crate::types::{
    Carrier, CarrierConfig, ClientKind, RateLimitInfo, TrackingInfo, TrackingRequest,
    TrackingResponse,
};
use crate::validation;

use super::scrape_common::{
    build_events, page_reports_not_found, run_pattern_ladder, summary_fallback, EventPattern,
};

const UPS_TRACK_BASE: &str = "https://www.ups.com";

const NOT_FOUND_PHRASES: &[&str] = &[
    "could not locate the shipment details for this tracking number",
    "no information for this tracking number",
    "tracking number entered is not valid",
];

fn patterns() -> Vec<EventPattern> {
    vec![
        EventPattern::new(
            "ups-progress-table",
            r#"(?s)<tr[^>]*class="ups-prog_activity_row"[^>]*>.*?<td[^>]*class="ups-prog_date"[^>]*>(?P<date>.*?)</td>.*?<td[^>]*class="ups-prog_location"[^>]*>(?P<location>.*?)</td>.*?<td[^>]*class="ups-prog_activity"[^>]*>(?P<status>.*?)</td>.*?</tr>"#,
        ),
        EventPattern::new(
            "ups-activity-card",
            r#"(?s)<div[^>]*class="ups-activity-card"[^>]*data-date="(?P<date>[^"]*)"[^>]*>.*?<span[^>]*class="activity-status"[^>]*>(?P<status>.*?)</span>.*?<span[^>]*class="activity-location"[^>]*>(?P<location>.*?)</span>"#,
        ),
    ]
}

pub struct UpsScrapeClient {
    fetcher: PageFetcher,
    base_url: String,
    patterns: Vec<EventPattern>,
}

impl UpsScrapeClient {
    pub fn new(config: &CarrierConfig) -> Result<Self, TrackError> {
        Ok(Self {
            fetcher: PageFetcher::new(Carrier::Ups, config)?,
            base_url: UPS_TRACK_BASE.to_string(),
            patterns: patterns(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn tracking_url(&self, tracking_number: &str) -> String {
        format!("{}/track?tracknum={}", self.base_url, tracking_number)
    }

    fn parse_page(&self, tracking_number: &str, html: &str) -> Result<TrackingInfo, CarrierError> {
        if page_reports_not_found(html, NOT_FOUND_PHRASES) {
            return Err(CarrierError::not_found(Carrier::Ups, tracking_number));
        }

        let mut raw_events = run_pattern_ladder(&self.patterns, html);
        if raw_events.is_empty() {
            raw_events.extend(summary_fallback(html));
        }

        let events = build_events(raw_events);
        if events.is_empty() {
            return Err(CarrierError::no_events(Carrier::Ups, tracking_number));
        }

        let mut info = TrackingInfo::new(tracking_number, Carrier::Ups);
        info.events = events;
        normalize::finalize(&mut info, None);
        Ok(info)
    }
}

#[async_trait::async_trait]
impl TrackingClient for UpsScrapeClient {
    fn carrier_name(&self) -> &'static str {
        Carrier::Ups.as_str()
    }

    fn kind(&self) -> ClientKind {
        ClientKind::Scraping
    }

    fn validate_tracking_number(&self, tracking_number: &str) -> bool {
        validation::is_ups(tracking_number)
    }

    fn rate_limit(&self) -> RateLimitInfo {
        self.fetcher.rate_limit()
    }

    async fn track(
        &self,
        ctx: &TrackContext,
        request: &TrackingRequest,
    ) -> Result<TrackingResponse, TrackError> {
        let mut response = TrackingResponse::new(self.rate_limit());

        for number in &request.tracking_numbers {
            ctx.checkpoint()?;

            let url = self.tracking_url(number);
            let html = self.fetcher.fetch_page(ctx, &url).await?;
            match self.parse_page(number, &html) {
                Ok(info) => response.results.push(info),
                Err(err) => response.errors.push(err),
            }
        }

        response.rate_limit = self.rate_limit();
        Ok(response)
    }
}
