//! FedEx legacy tracking-page scraper.
//!
//! The legacy mobile/print views still render a travel-history table
//! server-side; the SPA main site does not, which is why FedEx also has a
//! headless client. This scraper covers the legacy formats.

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

const FEDEX_TRACK_BASE: &str = "https://www.fedex.com";

const NOT_FOUND_PHRASES: &[&str] = &[
    "no record of this tracking number",
    "enter a valid tracking number",
    "tracking number cannot be found",
];

fn patterns() -> Vec<EventPattern> {
    vec![
        EventPattern::new(
            "fedex-travel-history",
            r#"(?s)<tr[^>]*class="travel-history-row"[^>]*>.*?<td[^>]*class="travel-history-date"[^>]*>(?P<date>.*?)</td>.*?<td[^>]*class="travel-history-status"[^>]*>(?P<status>.*?)</td>.*?<td[^>]*class="travel-history-location"[^>]*>(?P<location>.*?)</td>.*?</tr>"#,
        ),
        EventPattern::new(
            "fedex-scan-event",
            r#"(?s)<div[^>]*class="fedex-scan-event"[^>]*>.*?<span[^>]*class="scan-status"[^>]*>(?P<status>.*?)</span>.*?<span[^>]*class="scan-location"[^>]*>(?P<location>.*?)</span>.*?<span[^>]*class="scan-date"[^>]*>(?P<date>.*?)</span>"#,
        ),
    ]
}

pub struct FedExScrapeClient {
    fetcher: PageFetcher,
    base_url: String,
    patterns: Vec<EventPattern>,
}

impl FedExScrapeClient {
    pub fn new(config: &CarrierConfig) -> Result<Self, TrackError> {
        Ok(Self {
            fetcher: PageFetcher::new(Carrier::FedEx, config)?,
            base_url: FEDEX_TRACK_BASE.to_string(),
            patterns: patterns(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn tracking_url(&self, tracking_number: &str) -> String {
        format!("{}/track?trackingnumber={}", self.base_url, tracking_number)
    }

    fn parse_page(&self, tracking_number: &str, html: &str) -> Result<TrackingInfo, CarrierError> {
        if page_reports_not_found(html, NOT_FOUND_PHRASES) {
            return Err(CarrierError::not_found(Carrier::FedEx, tracking_number));
        }

        let mut raw_events = run_pattern_ladder(&self.patterns, html);
        if raw_events.is_empty() {
            raw_events.extend(summary_fallback(html));
        }

        let events = build_events(raw_events);
        if events.is_empty() {
            return Err(CarrierError::no_events(Carrier::FedEx, tracking_number));
        }

        let mut info = TrackingInfo::new(tracking_number, Carrier::FedEx);
        info.events = events;
        normalize::finalize(&mut info, None);
        Ok(info)
    }
}

#[async_trait::async_trait]
impl TrackingClient for FedExScrapeClient {
    fn carrier_name(&self) -> &'static str {
        Carrier::FedEx.as_str()
    }

    fn kind(&self) -> ClientKind {
        ClientKind::Scraping
    }

    fn validate_tracking_number(&self, tracking_number: &str) -> bool {
        validation::is_fedex(tracking_number)
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TrackingStatus;

    const TRAVEL_HISTORY_HTML: &str = r#"
<table class="travel-history">
  <tr class="travel-history-row">
    <td class="travel-history-date">5/15/2023 2:15 PM</td>
    <td class="travel-history-status">Delivered</td>
    <td class="travel-history-location">MEMPHIS, TN</td>
  </tr>
  <tr class="travel-history-row">
    <td class="travel-history-date">5/15/2023 8:12 AM</td>
    <td class="travel-history-status">On FedEx vehicle for delivery</td>
    <td class="travel-history-location">MEMPHIS, TN</td>
  </tr>
  <tr class="travel-history-row">
    <td class="travel-history-date">5/14/2023 9:40 PM</td>
    <td class="travel-history-status">Arrived at FedEx location</td>
    <td class="travel-history-location">MEMPHIS, TN</td>
  </tr>
</table>"#;

    fn client() -> FedExScrapeClient {
        FedExScrapeClient::new(&CarrierConfig::default()).unwrap()
    }

    #[test]
    fn test_parse_travel_history() {
        let info = client()
            .parse_page("123456789012", TRAVEL_HISTORY_HTML)
            .unwrap();
        assert_eq!(info.status, TrackingStatus::Delivered);
        assert_eq!(info.events.len(), 3);
        assert_eq!(info.events[1].status, TrackingStatus::OutForDelivery);
        assert_eq!(info.events[2].status, TrackingStatus::InTransit);
        assert_eq!(info.actual_delivery, Some(info.events[0].timestamp));
    }

    #[test]
    fn test_parse_scan_event_divs() {
        let html = r#"
<div class="fedex-scan-event">
  <span class="scan-status">In transit</span>
  <span class="scan-location">NASHVILLE, TN</span>
  <span class="scan-date">5/14/2023 11:02 AM</span>
</div>"#;
        let info = client().parse_page("123456789012", html).unwrap();
        assert_eq!(info.status, TrackingStatus::InTransit);
        assert_eq!(info.events[0].location, "NASHVILLE, TN");
    }

    #[test]
    fn test_not_found_page() {
        let html = "<p>We have no record of this tracking number.</p>";
        let err = client().parse_page("123456789012", html).unwrap_err();
        assert_eq!(err.code, crate::error::codes::NOT_FOUND);
    }

    #[test]
    fn test_empty_page_is_no_events() {
        let err = client().parse_page("123456789012", "<html></html>").unwrap_err();
        assert_eq!(err.code, crate::error::codes::NO_EVENTS);
        assert!(err.retryable);
    }

    #[test]
    fn test_tracking_url_shape() {
        assert_eq!(
            client().tracking_url("123456789012"),
            "https://www.fedex.com/track?trackingnumber=123456789012"
        );
    }
}
