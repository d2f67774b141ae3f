//! DHL tracking-page scraper.
//!
//! DHL renders checkpoint blocks with status, location and date; the
//! destination country is printed once at the page level, so the scraper
//! appends it to checkpoint locations that do not already carry it.

use std::sync::LazyLock;

use regex::Regex;

use crate::client::TrackingClient;
use crate::ctx::TrackContext;
use crate::error::{CarrierError, TrackError};
use crate::normalize;
use crate::scrape::{strip_tags, PageFetcher};
use crate::types::{
    Carrier, CarrierConfig, ClientKind, RateLimitInfo, TrackingInfo, TrackingRequest,
    TrackingResponse,
};
use crate::validation;

use super::scrape_common::{
    build_events, page_reports_not_found, run_pattern_ladder, summary_fallback, EventPattern,
};

const DHL_TRACK_BASE: &str = "https://www.dhl.com";

const NOT_FOUND_PHRASES: &[&str] = &[
    "tracking attempt was not successful",
    "no results found",
    "number you entered is not valid",
];

static DESTINATION_COUNTRY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)<[^>]*class="[^"]*c-tracking-result--destination-country[^"]*"[^>]*>(.*?)</"#)
        .unwrap()
});

fn patterns() -> Vec<EventPattern> {
    vec![
        EventPattern::new(
            "dhl-checkpoint",
            r#"(?s)<div[^>]*class="[^"]*c-tracking-result--checkpoint[^"]*"[^>]*>.*?<p[^>]*class="[^"]*checkpoint-status[^"]*"[^>]*>(?P<status>.*?)</p>.*?<p[^>]*class="[^"]*checkpoint-location[^"]*"[^>]*>(?P<location>.*?)</p>.*?<p[^>]*class="[^"]*checkpoint-date[^"]*"[^>]*>(?P<date>.*?)</p>"#,
        ),
        EventPattern::new(
            "dhl-event-table",
            r#"(?s)<tr[^>]*class="[^"]*dhl-event-row[^"]*"[^>]*>.*?<td[^>]*class="[^"]*event-time[^"]*"[^>]*>(?P<date>.*?)</td>.*?<td[^>]*class="[^"]*event-status[^"]*"[^>]*>(?P<status>.*?)</td>.*?<td[^>]*class="[^"]*event-location[^"]*"[^>]*>(?P<location>.*?)</td>.*?</tr>"#,
        ),
    ]
}

pub struct DhlScrapeClient {
    fetcher: PageFetcher,
    base_url: String,
    patterns: Vec<EventPattern>,
}

impl DhlScrapeClient {
    pub fn new(config: &CarrierConfig) -> Result<Self, TrackError> {
        Ok(Self {
            fetcher: PageFetcher::new(Carrier::Dhl, config)?,
            base_url: DHL_TRACK_BASE.to_string(),
            patterns: patterns(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn tracking_url(&self, tracking_number: &str) -> String {
        format!("{}/track?tracking-id={}", self.base_url, tracking_number)
    }

    fn parse_page(&self, tracking_number: &str, html: &str) -> Result<TrackingInfo, CarrierError> {
        if page_reports_not_found(html, NOT_FOUND_PHRASES) {
            return Err(CarrierError::not_found(Carrier::Dhl, tracking_number));
        }

        let mut raw_events = run_pattern_ladder(&self.patterns, html);
        if raw_events.is_empty() {
            raw_events.extend(summary_fallback(html));
        }

        // The page prints the destination country once; checkpoints carry
        // only city/state/zip, except origin scans that name their own
        // country code.
        if let Some(country) = destination_country(html) {
            for raw in &mut raw_events {
                if !raw.location.is_empty() && !has_country_suffix(&raw.location) {
                    raw.location = format!("{}, {}", raw.location, country);
                }
            }
        }

        let events = build_events(raw_events);
        if events.is_empty() {
            return Err(CarrierError::no_events(Carrier::Dhl, tracking_number));
        }

        let mut info = TrackingInfo::new(tracking_number, Carrier::Dhl);
        info.events = events;
        normalize::finalize(&mut info, None);
        Ok(info)
    }
}

/// True when the last comma-separated token is a two-letter country code.
fn has_country_suffix(location: &str) -> bool {
    location
        .rsplit(',')
        .next()
        .map(|last| {
            let token = last.trim();
            token.len() == 2 && token.bytes().all(|b| b.is_ascii_uppercase())
        })
        .unwrap_or(false)
}

fn destination_country(html: &str) -> Option<String> {
    DESTINATION_COUNTRY_RE
        .captures(html)
        .and_then(|caps| caps.get(1))
        .map(|m| strip_tags(m.as_str()))
        .filter(|country| !country.is_empty())
}

#[async_trait::async_trait]
impl TrackingClient for DhlScrapeClient {
    fn carrier_name(&self) -> &'static str {
        Carrier::Dhl.as_str()
    }

    fn kind(&self) -> ClientKind {
        ClientKind::Scraping
    }

    fn validate_tracking_number(&self, tracking_number: &str) -> bool {
        validation::is_dhl(tracking_number)
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

    const CHECKPOINT_HTML: &str = r#"
<div class="c-tracking-result">
  <span class="c-tracking-result--destination-country">US</span>
  <div class="c-tracking-result--checkpoint">
    <p class="checkpoint-status">Delivered</p>
    <p class="checkpoint-location">NEW YORK, NY 10001</p>
    <p class="checkpoint-date">May 15, 2023 2:15 PM</p>
  </div>
  <div class="c-tracking-result--checkpoint">
    <p class="checkpoint-status">Shipment is out with courier for delivery</p>
    <p class="checkpoint-location">NEW YORK, NY 10001</p>
    <p class="checkpoint-date">May 15, 2023 8:31 AM</p>
  </div>
  <div class="c-tracking-result--checkpoint">
    <p class="checkpoint-status">Arrived at delivery facility</p>
    <p class="checkpoint-location">NEW YORK GATEWAY</p>
    <p class="checkpoint-date">May 14, 2023 10:05 PM</p>
  </div>
  <div class="c-tracking-result--checkpoint">
    <p class="checkpoint-status">Shipment picked up</p>
    <p class="checkpoint-location">LONDON HEATHROW, GB</p>
    <p class="checkpoint-date">May 12, 2023 9:00 AM</p>
  </div>
</div>"#;

    fn client() -> DhlScrapeClient {
        DhlScrapeClient::new(&CarrierConfig::default()).unwrap()
    }

    #[test]
    fn test_parse_checkpoints_delivered() {
        let info = client().parse_page("1234567890", CHECKPOINT_HTML).unwrap();
        assert_eq!(info.status, TrackingStatus::Delivered);
        assert_eq!(info.events.len(), 4);
        assert_eq!(info.events[0].location, "NEW YORK, NY 10001, US");
        assert_eq!(info.actual_delivery, Some(info.events[0].timestamp));
        // Newest first throughout.
        for pair in info.events.windows(2) {
            assert!(pair[0].timestamp >= pair[1].timestamp);
        }
    }

    #[test]
    fn test_destination_country_not_doubled() {
        let info = client().parse_page("1234567890", CHECKPOINT_HTML).unwrap();
        // The origin checkpoint already names a country and keeps it.
        assert_eq!(info.events[3].location, "LONDON HEATHROW, GB");
    }

    #[test]
    fn test_event_table_fallback_pattern() {
        let html = r#"
<table>
  <tr class="dhl-event-row">
    <td class="event-time">May 14, 2023 10:05 PM</td>
    <td class="event-status">Processed at DHL facility</td>
    <td class="event-location">CINCINNATI HUB, OH</td>
  </tr>
</table>"#;
        let info = client().parse_page("1234567890", html).unwrap();
        assert_eq!(info.events.len(), 1);
        assert_eq!(info.events[0].location, "CINCINNATI HUB, OH");
    }

    #[test]
    fn test_not_found_page() {
        let html = "<p>Sorry, your tracking attempt was not successful.</p>";
        let err = client().parse_page("1234567890", html).unwrap_err();
        assert_eq!(err.code, crate::error::codes::NOT_FOUND);
    }

    #[test]
    fn test_tracking_url_shape() {
        assert_eq!(
            client().tracking_url("1234567890"),
            "https://www.dhl.com/track?tracking-id=1234567890"
        );
    }
}
