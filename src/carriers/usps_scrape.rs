//! USPS tracking-page scraper.
//!
//! Page formats rotate between the modern `tb-step` containers and the
//! older detail tables; the ladder tries them in that order before the
//! free-text summary scan. The parsing functions are shared with the USPS
//! headless client, which snapshots the rendered DOM and feeds it through
//! the same ladder.

use std::sync::LazyLock;

use regex::Regex;

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

const USPS_TRACK_BASE: &str = "https://tools.usps.com";

pub(crate) const NOT_FOUND_PHRASES: &[&str] = &[
    "status not available",
    "could not locate",
    "delivery status information is not available",
    "label created, not yet in system",
];

/// `May 11, 2023, 11:07 am` — the interior comma before the time is a USPS
/// artefact the generic layouts do not accept.
static INTERIOR_COMMA_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{4}),\s+(\d{1,2}:)").unwrap());

/// Normalise USPS date text: `&nbsp;` artefacts and the interior comma
/// between year and time.
pub(crate) fn normalize_usps_date(s: &str) -> String {
    let s = s.replace('\u{a0}', " ").replace("&nbsp;", " ");
    INTERIOR_COMMA_RE.replace(&s, "$1 $2").trim().to_string()
}

fn patterns() -> Vec<EventPattern> {
    vec![
        EventPattern::new(
            "usps-tb-step",
            r#"(?s)<div[^>]*class="tb-step[^"]*"[^>]*>.*?<p[^>]*class="tb-status-detail"[^>]*>(?P<status>.*?)</p>.*?<p[^>]*class="tb-location"[^>]*>(?P<location>.*?)</p>.*?<p[^>]*class="tb-date"[^>]*>(?P<date>.*?)</p>"#,
        ),
        EventPattern::new(
            "usps-detail-table",
            r#"(?s)<tr[^>]*class="detail-wrapper"[^>]*>.*?<td[^>]*class="date-time"[^>]*>(?P<date>.*?)</td>.*?<td[^>]*class="status"[^>]*>(?P<status>.*?)</td>.*?<td[^>]*class="location"[^>]*>(?P<location>.*?)</td>.*?</tr>"#,
        ),
    ]
}

/// Parse a USPS tracking page (scraped or headless-rendered) into events,
/// running the not-found classifier first.
pub(crate) fn parse_tracking_page(
    tracking_number: &str,
    html: &str,
    patterns: &[EventPattern],
) -> Result<TrackingInfo, CarrierError> {
    if page_reports_not_found(html, NOT_FOUND_PHRASES) {
        return Err(CarrierError::not_found(Carrier::Usps, tracking_number));
    }

    let mut raw_events = run_pattern_ladder(patterns, html);
    if raw_events.is_empty() {
        raw_events.extend(summary_fallback(html));
    }
    for raw in &mut raw_events {
        if let Some(date) = &raw.date {
            raw.date = Some(normalize_usps_date(date));
        }
    }

    let events = build_events(raw_events);
    if events.is_empty() {
        return Err(CarrierError::no_events(Carrier::Usps, tracking_number));
    }

    let mut info = TrackingInfo::new(tracking_number, Carrier::Usps);
    info.events = events;
    normalize::finalize(&mut info, None);
    Ok(info)
}

pub struct UspsScrapeClient {
    fetcher: PageFetcher,
    base_url: String,
    patterns: Vec<EventPattern>,
}

impl UspsScrapeClient {
    pub fn new(config: &CarrierConfig) -> Result<Self, TrackError> {
        Ok(Self {
            fetcher: PageFetcher::new(Carrier::Usps, config)?,
            base_url: USPS_TRACK_BASE.to_string(),
            patterns: patterns(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub(crate) fn tracking_url(&self, tracking_number: &str) -> String {
        format!(
            "{}/go/TrackConfirmAction?qtc_tLabels1={}",
            self.base_url, tracking_number
        )
    }
}

#[async_trait::async_trait]
impl TrackingClient for UspsScrapeClient {
    fn carrier_name(&self) -> &'static str {
        Carrier::Usps.as_str()
    }

    fn kind(&self) -> ClientKind {
        ClientKind::Scraping
    }

    fn validate_tracking_number(&self, tracking_number: &str) -> bool {
        validation::is_usps(tracking_number)
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
            match parse_tracking_page(number, &html, &self.patterns) {
                Ok(info) => response.results.push(info),
                Err(err) => response.errors.push(err),
            }
        }

        response.rate_limit = self.rate_limit();
        Ok(response)
    }
}
