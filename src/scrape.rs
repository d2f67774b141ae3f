//! Shared HTTP scraping substrate.
//!
//! The carrier tracking pages are fetched with browser-like headers behind
//! a local per-minute token bucket, then parsed with the regex helpers and
//! the date/status recovery functions below. Every scraping client builds
//! on this module; the API clients reuse the status classifier and the
//! location formatting.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use reqwest::header;
use std::sync::LazyLock;
use std::sync::Mutex;

use crate::ctx::TrackContext;
use crate::error::{CarrierError, TrackError};
use crate::types::{Carrier, RateLimitInfo};

/// Local request budget for polite scraping, per minute.
pub const SCRAPE_REQUESTS_PER_MINUTE: i32 = 10;

/// Polite page fetcher with rate-limit accounting.
///
/// One fetcher per scraping client; the bucket is local, so a depleted
/// budget fails fast without touching the carrier at all.
pub struct PageFetcher {
    http: reqwest::Client,
    carrier: Carrier,
    user_agent: String,
    /// Transport-level connect retries. Protocol-level retries stay
    /// forbidden; this only covers connections that never reached the
    /// carrier.
    max_retries: u32,
    rate: Mutex<RateLimitInfo>,
}

impl PageFetcher {
    pub fn new(carrier: Carrier, config: &crate::types::CarrierConfig) -> Result<Self, TrackError> {
        let http = reqwest::Client::builder()
            .cookie_store(true)
            .timeout(config.timeout())
            .build()?;
        Ok(Self {
            http,
            carrier,
            user_agent: config.user_agent().to_string(),
            max_retries: config.max_retries,
            rate: Mutex::new(RateLimitInfo::per_minute(SCRAPE_REQUESTS_PER_MINUTE)),
        })
    }

    pub fn rate_limit(&self) -> RateLimitInfo {
        self.rate.lock().expect("rate lock poisoned").clone()
    }

    /// Fail before sending when the local bucket is depleted; refill once
    /// the window has passed.
    fn check_rate_limit(&self) -> Result<(), TrackError> {
        let mut rate = self.rate.lock().expect("rate lock poisoned");
        let now = Utc::now();
        if now >= rate.reset_time {
            rate.remaining = rate.limit;
            rate.reset_time = now + chrono::Duration::seconds(60);
        }
        if rate.remaining <= 0 {
            return Err(CarrierError::rate_limited(
                self.carrier,
                format!("local scrape budget exhausted until {}", rate.reset_time),
            )
            .into());
        }
        Ok(())
    }

    fn consume_request(&self) {
        let mut rate = self.rate.lock().expect("rate lock poisoned");
        rate.remaining -= 1;
        if rate.remaining <= 0 {
            rate.remaining = 0;
            rate.reset_time = Utc::now() + chrono::Duration::seconds(60);
        }
    }

    fn record_upstream_throttle(&self, retry_after: Option<std::time::Duration>) {
        let mut rate = self.rate.lock().expect("rate lock poisoned");
        rate.remaining = 0;
        rate.reset_time = Utc::now() + chrono::Duration::seconds(60);
        rate.retry_after = retry_after;
    }

    /// GET a tracking page with headers mimicking a real browser. The
    /// transport negotiates content encoding itself; no `Accept-Encoding`
    /// override.
    pub async fn fetch_page(&self, ctx: &TrackContext, url: &str) -> Result<String, TrackError> {
        self.check_rate_limit()?;

        tracing::debug!(carrier = %self.carrier, url, "fetching tracking page");

        let build_request = || {
            self.http
                .get(url)
                .header(header::USER_AGENT, &self.user_agent)
                .header(
                    header::ACCEPT,
                    "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8",
                )
                .header(header::ACCEPT_LANGUAGE, "en-US,en;q=0.9")
                .header(header::CONNECTION, "keep-alive")
                .header("Upgrade-Insecure-Requests", "1")
        };

        let mut attempt = 0;
        let response = loop {
            let sent = ctx
                .run(async { Ok::<_, TrackError>(build_request().send().await) })
                .await?;
            match sent {
                Ok(response) => break response,
                Err(e) if e.is_connect() && attempt < self.max_retries => {
                    attempt += 1;
                    tracing::debug!(carrier = %self.carrier, attempt, "connect failed, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        };
        self.consume_request();

        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(std::time::Duration::from_secs);
            self.record_upstream_throttle(retry_after);
            return Err(CarrierError::rate_limited(
                self.carrier,
                format!("{} returned HTTP 429", self.carrier),
            )
            .into());
        }
        if !status.is_success() {
            return Err(TrackError::Http {
                status: status.as_u16(),
            });
        }

        let body = ctx.run(async { Ok(response.text().await?) }).await?;
        tracing::debug!(carrier = %self.carrier, bytes = body.len(), "page fetched");
        Ok(body)
    }
}

static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").unwrap());
static WS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// Decode the entity set that shows up in carrier tracking markup.
pub fn decode_entities(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
}

/// Drop tags, decode entities and collapse whitespace.
pub fn strip_tags(html: &str) -> String {
    let text = TAG_RE.replace_all(html, " ");
    let text = decode_entities(&text);
    WS_RE.replace_all(text.trim(), " ").to_string()
}

/// Join city/state/zip/country into the human location form the carriers
/// print: `CITY, ST ZIP, CC`. Empty parts are skipped.
pub fn format_location(city: &str, state: &str, zip: &str, country: &str) -> String {
    let mut out = String::new();
    let city = city.trim();
    let state = state.trim();
    let zip = zip.trim();
    let country = country.trim();

    if !city.is_empty() {
        out.push_str(city);
    }
    let region = match (state.is_empty(), zip.is_empty()) {
        (false, false) => format!("{} {}", state, zip),
        (false, true) => state.to_string(),
        (true, false) => zip.to_string(),
        (true, true) => String::new(),
    };
    if !region.is_empty() {
        if !out.is_empty() {
            out.push_str(", ");
        }
        out.push_str(&region);
    }
    if !country.is_empty() {
        if !out.is_empty() {
            out.push_str(", ");
        }
        out.push_str(country);
    }
    out
}

/// Failure sentinel from [`parse_date_time`]: carries a wall-clock fallback
/// so callers can decide between dropping the event and stamping it.
#[derive(Debug)]
pub struct DateParseError {
    pub input: String,
    pub fallback: DateTime<Utc>,
}

impl std::fmt::Display for DateParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unparseable date: {:?}", self.input)
    }
}

impl std::error::Error for DateParseError {}

const DATETIME_LAYOUTS: &[&str] = &[
    // Month D, YYYY h:mm AM/PM (the "at" variant is normalised away).
    "%B %d, %Y %I:%M %p",
    "%b %d, %Y %I:%M %p",
    "%m/%d/%Y %I:%M %p",
    "%m/%d/%Y %H:%M",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
];

const DATE_LAYOUTS: &[&str] = &[
    "%A, %B %d, %Y",
    "%B %d, %Y",
    "%m/%d/%Y",
];

/// Parse a carrier-formatted date/time into an instant.
///
/// Tries the fixed layout list spanning the formats observed across carrier
/// pages and APIs. Zone-less values are interpreted as UTC. On total
/// failure the error carries the current wall clock as a fallback; callers
/// should prefer dropping the event over stamping it with "now".
pub fn parse_date_time(input: &str) -> Result<DateTime<Utc>, DateParseError> {
    let cleaned = WS_RE
        .replace_all(&decode_entities(input).replace('\u{a0}', " "), " ")
        .trim()
        .to_string();
    let cleaned = cleaned.replace(" at ", " ");

    if let Ok(with_zone) = DateTime::parse_from_rfc3339(&cleaned) {
        return Ok(with_zone.with_timezone(&Utc));
    }
    for layout in DATETIME_LAYOUTS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(&cleaned, layout) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }
    for layout in DATE_LAYOUTS {
        if let Ok(date) = NaiveDate::parse_from_str(&cleaned, layout) {
            if let Some(naive) = date.and_hms_opt(0, 0, 0) {
                return Ok(Utc.from_utc_datetime(&naive));
            }
        }
    }

    Err(DateParseError {
        input: input.to_string(),
        fallback: Utc::now(),
    })
}

/// Case-insensitive substring classifier for scraped status text.
///
/// Priority is significant: delivered wins over out-for-delivery, which
/// wins over in-transit, so "Out for Delivery" can never be classified as
/// in-transit by its weaker substrings.
pub fn map_scraped_status(text: &str) -> crate::types::TrackingStatus {
    use crate::types::TrackingStatus::*;

    let text = text.to_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| text.contains(n));

    if has(&["delivered"]) {
        return Delivered;
    }
    if has(&["out for delivery", "on vehicle"]) {
        return OutForDelivery;
    }
    if has(&[
        "in transit",
        "en route",
        "arrived",
        "departed",
        "at facility",
        "on its way",
    ]) {
        return InTransit;
    }
    if has(&[
        "picked up",
        "pre-shipment",
        "acceptance",
        "electronic",
        "label created",
        "shipment information received",
    ]) {
        return PreShip;
    }
    if has(&["delay", "held", "customs", "exception", "unable to deliver", "damaged"]) {
        return Exception;
    }
    if has(&["returned", "return to sender"]) {
        return Returned;
    }
    Unknown
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TrackingStatus;
    use chrono::Timelike;

    #[test]
    fn test_strip_tags_collapses_whitespace() {
        let html = "<div>\n  Delivered,\t<b>front&nbsp;door</b>  </div>";
        assert_eq!(strip_tags(html), "Delivered, front door");
    }

    #[test]
    fn test_decode_entities() {
        assert_eq!(
            decode_entities("a &amp; b &lt;c&gt; &quot;d&quot; &#39;e&#39;&nbsp;f"),
            "a & b <c> \"d\" 'e' f"
        );
    }

    #[test]
    fn test_format_location_shapes() {
        assert_eq!(
            format_location("GREENSBORO", "NC", "27401", ""),
            "GREENSBORO, NC 27401"
        );
        assert_eq!(
            format_location("NEW YORK", "NY", "10001", "US"),
            "NEW YORK, NY 10001, US"
        );
        assert_eq!(format_location("", "TN", "", ""), "TN");
        assert_eq!(format_location("", "", "", ""), "");
    }

    #[test]
    fn test_parse_month_name_layout() {
        let parsed = parse_date_time("May 11, 2016 11:07 am").unwrap();
        assert_eq!(parsed.to_rfc3339(), "2016-05-11T11:07:00+00:00");
    }

    #[test]
    fn test_parse_at_variant() {
        let parsed = parse_date_time("May 11, 2016 at 2:15 PM").unwrap();
        assert_eq!(parsed.hour(), 14);
    }

    #[test]
    fn test_parse_abbreviated_month() {
        let parsed = parse_date_time("Sep 3, 2023 9:05 AM").unwrap();
        assert_eq!(parsed.to_rfc3339(), "2023-09-03T09:05:00+00:00");
    }

    #[test]
    fn test_parse_numeric_layouts() {
        assert_eq!(
            parse_date_time("05/11/2016 11:07 AM").unwrap().hour(),
            11
        );
        assert_eq!(parse_date_time("05/11/2016 23:45").unwrap().hour(), 23);
    }

    #[test]
    fn test_parse_iso_variants() {
        assert_eq!(
            parse_date_time("2023-05-15T14:30:00-05:00").unwrap().to_rfc3339(),
            "2023-05-15T19:30:00+00:00"
        );
        assert_eq!(
            parse_date_time("2023-05-15T14:30:00").unwrap().hour(),
            14
        );
        assert_eq!(
            parse_date_time("2023-05-15T14:30:00.250").unwrap().minute(),
            30
        );
        assert_eq!(parse_date_time("2023-05-15 14:30:00").unwrap().hour(), 14);
    }

    #[test]
    fn test_parse_weekday_layout() {
        let parsed = parse_date_time("Thursday, May 11, 2023").unwrap();
        assert_eq!(parsed.hour(), 0);
    }

    #[test]
    fn test_parse_failure_carries_fallback() {
        let err = parse_date_time("no date here").unwrap_err();
        assert_eq!(err.input, "no date here");
        assert!(err.fallback <= Utc::now());
    }

    #[test]
    fn test_nbsp_artifacts_are_tolerated() {
        let parsed = parse_date_time("May 11, 2016\u{a0}11:07 am").unwrap();
        assert_eq!(parsed.hour(), 11);
    }

    #[test]
    fn test_status_priority_order() {
        assert_eq!(map_scraped_status("Delivered, Front Door"), TrackingStatus::Delivered);
        assert_eq!(
            map_scraped_status("Out for Delivery"),
            TrackingStatus::OutForDelivery
        );
        assert_eq!(
            map_scraped_status("On Vehicle for Delivery"),
            TrackingStatus::OutForDelivery
        );
        assert_eq!(map_scraped_status("In Transit to Next Facility"), TrackingStatus::InTransit);
        assert_eq!(map_scraped_status("Arrived at Hub"), TrackingStatus::InTransit);
        assert_eq!(map_scraped_status("Departed Memphis TN"), TrackingStatus::InTransit);
        assert_eq!(map_scraped_status("En route"), TrackingStatus::InTransit);
        assert_eq!(map_scraped_status("Picked Up"), TrackingStatus::PreShip);
        assert_eq!(
            map_scraped_status("Pre-Shipment Info Sent to USPS"),
            TrackingStatus::PreShip
        );
        assert_eq!(
            map_scraped_status("Electronic Shipping Info Received"),
            TrackingStatus::PreShip
        );
        assert_eq!(map_scraped_status("Acceptance"), TrackingStatus::PreShip);
        assert_eq!(map_scraped_status("Weather Delay"), TrackingStatus::Exception);
        assert_eq!(map_scraped_status("Held in Customs"), TrackingStatus::Exception);
        assert_eq!(map_scraped_status("Return to Sender"), TrackingStatus::Returned);
        assert_eq!(map_scraped_status("something else"), TrackingStatus::Unknown);
    }

    #[test]
    fn test_out_for_delivery_never_in_transit() {
        // "out for delivery" pages often also say "on its way"; the
        // priority order must still classify them as out-for-delivery.
        assert_eq!(
            map_scraped_status("Out for Delivery - on its way"),
            TrackingStatus::OutForDelivery
        );
    }
}
