//! FedEx headless client.
//!
//! FedEx serves an Angular SPA that aggressively blocks automation, so the
//! page is driven in phases: navigate, DOM ready, stealth (injected by the
//! engine before any page script runs), poll until the SPA root is ready,
//! settle, then two human-like scrolls before the DOM snapshot. Three
//! classifier families run over the rendered HTML in a fixed order —
//! bot-detection, then server-error, then not-found — so an interdiction
//! page can never be mistaken for a missing shipment.

use std::sync::Arc;
use std::time::Duration;

use crate::client::{HeadlessClient, TrackingClient};
use crate::ctx::TrackContext;
use crate::error::{codes, CarrierError, TrackError};
use crate::headless::{
    ExtractionResult, Extractor, HeadlessEngine, HeadlessOptions, WaitStrategy,
};
use crate::normalize;
use crate::pool::BrowserPool;
use crate::types::{
    Carrier, CarrierConfig, ClientKind, RateLimitInfo, TrackingInfo, TrackingRequest,
    TrackingResponse,
};
use crate::validation;

use super::scrape_common::{build_events, run_pattern_ladder, EventPattern};

const FEDEX_TRACK_BASE: &str = "https://www.fedex.com";

/// The SPA regularly takes over a minute to settle behind its own
/// anti-automation checks.
const OPERATION_TIMEOUT: Duration = Duration::from_secs(90);
const SPA_READY_BUDGET: Duration = Duration::from_secs(45);
const SPA_POLL: Duration = Duration::from_millis(500);
const SETTLE_SLEEP: Duration = Duration::from_secs(2);

/// FedEx treats Firefox traffic more gently than headless-Chrome defaults.
const FIREFOX_UA: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:124.0) Gecko/20100101 Firefox/124.0";

const BOT_DETECTION_PHRASES: &[&str] = &[
    "unfortunately we are unable to retrieve your tracking results at this time",
    "unable to retrieve your tracking results",
    "please try again later",
];

const SERVER_ERROR_PHRASES: &[&str] = &[
    "we are currently performing maintenance",
    "system is temporarily unavailable",
    "temporarily down for maintenance",
];

const NOT_FOUND_PHRASES: &[&str] = &[
    "tracking number cannot be found",
    "no record of this tracking number",
    "please check the number and try again",
];

/// Readiness probe: the travel history root is attached in any of the
/// three markup generations.
const SPA_READY_PROBE: &str = r#"!!(document.querySelector('[data-test-id="scan-event"]')
    || document.querySelector('trk-shared-travel-history')
    || document.querySelector('.travel-history-row'))"#;

fn patterns() -> Vec<EventPattern> {
    vec![
        // Primary: modern data attributes.
        EventPattern::new(
            "fedex-data-test-id",
            r#"(?s)<[^>]*data-test-id="scan-event"[^>]*>.*?data-test-id="scan-event-date"[^>]*>(?P<date>.*?)<.*?data-test-id="scan-event-status"[^>]*>(?P<status>.*?)<.*?data-test-id="scan-event-location"[^>]*>(?P<location>.*?)<"#,
        ),
        // Secondary: Angular components.
        EventPattern::new(
            "fedex-angular-component",
            r#"(?s)<trk-shared-travel-history-scan-event[^>]*>.*?class="[^"]*scan-event-date[^"]*"[^>]*>(?P<date>.*?)<.*?class="[^"]*scan-event-status[^"]*"[^>]*>(?P<status>.*?)<.*?class="[^"]*scan-event-location[^"]*"[^>]*>(?P<location>.*?)<"#,
        ),
        // Tertiary: legacy classes.
        EventPattern::new(
            "fedex-legacy-travel-history",
            r#"(?s)<tr[^>]*class="travel-history-row"[^>]*>.*?<td[^>]*class="travel-history-date"[^>]*>(?P<date>.*?)</td>.*?<td[^>]*class="travel-history-status"[^>]*>(?P<status>.*?)</td>.*?<td[^>]*class="travel-history-location"[^>]*>(?P<location>.*?)</td>.*?</tr>"#,
        ),
    ]
}

/// Classify a rendered page. Order is load-bearing: the bot-detection
/// banner contains generic wording that would also trip a loose not-found
/// match.
fn classify_page(tracking_number: &str, html: &str) -> Option<CarrierError> {
    let lower = html.to_lowercase();

    if BOT_DETECTION_PHRASES.iter().any(|p| lower.contains(p)) {
        return Some(CarrierError::new(
            Carrier::FedEx,
            Some(tracking_number.to_string()),
            codes::BOT_DETECTION,
            "FedEx blocked the automated session",
            true,
        ));
    }
    if SERVER_ERROR_PHRASES.iter().any(|p| lower.contains(p)) {
        return Some(CarrierError::new(
            Carrier::FedEx,
            Some(tracking_number.to_string()),
            codes::SERVER_ERROR,
            "FedEx is serving a maintenance page",
            true,
        ));
    }
    if NOT_FOUND_PHRASES.iter().any(|p| lower.contains(p)) {
        return Some(CarrierError::not_found(Carrier::FedEx, tracking_number));
    }
    None
}

fn parse_rendered_page(
    tracking_number: &str,
    html: &str,
    patterns: &[EventPattern],
) -> Result<TrackingInfo, CarrierError> {
    if let Some(err) = classify_page(tracking_number, html) {
        return Err(err);
    }

    let events = build_events(run_pattern_ladder(patterns, html));
    if events.is_empty() {
        return Err(CarrierError::no_events(Carrier::FedEx, tracking_number));
    }

    let mut info = TrackingInfo::new(tracking_number, Carrier::FedEx);
    info.events = events;
    normalize::finalize(&mut info, None);
    Ok(info)
}

pub struct FedExHeadlessClient {
    engine: Arc<HeadlessEngine>,
    base_url: String,
    patterns: Vec<EventPattern>,
}

impl FedExHeadlessClient {
    pub fn new(config: &CarrierConfig, pool: BrowserPool) -> Self {
        let options = HeadlessOptions {
            wait: WaitStrategy::Custom,
            stealth: true,
            user_agent: Some(
                config
                    .user_agent
                    .clone()
                    .unwrap_or_else(|| FIREFOX_UA.to_string()),
            ),
            settle: SETTLE_SLEEP,
            capture_artifacts: true,
            ..HeadlessOptions::default()
        };
        Self {
            engine: Arc::new(HeadlessEngine::new(pool, Carrier::FedEx, options)),
            base_url: FEDEX_TRACK_BASE.to_string(),
            patterns: patterns(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn tracking_url(&self, tracking_number: &str) -> String {
        format!("{}/wtrk/track/?tracknumbers={}", self.base_url, tracking_number)
    }

    /// Drive the SPA through its phases and snapshot the DOM.
    async fn render_tracking_page(
        &self,
        ctx: &TrackContext,
        tracking_number: &str,
    ) -> Result<String, TrackError> {
        let url = self.tracking_url(tracking_number);
        let op_ctx = ctx.bounded(OPERATION_TIMEOUT);

        self.engine
            .with_page(&op_ctx, &url, move |page| async move {
                // Poll until the SPA root reports ready; interdiction pages
                // never do, so the budget falls through to classification.
                let budget = tokio::time::Instant::now() + SPA_READY_BUDGET;
                while tokio::time::Instant::now() < budget {
                    let ready = page
                        .evaluate(SPA_READY_PROBE)
                        .await
                        .ok()
                        .and_then(|r| r.value().and_then(|v| v.as_bool()))
                        .unwrap_or(false);
                    if ready {
                        break;
                    }
                    tokio::time::sleep(SPA_POLL).await;
                }

                tokio::time::sleep(SETTLE_SLEEP).await;

                // Two human-like scrolls with jitter; the SPA lazy-loads
                // the scan list below the fold.
                for _ in 0..2 {
                    let distance = 400 + fastrand::i64(0..200);
                    let _ = page
                        .evaluate(format!("window.scrollBy(0, {})", distance))
                        .await;
                    tokio::time::sleep(Duration::from_millis(300 + fastrand::u64(0..400))).await;
                }

                page.content()
                    .await
                    .map_err(|e| TrackError::Browser(format!("failed to read page source: {}", e)))
            })
            .await
    }
}

#[async_trait::async_trait]
impl TrackingClient for FedExHeadlessClient {
    fn carrier_name(&self) -> &'static str {
        Carrier::FedEx.as_str()
    }

    fn kind(&self) -> ClientKind {
        ClientKind::Headless
    }

    fn validate_tracking_number(&self, tracking_number: &str) -> bool {
        validation::is_fedex(tracking_number)
    }

    fn rate_limit(&self) -> RateLimitInfo {
        RateLimitInfo::unmetered()
    }

    async fn track(
        &self,
        ctx: &TrackContext,
        request: &TrackingRequest,
    ) -> Result<TrackingResponse, TrackError> {
        let mut response = TrackingResponse::new(self.rate_limit());

        for number in &request.tracking_numbers {
            ctx.checkpoint()?;

            match self.render_tracking_page(ctx, number).await {
                Ok(html) => match parse_rendered_page(number, &html, &self.patterns) {
                    Ok(info) => response.results.push(info),
                    Err(err) => response.errors.push(err),
                },
                // Browser-level failures are per-number and retryable; the
                // next number gets a fresh page.
                Err(TrackError::Carrier(err)) => response.errors.push(CarrierError {
                    tracking_number: Some(number.clone()),
                    ..err
                }),
                Err(TrackError::Browser(message)) => response.errors.push(CarrierError::new(
                    Carrier::FedEx,
                    Some(number.clone()),
                    codes::HEADLESS_ERROR,
                    message,
                    true,
                )),
                Err(fatal) => return Err(fatal),
            }
        }

        Ok(response)
    }
}

#[async_trait::async_trait]
impl HeadlessClient for FedExHeadlessClient {
    async fn navigate_and_extract(
        &self,
        ctx: &TrackContext,
        url: &str,
        extractors: &[Extractor],
    ) -> Result<ExtractionResult, TrackError> {
        self.engine.navigate_and_extract(ctx, url, extractors).await
    }

    async fn wait_for_content(
        &self,
        ctx: &TrackContext,
        url: &str,
        selectors: &[String],
    ) -> Result<String, TrackError> {
        self.engine
            .navigate_and_wait_for_tracking_data(ctx, url, selectors)
            .await
    }

    async fn execute_script(
        &self,
        ctx: &TrackContext,
        url: &str,
        script: &str,
    ) -> Result<serde_json::Value, TrackError> {
        self.engine.execute_script(ctx, url, script).await
    }

    async fn screenshot(&self, ctx: &TrackContext, url: &str) -> Result<Vec<u8>, TrackError> {
        self.engine.screenshot(ctx, url).await
    }

    async fn page_source(&self, ctx: &TrackContext, url: &str) -> Result<String, TrackError> {
        self.engine.page_source(ctx, url).await
    }

    async fn close(&self) -> Result<(), TrackError> {
        self.engine.close().await;
        Ok(())
    }
}
