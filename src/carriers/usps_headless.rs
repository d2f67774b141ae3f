//! USPS headless client.
//!
//! The USPS tracking page is dynamic but not adversarial: the tracking bar
//! renders client-side a few seconds after load. The loader waits for
//! `body`, gives the page a long first sleep, runs a readiness probe, then
//! a short second sleep before snapshotting the DOM. Parsing reuses the
//! USPS scraper's pattern ladder, including the date normalisation for the
//! interior-comma and `&nbsp;` artefacts.

use std::sync::Arc;
use std::time::Duration;

use crate::client::{HeadlessClient, TrackingClient};
use crate::ctx::TrackContext;
use crate::error::{codes, CarrierError, TrackError};
use crate::headless::{
    wait_for_selector, ExtractionResult, Extractor, HeadlessEngine, HeadlessOptions, WaitStrategy,
};
use crate::pool::BrowserPool;
use crate::types::{
    Carrier, CarrierConfig, ClientKind, RateLimitInfo, TrackingRequest, TrackingResponse,
};
use crate::validation;

use super::scrape_common::EventPattern;
use super::usps_scrape;

const USPS_TRACK_BASE: &str = "https://tools.usps.com";

const OPERATION_TIMEOUT: Duration = Duration::from_secs(60);
const BODY_WAIT: Duration = Duration::from_secs(10);
/// The tracking bar usually attaches within ten seconds of DOM ready.
const INITIAL_SLEEP: Duration = Duration::from_secs(10);
const POST_PROBE_SLEEP: Duration = Duration::from_secs(5);

/// Readiness probe for the dynamic tracking markup.
const READY_PROBE: &str = r#"!!(document.querySelector('.tb-step')
    || document.querySelector('.track-bar-container')
    || document.querySelector('.detail-wrapper'))"#;

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
        EventPattern::new(
            "usps-banner",
            r#"(?s)<div[^>]*class="[^"]*delivery_status[^"]*"[^>]*>.*?<h2[^>]*>(?P<status>.*?)</h2>.*?<p[^>]*class="[^"]*date[^"]*"[^>]*>(?P<date>.*?)</p>"#,
        ),
    ]
}

pub struct UspsHeadlessClient {
    engine: Arc<HeadlessEngine>,
    base_url: String,
    patterns: Vec<EventPattern>,
}

impl UspsHeadlessClient {
    pub fn new(config: &CarrierConfig, pool: BrowserPool) -> Self {
        let options = HeadlessOptions {
            wait: WaitStrategy::Custom,
            stealth: true,
            user_agent: Some(config.user_agent().to_string()),
            capture_artifacts: true,
            ..HeadlessOptions::default()
        };
        Self {
            engine: Arc::new(HeadlessEngine::new(pool, Carrier::Usps, options)),
            base_url: USPS_TRACK_BASE.to_string(),
            patterns: patterns(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn tracking_url(&self, tracking_number: &str) -> String {
        format!(
            "{}/go/TrackConfirmAction?qtc_tLabels1={}",
            self.base_url, tracking_number
        )
    }

    async fn render_tracking_page(
        &self,
        ctx: &TrackContext,
        tracking_number: &str,
    ) -> Result<String, TrackError> {
        let url = self.tracking_url(tracking_number);
        let op_ctx = ctx.bounded(OPERATION_TIMEOUT);
        let number = tracking_number.to_string();

        self.engine
            .with_page(&op_ctx, &url, move |page| async move {
                wait_for_selector(&page, "body", BODY_WAIT).await;
                tokio::time::sleep(INITIAL_SLEEP).await;

                let ready = page
                    .evaluate(READY_PROBE)
                    .await
                    .ok()
                    .and_then(|r| r.value().and_then(|v| v.as_bool()))
                    .unwrap_or(false);
                if !ready {
                    tracing::debug!(tracking_number = %number, "tracking markup not ready yet");
                }
                tokio::time::sleep(POST_PROBE_SLEEP).await;

                page.content()
                    .await
                    .map_err(|e| TrackError::Browser(format!("failed to read page source: {}", e)))
            })
            .await
    }
}

#[async_trait::async_trait]
impl TrackingClient for UspsHeadlessClient {
    fn carrier_name(&self) -> &'static str {
        Carrier::Usps.as_str()
    }

    fn kind(&self) -> ClientKind {
        ClientKind::Headless
    }

    fn validate_tracking_number(&self, tracking_number: &str) -> bool {
        validation::is_usps(tracking_number)
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
                Ok(html) => {
                    match usps_scrape::parse_tracking_page(number, &html, &self.patterns) {
                        Ok(info) => response.results.push(info),
                        Err(err) => response.errors.push(err),
                    }
                }
                Err(TrackError::Carrier(err)) => response.errors.push(CarrierError {
                    tracking_number: Some(number.clone()),
                    ..err
                }),
                Err(TrackError::Browser(message)) => response.errors.push(CarrierError::new(
                    Carrier::Usps,
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
impl HeadlessClient for UspsHeadlessClient {
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
