//! Headless navigation and extraction over the browser pool.
//!
//! The engine borrows one pooled browser per operation, opens a fresh page,
//! optionally injects the stealth script and a user-agent override, then
//! runs the requested wait strategy and extraction. Failures become
//! headless carrier errors (retryable) with optional debug artifacts.

use std::collections::HashMap;
use std::time::Duration;

use chromiumoxide::cdp::browser_protocol::network::SetUserAgentOverrideParams;
use chromiumoxide::cdp::browser_protocol::page::AddScriptToEvaluateOnNewDocumentParams;
use chromiumoxide::page::Page;

use crate::ctx::TrackContext;
use crate::error::{codes, CarrierError, DebugArtifacts, TrackError};
use crate::pool::BrowserPool;
use crate::types::Carrier;

const SELECTOR_POLL: Duration = Duration::from_millis(250);
const NETWORK_IDLE_APPROXIMATION: Duration = Duration::from_secs(2);
const DEFAULT_SELECTOR_WAIT: Duration = Duration::from_secs(20);

/// Script injected into every new document when stealth is on. Removes the
/// automation flag and fakes the plugin/language/permission surface that
/// anti-bot heuristics probe.
const STEALTH_JS: &str = include_str!("carriers/js/stealth.js");

/// How the engine decides the page is ready for extraction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum WaitStrategy {
    /// Wait for the first required extractor's selector (or the first
    /// extractor's, when none is required).
    #[default]
    Selector,
    /// Portable approximation: a fixed short sleep.
    NetworkIdle,
    Timeout(Duration),
    /// The carrier client drives readiness itself.
    Custom,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractTarget {
    Text,
    Attribute(String),
}

/// One named piece of content to pull out of the rendered DOM.
#[derive(Debug, Clone)]
pub struct Extractor {
    pub name: String,
    pub selector: String,
    pub target: ExtractTarget,
    pub multiple: bool,
    /// Required extractors abort the operation when missing; optional ones
    /// are skipped.
    pub required: bool,
}

impl Extractor {
    pub fn text(name: &str, selector: &str) -> Self {
        Self {
            name: name.to_string(),
            selector: selector.to_string(),
            target: ExtractTarget::Text,
            multiple: false,
            required: false,
        }
    }

    pub fn all_text(name: &str, selector: &str) -> Self {
        Self {
            multiple: true,
            ..Self::text(name, selector)
        }
    }

    pub fn attribute(name: &str, selector: &str, attribute: &str) -> Self {
        Self {
            target: ExtractTarget::Attribute(attribute.to_string()),
            ..Self::text(name, selector)
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// Values per extractor name; a multiple extractor yields all matches.
#[derive(Debug, Clone, Default)]
pub struct ExtractionResult {
    pub values: HashMap<String, Vec<String>>,
}

impl ExtractionResult {
    pub fn first(&self, name: &str) -> Option<&str> {
        self.values.get(name)?.first().map(String::as_str)
    }

    pub fn all(&self, name: &str) -> &[String] {
        self.values.get(name).map(Vec::as_slice).unwrap_or(&[])
    }
}

#[derive(Debug, Clone)]
pub struct HeadlessOptions {
    pub wait: WaitStrategy,
    pub stealth: bool,
    pub user_agent: Option<String>,
    /// Extra settle time after the wait strategy resolves.
    pub settle: Duration,
    /// Byte budget for debug artifacts attached to failures.
    pub max_artifact_bytes: usize,
    pub capture_artifacts: bool,
}

impl Default for HeadlessOptions {
    fn default() -> Self {
        Self {
            wait: WaitStrategy::Selector,
            stealth: false,
            user_agent: None,
            settle: Duration::ZERO,
            max_artifact_bytes: 256 * 1024,
            capture_artifacts: false,
        }
    }
}

/// Carrier-specific headless navigation engine over a shared pool.
pub struct HeadlessEngine {
    pool: BrowserPool,
    carrier: Carrier,
    options: HeadlessOptions,
}

impl HeadlessEngine {
    pub fn new(pool: BrowserPool, carrier: Carrier, options: HeadlessOptions) -> Self {
        Self {
            pool,
            carrier,
            options,
        }
    }

    /// Borrow a page for one operation: open, prepare (stealth + UA),
    /// navigate, hand to `f`, close on every path.
    pub async fn with_page<F, Fut, T>(
        &self,
        ctx: &TrackContext,
        url: &str,
        f: F,
    ) -> Result<T, TrackError>
    where
        F: FnOnce(Page) -> Fut + Send,
        Fut: std::future::Future<Output = Result<T, TrackError>> + Send,
    {
        let carrier = self.carrier;
        let stealth = self.options.stealth;
        let user_agent = self.options.user_agent.clone();
        let url = url.to_string();

        self.pool
            .execute(ctx, move |handle| async move {
                let page = handle.new_page("about:blank").await?;

                let prepared = prepare_and_navigate(&page, &url, stealth, user_agent.as_deref())
                    .await
                    .map_err(|e| {
                        TrackError::Carrier(CarrierError::new(
                            carrier,
                            None,
                            codes::NAVIGATION_ERROR,
                            format!("failed to load {}: {}", url, e),
                            true,
                        ))
                    });

                let result = match prepared {
                    Ok(()) => f(page.clone()).await,
                    Err(e) => Err(e),
                };

                if let Err(e) = page.close().await {
                    tracing::debug!(carrier = %carrier, "failed to close page: {}", e);
                }
                result
            })
            .await
    }

    /// Navigate, apply the configured wait strategy, then run every
    /// extractor. A missing required extractor aborts with a headless
    /// error; optional ones are skipped.
    pub async fn navigate_and_extract(
        &self,
        ctx: &TrackContext,
        url: &str,
        extractors: &[Extractor],
    ) -> Result<ExtractionResult, TrackError> {
        let wait = self.options.wait.clone();
        let settle = self.options.settle;
        let capture = self.options.capture_artifacts;
        let max_artifact_bytes = self.options.max_artifact_bytes;
        let carrier = self.carrier;
        let extractors = extractors.to_vec();

        self.with_page(ctx, url, move |page| async move {
            apply_wait_strategy(&page, &wait, &extractors).await;
            if settle > Duration::ZERO {
                tokio::time::sleep(settle).await;
            }

            let mut result = ExtractionResult::default();
            for extractor in &extractors {
                let values = evaluate_extractor(&page, extractor).await;
                match values {
                    Some(values) if !values.is_empty() => {
                        result.values.insert(extractor.name.clone(), values);
                    }
                    _ if extractor.required => {
                        let mut err = CarrierError::new(
                            carrier,
                            None,
                            codes::HEADLESS_ERROR,
                            format!(
                                "required content {:?} ({}) not found",
                                extractor.name, extractor.selector
                            ),
                            true,
                        );
                        if capture {
                            err = err.with_artifacts(
                                capture_artifacts(&page, max_artifact_bytes).await,
                            );
                        }
                        return Err(err.into());
                    }
                    _ => {
                        tracing::debug!(
                            carrier = %carrier,
                            extractor = %extractor.name,
                            "optional extractor matched nothing"
                        );
                    }
                }
            }
            Ok(result)
        })
        .await
    }

    /// Navigate and wait until one of `selectors` appears (checked in
    /// order, first success wins, bounded wait), then return the final DOM
    /// serialisation. Carriers with SPA-style rendering classify the
    /// returned HTML themselves.
    pub async fn navigate_and_wait_for_tracking_data(
        &self,
        ctx: &TrackContext,
        url: &str,
        selectors: &[String],
    ) -> Result<String, TrackError> {
        let selectors = selectors.to_vec();
        let carrier = self.carrier;

        self.with_page(ctx, url, move |page| async move {
            let budget = tokio::time::Instant::now() + DEFAULT_SELECTOR_WAIT;
            let mut matched = None;
            'outer: while tokio::time::Instant::now() < budget {
                for selector in &selectors {
                    if page.find_element(selector.as_str()).await.is_ok() {
                        matched = Some(selector.clone());
                        break 'outer;
                    }
                }
                tokio::time::sleep(SELECTOR_POLL).await;
            }
            match matched {
                Some(selector) => {
                    tracing::debug!(carrier = %carrier, selector = %selector, "tracking data present")
                }
                None => tracing::debug!(carrier = %carrier, "no tracking selector appeared"),
            }

            page.content()
                .await
                .map_err(|e| TrackError::Browser(format!("failed to read page source: {}", e)))
        })
        .await
    }

    pub async fn execute_script(
        &self,
        ctx: &TrackContext,
        url: &str,
        script: &str,
    ) -> Result<serde_json::Value, TrackError> {
        let script = script.to_string();
        self.with_page(ctx, url, move |page| async move {
            let evaluated = page
                .evaluate(script)
                .await
                .map_err(|e| TrackError::Browser(format!("script evaluation failed: {}", e)))?;
            Ok(evaluated.value().cloned().unwrap_or(serde_json::Value::Null))
        })
        .await
    }

    pub async fn screenshot(&self, ctx: &TrackContext, url: &str) -> Result<Vec<u8>, TrackError> {
        self.with_page(ctx, url, move |page| async move {
            screenshot_page(&page)
                .await
                .map_err(|e| TrackError::Browser(format!("screenshot failed: {}", e)))
        })
        .await
    }

    pub async fn page_source(&self, ctx: &TrackContext, url: &str) -> Result<String, TrackError> {
        self.with_page(ctx, url, move |page| async move {
            page.content()
                .await
                .map_err(|e| TrackError::Browser(format!("failed to read page source: {}", e)))
        })
        .await
    }

    /// Shut down the underlying pool. Idempotent.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

async fn prepare_and_navigate(
    page: &Page,
    url: &str,
    stealth: bool,
    user_agent: Option<&str>,
) -> Result<(), String> {
    if stealth {
        let inject = AddScriptToEvaluateOnNewDocumentParams::builder()
            .source(STEALTH_JS)
            .build()
            .map_err(|e| format!("bad stealth script params: {}", e))?;
        page.execute(inject)
            .await
            .map_err(|e| format!("stealth injection failed: {}", e))?;
    }
    if let Some(ua) = user_agent {
        let override_params = SetUserAgentOverrideParams::builder()
            .user_agent(ua)
            .build()
            .map_err(|e| format!("bad user-agent params: {}", e))?;
        page.set_user_agent(override_params)
            .await
            .map_err(|e| format!("user-agent override failed: {}", e))?;
    }
    page.goto(url).await.map_err(|e| e.to_string())?;
    page.wait_for_navigation()
        .await
        .map_err(|e| e.to_string())?;
    Ok(())
}

async fn apply_wait_strategy(page: &Page, wait: &WaitStrategy, extractors: &[Extractor]) {
    match wait {
        WaitStrategy::Selector => {
            let selector = extractors
                .iter()
                .find(|e| e.required)
                .or_else(|| extractors.first())
                .map(|e| e.selector.clone());
            if let Some(selector) = selector {
                wait_for_selector(page, &selector, DEFAULT_SELECTOR_WAIT).await;
            }
        }
        WaitStrategy::NetworkIdle => tokio::time::sleep(NETWORK_IDLE_APPROXIMATION).await,
        WaitStrategy::Timeout(duration) => tokio::time::sleep(*duration).await,
        WaitStrategy::Custom => {}
    }
}

/// Poll for a selector until it appears or the budget runs out. Returns
/// whether it appeared; callers decide whether that is fatal.
pub async fn wait_for_selector(page: &Page, selector: &str, budget: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + budget;
    while tokio::time::Instant::now() < deadline {
        if page.find_element(selector).await.is_ok() {
            return true;
        }
        tokio::time::sleep(SELECTOR_POLL).await;
    }
    false
}

async fn evaluate_extractor(page: &Page, extractor: &Extractor) -> Option<Vec<String>> {
    let accessor = match &extractor.target {
        ExtractTarget::Text => "(e => e.innerText)".to_string(),
        ExtractTarget::Attribute(attr) => {
            format!("(e => e.getAttribute({}))", serde_json::json!(attr))
        }
    };
    let selector = serde_json::json!(extractor.selector);
    let script = if extractor.multiple {
        format!(
            "Array.from(document.querySelectorAll({selector})).map({accessor}).filter(v => v !== null)"
        )
    } else {
        format!(
            "(() => {{ const e = document.querySelector({selector}); return e ? [{accessor}(e)] : []; }})()"
        )
    };

    let evaluated = page.evaluate(script).await.ok()?;
    let value = evaluated.value()?;
    let values: Vec<String> = serde_json::from_value(value.clone()).ok()?;
    Some(
        values
            .into_iter()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .collect(),
    )
}

async fn screenshot_page(page: &Page) -> Result<Vec<u8>, chromiumoxide::error::CdpError> {
    use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
    use chromiumoxide::page::ScreenshotParams;

    page.screenshot(
        ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Png)
            .full_page(true)
            .build(),
    )
    .await
}

/// Snapshot the page for debugging, truncated to the byte budget.
pub async fn capture_artifacts(page: &Page, max_bytes: usize) -> DebugArtifacts {
    let mut page_source = page.content().await.unwrap_or_default();
    if page_source.len() > max_bytes {
        let mut cut = max_bytes;
        while cut > 0 && !page_source.is_char_boundary(cut) {
            cut -= 1;
        }
        page_source.truncate(cut);
    }
    let mut screenshot_png = screenshot_page(page).await.unwrap_or_default();
    screenshot_png.truncate(max_bytes);
    DebugArtifacts {
        page_source,
        screenshot_png,
    }
}
