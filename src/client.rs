//! The uniform tracking contract every carrier client implements.
//!
//! Three client kinds (API, scraping, headless) plus the Amazon composite
//! present the same capability set; the factory is the only place that
//! knows which kind backs a given carrier.

use async_trait::async_trait;

use crate::ctx::TrackContext;
use crate::error::TrackError;
use crate::headless::{ExtractionResult, Extractor};
use crate::types::{ClientKind, RateLimitInfo, TrackingRequest, TrackingResponse};

#[async_trait]
pub trait TrackingClient: Send + Sync {
    /// Canonical lowercase carrier name, e.g. `"usps"`.
    fn carrier_name(&self) -> &'static str;

    /// Which backend this client speaks through.
    fn kind(&self) -> ClientKind;

    /// Pure, deterministic validity check for this carrier's namespace.
    fn validate_tracking_number(&self, tracking_number: &str) -> bool;

    /// Snapshot of the last observed rate-limit state.
    fn rate_limit(&self) -> RateLimitInfo;

    /// Track a batch of numbers.
    ///
    /// Every input produces exactly one outcome: a result or a per-number
    /// error, never both. Rate-limit carrier errors are returned only after
    /// the snapshot has been updated. Cancellation and deadline from `ctx`
    /// are honoured at every I/O point.
    async fn track(
        &self,
        ctx: &TrackContext,
        request: &TrackingRequest,
    ) -> Result<TrackingResponse, TrackError>;
}

/// Extra surface exposed by headless-capable clients for direct page work
/// and orderly shutdown of the browser resources they own.
#[async_trait]
pub trait HeadlessClient: TrackingClient {
    async fn navigate_and_extract(
        &self,
        ctx: &TrackContext,
        url: &str,
        extractors: &[Extractor],
    ) -> Result<ExtractionResult, TrackError>;

    /// Navigate and wait for any of `selectors` to appear, returning the
    /// final DOM serialisation.
    async fn wait_for_content(
        &self,
        ctx: &TrackContext,
        url: &str,
        selectors: &[String],
    ) -> Result<String, TrackError>;

    async fn execute_script(
        &self,
        ctx: &TrackContext,
        url: &str,
        script: &str,
    ) -> Result<serde_json::Value, TrackError>;

    async fn screenshot(&self, ctx: &TrackContext, url: &str) -> Result<Vec<u8>, TrackError>;

    async fn page_source(&self, ctx: &TrackContext, url: &str) -> Result<String, TrackError>;

    /// Shut down owned browser resources. Idempotent.
    async fn close(&self) -> Result<(), TrackError>;
}
