pub mod carriers;
pub mod client;
pub mod ctx;
pub mod error;
pub mod factory;
pub mod headless;
pub mod normalize;
pub mod oauth;
pub mod pool;
pub mod scrape;
pub mod types;
pub mod validation;

pub use client::{HeadlessClient, TrackingClient};
pub use ctx::TrackContext;
pub use error::{CarrierError, TrackError};
pub use factory::{ClientFactory, DelegateSource};
pub use pool::{validate_browser_available, BrowserPool, BrowserPoolOptions, PoolStats};
pub use types::{
    Carrier, CarrierConfig, ClientKind, RateLimitInfo, TrackingEvent, TrackingInfo,
    TrackingRequest, TrackingResponse, TrackingStatus,
};
