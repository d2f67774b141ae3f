//! Client factory: the only place that knows about client kinds.
//!
//! Per carrier the factory tries the preferred kind first and falls
//! through on construction failure. Missing credentials make the API path
//! unconstructible (not a tracking failure); the scraping client always
//! constructs, so selection can never dead-end for the four real carriers.
//! Amazon composes the others through the `DelegateSource` seam.

use std::sync::Arc;
use std::sync::Mutex;

use crate::carriers::amazon::AmazonClient;
use crate::carriers::dhl_api::DhlApiClient;
use crate::carriers::dhl_scrape::DhlScrapeClient;
use crate::carriers::fedex_api::FedExApiClient;
use crate::carriers::fedex_headless::FedExHeadlessClient;
use crate::carriers::fedex_scrape::FedExScrapeClient;
use crate::carriers::ups_api::UpsApiClient;
use crate::carriers::ups_scrape::UpsScrapeClient;
use crate::carriers::usps_api::UspsApiClient;
use crate::carriers::usps_headless::UspsHeadlessClient;
use crate::carriers::usps_scrape::UspsScrapeClient;
use crate::client::TrackingClient;
use crate::error::TrackError;
use crate::pool::{BrowserPool, BrowserPoolOptions};
use crate::types::{Carrier, CarrierConfig, ClientKind};

/// Hands the Amazon client (and anything else that needs to re-enter
/// selection) a carrier's client without exposing the kinds.
pub trait DelegateSource: Send + Sync {
    fn delegate(&self, carrier: Carrier) -> Result<Arc<dyn TrackingClient>, TrackError>;
}

pub struct ClientFactory {
    config: CarrierConfig,
    /// One browser pool shared by every headless client this factory
    /// creates, built on first use.
    pool: Mutex<Option<BrowserPool>>,
}

impl ClientFactory {
    pub fn new(config: CarrierConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            pool: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &CarrierConfig {
        &self.config
    }

    /// Whether sufficient credentials exist for the named carrier's API
    /// path.
    pub fn is_api_configured(&self, carrier: Carrier) -> bool {
        let has = |value: &Option<String>| value.as_deref().is_some_and(|v| !v.is_empty());
        match carrier {
            Carrier::Usps => has(&self.config.usps_user_id),
            Carrier::Ups => {
                has(&self.config.ups_client_id) && has(&self.config.ups_client_secret)
            }
            Carrier::FedEx => {
                has(&self.config.fedex_client_id) && has(&self.config.fedex_client_secret)
            }
            Carrier::Dhl => has(&self.config.dhl_api_key),
            Carrier::Amazon => false,
        }
    }

    /// Carriers whose live site cannot be scraped statically.
    fn requires_headless(carrier: Carrier) -> bool {
        carrier == Carrier::FedEx
    }

    fn shared_pool(&self) -> BrowserPool {
        let mut guard = self.pool.lock().expect("pool lock poisoned");
        guard
            .get_or_insert_with(|| BrowserPool::new(BrowserPoolOptions::default()))
            .clone()
    }

    /// Build the best available client for a carrier, honouring the
    /// preferred kind with graceful fallback.
    pub fn client(
        self: &Arc<Self>,
        carrier: Carrier,
    ) -> Result<Arc<dyn TrackingClient>, TrackError> {
        if carrier == Carrier::Amazon {
            let source: Arc<dyn DelegateSource> = Arc::clone(self) as Arc<dyn DelegateSource>;
            return Ok(Arc::new(AmazonClient::new(source)));
        }

        let preferred = self.config.preferred_kind;

        if preferred == ClientKind::Api {
            match self.api_client(carrier) {
                Ok(client) => return Ok(client),
                Err(TrackError::MissingCredentials(_)) => {
                    tracing::debug!(carrier = %carrier, "api credentials missing, falling back");
                }
                Err(e) => return Err(e),
            }
        }

        if preferred == ClientKind::Headless || Self::requires_headless(carrier) {
            match self.headless_client(carrier) {
                Ok(client) => return Ok(client),
                Err(e) => {
                    tracing::debug!(carrier = %carrier, "headless unavailable ({}), falling back", e);
                }
            }
        }

        self.scraping_client(carrier)
    }

    fn api_client(&self, carrier: Carrier) -> Result<Arc<dyn TrackingClient>, TrackError> {
        match carrier {
            Carrier::Usps => Ok(Arc::new(UspsApiClient::new(&self.config)?)),
            Carrier::Ups => Ok(Arc::new(UpsApiClient::new(&self.config)?)),
            Carrier::FedEx => Ok(Arc::new(FedExApiClient::new(&self.config)?)),
            Carrier::Dhl => Ok(Arc::new(DhlApiClient::new(&self.config)?)),
            Carrier::Amazon => Err(TrackError::UnsupportedCarrier(carrier)),
        }
    }

    fn headless_client(&self, carrier: Carrier) -> Result<Arc<dyn TrackingClient>, TrackError> {
        if !self.config.use_headless && self.config.preferred_kind != ClientKind::Headless {
            return Err(TrackError::Browser("headless path not enabled".into()));
        }
        match carrier {
            Carrier::FedEx => Ok(Arc::new(FedExHeadlessClient::new(
                &self.config,
                self.shared_pool(),
            ))),
            Carrier::Usps => Ok(Arc::new(UspsHeadlessClient::new(
                &self.config,
                self.shared_pool(),
            ))),
            other => Err(TrackError::UnsupportedCarrier(other)),
        }
    }

    fn scraping_client(&self, carrier: Carrier) -> Result<Arc<dyn TrackingClient>, TrackError> {
        match carrier {
            Carrier::Usps => Ok(Arc::new(UspsScrapeClient::new(&self.config)?)),
            Carrier::Ups => Ok(Arc::new(UpsScrapeClient::new(&self.config)?)),
            Carrier::FedEx => Ok(Arc::new(FedExScrapeClient::new(&self.config)?)),
            Carrier::Dhl => Ok(Arc::new(DhlScrapeClient::new(&self.config)?)),
            Carrier::Amazon => Err(TrackError::UnsupportedCarrier(carrier)),
        }
    }

    /// Shut down shared resources (the browser pool, when one was built).
    pub async fn close(&self) {
        let pool = self.pool.lock().expect("pool lock poisoned").take();
        if let Some(pool) = pool {
            pool.close().await;
        }
    }
}

impl DelegateSource for ClientFactory {
    fn delegate(&self, carrier: Carrier) -> Result<Arc<dyn TrackingClient>, TrackError> {
        // Delegation never re-enters Amazon, so the arc-receiver path is
        // not needed here.
        if carrier == Carrier::Amazon {
            return Err(TrackError::UnsupportedCarrier(carrier));
        }
        if self.config.preferred_kind == ClientKind::Api {
            if let Ok(client) = self.api_client(carrier) {
                return Ok(client);
            }
        }
        self.scraping_client(carrier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_config() -> CarrierConfig {
        CarrierConfig {
            usps_user_id: Some("user".to_string()),
            ups_client_id: Some("id".to_string()),
            ups_client_secret: Some("secret".to_string()),
            fedex_client_id: Some("id".to_string()),
            fedex_client_secret: Some("secret".to_string()),
            dhl_api_key: Some("key".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_is_api_configured() {
        let factory = ClientFactory::new(full_config());
        for carrier in [Carrier::Usps, Carrier::Ups, Carrier::FedEx, Carrier::Dhl] {
            assert!(factory.is_api_configured(carrier), "{}", carrier);
        }
        assert!(!factory.is_api_configured(Carrier::Amazon));

        let empty = ClientFactory::new(CarrierConfig::default());
        for carrier in [Carrier::Usps, Carrier::Ups, Carrier::FedEx, Carrier::Dhl] {
            assert!(!empty.is_api_configured(carrier), "{}", carrier);
        }
    }

    #[test]
    fn test_partial_credentials_do_not_configure_api() {
        let config = CarrierConfig {
            ups_client_id: Some("id".to_string()),
            ..Default::default()
        };
        let factory = ClientFactory::new(config);
        assert!(!factory.is_api_configured(Carrier::Ups));
    }

    #[test]
    fn test_api_preferred_selects_api() {
        let factory = ClientFactory::new(full_config());
        for carrier in [Carrier::Usps, Carrier::Ups, Carrier::Dhl] {
            let client = factory.client(carrier).unwrap();
            assert_eq!(client.kind(), ClientKind::Api, "{}", carrier);
            assert_eq!(client.carrier_name(), carrier.as_str());
        }
    }

    #[test]
    fn test_missing_credentials_fall_back_to_scraping() {
        let factory = ClientFactory::new(CarrierConfig::default());
        for carrier in [Carrier::Usps, Carrier::Ups, Carrier::Dhl] {
            let client = factory.client(carrier).unwrap();
            assert_eq!(client.kind(), ClientKind::Scraping, "{}", carrier);
        }
    }

    #[tokio::test]
    async fn test_fedex_requires_headless_policy() {
        // No FedEx credentials, headless opted in: policy says FedEx goes
        // headless rather than scraping.
        let config = CarrierConfig {
            use_headless: true,
            ..Default::default()
        };
        let factory = ClientFactory::new(config);
        let client = factory.client(Carrier::FedEx).unwrap();
        assert_eq!(client.kind(), ClientKind::Headless);
        factory.close().await;
    }

    #[test]
    fn test_fedex_without_headless_opt_in_scrapes() {
        let factory = ClientFactory::new(CarrierConfig::default());
        let client = factory.client(Carrier::FedEx).unwrap();
        assert_eq!(client.kind(), ClientKind::Scraping);
    }

    #[tokio::test]
    async fn test_preferred_kind_switches_implementation() {
        let api_factory = ClientFactory::new(full_config());
        let api_client = api_factory.client(Carrier::Usps).unwrap();

        let scrape_factory = ClientFactory::new(CarrierConfig {
            preferred_kind: ClientKind::Scraping,
            ..full_config()
        });
        let scrape_client = scrape_factory.client(Carrier::Usps).unwrap();

        let headless_factory = ClientFactory::new(CarrierConfig {
            preferred_kind: ClientKind::Headless,
            ..full_config()
        });
        let headless_client = headless_factory.client(Carrier::Usps).unwrap();

        // Same contract, different implementations.
        assert_eq!(api_client.kind(), ClientKind::Api);
        assert_eq!(scrape_client.kind(), ClientKind::Scraping);
        assert_eq!(headless_client.kind(), ClientKind::Headless);
        for client in [&api_client, &scrape_client, &headless_client] {
            assert_eq!(client.carrier_name(), "usps");
            assert!(client.validate_tracking_number("9400111699000367046792"));
        }
        headless_factory.close().await;
    }

    #[test]
    fn test_amazon_client_is_composite() {
        let factory = ClientFactory::new(full_config());
        let client = factory.client(Carrier::Amazon).unwrap();
        assert_eq!(client.carrier_name(), "amazon");
        assert!(client.validate_tracking_number("TBA123456789012"));
    }

    #[test]
    fn test_delegate_never_returns_amazon() {
        let factory = ClientFactory::new(full_config());
        assert!(matches!(
            factory.delegate(Carrier::Amazon),
            Err(TrackError::UnsupportedCarrier(Carrier::Amazon))
        ));
        let delegate = factory.delegate(Carrier::Ups).unwrap();
        assert_eq!(delegate.carrier_name(), "ups");
    }
}
