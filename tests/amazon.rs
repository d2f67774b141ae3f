//! Amazon client contract tests: shape validation, synthetic placeholder,
//! and delegation through a fake delegate source (S5).

mod common;

use std::sync::Arc;

use chrono::Utc;

use shiptrack_rs::carriers::amazon::AmazonClient;
use shiptrack_rs::error::{codes, TrackError};
use shiptrack_rs::factory::DelegateSource;
use shiptrack_rs::types::{
    Carrier, ClientKind, RateLimitInfo, TrackingEvent, TrackingInfo, TrackingRequest,
    TrackingResponse, TrackingStatus,
};
use shiptrack_rs::{TrackContext, TrackingClient};

/// Test fake standing in for a real carrier client behind the factory.
struct FakeUpsClient;

#[async_trait::async_trait]
impl TrackingClient for FakeUpsClient {
    fn carrier_name(&self) -> &'static str {
        "ups"
    }

    fn kind(&self) -> ClientKind {
        ClientKind::Api
    }

    fn validate_tracking_number(&self, _tracking_number: &str) -> bool {
        true
    }

    fn rate_limit(&self) -> RateLimitInfo {
        RateLimitInfo::unmetered()
    }

    async fn track(
        &self,
        _ctx: &TrackContext,
        request: &TrackingRequest,
    ) -> Result<TrackingResponse, TrackError> {
        let mut response = TrackingResponse::new(RateLimitInfo::unmetered());
        for number in &request.tracking_numbers {
            let mut info = TrackingInfo::new(number, Carrier::Ups);
            info.status = TrackingStatus::InTransit;
            info.events = vec![TrackingEvent {
                timestamp: Utc::now(),
                status: TrackingStatus::InTransit,
                location: "PHILADELPHIA, PA, US".to_string(),
                description: "Departed from Facility".to_string(),
                details: None,
            }];
            response.results.push(info);
        }
        Ok(response)
    }
}

/// Delegate source handing out the fake, or nothing at all.
struct FakeSource {
    empty: bool,
}

struct EmptyUpsClient;

#[async_trait::async_trait]
impl TrackingClient for EmptyUpsClient {
    fn carrier_name(&self) -> &'static str {
        "ups"
    }

    fn kind(&self) -> ClientKind {
        ClientKind::Api
    }

    fn validate_tracking_number(&self, _tracking_number: &str) -> bool {
        true
    }

    fn rate_limit(&self) -> RateLimitInfo {
        RateLimitInfo::unmetered()
    }

    async fn track(
        &self,
        _ctx: &TrackContext,
        _request: &TrackingRequest,
    ) -> Result<TrackingResponse, TrackError> {
        Ok(TrackingResponse::new(RateLimitInfo::unmetered()))
    }
}

impl DelegateSource for FakeSource {
    fn delegate(&self, carrier: Carrier) -> Result<Arc<dyn TrackingClient>, TrackError> {
        match carrier {
            Carrier::Ups if self.empty => Ok(Arc::new(EmptyUpsClient)),
            Carrier::Ups => Ok(Arc::new(FakeUpsClient)),
            other => Err(TrackError::UnsupportedCarrier(other)),
        }
    }
}

/// S5 part one: a valid internal reference synthesises one pre-ship event
/// with the "Amazon Internal" service type.
#[tokio::test]
async fn amazon_internal_reference_placeholder() {
    let client = AmazonClient::new(Arc::new(FakeSource { empty: false }));
    let ctx = TrackContext::new();
    let request = TrackingRequest::single(Carrier::Amazon, "BqPz3RXRS");
    let response = client.track(&ctx, &request).await.unwrap();

    common::assert_response_invariants(&request, &response);
    assert_eq!(response.results.len(), 1);
    let info = &response.results[0];
    assert_eq!(info.carrier, Carrier::Amazon);
    assert_eq!(info.status, TrackingStatus::PreShip);
    assert_eq!(info.service_type.as_deref(), Some("Amazon Internal"));
    assert_eq!(info.events.len(), 1);
    assert_eq!(info.events[0].description, "Amazon shipment reference created");
}

/// S5 part two: with a UPS hint the delegated result comes back verbatim,
/// carrying the delegated carrier's report.
#[tokio::test]
async fn amazon_delegates_to_hinted_carrier() {
    let client = AmazonClient::new(Arc::new(FakeSource { empty: false }));
    let ctx = TrackContext::new();
    let request = TrackingRequest::single(Carrier::Amazon, "1Z999AA1234567890");
    let response = client
        .track_delegated(&ctx, &request, Carrier::Ups)
        .await
        .unwrap();

    assert_eq!(response.results.len(), 1);
    let info = &response.results[0];
    assert_eq!(info.carrier, Carrier::Ups);
    assert_eq!(info.status, TrackingStatus::InTransit);
    assert_eq!(info.events[0].description, "Departed from Facility");
}

#[tokio::test]
async fn amazon_delegation_with_zero_results_fails_typed() {
    let client = AmazonClient::new(Arc::new(FakeSource { empty: true }));
    let ctx = TrackContext::new();
    let request = TrackingRequest::single(Carrier::Amazon, "1Z999AA1234567890");
    let response = client
        .track_delegated(&ctx, &request, Carrier::Ups)
        .await
        .unwrap();

    assert!(response.results.is_empty());
    assert_eq!(response.errors.len(), 1);
    let err = &response.errors[0];
    assert_eq!(err.code, codes::DELEGATION_FAILED);
    assert!(err.retryable);
    assert_eq!(err.carrier, Carrier::Amazon);
}

#[tokio::test]
async fn amazon_delegation_to_unbuildable_carrier_is_fatal() {
    let client = AmazonClient::new(Arc::new(FakeSource { empty: false }));
    let ctx = TrackContext::new();
    let request = TrackingRequest::single(Carrier::Amazon, "7777777770");
    let result = client.track_delegated(&ctx, &request, Carrier::Dhl).await;
    assert!(matches!(
        result,
        Err(TrackError::UnsupportedCarrier(Carrier::Dhl))
    ));
}

/// Validation determinism across repeated calls, through the contract.
#[tokio::test]
async fn amazon_validation_is_pure() {
    let client = AmazonClient::new(Arc::new(FakeSource { empty: false }));
    for _ in 0..3 {
        assert!(client.validate_tracking_number("TBA123456789012"));
        assert!(client.validate_tracking_number("111-2223334-4455566"));
        assert!(client.validate_tracking_number("BqPz3RXRS"));
        assert!(!client.validate_tracking_number("test123"));
        assert!(!client.validate_tracking_number("1Z999AA1234567890"));
    }
}
