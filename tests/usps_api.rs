//! USPS API contract tests against an in-process fixture server.

mod common;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::extract::{Query, State};
use axum::routing::get;
use axum::Router;
use regex::Regex;

use shiptrack_rs::carriers::usps_api::UspsApiClient;
use shiptrack_rs::types::{Carrier, CarrierConfig, TrackingRequest, TrackingStatus};
use shiptrack_rs::{TrackContext, TrackingClient};

const DELIVERED_XML: &str = include_str!("fixtures/usps_delivered.xml");

#[derive(Clone, Default)]
struct UspsState {
    /// TrackID batches per request, in arrival order.
    batches: Arc<Mutex<Vec<Vec<String>>>>,
    fixed_body: Option<String>,
}

async fn shippingapi(
    State(state): State<UspsState>,
    Query(params): Query<HashMap<String, String>>,
) -> String {
    assert_eq!(params.get("API").map(String::as_str), Some("TrackV2"));
    let xml = params.get("XML").cloned().unwrap_or_default();

    let id_re = Regex::new(r#"<TrackID ID="([^"]+)""#).unwrap();
    let ids: Vec<String> = id_re
        .captures_iter(&xml)
        .map(|caps| caps[1].to_string())
        .collect();
    state.batches.lock().unwrap().push(ids.clone());

    if let Some(body) = &state.fixed_body {
        return body.clone();
    }

    // Synthesised response: one pre-ship info per requested ID.
    let mut body = String::from("<TrackResponse>");
    for id in ids {
        body.push_str(&format!(
            r#"<TrackInfo ID="{id}"><TrackSummary><EventTime>9:00 am</EventTime><EventDate>May 10, 2023</EventDate><Event>Shipping Label Created, USPS Awaiting Item</Event><EventCity>RALEIGH</EventCity><EventState>NC</EventState><EventZIPCode>27601</EventZIPCode><EventCountry/></TrackSummary></TrackInfo>"#
        ));
    }
    body.push_str("</TrackResponse>");
    body
}

fn usps_app(state: UspsState) -> Router {
    Router::new()
        .route("/shippingapi.dll", get(shippingapi))
        .with_state(state)
}

fn client(base_url: &str) -> UspsApiClient {
    let config = CarrierConfig {
        usps_user_id: Some("TESTUSER".to_string()),
        ..Default::default()
    };
    UspsApiClient::new(&config).unwrap().with_base_url(base_url)
}

/// S1: delivered summary plus one prior detail event.
#[tokio::test]
async fn usps_xml_delivered() {
    let state = UspsState {
        fixed_body: Some(DELIVERED_XML.to_string()),
        ..Default::default()
    };
    let (base_url, server) = common::serve(usps_app(state)).await;

    let client = client(&base_url);
    let ctx = TrackContext::new();
    let request = TrackingRequest::single(Carrier::Usps, "9400111699000367046792");
    let response = client.track(&ctx, &request).await.unwrap();

    common::assert_response_invariants(&request, &response);
    assert_eq!(response.results.len(), 1);
    assert!(response.errors.is_empty());

    let info = &response.results[0];
    assert_eq!(info.status, TrackingStatus::Delivered);
    assert_eq!(info.events.len(), 2);
    assert_eq!(info.events[0].status, TrackingStatus::Delivered);
    assert_eq!(info.events[0].location, "GREENSBORO, NC 27401");
    assert_eq!(info.events[0].timestamp.to_rfc3339(), "2016-05-11T11:07:00+00:00");
    assert_eq!(info.events[1].status, TrackingStatus::OutForDelivery);
    assert_eq!(info.actual_delivery, Some(info.events[0].timestamp));

    server.abort();
}

/// Twelve inputs split at ten per call, order preserved across the split.
#[tokio::test]
async fn usps_batch_split_preserves_order() {
    let state = UspsState::default();
    let batches = Arc::clone(&state.batches);
    let (base_url, server) = common::serve(usps_app(state)).await;

    let numbers: Vec<String> = (0..12)
        .map(|i| format!("94001116990003670467{:02}", i))
        .collect();
    let client = client(&base_url);
    let ctx = TrackContext::new();
    let request = TrackingRequest::new(Carrier::Usps, numbers.clone());
    let response = client.track(&ctx, &request).await.unwrap();

    common::assert_response_invariants(&request, &response);
    assert_eq!(response.results.len(), 12);

    let recorded = batches.lock().unwrap().clone();
    assert_eq!(recorded.len(), 2, "expected two sequenced batches");
    assert_eq!(recorded[0].len(), 10);
    assert_eq!(recorded[1].len(), 2);
    let rejoined: Vec<String> = recorded.into_iter().flatten().collect();
    assert_eq!(rejoined, numbers, "split must preserve request order");

    // Results come back in request order too.
    let result_numbers: Vec<&str> = response
        .results
        .iter()
        .map(|info| info.tracking_number.as_str())
        .collect();
    assert_eq!(result_numbers, numbers.iter().map(String::as_str).collect::<Vec<_>>());

    server.abort();
}

/// A USPS `Error` element inside a success response is a per-number,
/// non-retryable error; the rest of the batch is unaffected.
#[tokio::test]
async fn usps_per_number_error_does_not_abort_batch() {
    let error_body = r#"<TrackResponse>
  <TrackInfo ID="9400111699000367046792">
    <TrackSummary><EventTime>9:00 am</EventTime><EventDate>May 10, 2023</EventDate><Event>Arrived at USPS Facility</Event><EventCity>RALEIGH</EventCity><EventState>NC</EventState><EventZIPCode>27601</EventZIPCode><EventCountry/></TrackSummary>
  </TrackInfo>
  <TrackInfo ID="9400111699000367046793">
    <Error><Number>-2147219283</Number><Description>A status update is not yet available.</Description></Error>
  </TrackInfo>
</TrackResponse>"#;
    let state = UspsState {
        fixed_body: Some(error_body.to_string()),
        ..Default::default()
    };
    let (base_url, server) = common::serve(usps_app(state)).await;

    let client = client(&base_url);
    let ctx = TrackContext::new();
    let request = TrackingRequest::new(
        Carrier::Usps,
        vec![
            "9400111699000367046792".to_string(),
            "9400111699000367046793".to_string(),
        ],
    );
    let response = client.track(&ctx, &request).await.unwrap();

    common::assert_response_invariants(&request, &response);
    assert_eq!(response.results.len(), 1);
    assert_eq!(response.errors.len(), 1);
    let err = &response.errors[0];
    assert_eq!(err.tracking_number.as_deref(), Some("9400111699000367046793"));
    assert!(!err.retryable);
    assert!(err.message.contains("status update"));

    server.abort();
}

/// Cancellation observed before the HTTP call returns a context error.
#[tokio::test]
async fn usps_cancellation_aborts_batch() {
    let state = UspsState::default();
    let (base_url, server) = common::serve(usps_app(state)).await;

    let client = client(&base_url);
    let ctx = TrackContext::new();
    ctx.cancel();
    let request = TrackingRequest::single(Carrier::Usps, "9400111699000367046792");
    let result = client.track(&ctx, &request).await;
    assert!(matches!(result, Err(shiptrack_rs::TrackError::Cancelled)));

    server.abort();
}
