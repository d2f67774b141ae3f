//! Scraping-client contract tests: fixture pages served by an in-process
//! server, not-found classification, and the local request budget.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::routing::get;
use axum::Router;

use shiptrack_rs::carriers::dhl_scrape::DhlScrapeClient;
use shiptrack_rs::carriers::fedex_scrape::FedExScrapeClient;
use shiptrack_rs::carriers::ups_scrape::UpsScrapeClient;
use shiptrack_rs::carriers::usps_scrape::UspsScrapeClient;
use shiptrack_rs::error::codes;
use shiptrack_rs::types::{Carrier, CarrierConfig, TrackingRequest, TrackingStatus};
use shiptrack_rs::{TrackContext, TrackingClient};

const DHL_DELIVERED: &str = include_str!("fixtures/dhl_delivered.html");
const USPS_TB_STEP: &str = include_str!("fixtures/usps_tb_step.html");
const UPS_PROGRESS: &str = include_str!("fixtures/ups_progress.html");
const FEDEX_TRAVEL: &str = include_str!("fixtures/fedex_travel.html");

async fn serve_page(path: &str, body: &'static str) -> (String, tokio::task::JoinHandle<()>) {
    let app = Router::new().route(path, get(move || async move { axum::response::Html(body) }));
    common::serve(app).await
}

/// S4: DHL checkpoint page, four events newest-first, destination country
/// appended to checkpoint locations.
#[tokio::test]
async fn dhl_scrape_delivered() {
    let (base_url, server) = serve_page("/track", DHL_DELIVERED).await;

    let client = DhlScrapeClient::new(&CarrierConfig::default())
        .unwrap()
        .with_base_url(&base_url);
    let ctx = TrackContext::new();
    let request = TrackingRequest::single(Carrier::Dhl, "7777777770");
    let response = client.track(&ctx, &request).await.unwrap();

    common::assert_response_invariants(&request, &response);
    assert_eq!(response.results.len(), 1);
    let info = &response.results[0];
    assert_eq!(info.status, TrackingStatus::Delivered);
    assert_eq!(info.events.len(), 4);
    assert_eq!(info.events[0].location, "NEW YORK, NY 10001, US");
    assert_eq!(info.actual_delivery, Some(info.events[0].timestamp));

    server.abort();
}

#[tokio::test]
async fn usps_scrape_tb_steps() {
    let (base_url, server) = serve_page("/go/TrackConfirmAction", USPS_TB_STEP).await;

    let client = UspsScrapeClient::new(&CarrierConfig::default())
        .unwrap()
        .with_base_url(&base_url);
    let ctx = TrackContext::new();
    let request = TrackingRequest::single(Carrier::Usps, "9400111699000367046792");
    let response = client.track(&ctx, &request).await.unwrap();

    common::assert_response_invariants(&request, &response);
    let info = &response.results[0];
    assert_eq!(info.status, TrackingStatus::Delivered);
    assert_eq!(info.events.len(), 3);
    assert_eq!(info.events[0].location, "GREENSBORO, NC 27401");

    server.abort();
}

#[tokio::test]
async fn ups_scrape_progress_table() {
    let (base_url, server) = serve_page("/track", UPS_PROGRESS).await;

    let client = UpsScrapeClient::new(&CarrierConfig::default())
        .unwrap()
        .with_base_url(&base_url);
    let ctx = TrackContext::new();
    let request = TrackingRequest::single(Carrier::Ups, "1Z999AA1234567890");
    let response = client.track(&ctx, &request).await.unwrap();

    common::assert_response_invariants(&request, &response);
    let info = &response.results[0];
    assert_eq!(info.status, TrackingStatus::Delivered);
    assert_eq!(info.events.len(), 3);
    assert_eq!(info.events[1].status, TrackingStatus::OutForDelivery);

    server.abort();
}

#[tokio::test]
async fn fedex_scrape_travel_history() {
    let (base_url, server) = serve_page("/track", FEDEX_TRAVEL).await;

    let client = FedExScrapeClient::new(&CarrierConfig::default())
        .unwrap()
        .with_base_url(&base_url);
    let ctx = TrackContext::new();
    let request = TrackingRequest::single(Carrier::FedEx, "123456789012");
    let response = client.track(&ctx, &request).await.unwrap();

    common::assert_response_invariants(&request, &response);
    let info = &response.results[0];
    assert_eq!(info.status, TrackingStatus::Delivered);
    assert_eq!(info.events.len(), 2);

    server.abort();
}

/// Fixture determinism: the same page parses to identical results.
#[tokio::test]
async fn scrape_parse_is_deterministic() {
    let (base_url, server) = serve_page("/track", DHL_DELIVERED).await;

    let client = DhlScrapeClient::new(&CarrierConfig::default())
        .unwrap()
        .with_base_url(&base_url);
    let ctx = TrackContext::new();
    let request = TrackingRequest::single(Carrier::Dhl, "7777777770");

    let first = client.track(&ctx, &request).await.unwrap();
    let second = client.track(&ctx, &request).await.unwrap();
    assert_eq!(first.results[0].events, second.results[0].events);
    assert_eq!(first.results[0].status, second.results[0].status);

    server.abort();
}

/// A not-found page is classified before any event extraction.
#[tokio::test]
async fn usps_scrape_not_found_page() {
    let app = Router::new().route(
        "/go/TrackConfirmAction",
        get(|| async {
            axum::response::Html(
                "<html><body><p>Status Not Available. We could not locate the tracking \
                 information for your request.</p></body></html>",
            )
        }),
    );
    let (base_url, server) = common::serve(app).await;

    let client = UspsScrapeClient::new(&CarrierConfig::default())
        .unwrap()
        .with_base_url(&base_url);
    let ctx = TrackContext::new();
    let request = TrackingRequest::single(Carrier::Usps, "9400111699000367046792");
    let response = client.track(&ctx, &request).await.unwrap();

    common::assert_response_invariants(&request, &response);
    assert!(response.results.is_empty());
    assert_eq!(response.errors[0].code, codes::NOT_FOUND);
    assert!(!response.errors[0].retryable);

    server.abort();
}

/// The local per-minute budget trips before the request is issued: the
/// server sees exactly the budgeted number of requests.
#[tokio::test]
async fn scrape_local_budget_fails_fast() {
    let hits = Arc::new(AtomicUsize::new(0));
    let hits_handler = Arc::clone(&hits);
    let app = Router::new().route(
        "/go/TrackConfirmAction",
        get(move || {
            let hits = Arc::clone(&hits_handler);
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                axum::response::Html(USPS_TB_STEP)
            }
        }),
    );
    let (base_url, server) = common::serve(app).await;

    let client = UspsScrapeClient::new(&CarrierConfig::default())
        .unwrap()
        .with_base_url(&base_url);
    let ctx = TrackContext::new();
    let request = TrackingRequest::single(Carrier::Usps, "9400111699000367046792");

    for _ in 0..10 {
        client.track(&ctx, &request).await.unwrap();
    }
    let err = client.track(&ctx, &request).await.unwrap_err();
    assert!(err.is_rate_limit());
    assert_eq!(hits.load(Ordering::SeqCst), 10, "throttled call must not reach the carrier");
    assert_eq!(client.rate_limit().remaining, 0);

    server.abort();
}
