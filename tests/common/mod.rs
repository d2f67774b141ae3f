//! Shared helpers for the contract tests: in-process fixture servers and
//! the response invariants every `track` call must uphold.

// Each test binary pulls in the helpers it needs.
#![allow(dead_code)]

use std::collections::HashSet;

use axum::Router;
use tokio::task::JoinHandle;

use shiptrack_rs::types::{TrackingRequest, TrackingResponse, TrackingStatus};

/// Opt-in log output for debugging contract tests (`RUST_LOG=debug`).
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Serve a router on an ephemeral local port, returning the base URL.
pub async fn serve(router: Router) -> (String, JoinHandle<()>) {
    init_tracing();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind fixture server");
    let addr = listener.local_addr().expect("local addr");
    let handle = tokio::spawn(async move {
        axum::serve(listener, router).await.expect("fixture server");
    });
    (format!("http://{}", addr), handle)
}

/// The quantified invariants from the tracking contract:
/// 1. events strictly newest-first;
/// 2. delivered results carry `actual_delivery == events[0].timestamp`;
/// 3. status equals the newest event's status when events exist;
/// 4. each input appears exactly once across results and errors;
/// 5. the rate-limit snapshot is consistent;
/// 6. rate-limit errors are retryable.
pub fn assert_response_invariants(request: &TrackingRequest, response: &TrackingResponse) {
    for info in &response.results {
        for pair in info.events.windows(2) {
            assert!(
                pair[0].timestamp >= pair[1].timestamp,
                "events out of order for {}",
                info.tracking_number
            );
        }

        if info.status == TrackingStatus::Delivered {
            assert_eq!(
                info.actual_delivery,
                info.events.first().map(|e| e.timestamp),
                "actual_delivery mismatch for {}",
                info.tracking_number
            );
        } else {
            assert!(info.actual_delivery.is_none());
        }

        if let Some(newest) = info.events.first() {
            assert_eq!(info.status, newest.status);
        }
    }

    let mut outcomes: Vec<&str> = response
        .results
        .iter()
        .map(|info| info.tracking_number.as_str())
        .collect();
    let error_numbers: HashSet<&str> = response
        .errors
        .iter()
        .filter_map(|err| err.tracking_number.as_deref())
        .collect();
    outcomes.extend(error_numbers.iter().copied());
    let inputs: HashSet<&str> = request
        .tracking_numbers
        .iter()
        .map(String::as_str)
        .collect();
    assert_eq!(
        outcomes.len(),
        request.tracking_numbers.len(),
        "each input must produce exactly one outcome"
    );
    for outcome in outcomes {
        assert!(inputs.contains(outcome), "unexpected outcome for {}", outcome);
    }

    assert!(
        response.rate_limit.remaining >= 0 || response.rate_limit.limit == -1,
        "rate limit snapshot inconsistent"
    );

    for err in &response.errors {
        if err.rate_limit {
            assert!(err.retryable, "rate-limit errors must be retryable");
        }
    }
}
