//! Carrier-agnostic status/event normalisation.
//!
//! Every client funnels its parsed events through [`finalize`] so the
//! response invariants hold regardless of source: events strictly newest
//! first, info status promoted from the newest event, and `actual_delivery`
//! set iff the roll-up is delivered.

use crate::types::{TrackingInfo, TrackingStatus};

/// Sort events newest first (stable), promote the newest event's status to
/// the info level and stamp `actual_delivery`.
///
/// `carrier_latest` is the carrier-reported shipment status used when the
/// event list is empty; transitions are advisory, the latest event always
/// wins. `estimated_delivery` is never derived from history, only from
/// carrier metadata set by the caller.
pub fn finalize(info: &mut TrackingInfo, carrier_latest: Option<TrackingStatus>) {
    info.events.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

    info.status = match info.events.first() {
        Some(newest) => newest.status,
        None => carrier_latest.unwrap_or(TrackingStatus::Unknown),
    };

    info.actual_delivery = match (info.status, info.events.first()) {
        (TrackingStatus::Delivered, Some(newest)) => Some(newest.timestamp),
        _ => None,
    };
}
