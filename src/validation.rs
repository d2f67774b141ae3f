//! Per-carrier tracking-number validation.
//!
//! Validation is total and deterministic: pure string checks, no I/O. Each
//! client exposes its carrier's validator through the tracking contract;
//! the Amazon shapes live in `carriers::amazon` because they depend on the
//! negative lists below.

use std::sync::LazyLock;

use regex::Regex;

use crate::types::Carrier;

static UPS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^1Z[A-Z0-9]{6}\d{2}\d{7}$").unwrap());

static USPS_22_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^9[1-5]\d{20}$").unwrap());

static USPS_11_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^82\d{9}$").unwrap());

static DHL_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Z0-9]{10,20}$").unwrap());

/// FedEx numbers are digit-only at a fixed set of lengths.
const FEDEX_LENGTHS: &[usize] = &[12, 14, 15, 16, 18, 20, 22];

fn canonical(s: &str) -> String {
    s.trim().replace(' ', "").to_ascii_uppercase()
}

/// `1Z` + 6-char shipper id + 2-digit service code + 7-digit package tail,
/// 17 characters total.
pub fn is_ups(s: &str) -> bool {
    UPS_RE.is_match(&canonical(s))
}

/// 22-digit IMpb barcodes with prefix 91-95, or the 11-digit `82` express
/// form.
pub fn is_usps(s: &str) -> bool {
    let s = canonical(s);
    USPS_22_RE.is_match(&s) || USPS_11_RE.is_match(&s)
}

pub fn is_fedex(s: &str) -> bool {
    let s = canonical(s);
    FEDEX_LENGTHS.contains(&s.len()) && s.bytes().all(|b| b.is_ascii_digit())
}

/// Alphanumeric, 10-20 characters, at least one digit.
pub fn is_dhl(s: &str) -> bool {
    let s = canonical(s);
    DHL_RE.is_match(&s) && s.bytes().any(|b| b.is_ascii_digit())
}

/// Validator for the four real carriers. Amazon's richer shape set is
/// implemented by its client.
pub fn validate(carrier: Carrier, s: &str) -> bool {
    match carrier {
        Carrier::Usps => is_usps(s),
        Carrier::Ups => is_ups(s),
        Carrier::FedEx => is_fedex(s),
        Carrier::Dhl => is_dhl(s),
        Carrier::Amazon => crate::carriers::amazon::is_amazon(s),
    }
}
