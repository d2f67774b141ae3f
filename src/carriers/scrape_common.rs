//! Machinery shared by the per-carrier HTML scraping clients.
//!
//! Carriers rotate between several page formats, so each client carries an
//! ordered ladder of tagged extraction patterns: run in precedence order,
//! fall through on zero matches, stop at the first pattern that yields any
//! events. A last-resort summary scan anchors a handful of status phrases
//! to a date/time group.

use regex::Regex;

use crate::scrape::{map_scraped_status, parse_date_time, strip_tags};
use crate::types::TrackingEvent;

/// One tagged extraction strategy. Patterns use named capture groups:
/// `date`, `time` (optional), `status`, `location` (optional), `desc`
/// (optional, defaults to the status text).
pub struct EventPattern {
    pub name: &'static str,
    pub re: Regex,
}

impl EventPattern {
    pub fn new(name: &'static str, pattern: &str) -> Self {
        Self {
            name,
            // Patterns are compiled at client construction from literals;
            // a failure here is a programming error caught by tests.
            re: Regex::new(pattern).unwrap_or_else(|e| panic!("bad pattern {}: {}", name, e)),
        }
    }
}

/// Raw capture tuple before date recovery and status mapping.
#[derive(Debug, Clone, Default)]
pub struct RawEvent {
    pub date: Option<String>,
    pub time: Option<String>,
    pub status: String,
    pub location: String,
    pub description: String,
}

/// Run the ladder: first pattern yielding at least one event wins.
pub fn run_pattern_ladder(patterns: &[EventPattern], html: &str) -> Vec<RawEvent> {
    for pattern in patterns {
        let events: Vec<RawEvent> = pattern
            .re
            .captures_iter(html)
            .map(|caps| {
                let group = |name: &str| {
                    caps.name(name)
                        .map(|m| strip_tags(m.as_str()))
                        .unwrap_or_default()
                };
                let status = group("status");
                let desc = group("desc");
                RawEvent {
                    date: caps.name("date").map(|m| strip_tags(m.as_str())),
                    time: caps.name("time").map(|m| strip_tags(m.as_str())),
                    description: if desc.is_empty() { status.clone() } else { desc },
                    status,
                    location: group("location"),
                }
            })
            .filter(|event| !event.status.is_empty())
            .collect();

        if !events.is_empty() {
            tracing::debug!(pattern = pattern.name, count = events.len(), "pattern matched");
            return events;
        }
    }
    Vec::new()
}

/// Phrases the summary fallback anchors to a date/time group when no
/// structured pattern matched.
const SUMMARY_PHRASES: &[&str] = &[
    "delivered",
    "out for delivery",
    "in transit",
    "arrived",
    "departed",
    "picked up",
    "label created",
    "return to sender",
];

/// Scan page text for a status phrase next to a date/time. Produces at
/// most one synthetic event.
pub fn summary_fallback(html: &str) -> Option<RawEvent> {
    let text = strip_tags(html);
    let lower = text.to_lowercase();
    let phrase = SUMMARY_PHRASES.iter().find(|p| lower.contains(**p))?;

    // A date/time anywhere in the page anchors the synthetic event.
    static DATE_PATTERNS: &[&str] = &[
        r"(?i)([A-Z][a-z]+ \d{1,2}, \d{4}(?:,? at)? \d{1,2}:\d{2}\s*[ap]m)",
        r"(\d{2}/\d{2}/\d{4},? \d{1,2}:\d{2}(?:\s*[APap][Mm])?)",
        r"(\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2})",
    ];
    let date = DATE_PATTERNS.iter().find_map(|p| {
        Regex::new(p)
            .ok()?
            .captures(&text)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
    })?;

    Some(RawEvent {
        date: Some(date),
        time: None,
        status: phrase.to_string(),
        location: String::new(),
        description: phrase.to_string(),
    })
}

/// Turn raw captures into events. Events whose date cannot be recovered
/// are dropped rather than stamped with "now", so they cannot pollute the
/// newest-first ordering.
pub fn build_events(raw_events: Vec<RawEvent>) -> Vec<TrackingEvent> {
    raw_events
        .into_iter()
        .filter_map(|raw| {
            let stamp_input = match (&raw.date, &raw.time) {
                (Some(date), Some(time)) => format!("{} {}", date, time),
                (Some(date), None) => date.clone(),
                (None, Some(time)) => time.clone(),
                (None, None) => String::new(),
            };
            let timestamp = match parse_date_time(stamp_input.trim()) {
                Ok(timestamp) => timestamp,
                Err(e) => {
                    tracing::debug!(status = %raw.status, "dropping scraped event: {}", e);
                    return None;
                }
            };
            Some(TrackingEvent {
                timestamp,
                status: map_scraped_status(&raw.status),
                location: raw.location.trim().to_string(),
                description: raw.description.trim().to_string(),
                details: None,
            })
        })
        .collect()
}

/// Lowercased not-found classifier. Runs before any event extraction so an
/// error page can never double-classify as NO_EVENTS.
pub fn page_reports_not_found(html: &str, phrases: &[&str]) -> bool {
    let lower = html.to_lowercase();
    phrases.iter().any(|phrase| lower.contains(phrase))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TrackingStatus;

    #[test]
    fn test_ladder_stops_at_first_yielding_pattern() {
        let patterns = [
            EventPattern::new(
                "modern",
                r#"<li class="step">(?P<status>[^<]+)\|(?P<date>[^<]+)</li>"#,
            ),
            EventPattern::new(
                "legacy",
                r#"<td>(?P<status>[^<]+)</td><td>(?P<date>[^<]+)</td>"#,
            ),
        ];
        let html = r#"
            <li class="step">Delivered|May 15, 2023 2:15 PM</li>
            <td>In Transit</td><td>May 14, 2023 9:00 AM</td>
        "#;
        let events = run_pattern_ladder(&patterns, html);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, "Delivered");
    }

    #[test]
    fn test_ladder_falls_through_on_zero_matches() {
        let patterns = [
            EventPattern::new("modern", r#"<li class="nope">(?P<status>[^<]+)</li>"#),
            EventPattern::new(
                "legacy",
                r#"<td>(?P<status>[^<]+)</td><td>(?P<date>[^<]+)</td>"#,
            ),
        ];
        let html = "<td>In Transit</td><td>May 14, 2023 9:00 AM</td>";
        let events = run_pattern_ladder(&patterns, html);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, "In Transit");
    }

    #[test]
    fn test_build_events_drops_undated() {
        let events = build_events(vec![
            RawEvent {
                date: Some("May 15, 2023".to_string()),
                time: Some("2:15 PM".to_string()),
                status: "Delivered".to_string(),
                location: "NEW YORK, NY 10001".to_string(),
                description: "Delivered".to_string(),
            },
            RawEvent {
                date: Some("garbage".to_string()),
                time: None,
                status: "In Transit".to_string(),
                ..Default::default()
            },
        ]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, TrackingStatus::Delivered);
        assert_eq!(events[0].location, "NEW YORK, NY 10001");
    }

    #[test]
    fn test_summary_fallback_anchors_date() {
        let html = "<p>Your item was delivered on May 11, 2016 at 11:07 am in GREENSBORO.</p>";
        let raw = summary_fallback(html).unwrap();
        assert_eq!(raw.status, "delivered");
        assert!(raw.date.as_deref().unwrap().contains("May 11, 2016"));

        let built = build_events(vec![raw]);
        assert_eq!(built.len(), 1);
        assert_eq!(built[0].status, TrackingStatus::Delivered);
    }

    #[test]
    fn test_summary_fallback_requires_both_anchors() {
        assert!(summary_fallback("<p>delivered, but no date anywhere</p>").is_none());
        assert!(summary_fallback("<p>May 11, 2016 at 11:07 am, nothing else</p>").is_none());
    }

    #[test]
    fn test_not_found_classifier() {
        let phrases = ["could not locate", "status not available"];
        assert!(page_reports_not_found(
            "<p>We Could Not Locate the tracking information</p>",
            &phrases,
        ));
        assert!(!page_reports_not_found("<p>Delivered</p>", &phrases));
    }
}
