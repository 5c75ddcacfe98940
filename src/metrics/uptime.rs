//! Per-target uptime over a time window.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::history::resolve_entities;
use crate::storage::{StatusEntry, Target};
use crate::window::Window;

/// Health summary of one target over a window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceUptime {
    pub id: String,
    pub name: String,
    pub uptime_percent: f64,
    pub total_checks: u64,
    pub passing: u64,
    /// Failed checks plus missing slots.
    pub failing: u64,
    /// Expected ticks with no stored entry.
    pub missing: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_latency_ms: Option<f64>,
}

#[derive(Default)]
struct Tally {
    passing: u64,
    failing: u64,
    last_state: Option<String>,
    last_updated: Option<DateTime<Utc>>,
    latency_sum: f64,
    latency_count: u64,
}

/// Compute uptime for every configured or observed target.
///
/// Only entries inside `window` count. Ticks the monitor should have
/// produced but did not (derived from `interval`) are counted as failures
/// for every target alike. An `interval` of zero or less disables that
/// inference.
pub fn compute_service_uptime(
    entries: &[StatusEntry],
    targets: &[Target],
    window: &Window,
    interval: Duration,
) -> Vec<ServiceUptime> {
    let in_window: Vec<&StatusEntry> = entries
        .iter()
        .filter(|e| window.contains(e.timestamp))
        .collect();

    let entities = resolve_entities(targets, in_window.iter().copied());
    if entities.is_empty() {
        return Vec::new();
    }

    let position: HashMap<&str, usize> = entities
        .iter()
        .enumerate()
        .map(|(i, e)| (e.id.as_str(), i))
        .collect();
    let mut tallies: Vec<Tally> = entities.iter().map(|_| Tally::default()).collect();

    for entry in &in_window {
        for check in &entry.checks {
            let Some(&i) = position.get(check.id.trim()) else {
                continue;
            };
            let tally = &mut tallies[i];
            if check.ok {
                tally.passing += 1;
            } else {
                tally.failing += 1;
            }
            if !check.state.is_empty() {
                tally.last_state = Some(check.state.clone());
                tally.last_updated = Some(entry.timestamp);
            }
            if let Some(latency) = check.latency_ms.filter(|l| l.is_finite()) {
                tally.latency_sum += latency;
                tally.latency_count += 1;
            }
        }
    }

    let missing = missing_slots(window, interval, in_window.len() as u64);

    let mut results: Vec<ServiceUptime> = entities
        .into_iter()
        .zip(tallies)
        .map(|(entity, tally)| {
            let failing = tally.failing + missing;
            let total = tally.passing + failing;
            let uptime = if total > 0 {
                tally.passing as f64 / total as f64 * 100.0
            } else {
                0.0
            };
            ServiceUptime {
                id: entity.id,
                name: entity.name,
                uptime_percent: round2(uptime),
                total_checks: total,
                passing: tally.passing,
                failing,
                missing,
                last_state: tally.last_state,
                last_updated: tally.last_updated,
                avg_latency_ms: (tally.latency_count > 0)
                    .then(|| round2(tally.latency_sum / tally.latency_count as f64)),
            }
        })
        .collect();

    results.sort_by(|a, b| a.id.cmp(&b.id));
    results
}

/// Number of expected ticks in `window` that have no stored entry.
pub fn missing_slots(window: &Window, interval: Duration, observed: u64) -> u64 {
    let step = interval.num_milliseconds();
    if step <= 0 {
        return 0;
    }
    let span = window.span().num_milliseconds().max(0);
    let expected = ((span + step - 1) / step) as u64;
    expected.max(observed) - observed
}

pub fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Check;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap()
    }

    fn check(id: &str, ok: bool) -> Check {
        Check {
            id: id.to_string(),
            name: id.to_uppercase(),
            ok,
            state: if ok { "active" } else { "failed" }.to_string(),
            ..Default::default()
        }
    }

    fn entry(minute: i64, checks: Vec<Check>) -> StatusEntry {
        StatusEntry {
            timestamp: t0() + Duration::minutes(minute),
            checks,
        }
    }

    fn window(from: i64, to: i64) -> Window {
        Window::new(
            t0() + Duration::minutes(from),
            t0() + Duration::minutes(to),
            t0() + Duration::days(1),
        )
    }

    fn all_ok() -> Vec<StatusEntry> {
        vec![
            entry(0, vec![check("api", true)]),
            entry(5, vec![check("api", true)]),
            entry(10, vec![check("api", true)]),
        ]
    }

    #[test]
    fn test_full_coverage_is_100_percent() {
        let result = compute_service_uptime(&all_ok(), &[], &window(0, 10), Duration::minutes(5));
        assert_eq!(result.len(), 1);
        let api = &result[0];
        assert_eq!(api.uptime_percent, 100.0);
        assert_eq!(api.total_checks, 3);
        assert_eq!(api.missing, 0);
        assert_eq!(api.failing, 0);
        assert_eq!(api.name, "API");
        assert_eq!(api.last_state.as_deref(), Some("active"));
        assert_eq!(api.last_updated, Some(t0() + Duration::minutes(10)));
    }

    #[test]
    fn test_missing_slot_counts_as_failure() {
        let result = compute_service_uptime(&all_ok(), &[], &window(0, 20), Duration::minutes(5));
        let api = &result[0];
        assert_eq!(api.missing, 1);
        assert_eq!(api.failing, 1);
        assert_eq!(api.passing, 3);
        assert_eq!(api.uptime_percent, 75.0);
    }

    #[test]
    fn test_missing_is_global_across_targets() {
        let entries = vec![
            entry(0, vec![check("api", true), check("db", false)]),
            entry(5, vec![check("api", true)]),
        ];
        let targets = vec![Target {
            id: "idle".to_string(),
            name: "Idle".to_string(),
            ..Default::default()
        }];
        let w = window(0, 30);
        let result = compute_service_uptime(&entries, &targets, &w, Duration::minutes(5));
        let ids: Vec<_> = result.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["api", "db", "idle"]);

        let per_target_samples = [2, 1, 0];
        for (row, samples) in result.iter().zip(per_target_samples) {
            assert_eq!(row.missing, 4);
            assert_eq!(row.passing + row.failing, samples + row.missing);
            assert!((0.0..=100.0).contains(&row.uptime_percent));
        }
        let idle = &result[2];
        assert_eq!(idle.passing, 0);
        assert_eq!(idle.uptime_percent, 0.0);
        assert_eq!(idle.name, "Idle");
    }

    #[test]
    fn test_entries_outside_window_ignored() {
        let result = compute_service_uptime(&all_ok(), &[], &window(1, 9), Duration::zero());
        assert_eq!(result[0].total_checks, 1);
        assert_eq!(result[0].missing, 0);
    }

    #[test]
    fn test_expected_slots_never_below_observed() {
        // Interval misconfigured much larger than the real cadence.
        let result = compute_service_uptime(&all_ok(), &[], &window(0, 10), Duration::hours(1));
        assert_eq!(result[0].missing, 0);
        assert_eq!(result[0].uptime_percent, 100.0);
    }

    #[test]
    fn test_no_samples_reports_zero() {
        let targets = vec![Target {
            id: "api".to_string(),
            ..Default::default()
        }];
        let result = compute_service_uptime(&[], &targets, &window(0, 0), Duration::minutes(5));
        assert_eq!(result[0].total_checks, 0);
        assert_eq!(result[0].uptime_percent, 0.0);
        assert!(compute_service_uptime(&[], &[], &window(0, 10), Duration::minutes(5)).is_empty());
    }

    #[test]
    fn test_rounding_and_latency() {
        let mut a = check("api", true);
        a.latency_ms = Some(10.0);
        let mut b = check("api", true);
        b.latency_ms = Some(15.5);
        let entries = vec![
            entry(0, vec![a]),
            entry(5, vec![b]),
            entry(10, vec![check("api", false)]),
        ];
        let result = compute_service_uptime(&entries, &[], &window(0, 10), Duration::minutes(5));
        assert_eq!(result[0].uptime_percent, 66.67);
        assert_eq!(result[0].avg_latency_ms, Some(12.75));
        assert_eq!(result[0].last_state.as_deref(), Some("failed"));
    }
}
