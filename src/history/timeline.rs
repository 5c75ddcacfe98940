//! Compresses sample series into fixed-size bucket timelines.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::catalog::{by_name, resolve_entities};
use crate::storage::{ConnectivityStatus, StatusEntry, Target};
use crate::window::Window;

/// Buckets generated per service when the caller does not ask for a count.
pub const DEFAULT_TIMELINE_POINTS: usize = 80;
/// Upper bound on buckets per timeline; larger requests are clamped.
pub const MAX_TIMELINE_POINTS: usize = 1440;

const MAX_DETAILS_PER_POINT: usize = 4;

const WARNING_STATES: [&str; 4] = ["activating", "deactivating", "reloading", "maintenance"];
const ERROR_STATES: [&str; 3] = ["inactive", "failed", "degraded"];

/// Bounds, in minutes, on how long a connectivity sample is carried over
/// into later empty buckets.
pub const MIN_HOLDOVER_MINUTES: i64 = 1;
pub const MAX_HOLDOVER_MINUTES: i64 = 120;

/// Classification of one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimelineClass {
    Success,
    Warning,
    Error,
    Missing,
    Unknown,
}

impl TimelineClass {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Success => "Operational",
            Self::Warning => "Transitioning",
            Self::Error => "Unavailable",
            Self::Missing => "No data",
            Self::Unknown => "Unknown",
        }
    }
}

/// Drill-down record for a problematic bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineDetail {
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub state: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

/// One bucket of a timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelinePoint {
    pub class: TimelineClass,
    pub label: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<TimelineDetail>,
}

impl TimelinePoint {
    fn new(
        class: TimelineClass,
        (start, end): (DateTime<Utc>, DateTime<Utc>),
        details: Vec<TimelineDetail>,
    ) -> Self {
        Self {
            class,
            label: class.label().to_string(),
            start,
            end,
            details,
        }
    }
}

/// Timeline of one service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceTimeline {
    pub service_id: String,
    pub service_name: String,
    pub timeline: Vec<TimelinePoint>,
}

/// One observation of an entity, as seen by the timeline builder.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    pub ok: bool,
    pub state: String,
    pub error: String,
}

impl Sample {
    fn detail(&self) -> TimelineDetail {
        TimelineDetail {
            timestamp: self.timestamp,
            state: self.state.clone(),
            error: self.error.clone(),
        }
    }
}

/// Build one timeline per entity known from targets, history and the latest tick.
///
/// Timelines are ordered by display name (case-insensitive), ties by id.
pub fn build_service_timelines(
    history: &[StatusEntry],
    latest: Option<&StatusEntry>,
    targets: &[Target],
    window: &Window,
    points: usize,
) -> Vec<ServiceTimeline> {
    let mut entities = resolve_entities(targets, history.iter().chain(latest));
    if entities.is_empty() {
        return Vec::new();
    }
    entities.sort_by(by_name);

    let mut samples = samples_by_entity(history);
    entities
        .into_iter()
        .map(|entity| {
            let series = samples.remove(&entity.id).unwrap_or_default();
            ServiceTimeline {
                timeline: build_timeline(series, window, points),
                service_id: entity.id,
                service_name: entity.name,
            }
        })
        .collect()
}

/// Split history into per-entity sample series.
pub fn samples_by_entity(history: &[StatusEntry]) -> HashMap<String, Vec<Sample>> {
    let mut samples: HashMap<String, Vec<Sample>> = HashMap::new();
    for entry in history {
        for check in &entry.checks {
            let id = check.id.trim();
            if id.is_empty() {
                continue;
            }
            samples.entry(id.to_string()).or_default().push(Sample {
                timestamp: entry.timestamp,
                ok: check.ok,
                state: check.state.clone(),
                error: check.error.clone().unwrap_or_default(),
            });
        }
    }
    samples
}

/// Reduce one entity's samples into `points` buckets spanning `window`.
pub fn build_timeline(mut samples: Vec<Sample>, window: &Window, points: usize) -> Vec<TimelinePoint> {
    let points = if points == 0 { DEFAULT_TIMELINE_POINTS } else { points };
    samples.sort_by_key(|s| s.timestamp);

    let buckets = bucket_bounds(window, points);
    let last = buckets.len() - 1;
    let mut cursor = 0;

    buckets
        .into_iter()
        .enumerate()
        .map(|(i, (start, end))| {
            while cursor < samples.len() && samples[cursor].timestamp < start {
                cursor += 1;
            }
            let first = cursor;
            while cursor < samples.len() && in_bucket(samples[cursor].timestamp, end, i == last) {
                cursor += 1;
            }
            let (class, details) = evaluate_bucket(&samples[first..cursor]);
            TimelinePoint::new(class, (start, end), details)
        })
        .collect()
}

/// Classify a bucket's samples.
///
/// Precedence is error, then missing, then warning, then success. Up to
/// four error or warning samples are kept as details; success buckets
/// carry none.
pub fn evaluate_bucket(samples: &[Sample]) -> (TimelineClass, Vec<TimelineDetail>) {
    if samples.is_empty() {
        return (TimelineClass::Missing, Vec::new());
    }

    let mut has_error = false;
    let mut has_missing = false;
    let mut has_warning = false;
    let mut details = Vec::with_capacity(MAX_DETAILS_PER_POINT);

    for sample in samples {
        let state = sample.state.trim().to_lowercase();
        let explicit_failure = !sample.ok
            && (ERROR_STATES.contains(&state.as_str())
                || (state.is_empty() && !sample.error.is_empty()));

        if explicit_failure {
            has_error = true;
            keep_detail(&mut details, sample);
        } else if sample.ok || state == "active" || state == "running" {
            // success
        } else if state == "missing" || state.is_empty() || state == "unknown" {
            has_missing = true;
        } else if WARNING_STATES.contains(&state.as_str()) {
            has_warning = true;
            keep_detail(&mut details, sample);
        } else {
            has_error = true;
            keep_detail(&mut details, sample);
        }
    }

    if has_error {
        (TimelineClass::Error, details)
    } else if has_missing {
        (TimelineClass::Missing, details)
    } else if has_warning {
        (TimelineClass::Warning, details)
    } else {
        (TimelineClass::Success, Vec::new())
    }
}

fn keep_detail(details: &mut Vec<TimelineDetail>, sample: &Sample) {
    if details.len() < MAX_DETAILS_PER_POINT {
        details.push(sample.detail());
    }
}

/// Reduce connectivity samples into `points` buckets spanning `window`.
///
/// Unlike service timelines, an empty bucket inherits the last known sample
/// as long as the silence since that sample stays within
/// [`holdover_threshold`]. Samples before the window seed that state.
pub fn build_connectivity_timeline(
    entries: &[ConnectivityStatus],
    window: &Window,
    points: usize,
) -> Vec<TimelinePoint> {
    let points = if points == 0 { DEFAULT_TIMELINE_POINTS } else { points };
    let mut samples: Vec<&ConnectivityStatus> = entries.iter().collect();
    samples.sort_by_key(|s| s.checked_at);

    let threshold = holdover_threshold(&samples);
    let buckets = bucket_bounds(window, points);
    let last_bucket = buckets.len() - 1;

    let mut idx = 0;
    let mut last: Option<&ConnectivityStatus> = None;
    while idx < samples.len() && samples[idx].checked_at < window.start {
        last = Some(samples[idx]);
        idx += 1;
    }

    buckets
        .into_iter()
        .enumerate()
        .map(|(i, (start, end))| {
            let mut class: Option<TimelineClass> = None;
            let mut details = Vec::new();

            while idx < samples.len() && in_bucket(samples[idx].checked_at, end, i == last_bucket) {
                let sample = samples[idx];
                let sample_class = connectivity_class(sample);
                class = Some(match class {
                    Some(current) => worse(current, sample_class),
                    None => sample_class,
                });
                if sample_class != TimelineClass::Success && details.len() < MAX_DETAILS_PER_POINT {
                    details.push(connectivity_detail(sample, sample.checked_at));
                }
                last = Some(sample);
                idx += 1;
            }

            if class.is_none() {
                if let Some(held) = last.filter(|s| start - s.checked_at <= threshold) {
                    let held_class = connectivity_class(held);
                    if held_class != TimelineClass::Success {
                        details.push(connectivity_detail(held, start));
                    }
                    class = Some(held_class);
                }
            }

            match class {
                Some(TimelineClass::Success) => {
                    TimelinePoint::new(TimelineClass::Success, (start, end), Vec::new())
                }
                Some(class) => TimelinePoint::new(class, (start, end), details),
                None => TimelinePoint::new(TimelineClass::Missing, (start, end), Vec::new()),
            }
        })
        .collect()
}

/// Longest gap an empty bucket may inherit the previous sample across.
///
/// Twice the median spacing of the samples, clamped to between one minute
/// and two hours. Fewer than two samples give the minimum.
pub fn holdover_threshold(sorted: &[&ConnectivityStatus]) -> Duration {
    let min = Duration::minutes(MIN_HOLDOVER_MINUTES);
    let max = Duration::minutes(MAX_HOLDOVER_MINUTES);
    let mut gaps: Vec<Duration> = sorted
        .windows(2)
        .map(|pair| pair[1].checked_at - pair[0].checked_at)
        .collect();
    if gaps.is_empty() {
        return min;
    }
    gaps.sort();
    let mid = gaps.len() / 2;
    let median = if gaps.len() % 2 == 0 {
        (gaps[mid - 1] + gaps[mid]) / 2
    } else {
        gaps[mid]
    };
    (median * 2).clamp(min, max)
}

fn connectivity_class(status: &ConnectivityStatus) -> TimelineClass {
    if status.ok {
        TimelineClass::Success
    } else if status.error.as_deref().is_some_and(|e| !e.is_empty()) {
        TimelineClass::Error
    } else {
        TimelineClass::Unknown
    }
}

fn connectivity_detail(status: &ConnectivityStatus, at: DateTime<Utc>) -> TimelineDetail {
    let state = match connectivity_class(status) {
        TimelineClass::Success => "online",
        TimelineClass::Error => "offline",
        _ => "unknown",
    };
    TimelineDetail {
        timestamp: at,
        state: state.to_string(),
        error: status.error.clone().unwrap_or_default(),
    }
}

fn worse(a: TimelineClass, b: TimelineClass) -> TimelineClass {
    let rank = |c: TimelineClass| match c {
        TimelineClass::Error => 3,
        TimelineClass::Unknown | TimelineClass::Missing => 2,
        TimelineClass::Warning => 1,
        TimelineClass::Success => 0,
    };
    if rank(b) > rank(a) {
        b
    } else {
        a
    }
}

/// `[start, end)` buckets, the last one stretched to exactly `window.end`.
fn bucket_bounds(window: &Window, points: usize) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
    let points = points.clamp(1, MAX_TIMELINE_POINTS);
    let start = window.start;
    let mut end = window.end;
    if end <= start {
        end = start + Duration::minutes(1);
    }

    let divisor = i32::try_from(points).unwrap_or(i32::MAX);
    let mut width = (end - start) / divisor;
    if width <= Duration::zero() {
        width = Duration::minutes(1);
    }

    (0..points)
        .map(|i| {
            let bucket_start = start + width * i as i32;
            let bucket_end = if i == points - 1 {
                end
            } else {
                bucket_start + width
            };
            (bucket_start, bucket_end)
        })
        .collect()
}

fn in_bucket(ts: DateTime<Utc>, bucket_end: DateTime<Utc>, is_last: bool) -> bool {
    ts < bucket_end || (is_last && ts == bucket_end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Check;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap()
    }

    fn window(minutes: i64) -> Window {
        Window::new(t0(), t0() + Duration::minutes(minutes), t0() + Duration::days(365))
    }

    fn sample(minute: i64, ok: bool, state: &str) -> Sample {
        Sample {
            timestamp: t0() + Duration::minutes(minute),
            ok,
            state: state.to_string(),
            error: String::new(),
        }
    }

    fn classes(points: &[TimelinePoint]) -> Vec<TimelineClass> {
        points.iter().map(|p| p.class).collect()
    }

    #[test]
    fn test_single_failure_forces_error() {
        let samples = vec![
            sample(1, true, "active"),
            sample(2, false, "failed"),
            sample(3, true, "active"),
        ];
        let (class, details) = evaluate_bucket(&samples);
        assert_eq!(class, TimelineClass::Error);
        assert_eq!(details.len(), 1);
        assert_eq!(details[0].state, "failed");
    }

    #[test]
    fn test_bucket_precedence() {
        use TimelineClass::*;
        let cases: Vec<(Vec<Sample>, TimelineClass)> = vec![
            (vec![], Missing),
            (vec![sample(0, true, "active"), sample(1, true, "")], Success),
            (vec![sample(0, false, "running")], Success),
            (vec![sample(0, false, "reloading"), sample(1, true, "active")], Warning),
            (vec![sample(0, false, "reloading"), sample(1, false, "unknown")], Missing),
            (vec![sample(0, false, "missing"), sample(1, false, "degraded")], Error),
            (vec![sample(0, false, "exploded")], Error),
            (vec![sample(0, false, "")], Missing),
        ];
        for (samples, expected) in cases {
            assert_eq!(evaluate_bucket(&samples).0, expected, "{:?}", samples);
        }

        let mut with_error = sample(0, false, "");
        with_error.error = "connection refused".to_string();
        assert_eq!(evaluate_bucket(&[with_error]).0, Error);
    }

    #[test]
    fn test_details_capped_and_success_has_none() {
        let samples: Vec<_> = (0..6).map(|m| sample(m, false, "failed")).collect();
        assert_eq!(evaluate_bucket(&samples).1.len(), MAX_DETAILS_PER_POINT);

        let ok: Vec<_> = (0..3).map(|m| sample(m, true, "active")).collect();
        assert!(evaluate_bucket(&ok).1.is_empty());

        let mixed = vec![sample(0, false, "maintenance"), sample(1, false, "inactive")];
        let (class, details) = evaluate_bucket(&mixed);
        assert_eq!(class, TimelineClass::Error);
        assert_eq!(details.len(), 2);
    }

    #[test]
    fn test_build_timeline_buckets() {
        // 4 buckets of 15 minutes.
        let samples = vec![
            sample(20, true, "active"),
            sample(5, true, "active"),
            sample(40, false, "activating"),
            sample(60, false, "failed"),
        ];
        let points = build_timeline(samples, &window(60), 4);
        assert_eq!(points.len(), 4);
        assert_eq!(
            classes(&points),
            vec![
                TimelineClass::Success,
                TimelineClass::Success,
                TimelineClass::Warning,
                TimelineClass::Error,
            ]
        );
        assert_eq!(points[0].start, t0());
        assert_eq!(points[1].start, t0() + Duration::minutes(15));
        assert_eq!(points[3].end, t0() + Duration::minutes(60));
        assert_eq!(points[3].label, "Unavailable");
        assert_eq!(points[2].details.len(), 1);
    }

    #[test]
    fn test_last_bucket_reaches_window_end() {
        let w = Window::new(t0(), t0() + Duration::seconds(100), t0() + Duration::days(1));
        let points = build_timeline(Vec::new(), &w, 3);
        assert_eq!(points.len(), 3);
        assert_eq!(points[2].end, w.end);
        assert!(points.iter().all(|p| p.class == TimelineClass::Missing));
        for pair in points.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
    }

    #[test]
    fn test_oversized_point_count_is_clamped() {
        let points = build_timeline(Vec::new(), &window(60), 1 << 32);
        assert_eq!(points.len(), MAX_TIMELINE_POINTS);
        assert_eq!(points[0].start, t0());
        assert_eq!(points[MAX_TIMELINE_POINTS - 1].end, t0() + Duration::minutes(60));

        let conn = build_connectivity_timeline(&[], &window(60), usize::MAX);
        assert_eq!(conn.len(), MAX_TIMELINE_POINTS);
    }

    #[test]
    fn test_samples_outside_window_ignored() {
        let samples = vec![sample(-5, false, "failed"), sample(90, false, "failed")];
        let points = build_timeline(samples, &window(60), 2);
        assert_eq!(classes(&points), vec![TimelineClass::Missing, TimelineClass::Missing]);
    }

    #[test]
    fn test_build_timeline_is_deterministic() {
        let samples: Vec<_> = (0..200)
            .map(|m| sample(m * 7 % 600, m % 11 != 0, if m % 13 == 0 { "reloading" } else { "active" }))
            .collect();
        let a = build_timeline(samples.clone(), &window(600), 80);
        let b = build_timeline(samples, &window(600), 80);
        assert_eq!(a, b);
        assert_eq!(a.len(), 80);
    }

    #[test]
    fn test_service_timelines_cover_all_entities() {
        let history = vec![StatusEntry {
            timestamp: t0() + Duration::minutes(1),
            checks: vec![Check {
                id: "web".to_string(),
                name: "web frontend".to_string(),
                ok: true,
                state: "active".to_string(),
                ..Default::default()
            }],
        }];
        let targets = vec![Target {
            id: "api".to_string(),
            name: "Zulu API".to_string(),
            ..Default::default()
        }];
        let timelines = build_service_timelines(&history, None, &targets, &window(10), 2);
        let ids: Vec<_> = timelines.iter().map(|t| t.service_id.as_str()).collect();
        assert_eq!(ids, vec!["web", "api"]);
        assert_eq!(timelines[0].timeline[0].class, TimelineClass::Success);
        assert!(timelines[1].timeline.iter().all(|p| p.class == TimelineClass::Missing));
    }

    fn conn(minute: i64, ok: bool) -> ConnectivityStatus {
        ConnectivityStatus {
            target: "1.1.1.1".to_string(),
            ok,
            latency_ms: 10,
            error: (!ok).then(|| "timeout".to_string()),
            checked_at: t0() + Duration::minutes(minute),
        }
    }

    #[test]
    fn test_holdover_threshold() {
        let samples: Vec<_> = [0, 5, 10, 15].iter().map(|&m| conn(m, true)).collect();
        let refs: Vec<_> = samples.iter().collect();
        assert_eq!(holdover_threshold(&refs), Duration::minutes(10));

        let dense: Vec<_> = (0..3).map(|_| conn(0, true)).collect();
        let refs: Vec<_> = dense.iter().collect();
        assert_eq!(holdover_threshold(&refs), Duration::minutes(1));

        let sparse: Vec<_> = [0, 600].iter().map(|&m| conn(m, true)).collect();
        let refs: Vec<_> = sparse.iter().collect();
        assert_eq!(holdover_threshold(&refs), Duration::hours(2));

        assert_eq!(holdover_threshold(&[]), Duration::minutes(1));
    }

    #[test]
    fn test_connectivity_holds_over_short_gaps() {
        // Samples every 5 minutes (threshold 10m), 1-minute buckets.
        let samples = vec![conn(0, true), conn(5, true), conn(10, false)];
        let points = build_connectivity_timeline(&samples, &window(12), 12);
        let got = classes(&points);
        assert!(got[..10].iter().all(|c| *c == TimelineClass::Success));
        assert_eq!(got[10], TimelineClass::Error);
        assert_eq!(got[11], TimelineClass::Error);
        assert_eq!(points[11].details[0].timestamp, points[11].start);
        assert_eq!(points[10].details[0].state, "offline");
    }

    #[test]
    fn test_connectivity_long_silence_is_missing() {
        let samples = vec![conn(0, true), conn(5, true)];
        // Threshold is 10 minutes; buckets of 5 minutes over an hour.
        let points = build_connectivity_timeline(&samples, &window(60), 12);
        let got = classes(&points);
        assert_eq!(got[0], TimelineClass::Success);
        assert_eq!(got[1], TimelineClass::Success);
        // Gap of exactly the threshold is still held over.
        assert_eq!(got[2], TimelineClass::Success);
        assert_eq!(got[3], TimelineClass::Success);
        assert!(got[4..].iter().all(|c| *c == TimelineClass::Missing));
    }

    #[test]
    fn test_connectivity_seeded_from_before_window() {
        let samples = vec![conn(-4, true), conn(-2, false)];
        let points = build_connectivity_timeline(&samples, &window(4), 4);
        assert_eq!(points[0].class, TimelineClass::Error);
        assert_eq!(points[3].class, TimelineClass::Missing);
        assert!(build_connectivity_timeline(&[], &window(4), 4)
            .iter()
            .all(|p| p.class == TimelineClass::Missing));
    }
}
