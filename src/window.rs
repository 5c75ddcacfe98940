//! Time windows and the named ranges clients can request.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::storage::Timestamped;

/// A closed time range `[start, end]` used for every aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Window {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Window {
    /// Build a window with `end` clamped to `now` and to at least `start`.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        let end = end.min(now).max(start);
        Self { start, end }
    }

    /// The window of length `span` ending at `now`.
    pub fn ending_at(now: DateTime<Utc>, span: Duration) -> Self {
        Self::new(now - span, now, now)
    }

    pub fn span(&self) -> Duration {
        self.end - self.start
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts <= self.end
    }

    /// Keep only the items whose timestamp falls inside the window.
    pub fn retain<T: Timestamped>(&self, items: Vec<T>) -> Vec<T> {
        items
            .into_iter()
            .filter(|item| self.contains(item.timestamp()))
            .collect()
    }
}

/// Named ranges accepted by the HTTP API and the peer protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RangeKey {
    #[default]
    #[serde(rename = "24h")]
    Last24Hours,
    #[serde(rename = "30d")]
    Last30Days,
}

impl RangeKey {
    /// Parse a range key, falling back to the last 24 hours.
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.map(|s| s.trim().to_ascii_lowercase()).as_deref() {
            Some("30d") | Some("last30d") | Some("month") => Self::Last30Days,
            _ => Self::Last24Hours,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Last24Hours => "24h",
            Self::Last30Days => "30d",
        }
    }

    pub fn span(&self) -> Duration {
        match self {
            Self::Last24Hours => Duration::hours(24),
            Self::Last30Days => Duration::days(30),
        }
    }

    pub fn window(&self, now: DateTime<Utc>) -> Window {
        Window::ending_at(now, self.span())
    }
}
