//! Interval algebra over valid-time ranges.
//!
//! An open end (`None`) means "ongoing through now": every comparison
//! resolves it against the caller-supplied `now`, never against an infinite
//! future. All functions are pure.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::{BiTemporalEdge, ChronoError, Result};

/// A valid-time range with an optionally open end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: Option<DateTime<Utc>>) -> Result<Self> {
        if let Some(end) = end {
            if end < start {
                return Err(ChronoError::Validation(format!(
                    "range end ({}) is before start ({})",
                    end.to_rfc3339(),
                    start.to_rfc3339()
                )));
            }
        }
        Ok(Self { start, end })
    }

    pub fn closed(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        Self::new(start, Some(end))
    }

    /// The end of the range, with an open end read as `now`.
    pub fn end_or(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.end.unwrap_or(now)
    }

    /// Closed-interval membership: `start <= t <= (end ?? now)`.
    pub fn contains_point(&self, t: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        self.start <= t && t <= self.end_or(now)
    }
}

/// `a.start <= (b.end ?? now) && b.start <= (a.end ?? now)`.
pub fn overlaps(a: &TimeRange, b: &TimeRange, now: DateTime<Utc>) -> bool {
    a.start <= b.end_or(now) && b.start <= a.end_or(now)
}

/// Was `edge` valid at `t` on the valid-time axis?
pub fn valid_at_point(edge: &BiTemporalEdge, t: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    edge.valid_time.range().contains_point(t, now)
}

/// Allen-style relation between an edge's valid time (`a`) and a query
/// range (`b`).
///
/// `Contains` and `During` are inclusive; the endpoint relations
/// (`Meets`, `MetBy`, `Starts`, `Finishes`, `Equals`) compare exact
/// instants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemporalOperator {
    /// The ranges share at least one instant.
    Overlaps,
    /// `a` covers all of `b`.
    Contains,
    /// `a` lies entirely inside `b`.
    During,
    /// `a` ends strictly before `b` starts.
    #[serde(alias = "precedes")]
    Before,
    /// `a` starts strictly after `b` ends.
    #[serde(alias = "follows")]
    After,
    /// `a` ends exactly where `b` starts.
    Meets,
    /// `a` starts exactly where `b` ends.
    MetBy,
    /// Same start, `a` ends no later than `b`.
    Starts,
    /// Same end, `a` starts no earlier than `b`.
    Finishes,
    /// Same start and same end.
    Equals,
}

impl TemporalOperator {
    pub fn evaluate(self, a: &TimeRange, b: &TimeRange, now: DateTime<Utc>) -> bool {
        let a_end = a.end_or(now);
        let b_end = b.end_or(now);
        match self {
            TemporalOperator::Overlaps => overlaps(a, b, now),
            TemporalOperator::Contains => a.start <= b.start && a_end >= b_end,
            TemporalOperator::During => b.start <= a.start && a_end <= b_end,
            TemporalOperator::Before => a_end < b.start,
            TemporalOperator::After => a.start > b_end,
            TemporalOperator::Meets => a_end == b.start,
            TemporalOperator::MetBy => a.start == b_end,
            TemporalOperator::Starts => a.start == b.start && a_end <= b_end,
            TemporalOperator::Finishes => a_end == b_end && a.start >= b.start,
            TemporalOperator::Equals => a.start == b.start && a_end == b_end,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TemporalOperator::Overlaps => "overlaps",
            TemporalOperator::Contains => "contains",
            TemporalOperator::During => "during",
            TemporalOperator::Before => "before",
            TemporalOperator::After => "after",
            TemporalOperator::Meets => "meets",
            TemporalOperator::MetBy => "met_by",
            TemporalOperator::Starts => "starts",
            TemporalOperator::Finishes => "finishes",
            TemporalOperator::Equals => "equals",
        }
    }
}

impl std::fmt::Display for TemporalOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TemporalOperator {
    type Err = ChronoError;

    fn from_str(s: &str) -> Result<Self> {
        let op = match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "overlaps" => TemporalOperator::Overlaps,
            "contains" => TemporalOperator::Contains,
            "during" => TemporalOperator::During,
            "before" | "precedes" => TemporalOperator::Before,
            "after" | "follows" => TemporalOperator::After,
            "meets" => TemporalOperator::Meets,
            "met_by" | "metby" => TemporalOperator::MetBy,
            "starts" => TemporalOperator::Starts,
            "finishes" => TemporalOperator::Finishes,
            "equals" => TemporalOperator::Equals,
            other => {
                return Err(ChronoError::Validation(format!(
                    "unsupported temporal operator: {other}"
                )))
            }
        };
        Ok(op)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
