//! Bi-temporal queries over the edge store.
//!
//! Filters compose with AND semantics and run in a fixed order:
//!
//! 1. `valid_at`: valid-time point membership.
//! 2. `valid_during`: valid-time range relation (`overlaps` unless a
//!    [`TemporalOperator`] is given).
//! 3. `as_of`: transaction-time cut: edges recorded after `as_of` are
//!    dropped, the rest are replaced by their reconstructed state.
//! 4. `context_window`: explicit tag membership.
//!
//! Steps 1 and 2 look at the live edge, so a reconstructed `as_of` result
//! can carry valid-time fields that differ from what was filtered on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::context::{ContextRegistry, ContextWindow};
use crate::interval::{valid_at_point, TemporalOperator, TimeRange};
use crate::{BiTemporalEdge, ChronoError, EdgeId, Result};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TemporalQuery {
    /// Transaction time: answer with what the store knew at this instant.
    pub as_of: Option<DateTime<Utc>>,
    /// Valid time: keep edges true at this instant.
    pub valid_at: Option<DateTime<Utc>>,
    /// Valid time: keep edges related to this range.
    pub valid_during: Option<TimeRange>,
    /// Keep edges tagged with this context window id.
    pub context_window: Option<String>,
    /// Relation used with `valid_during`; defaults to overlap.
    pub temporal_operator: Option<TemporalOperator>,
}

impl TemporalQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn as_of(mut self, t: DateTime<Utc>) -> Self {
        self.as_of = Some(t);
        self
    }

    pub fn valid_at(mut self, t: DateTime<Utc>) -> Self {
        self.valid_at = Some(t);
        self
    }

    pub fn valid_during(mut self, range: TimeRange) -> Self {
        self.valid_during = Some(range);
        self
    }

    pub fn in_context(mut self, id: impl Into<String>) -> Self {
        self.context_window = Some(id.into());
        self
    }

    pub fn with_operator(mut self, op: TemporalOperator) -> Self {
        self.temporal_operator = Some(op);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.temporal_operator.is_some() && self.valid_during.is_none() {
            return Err(ChronoError::Validation(
                "temporal_operator requires valid_during".to_string(),
            ));
        }
        if let Some(range) = &self.valid_during {
            TimeRange::new(range.start, range.end)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub edges: Vec<BiTemporalEdge>,
    /// Distinct endpoint entity ids of `edges`, sorted.
    pub related_entities: Vec<String>,
    /// Context windows referenced by `edges`.
    pub context_windows: Vec<ContextWindow>,
    /// The `now` open intervals were resolved against.
    pub evaluated_at: DateTime<Utc>,
}

pub(crate) fn execute(
    edges: &BTreeMap<EdgeId, BiTemporalEdge>,
    contexts: &ContextRegistry,
    query: &TemporalQuery,
    now: DateTime<Utc>,
) -> Result<QueryResult> {
    query.validate()?;
    let operator = query
        .temporal_operator
        .unwrap_or(TemporalOperator::Overlaps);

    let mut matched = Vec::new();
    for edge in edges.values() {
        if let Some(t) = query.valid_at {
            if !valid_at_point(edge, t, now) {
                continue;
            }
        }
        if let Some(range) = &query.valid_during {
            if !operator.evaluate(&edge.valid_time.range(), range, now) {
                continue;
            }
        }
        let edge = match query.as_of {
            Some(t) => {
                if edge.transaction_time.created > t {
                    continue;
                }
                match edge.reconstruct_as_of(t) {
                    Some(past) => past,
                    None => {
                        // Ledger trimmed past `t`: fall back to best-known state.
                        tracing::debug!(edge = %edge.id, as_of = %t, "no retained revision before as_of");
                        edge.clone()
                    }
                }
            }
            None => edge.clone(),
        };
        if let Some(ctx) = &query.context_window {
            if !edge.in_context(ctx) {
                continue;
            }
        }
        matched.push(edge);
    }

    let related_entities: BTreeSet<&str> = matched
        .iter()
        .flat_map(|e| [e.source.as_str(), e.target.as_str()])
        .collect();
    let context_ids: BTreeSet<&str> = matched
        .iter()
        .flat_map(|e| e.context_windows.iter().map(String::as_str))
        .collect();
    let context_windows = context_ids
        .into_iter()
        .filter_map(|id| contexts.get(id).cloned())
        .collect();
    let related_entities = related_entities.into_iter().map(str::to_string).collect();

    Ok(QueryResult {
        edges: matched,
        related_entities,
        context_windows,
        evaluated_at: now,
    })
}
