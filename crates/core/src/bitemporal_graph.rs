//! chronoedge: a bi-temporal knowledge store for relationships between code
//! entities.
//!
//! The core primitive is a [`BiTemporalEdge`]: a source-relation-target
//! relationship augmented with two independent time axes.
//!
//! **Valid time** ([`ValidTimeInterval`]) captures when the relationship was
//! true *in the codebase*. **Transaction time** ([`TransactionTimeInterval`])
//! captures when the store *learned* about it, together with an append-only
//! ledger of every [`Revision`] applied to the edge since.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use chrono::Utc;
//! use chronoedge::{BiTemporalStore, EdgeOptions, RedbGraphStore, TemporalConfig, TemporalQuery};
//!
//! let graph = Arc::new(RedbGraphStore::open("code-graph.redb").unwrap());
//! let store = BiTemporalStore::new(graph, TemporalConfig::default()).unwrap();
//!
//! // Record a relationship
//! let edge = store
//!     .create_bitemporal_edge("src/app.rs", "src/db.rs", "depends_on", Utc::now(), EdgeOptions::default())
//!     .unwrap();
//!
//! // What is true right now?
//! let current = store.query_bitemporal(&TemporalQuery::new().valid_at(Utc::now())).unwrap();
//!
//! // The relationship stops holding
//! store.invalidate_relationship(&edge.id, None, Some("module removed"), Vec::new()).unwrap();
//! ```

pub mod clock;
pub mod config;
pub mod context;
pub mod graph;
pub mod interval;
mod ledger;
pub mod maintenance;
pub mod query;
mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::TemporalConfig;
pub use context::{ContextRegistry, ContextWindow, ContextWindowParams};
pub use graph::{GraphEdge, GraphSnapshot, GraphStore, Node, RedbGraphStore};
pub use interval::{overlaps, valid_at_point, TemporalOperator, TimeRange};
pub use maintenance::{MaintenanceReport, MaintenanceScheduler};
pub use query::{QueryResult, TemporalQuery};
pub use store::{
    BiTemporalStats, BiTemporalStore, EdgeOptions, FileChange, TemporalExport, TemporalSnapshot,
};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ChronoError {
    #[error("edge not found: {0}")]
    EdgeNotFound(String),
    #[error("context window not found: {0}")]
    ContextWindowNotFound(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("graph store error: {0}")]
    GraphStore(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("config error: {0}")]
    Config(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<redb::DatabaseError> for ChronoError {
    fn from(e: redb::DatabaseError) -> Self {
        ChronoError::Storage(e.to_string())
    }
}
impl From<redb::TransactionError> for ChronoError {
    fn from(e: redb::TransactionError) -> Self {
        ChronoError::Storage(e.to_string())
    }
}
impl From<redb::TableError> for ChronoError {
    fn from(e: redb::TableError) -> Self {
        ChronoError::Storage(e.to_string())
    }
}
impl From<redb::StorageError> for ChronoError {
    fn from(e: redb::StorageError) -> Self {
        ChronoError::Storage(e.to_string())
    }
}
impl From<redb::CommitError> for ChronoError {
    fn from(e: redb::CommitError) -> Self {
        ChronoError::Storage(e.to_string())
    }
}
impl From<toml::de::Error> for ChronoError {
    fn from(e: toml::de::Error) -> Self {
        ChronoError::Config(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ChronoError>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// Confidence assigned to new edges when the caller does not supply one.
pub const DEFAULT_CONFIDENCE: f32 = 0.8;

/// Lowest confidence that maintenance decay can drive an edge down to.
pub const CONFIDENCE_FLOOR: f32 = 0.1;

/// Reject confidences outside `[0.0, 1.0]` (NaN included).
pub fn validate_confidence(value: f32) -> Result<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(ChronoError::Validation(format!(
            "confidence must be within [0, 1], got {value}"
        )));
    }
    Ok(())
}

/// Identifier of a [`BiTemporalEdge`].
///
/// Built from the endpoints, the relation and the creation timestamp, so the
/// id of an edge tells you what it connected and when it was first recorded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EdgeId(pub String);

impl EdgeId {
    pub fn generate(source: &str, target: &str, relation: &str, created: DateTime<Utc>) -> Self {
        Self(format!(
            "{source}__{relation}__{target}__{}",
            created.timestamp_millis()
        ))
    }
}

impl std::fmt::Display for EdgeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for EdgeId {
    fn from(s: &str) -> Self {
        EdgeId(s.to_string())
    }
}

/// When a relationship was true in the modeled codebase.
///
/// `end == None` means the relationship still holds. This is the single
/// authoritative "is this still true" flag; the edge record itself keeps
/// existing after `end` is set, until retention pruning removes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidTimeInterval {
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    /// Confidence in the relationship \[0.0, 1.0\].
    pub confidence: f32,
    /// Ordered evidence strings (analyzer findings, commit ids, ...).
    pub evidence: Vec<String>,
}

impl ValidTimeInterval {
    /// Build a validated interval.
    pub fn new(
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
        confidence: f32,
        evidence: Vec<String>,
    ) -> Result<Self> {
        let interval = Self {
            start,
            end,
            confidence,
            evidence,
        };
        interval.validate()?;
        Ok(interval)
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(end) = self.end {
            if end < self.start {
                return Err(ChronoError::Validation(format!(
                    "interval end ({}) is before start ({})",
                    end.to_rfc3339(),
                    self.start.to_rfc3339()
                )));
            }
        }
        validate_confidence(self.confidence)
    }

    pub fn is_open(&self) -> bool {
        self.end.is_none()
    }

    pub fn range(&self) -> TimeRange {
        TimeRange {
            start: self.start,
            end: self.end,
        }
    }
}

/// What happened to an edge in one [`Revision`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevisionAction {
    Created,
    Updated,
    Invalidated,
    Restored,
}

impl std::fmt::Display for RevisionAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RevisionAction::Created => "created",
            RevisionAction::Updated => "updated",
            RevisionAction::Invalidated => "invalidated",
            RevisionAction::Restored => "restored",
        };
        f.write_str(s)
    }
}

/// The externally visible, mutable part of an edge, as captured in a revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeState {
    pub valid_time: ValidTimeInterval,
    pub confidence: f32,
    pub context_windows: Vec<String>,
    pub temporal_type: TemporalType,
}

/// One immutable entry of an edge's revision ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Revision {
    /// `"<edge id>_rev_<n>"`.
    pub id: String,
    /// Transaction time of the change.
    pub timestamp: DateTime<Utc>,
    pub action: RevisionAction,
    /// State before the change. `None` for [`RevisionAction::Created`].
    pub previous_state: Option<EdgeState>,
    pub new_state: EdgeState,
    pub reason: String,
    pub confidence: f32,
    pub evidence: Vec<String>,
}

/// When the store learned about an edge, and everything it learned since.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionTimeInterval {
    pub created: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    /// Ordered by timestamp ascending (insertion order).
    pub revisions: Vec<Revision>,
    /// Which component or caller recorded the edge.
    pub discovered_by: String,
    /// Number of revisions ever appended, including ones trimmed away.
    #[serde(default)]
    pub revision_seq: u64,
}

/// How an edge's truth evolves over valid time.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum TemporalType {
    Snapshot,
    #[default]
    Continuous,
    Periodic,
    EventDriven,
}

/// Optional causal annotation: `cause` leads to `effect` after `delay_ms`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CausalLink {
    pub cause: String,
    pub effect: String,
    pub delay_ms: i64,
}

/// A relationship between two code entities with bi-temporal metadata.
///
/// # Bi-temporal model
///
/// - **Valid time** (`valid_time`): when `source --relation--> target` held
///   in the code. An import added in March has `valid_time.start` in March
///   even if the analyzer only noticed it in May.
///
/// - **Transaction time** (`transaction_time`): when the store recorded the
///   edge and each later change. Replaying the ledger answers "what did we
///   *believe* about this dependency on May 1st?" separately from "did this
///   dependency exist on May 1st?"
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BiTemporalEdge {
    pub id: EdgeId,
    /// Entity id of the relationship's origin.
    pub source: String,
    /// Entity id of the relationship's destination.
    pub target: String,
    /// Relationship type (e.g. `depends_on`, `calls`, `imports`).
    pub relation: String,
    /// Current confidence \[0.0, 1.0\]; mirrors `valid_time.confidence`.
    pub confidence: f32,
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub valid_time: ValidTimeInterval,
    pub transaction_time: TransactionTimeInterval,
    /// Ids of the context windows this edge was tagged with.
    pub context_windows: Vec<String>,
    pub temporal_type: TemporalType,
    pub causal: Option<CausalLink>,
}

impl BiTemporalEdge {
    /// Is the relationship still true (valid time is open)?
    pub fn is_currently_valid(&self) -> bool {
        self.valid_time.is_open()
    }

    /// Snapshot of the fields recorded in the revision ledger.
    pub fn state(&self) -> EdgeState {
        EdgeState {
            valid_time: self.valid_time.clone(),
            confidence: self.confidence,
            context_windows: self.context_windows.clone(),
            temporal_type: self.temporal_type,
        }
    }

    pub fn touches(&self, entity: &str) -> bool {
        self.source == entity || self.target == entity
    }

    pub fn in_context(&self, context_id: &str) -> bool {
        self.context_windows.iter().any(|c| c == context_id)
    }

    /// Overwrite the externally visible fields with a recorded state.
    pub(crate) fn apply_state(&mut self, state: &EdgeState) {
        self.valid_time = state.valid_time.clone();
        self.confidence = state.confidence;
        self.context_windows = state.context_windows.clone();
        self.temporal_type = state.temporal_type;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
