//! The bi-temporal edge store.
//!
//! [`BiTemporalStore`] owns every edge, ledger, context window and snapshot
//! behind a single `RwLock`. Mutations (including maintenance) take the write
//! lock, so revision numbering never races; queries take the read lock and
//! copy their results out. Calls into the external [`GraphStore`] happen
//! after the lock is released.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use ulid::Ulid;

use crate::clock::{Clock, SystemClock};
use crate::config::TemporalConfig;
use crate::context::{ContextRegistry, ContextWindow, ContextWindowParams};
use crate::graph::{GraphEdge, GraphStore, Node};
use crate::maintenance::{self, MaintenanceReport};
use crate::query::{self, QueryResult, TemporalQuery};
use crate::{
    validate_confidence, BiTemporalEdge, CausalLink, ChronoError, EdgeId, Result, RevisionAction,
    TemporalType, TransactionTimeInterval, ValidTimeInterval, CONFIDENCE_FLOOR,
    DEFAULT_CONFIDENCE,
};

/// Optional settings for [`BiTemporalStore::create_bitemporal_edge`].
#[derive(Debug, Clone, Default)]
pub struct EdgeOptions {
    /// Close the valid-time interval at creation (historical edges).
    pub valid_end: Option<DateTime<Utc>>,
    /// Defaults to [`DEFAULT_CONFIDENCE`].
    pub confidence: Option<f32>,
    pub evidence: Vec<String>,
    pub reason: Option<String>,
    pub temporal_type: TemporalType,
    pub causal: Option<CausalLink>,
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// Defaults to `"api"`.
    pub discovered_by: Option<String>,
}

/// Kind of file-system change reported to [`BiTemporalStore::on_file_changed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileChange {
    Created,
    Modified,
    Deleted,
}

impl std::fmt::Display for FileChange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FileChange::Created => "created",
            FileChange::Modified => "modified",
            FileChange::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

impl FromStr for FileChange {
    type Err = ChronoError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "created" | "added" => Ok(FileChange::Created),
            "modified" | "changed" => Ok(FileChange::Modified),
            "deleted" | "removed" => Ok(FileChange::Deleted),
            other => Err(ChronoError::Validation(format!(
                "unknown file change type: {other}"
            ))),
        }
    }
}

/// A full copy of the store's temporal state at one instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemporalSnapshot {
    pub id: String,
    pub taken_at: DateTime<Utc>,
    pub active_context_window: Option<String>,
    pub edges: Vec<BiTemporalEdge>,
    pub context_windows: Vec<ContextWindow>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BiTemporalStats {
    pub total_edges: usize,
    pub currently_valid_edges: usize,
    pub invalidated_edges: usize,
    pub total_revisions: usize,
    pub average_confidence: f32,
    pub temporal_types: BTreeMap<TemporalType, usize>,
    pub context_windows: usize,
    pub active_context_window: Option<String>,
    pub snapshots: usize,
    pub earliest_valid_start: Option<DateTime<Utc>>,
    pub latest_modification: Option<DateTime<Utc>>,
    pub last_maintenance: Option<DateTime<Utc>>,
    pub graph_nodes: usize,
    pub graph_edges: usize,
}

/// Everything the store holds, for backup or inspection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemporalExport {
    pub exported_at: DateTime<Utc>,
    pub config: TemporalConfig,
    pub active_context_window: Option<String>,
    pub context_windows: Vec<ContextWindow>,
    pub edges: Vec<BiTemporalEdge>,
    pub snapshots: Vec<TemporalSnapshot>,
    pub stats: BiTemporalStats,
}

/// State guarded by the store lock.
#[derive(Debug)]
pub(crate) struct StoreState {
    pub(crate) edges: BTreeMap<EdgeId, BiTemporalEdge>,
    pub(crate) contexts: ContextRegistry,
    pub(crate) snapshots: Vec<TemporalSnapshot>,
    pub(crate) last_maintenance: Option<DateTime<Utc>>,
}

impl StoreState {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            edges: BTreeMap::new(),
            contexts: ContextRegistry::bootstrap(now),
            snapshots: Vec::new(),
            last_maintenance: None,
        }
    }

    fn edge_mut(&mut self, id: &EdgeId) -> Result<&mut BiTemporalEdge> {
        self.edges
            .get_mut(id)
            .ok_or_else(|| ChronoError::EdgeNotFound(id.to_string()))
    }

    fn invalidate_edge(
        &mut self,
        id: &EdgeId,
        at: DateTime<Utc>,
        now: DateTime<Utc>,
        reason: String,
        evidence: Vec<String>,
    ) -> Result<BiTemporalEdge> {
        let edge = self.edge_mut(id)?;
        if at < edge.valid_time.start {
            return Err(ChronoError::Validation(format!(
                "cannot invalidate edge {id} at {}: before its valid start {}",
                at.to_rfc3339(),
                edge.valid_time.start.to_rfc3339()
            )));
        }
        // Repeated invalidation still appends a revision.
        edge.append_revision(RevisionAction::Invalidated, now, reason, evidence, |e| {
            e.valid_time.end = Some(at);
        });
        Ok(edge.clone())
    }

    pub(crate) fn take_snapshot(&mut self, now: DateTime<Utc>) -> TemporalSnapshot {
        let snapshot = TemporalSnapshot {
            id: Ulid::new().to_string(),
            taken_at: now,
            active_context_window: self.contexts.active_id().map(str::to_string),
            edges: self.edges.values().cloned().collect(),
            context_windows: self.contexts.iter().cloned().collect(),
        };
        self.snapshots.push(snapshot.clone());
        snapshot
    }

    fn stats(&self) -> BiTemporalStats {
        let total_edges = self.edges.len();
        let currently_valid_edges = self
            .edges
            .values()
            .filter(|e| e.is_currently_valid())
            .count();
        let mut temporal_types = BTreeMap::new();
        for edge in self.edges.values() {
            *temporal_types.entry(edge.temporal_type).or_insert(0) += 1;
        }
        let average_confidence = if total_edges == 0 {
            0.0
        } else {
            self.edges.values().map(|e| e.confidence).sum::<f32>() / total_edges as f32
        };
        BiTemporalStats {
            total_edges,
            currently_valid_edges,
            invalidated_edges: total_edges - currently_valid_edges,
            total_revisions: self
                .edges
                .values()
                .map(|e| e.transaction_time.revisions.len())
                .sum(),
            average_confidence,
            temporal_types,
            context_windows: self.contexts.len(),
            active_context_window: self.contexts.active_id().map(str::to_string),
            snapshots: self.snapshots.len(),
            earliest_valid_start: self.edges.values().map(|e| e.valid_time.start).min(),
            latest_modification: self
                .edges
                .values()
                .map(|e| e.transaction_time.last_modified)
                .max(),
            last_maintenance: self.last_maintenance,
            graph_nodes: 0,
            graph_edges: 0,
        }
    }
}

/// In-memory bi-temporal knowledge store.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use chrono::Utc;
/// use chronoedge::{BiTemporalStore, EdgeOptions, RedbGraphStore, TemporalConfig, TemporalQuery};
///
/// let graph = Arc::new(RedbGraphStore::open_in_memory().unwrap());
/// let store = BiTemporalStore::new(graph, TemporalConfig::default()).unwrap();
/// store
///     .create_bitemporal_edge("app", "db", "depends_on", Utc::now(), EdgeOptions::default())
///     .unwrap();
/// let result = store.query_bitemporal(&TemporalQuery::new().valid_at(Utc::now())).unwrap();
/// assert_eq!(result.edges.len(), 1);
/// ```
pub struct BiTemporalStore {
    state: RwLock<StoreState>,
    graph: Arc<dyn GraphStore>,
    clock: Arc<dyn Clock>,
    config: TemporalConfig,
}

impl BiTemporalStore {
    /// Create a store reading wall-clock time.
    pub fn new(graph: Arc<dyn GraphStore>, config: TemporalConfig) -> Result<Self> {
        Self::with_clock(graph, config, Arc::new(SystemClock))
    }

    /// Create a store with an explicit time source.
    ///
    /// The bootstrap context window is anchored at `clock.now()`.
    pub fn with_clock(
        graph: Arc<dyn GraphStore>,
        config: TemporalConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let state = StoreState::new(clock.now());
        Ok(Self {
            state: RwLock::new(state),
            graph,
            clock,
            config,
        })
    }

    pub fn config(&self) -> &TemporalConfig {
        &self.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn read_state(&self) -> Result<RwLockReadGuard<'_, StoreState>> {
        self.state
            .read()
            .map_err(|_| ChronoError::Internal("store lock poisoned".into()))
    }

    pub(crate) fn write_state(&self) -> Result<RwLockWriteGuard<'_, StoreState>> {
        self.state
            .write()
            .map_err(|_| ChronoError::Internal("store lock poisoned".into()))
    }

    // -- edges -------------------------------------------------------------

    /// Record a new relationship and mirror it into the plain graph.
    ///
    /// The edge is tagged with the active context window and gets one
    /// `created` revision. The mirror write is not transactional with the
    /// temporal write: if it fails the error is returned, but the temporal
    /// edge has already been recorded.
    pub fn create_bitemporal_edge(
        &self,
        source: &str,
        target: &str,
        relation: &str,
        valid_start: DateTime<Utc>,
        options: EdgeOptions,
    ) -> Result<BiTemporalEdge> {
        if source.is_empty() || target.is_empty() || relation.is_empty() {
            return Err(ChronoError::Validation(
                "source, target and relation must not be empty".to_string(),
            ));
        }
        let confidence = options.confidence.unwrap_or(DEFAULT_CONFIDENCE);
        let valid_time = ValidTimeInterval::new(
            valid_start,
            options.valid_end,
            confidence,
            options.evidence.clone(),
        )?;
        let now = self.clock.now();
        let reason = options
            .reason
            .unwrap_or_else(|| "relationship recorded".to_string());

        let edge = {
            let mut state = self.write_state()?;
            let base = EdgeId::generate(source, target, relation, now);
            let mut id = base.clone();
            let mut n = 1;
            while state.edges.contains_key(&id) {
                id = EdgeId(format!("{base}_{n}"));
                n += 1;
            }
            let context_windows: Vec<String> =
                state.contexts.active_id().map(str::to_string).into_iter().collect();

            let mut edge = BiTemporalEdge {
                id: id.clone(),
                source: source.to_string(),
                target: target.to_string(),
                relation: relation.to_string(),
                confidence,
                metadata: options.metadata,
                valid_time,
                transaction_time: TransactionTimeInterval {
                    created: now,
                    last_modified: now,
                    revisions: Vec::new(),
                    discovered_by: options.discovered_by.unwrap_or_else(|| "api".to_string()),
                    revision_seq: 0,
                },
                context_windows,
                temporal_type: options.temporal_type,
                causal: options.causal,
            };
            edge.append_revision(RevisionAction::Created, now, reason, options.evidence, |_| {});

            for ctx in &edge.context_windows {
                state
                    .contexts
                    .note_related(ctx, [edge.source.as_str(), edge.target.as_str()]);
            }
            state.edges.insert(id, edge.clone());
            edge
        };
        tracing::debug!(edge = %edge.id, relation = %edge.relation, "bi-temporal edge created");

        let mut metadata = edge.metadata.clone();
        metadata.insert("bitemporal_id".into(), edge.id.0.clone().into());
        metadata.insert(
            "valid_from".into(),
            edge.valid_time.start.to_rfc3339().into(),
        );
        self.graph.add_edge(GraphEdge {
            source: edge.source.clone(),
            target: edge.target.clone(),
            relation: edge.relation.clone(),
            confidence: edge.confidence,
            metadata,
        })?;
        Ok(edge)
    }

    /// Close the edge's valid time at `at` (default: now).
    ///
    /// Every call appends an `invalidated` revision, including calls on an
    /// edge that is already closed; the latest `at` wins.
    pub fn invalidate_relationship(
        &self,
        id: &EdgeId,
        at: Option<DateTime<Utc>>,
        reason: Option<&str>,
        evidence: Vec<String>,
    ) -> Result<BiTemporalEdge> {
        let now = self.clock.now();
        let at = at.unwrap_or(now);
        let reason = reason.unwrap_or("relationship invalidated").to_string();
        let edge = self
            .write_state()?
            .invalidate_edge(id, at, now, reason, evidence)?;
        tracing::debug!(edge = %id, at = %at, "bi-temporal edge invalidated");
        Ok(edge)
    }

    /// Reopen a closed edge's valid time.
    pub fn restore_relationship(&self, id: &EdgeId, reason: Option<&str>) -> Result<BiTemporalEdge> {
        let now = self.clock.now();
        let reason = reason.unwrap_or("relationship restored").to_string();
        let mut state = self.write_state()?;
        let edge = state.edge_mut(id)?;
        edge.append_revision(RevisionAction::Restored, now, reason, Vec::new(), |e| {
            e.valid_time.end = None;
        });
        tracing::debug!(edge = %id, "bi-temporal edge restored");
        Ok(edge.clone())
    }

    /// Set an edge's confidence, recording an `updated` revision.
    pub fn update_edge_confidence(
        &self,
        id: &EdgeId,
        confidence: f32,
        reason: Option<&str>,
    ) -> Result<BiTemporalEdge> {
        validate_confidence(confidence)?;
        let now = self.clock.now();
        let reason = reason.unwrap_or("confidence updated").to_string();
        let mut state = self.write_state()?;
        let edge = state.edge_mut(id)?;
        edge.append_revision(RevisionAction::Updated, now, reason, Vec::new(), |e| {
            e.confidence = confidence;
            e.valid_time.confidence = confidence;
        });
        Ok(edge.clone())
    }

    pub fn get_edge(&self, id: &EdgeId) -> Result<BiTemporalEdge> {
        self.read_state()?
            .edges
            .get(id)
            .cloned()
            .ok_or_else(|| ChronoError::EdgeNotFound(id.to_string()))
    }

    pub fn edge_count(&self) -> Result<usize> {
        Ok(self.read_state()?.edges.len())
    }

    // -- context windows ---------------------------------------------------

    pub fn create_context_window(&self, params: ContextWindowParams) -> Result<ContextWindow> {
        let window = self.write_state()?.contexts.create(params)?;
        tracing::debug!(context = %window.id, "context window created");
        Ok(window)
    }

    /// Tag all subsequently created edges with context window `id`.
    pub fn set_current_context_window(&self, id: &str) -> Result<()> {
        self.write_state()?.contexts.set_active(id)
    }

    pub fn current_context_window(&self) -> Result<Option<ContextWindow>> {
        Ok(self.read_state()?.contexts.active().cloned())
    }

    pub fn context_window(&self, id: &str) -> Result<ContextWindow> {
        self.read_state()?
            .contexts
            .get(id)
            .cloned()
            .ok_or_else(|| ChronoError::ContextWindowNotFound(id.to_string()))
    }

    /// Context windows covering `t`, within the configured overlap tolerance.
    pub fn context_windows_at(&self, t: DateTime<Utc>) -> Result<Vec<ContextWindow>> {
        let now = self.clock.now();
        let state = self.read_state()?;
        Ok(state
            .contexts
            .windows_at(t, self.config.context_window_overlap(), now)
            .into_iter()
            .cloned()
            .collect())
    }

    // -- queries -----------------------------------------------------------

    pub fn query_bitemporal(&self, query: &TemporalQuery) -> Result<QueryResult> {
        let now = self.clock.now();
        let state = self.read_state()?;
        query::execute(&state.edges, &state.contexts, query, now)
    }

    /// Look up entity records for ids returned in [`QueryResult::related_entities`].
    /// Ids unknown to the graph are skipped.
    pub fn resolve_entities(&self, ids: &[String]) -> Result<Vec<Node>> {
        let mut nodes = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(node) = self.graph.get_node(id)? {
                nodes.push(node);
            }
        }
        Ok(nodes)
    }

    // -- file events -------------------------------------------------------

    /// Invalidate every currently valid edge touching an entity that lives in
    /// `path`. Returns the invalidated edge ids.
    ///
    /// Does nothing when automatic invalidation is disabled or when the file
    /// was created. For deleted files the affected entities' confidence is
    /// also lowered to [`CONFIDENCE_FLOOR`].
    pub fn on_file_changed(&self, path: &str, change: FileChange) -> Result<Vec<EdgeId>> {
        if !self.config.automatic_invalidation {
            tracing::debug!(path, "automatic invalidation disabled; ignoring file change");
            return Ok(Vec::new());
        }
        if change == FileChange::Created {
            return Ok(Vec::new());
        }

        let nodes = self
            .graph
            .find_nodes(&|n| n.path.as_deref() == Some(path))?;
        if nodes.is_empty() {
            return Ok(Vec::new());
        }
        let entity_ids: BTreeSet<&str> = nodes.iter().map(|n| n.id.as_str()).collect();

        let now = self.clock.now();
        let invalidated = {
            let mut state = self.write_state()?;
            // Edges whose valid time starts in the future are closed at their
            // start, so every target can be invalidated.
            let targets: Vec<(EdgeId, DateTime<Utc>)> = state
                .edges
                .values()
                .filter(|e| e.is_currently_valid())
                .filter(|e| {
                    entity_ids.contains(e.source.as_str()) || entity_ids.contains(e.target.as_str())
                })
                .map(|e| (e.id.clone(), e.valid_time.start.max(now)))
                .collect();
            for (id, at) in &targets {
                state.invalidate_edge(
                    id,
                    *at,
                    now,
                    format!("file {path} was {change}"),
                    vec![format!("file_change:{change}:{path}")],
                )?;
            }
            targets.into_iter().map(|(id, _)| id).collect::<Vec<_>>()
        };

        if change == FileChange::Deleted {
            for node in &nodes {
                self.graph.update_node_confidence(&node.id, CONFIDENCE_FLOOR)?;
            }
        }
        tracing::debug!(path, %change, invalidated = invalidated.len(), "file change processed");
        Ok(invalidated)
    }

    // -- snapshots, stats, export -------------------------------------------

    /// Capture the full temporal state and flush the plain graph.
    pub fn create_temporal_snapshot(&self) -> Result<TemporalSnapshot> {
        let now = self.clock.now();
        let snapshot = self.write_state()?.take_snapshot(now);
        self.graph.save()?;
        tracing::info!(snapshot = %snapshot.id, edges = snapshot.edges.len(), "temporal snapshot taken");
        Ok(snapshot)
    }

    pub fn snapshots(&self) -> Result<Vec<TemporalSnapshot>> {
        Ok(self.read_state()?.snapshots.clone())
    }

    pub fn get_bitemporal_stats(&self) -> Result<BiTemporalStats> {
        let mut stats = self.read_state()?.stats();
        self.fill_graph_counts(&mut stats)?;
        Ok(stats)
    }

    fn fill_graph_counts(&self, stats: &mut BiTemporalStats) -> Result<()> {
        let graph = self.graph.get_graph()?;
        stats.graph_nodes = graph.nodes.len();
        stats.graph_edges = graph.edges.len();
        Ok(())
    }

    pub fn export_temporal_data(&self) -> Result<TemporalExport> {
        let now = self.clock.now();
        let mut export = {
            let state = self.read_state()?;
            TemporalExport {
                exported_at: now,
                config: self.config.clone(),
                active_context_window: state.contexts.active_id().map(str::to_string),
                context_windows: state.contexts.iter().cloned().collect(),
                edges: state.edges.values().cloned().collect(),
                snapshots: state.snapshots.clone(),
                stats: state.stats(),
            }
        };
        self.fill_graph_counts(&mut export.stats)?;
        Ok(export)
    }

    /// [`export_temporal_data`](Self::export_temporal_data) as pretty JSON.
    pub fn export_temporal_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.export_temporal_data()?)?)
    }

    // -- maintenance ---------------------------------------------------------

    /// Run one maintenance cycle now: decay, ledger trimming, retention
    /// pruning and, when due, a snapshot.
    pub fn run_maintenance(&self) -> Result<MaintenanceReport> {
        let now = self.clock.now();
        let mut report = {
            let mut state = self.write_state()?;
            maintenance::run_cycle(&mut state, &self.config, now)
        };
        // Same durability point as an explicit snapshot.
        if let Some(snapshot) = &report.snapshot_taken {
            if let Err(e) = self.graph.save() {
                tracing::warn!(snapshot = %snapshot, error = %e, "graph save after snapshot failed");
                report.failures.push(format!("graph save: {e}"));
            }
        }
        Ok(report)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::graph::RedbGraphStore;
    use crate::interval::{TemporalOperator, TimeRange};
    use chrono::Duration;

    fn dt(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    struct Fixture {
        store: BiTemporalStore,
        clock: Arc<ManualClock>,
        graph: Arc<RedbGraphStore>,
    }

    fn fixture_with(config: TemporalConfig) -> Fixture {
        let clock = Arc::new(ManualClock::new(dt("2024-06-01T00:00:00Z")));
        let graph = Arc::new(RedbGraphStore::open_in_memory().unwrap());
        let store = BiTemporalStore::with_clock(graph.clone(), config, clock.clone()).unwrap();
        Fixture {
            store,
            clock,
            graph,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(TemporalConfig::default())
    }

    fn create(fx: &Fixture, source: &str, target: &str, start: DateTime<Utc>) -> BiTemporalEdge {
        fx.store
            .create_bitemporal_edge(source, target, "depends_on", start, EdgeOptions::default())
            .unwrap()
    }

    #[test]
    fn create_applies_defaults_and_active_context() {
        let fx = fixture();
        let t0 = dt("2024-05-20T00:00:00Z");
        let edge = create(&fx, "a", "b", t0);

        assert!((edge.confidence - DEFAULT_CONFIDENCE).abs() < f32::EPSILON);
        assert!((edge.valid_time.confidence - DEFAULT_CONFIDENCE).abs() < f32::EPSILON);
        assert_eq!(edge.temporal_type, TemporalType::Continuous);
        assert_eq!(edge.transaction_time.revisions.len(), 1);
        assert_eq!(
            edge.transaction_time.revisions[0].action,
            RevisionAction::Created
        );
        assert_eq!(edge.transaction_time.created, fx.clock.now());

        let active = fx.store.current_context_window().unwrap().unwrap();
        assert_eq!(edge.context_windows, vec![active.id.clone()]);
        let active = fx.store.context_window(&active.id).unwrap();
        assert!(active.related_nodes.contains("a"));
        assert!(active.related_nodes.contains("b"));
    }

    #[test]
    fn create_mirrors_plain_edge_into_graph() {
        let fx = fixture();
        let edge = create(&fx, "a", "b", dt("2024-05-20T00:00:00Z"));
        let graph = fx.graph.get_graph().unwrap();
        assert_eq!(graph.edges.len(), 1);
        assert_eq!(graph.edges[0].relation, "depends_on");
        assert_eq!(
            graph.edges[0].metadata.get("bitemporal_id"),
            Some(&serde_json::Value::from(edge.id.0.clone()))
        );
    }

    #[test]
    fn create_rejects_malformed_input() {
        let fx = fixture();
        let t0 = dt("2024-05-20T00:00:00Z");

        let bad_conf = EdgeOptions {
            confidence: Some(1.5),
            ..EdgeOptions::default()
        };
        let err = fx
            .store
            .create_bitemporal_edge("a", "b", "calls", t0, bad_conf)
            .unwrap_err();
        assert!(matches!(err, ChronoError::Validation(_)), "got {err:?}");

        let bad_end = EdgeOptions {
            valid_end: Some(t0 - Duration::days(1)),
            ..EdgeOptions::default()
        };
        let err = fx
            .store
            .create_bitemporal_edge("a", "b", "calls", t0, bad_end)
            .unwrap_err();
        assert!(matches!(err, ChronoError::Validation(_)), "got {err:?}");

        assert_eq!(fx.store.edge_count().unwrap(), 0, "rejected edges must not be stored");
    }

    #[test]
    fn same_millisecond_edges_get_distinct_ids() {
        let fx = fixture();
        let t0 = dt("2024-05-20T00:00:00Z");
        let a = create(&fx, "a", "b", t0);
        let b = create(&fx, "a", "b", t0);
        assert_ne!(a.id, b.id);
        assert_eq!(fx.store.edge_count().unwrap(), 2);
    }

    #[test]
    fn valid_at_and_as_of_scenario() {
        let fx = fixture();
        let t0 = dt("2024-05-20T00:00:00Z");
        let edge = create(&fx, "A", "B", t0);
        let recorded = fx.clock.now();

        let at_t0 = fx
            .store
            .query_bitemporal(&TemporalQuery::new().valid_at(t0))
            .unwrap();
        assert_eq!(at_t0.edges.len(), 1);
        assert_eq!(at_t0.related_entities, vec!["A".to_string(), "B".to_string()]);

        let before = fx
            .store
            .query_bitemporal(&TemporalQuery::new().valid_at(t0 - Duration::milliseconds(1)))
            .unwrap();
        assert!(before.edges.is_empty());

        fx.clock.advance(Duration::hours(1));
        let t1 = dt("2024-05-25T00:00:00Z");
        fx.store
            .invalidate_relationship(&edge.id, Some(t1), Some("removed"), Vec::new())
            .unwrap();

        let after = fx
            .store
            .query_bitemporal(&TemporalQuery::new().valid_at(t1 + Duration::milliseconds(1)))
            .unwrap();
        assert!(after.edges.is_empty());

        let past = fx
            .store
            .query_bitemporal(&TemporalQuery::new().as_of(recorded + Duration::minutes(1)))
            .unwrap();
        assert_eq!(past.edges.len(), 1);
        assert!(
            past.edges[0].is_currently_valid(),
            "as_of must reconstruct the pre-invalidation state"
        );
        assert_eq!(past.edges[0].transaction_time.revisions.len(), 1);
    }

    #[test]
    fn as_of_before_creation_excludes_edge() {
        let fx = fixture();
        create(&fx, "A", "B", dt("2024-01-01T00:00:00Z"));
        let result = fx
            .store
            .query_bitemporal(&TemporalQuery::new().as_of(fx.clock.now() - Duration::seconds(1)))
            .unwrap();
        assert!(result.edges.is_empty());
    }

    #[test]
    fn context_membership_is_by_tag_not_time() {
        let fx = fixture();
        let mut a = ContextWindowParams::new("Window A", dt("2024-01-01T00:00:00Z"));
        a.valid_end = Some(dt("2024-04-01T00:00:00Z"));
        let mut b = ContextWindowParams::new("Window B", dt("2024-02-01T00:00:00Z"));
        b.valid_end = Some(dt("2024-05-01T00:00:00Z"));
        let a = fx.store.create_context_window(a).unwrap();
        let b = fx.store.create_context_window(b).unwrap();

        fx.store.set_current_context_window(&a.id).unwrap();
        create(&fx, "x", "y", dt("2024-03-01T00:00:00Z"));

        let in_a = fx
            .store
            .query_bitemporal(&TemporalQuery::new().in_context(a.id.clone()))
            .unwrap();
        assert_eq!(in_a.edges.len(), 1);
        assert_eq!(in_a.context_windows.len(), 1);
        assert_eq!(in_a.context_windows[0].id, a.id);

        let in_b = fx
            .store
            .query_bitemporal(&TemporalQuery::new().in_context(b.id.clone()))
            .unwrap();
        assert!(in_b.edges.is_empty());
    }

    #[test]
    fn set_unknown_context_fails() {
        let fx = fixture();
        let err = fx.store.set_current_context_window("nope_1").unwrap_err();
        assert!(matches!(err, ChronoError::ContextWindowNotFound(_)));
    }

    #[test]
    fn invalidate_unknown_edge_fails() {
        let fx = fixture();
        let err = fx
            .store
            .invalidate_relationship(&EdgeId::from("ghost"), None, None, Vec::new())
            .unwrap_err();
        assert!(matches!(err, ChronoError::EdgeNotFound(_)), "got {err:?}");
    }

    #[test]
    fn invalidate_before_start_is_rejected() {
        let fx = fixture();
        let t0 = dt("2024-05-20T00:00:00Z");
        let edge = create(&fx, "a", "b", t0);
        let err = fx
            .store
            .invalidate_relationship(&edge.id, Some(t0 - Duration::days(1)), None, Vec::new())
            .unwrap_err();
        assert!(matches!(err, ChronoError::Validation(_)));
        assert_eq!(fx.store.get_edge(&edge.id).unwrap().transaction_time.revisions.len(), 1);
    }

    #[test]
    fn each_action_appends_exactly_one_revision() {
        let fx = fixture();
        let edge = create(&fx, "a", "b", dt("2024-05-20T00:00:00Z"));
        for i in 0..3 {
            fx.clock.advance(Duration::minutes(1));
            fx.store
                .invalidate_relationship(&edge.id, None, Some(&format!("round {i}")), Vec::new())
                .unwrap();
        }
        let edge = fx.store.get_edge(&edge.id).unwrap();
        assert_eq!(edge.transaction_time.revisions.len(), 4);
        assert!(edge.transaction_time.revisions[1..]
            .iter()
            .all(|r| r.action == RevisionAction::Invalidated));
        assert_eq!(edge.valid_time.end, Some(fx.clock.now()), "latest invalidation wins");
    }

    #[test]
    fn restore_and_update_confidence_are_recorded() {
        let fx = fixture();
        let edge = create(&fx, "a", "b", dt("2024-05-20T00:00:00Z"));
        fx.store
            .invalidate_relationship(&edge.id, None, None, Vec::new())
            .unwrap();
        let restored = fx.store.restore_relationship(&edge.id, None).unwrap();
        assert!(restored.is_currently_valid());

        let updated = fx
            .store
            .update_edge_confidence(&edge.id, 0.3, Some("analyzer disagreed"))
            .unwrap();
        assert!((updated.valid_time.confidence - 0.3).abs() < 1e-6);
        let actions: Vec<_> = updated
            .transaction_time
            .revisions
            .iter()
            .map(|r| r.action)
            .collect();
        assert_eq!(
            actions,
            vec![
                RevisionAction::Created,
                RevisionAction::Invalidated,
                RevisionAction::Restored,
                RevisionAction::Updated
            ]
        );
        assert!(fx.store.update_edge_confidence(&edge.id, -1.0, None).is_err());
    }

    #[test]
    fn valid_during_honours_operator() {
        let fx = fixture();
        let jan = dt("2024-01-01T00:00:00Z");
        let edge = fx
            .store
            .create_bitemporal_edge(
                "a",
                "b",
                "calls",
                jan,
                EdgeOptions {
                    valid_end: Some(dt("2024-02-01T00:00:00Z")),
                    ..EdgeOptions::default()
                },
            )
            .unwrap();
        create(&fx, "c", "d", dt("2024-03-01T00:00:00Z"));

        let range = TimeRange::closed(dt("2024-02-01T00:00:00Z"), dt("2024-04-01T00:00:00Z")).unwrap();
        let overlapping = fx
            .store
            .query_bitemporal(&TemporalQuery::new().valid_during(range))
            .unwrap();
        assert_eq!(overlapping.edges.len(), 2);

        let meets = fx
            .store
            .query_bitemporal(
                &TemporalQuery::new()
                    .valid_during(range)
                    .with_operator(TemporalOperator::Meets),
            )
            .unwrap();
        assert_eq!(meets.edges.len(), 1);
        assert_eq!(meets.edges[0].id, edge.id);
    }

    #[test]
    fn file_deletion_invalidates_touching_edges() {
        let fx = fixture();
        fx.graph
            .upsert_node(&Node::new("parser", "parser.rs", "file").with_path("src/parser.rs"))
            .unwrap();
        fx.graph
            .upsert_node(&Node::new("main", "main.rs", "file").with_path("src/main.rs"))
            .unwrap();
        let t0 = dt("2024-05-20T00:00:00Z");
        let touching = create(&fx, "main", "parser", t0);
        let unrelated = create(&fx, "main", "config", t0);

        let ids = fx
            .store
            .on_file_changed("src/parser.rs", FileChange::Deleted)
            .unwrap();
        assert_eq!(ids, vec![touching.id.clone()]);
        assert!(!fx.store.get_edge(&touching.id).unwrap().is_currently_valid());
        assert!(fx.store.get_edge(&unrelated.id).unwrap().is_currently_valid());

        let node = fx.graph.get_node("parser").unwrap().unwrap();
        assert!((node.confidence - CONFIDENCE_FLOOR).abs() < 1e-6);

        let again = fx
            .store
            .on_file_changed("src/parser.rs", FileChange::Modified)
            .unwrap();
        assert!(again.is_empty(), "closed edges are not invalidated twice");
    }

    #[test]
    fn file_change_ignored_when_disabled_or_created() {
        let config = TemporalConfig {
            automatic_invalidation: false,
            ..TemporalConfig::default()
        };
        let fx = fixture_with(config);
        fx.graph
            .upsert_node(&Node::new("n", "n.rs", "file").with_path("src/n.rs"))
            .unwrap();
        let edge = create(&fx, "n", "m", dt("2024-05-20T00:00:00Z"));
        assert!(fx
            .store
            .on_file_changed("src/n.rs", FileChange::Deleted)
            .unwrap()
            .is_empty());
        assert!(fx.store.get_edge(&edge.id).unwrap().is_currently_valid());

        let fx = fixture();
        fx.graph
            .upsert_node(&Node::new("n", "n.rs", "file").with_path("src/n.rs"))
            .unwrap();
        create(&fx, "n", "m", dt("2024-05-20T00:00:00Z"));
        assert!(fx
            .store
            .on_file_changed("src/n.rs", FileChange::Created)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn snapshot_stats_and_export() {
        let fx = fixture();
        let t0 = dt("2024-05-20T00:00:00Z");
        let edge = create(&fx, "a", "b", t0);
        create(&fx, "b", "c", t0);
        fx.store
            .invalidate_relationship(&edge.id, None, None, Vec::new())
            .unwrap();

        let snapshot = fx.store.create_temporal_snapshot().unwrap();
        assert_eq!(snapshot.edges.len(), 2);
        assert_eq!(snapshot.taken_at, fx.clock.now());

        let stats = fx.store.get_bitemporal_stats().unwrap();
        assert_eq!(stats.total_edges, 2);
        assert_eq!(stats.currently_valid_edges, 1);
        assert_eq!(stats.invalidated_edges, 1);
        assert_eq!(stats.total_revisions, 3);
        assert_eq!(stats.snapshots, 1);
        assert_eq!(stats.context_windows, 1);
        assert_eq!(stats.graph_edges, 2);
        assert_eq!(stats.temporal_types.get(&TemporalType::Continuous), Some(&2));

        let json = fx.store.export_temporal_json().unwrap();
        let export: TemporalExport = serde_json::from_str(&json).unwrap();
        assert_eq!(export.edges.len(), 2);
        assert_eq!(export.snapshots.len(), 1);
        assert_eq!(export.stats.total_edges, 2);
    }

    #[test]
    fn context_windows_at_uses_configured_overlap() {
        let fx = fixture();
        let mut params = ContextWindowParams::new("Sprint", dt("2024-03-01T00:00:00Z"));
        params.valid_end = Some(dt("2024-03-15T00:00:00Z"));
        fx.store.create_context_window(params).unwrap();

        let hits = fx
            .store
            .context_windows_at(dt("2024-03-15T00:04:59Z"))
            .unwrap();
        assert!(hits.iter().any(|w| w.name == "Sprint"));
        let misses = fx
            .store
            .context_windows_at(dt("2024-03-15T00:05:01Z"))
            .unwrap();
        assert!(!misses.iter().any(|w| w.name == "Sprint"));
    }

    #[test]
    fn resolve_entities_skips_unknown_ids() {
        let fx = fixture();
        fx.graph.upsert_node(&Node::new("a", "a.rs", "file")).unwrap();
        let nodes = fx
            .store
            .resolve_entities(&["a".to_string(), "zzz".to_string()])
            .unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].id, "a");
    }

    #[test]
    fn file_change_closes_future_edges_at_their_start() {
        let fx = fixture();
        fx.graph
            .upsert_node(&Node::new("p", "p.rs", "file").with_path("src/p.rs"))
            .unwrap();
        let past = create(&fx, "a", "p", dt("2024-05-01T00:00:00Z"));
        let future_start = dt("2024-09-01T00:00:00Z");
        let future = create(&fx, "z", "p", future_start);

        let ids = fx
            .store
            .on_file_changed("src/p.rs", FileChange::Deleted)
            .unwrap();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&past.id));
        assert!(ids.contains(&future.id));

        let past = fx.store.get_edge(&past.id).unwrap();
        assert_eq!(past.valid_time.end, Some(fx.clock.now()));
        let future = fx.store.get_edge(&future.id).unwrap();
        assert_eq!(future.valid_time.end, Some(future_start));

        let node = fx.graph.get_node("p").unwrap().unwrap();
        assert!((node.confidence - CONFIDENCE_FLOOR).abs() < 1e-6);
    }

    #[derive(Default)]
    struct CountingGraph {
        saves: std::sync::atomic::AtomicUsize,
    }

    impl GraphStore for CountingGraph {
        fn get_node(&self, _id: &str) -> Result<Option<Node>> {
            Ok(None)
        }
        fn find_nodes(&self, _predicate: &dyn Fn(&Node) -> bool) -> Result<Vec<Node>> {
            Ok(Vec::new())
        }
        fn add_edge(&self, _edge: GraphEdge) -> Result<()> {
            Ok(())
        }
        fn update_node_confidence(&self, _id: &str, _value: f32) -> Result<()> {
            Ok(())
        }
        fn get_graph(&self) -> Result<crate::graph::GraphSnapshot> {
            Ok(crate::graph::GraphSnapshot::default())
        }
        fn save(&self) -> Result<()> {
            self.saves
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn maintenance_snapshot_saves_graph_like_explicit_snapshot() {
        let clock = Arc::new(ManualClock::new(dt("2024-06-01T00:00:00Z")));
        let graph = Arc::new(CountingGraph::default());
        let store =
            BiTemporalStore::with_clock(graph.clone(), TemporalConfig::default(), clock.clone())
                .unwrap();
        let saves = || graph.saves.load(std::sync::atomic::Ordering::SeqCst);

        store.create_temporal_snapshot().unwrap();
        assert_eq!(saves(), 1);

        clock.advance(Duration::days(2));
        let report = store.run_maintenance().unwrap();
        assert!(report.snapshot_taken.is_some());
        assert_eq!(saves(), 2);

        clock.advance(Duration::minutes(1));
        let report = store.run_maintenance().unwrap();
        assert!(report.snapshot_taken.is_none());
        assert_eq!(saves(), 2, "no snapshot, no save");
    }

    #[test]
    fn file_change_parses_common_names() {
        assert_eq!("Deleted".parse::<FileChange>().unwrap(), FileChange::Deleted);
        assert_eq!("changed".parse::<FileChange>().unwrap(), FileChange::Modified);
        assert!("renamed".parse::<FileChange>().is_err());
    }
}
