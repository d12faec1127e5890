//! Periodic maintenance: confidence decay, ledger trimming, retention
//! pruning and scheduled snapshots.
//!
//! A cycle runs under the store's write lock. Problems with individual edges
//! are logged, counted in the [`MaintenanceReport`] and skipped; they never
//! abort the cycle or stop the [`MaintenanceScheduler`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};

use crate::config::TemporalConfig;
use crate::store::{BiTemporalStore, StoreState};
use crate::{ChronoError, EdgeId, Result, CONFIDENCE_FLOOR};

const MS_PER_DAY: f64 = 86_400_000.0;

/// What one maintenance cycle did.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MaintenanceReport {
    pub ran_at: Option<DateTime<Utc>>,
    pub edges_decayed: usize,
    pub revisions_trimmed: usize,
    pub edges_pruned: usize,
    /// Id of the snapshot taken this cycle, if one was due.
    pub snapshot_taken: Option<String>,
    pub snapshots_pruned: usize,
    /// Per-edge problems that were skipped, as `"<edge id>: <message>"`.
    pub failures: Vec<String>,
}

/// Confidence after decaying `current` by `rate` per day over `age_days`.
///
/// Never drops below [`CONFIDENCE_FLOOR`], and a value already under the
/// floor is left where it is.
pub fn decayed_confidence(current: f32, age_days: f64, rate: f32) -> f32 {
    let delta = (age_days.max(0.0) * f64::from(rate)) as f32;
    let floor = CONFIDENCE_FLOOR.min(current);
    (current - delta).max(floor)
}

pub(crate) fn run_cycle(
    state: &mut StoreState,
    config: &TemporalConfig,
    now: DateTime<Utc>,
) -> MaintenanceReport {
    let mut report = MaintenanceReport {
        ran_at: Some(now),
        ..MaintenanceReport::default()
    };

    for edge in state.edges.values_mut() {
        let current = edge.valid_time.confidence;
        if !current.is_finite() {
            let e = ChronoError::Validation(format!("non-finite confidence {current}"));
            tracing::warn!(edge = %edge.id, error = %e, "skipping edge during decay");
            report.failures.push(format!("{}: {e}", edge.id));
            continue;
        }
        let age_days = (now - edge.valid_time.start).num_milliseconds() as f64 / MS_PER_DAY;
        let decayed = decayed_confidence(current, age_days, config.confidence_decay_rate);
        if decayed != current {
            edge.valid_time.confidence = decayed;
            edge.confidence = decayed;
            report.edges_decayed += 1;
        }
    }

    for edge in state.edges.values_mut() {
        if edge.transaction_time.revisions.is_empty() {
            tracing::warn!(edge = %edge.id, "edge has an empty revision ledger");
            report
                .failures
                .push(format!("{}: empty revision ledger", edge.id));
            continue;
        }
        report.revisions_trimmed += edge.trim_revisions(config.max_revision_history);
    }

    // An unrepresentable cutoff means nothing is old enough to prune.
    let cutoff = now
        .checked_sub_signed(config.retention_period())
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    let expired: Vec<EdgeId> = state
        .edges
        .values()
        .filter(|e| matches!(e.valid_time.end, Some(end) if end < cutoff))
        .map(|e| e.id.clone())
        .collect();
    for id in &expired {
        state.edges.remove(id);
        tracing::debug!(edge = %id, "pruned edge past retention");
    }
    report.edges_pruned = expired.len();

    let due = state
        .snapshots
        .last()
        .map_or(true, |s| now - s.taken_at >= config.snapshot_interval());
    if due {
        report.snapshot_taken = Some(state.take_snapshot(now).id);
    }
    let before = state.snapshots.len();
    state.snapshots.retain(|s| s.taken_at >= cutoff);
    report.snapshots_pruned = before - state.snapshots.len();

    state.last_maintenance = Some(now);
    tracing::info!(
        decayed = report.edges_decayed,
        trimmed = report.revisions_trimmed,
        pruned = report.edges_pruned,
        snapshot = ?report.snapshot_taken,
        failures = report.failures.len(),
        "maintenance cycle complete"
    );
    report
}

// ---------------------------------------------------------------------------
// Background scheduler
// ---------------------------------------------------------------------------

/// Runs [`BiTemporalStore::run_maintenance`] on a dedicated thread every
/// interval until shut down or dropped.
pub struct MaintenanceScheduler {
    stop: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl MaintenanceScheduler {
    /// Start with the store's configured `maintenance_interval_ms`.
    pub fn start(store: Arc<BiTemporalStore>) -> Result<Self> {
        let interval = store.config().maintenance_interval();
        Self::with_interval(store, interval)
    }

    pub fn with_interval(store: Arc<BiTemporalStore>, interval: Duration) -> Result<Self> {
        let (stop, rx) = bounded(1);
        let handle = thread::Builder::new()
            .name("chronoedge-maintenance".to_string())
            .spawn(move || maintenance_loop(store, rx, interval))
            .map_err(|e| ChronoError::Internal(format!("spawn maintenance thread: {e}")))?;
        tracing::debug!(interval_ms = interval.as_millis() as u64, "maintenance scheduler started");
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Stop the thread and wait for an in-flight cycle to finish.
    pub fn shutdown(mut self) -> Result<()> {
        let _ = self.stop.try_send(());
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| ChronoError::Internal("maintenance thread panicked".to_string())),
            None => Ok(()),
        }
    }
}

impl Drop for MaintenanceScheduler {
    fn drop(&mut self) {
        let _ = self.stop.try_send(());
    }
}

fn maintenance_loop(store: Arc<BiTemporalStore>, rx: Receiver<()>, interval: Duration) {
    loop {
        match rx.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => match store.run_maintenance() {
                Ok(report) => {
                    tracing::debug!(failures = report.failures.len(), "scheduled maintenance ran")
                }
                Err(e) => tracing::warn!(error = %e, "scheduled maintenance failed"),
            },
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    tracing::debug!("maintenance scheduler stopped");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
