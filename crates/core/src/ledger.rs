//! Per-edge revision ledger: append, bounded trimming, point-in-time replay.

use chrono::{DateTime, Utc};

use crate::{BiTemporalEdge, Revision, RevisionAction};

impl BiTemporalEdge {
    /// Apply `mutate` to the edge and append one revision describing it.
    ///
    /// The previous state is captured before `mutate` runs (except for
    /// [`RevisionAction::Created`]), the new state after. Revision ids are
    /// `"<edge id>_rev_<n>"`; `n` counts every revision ever appended, so it
    /// equals the ledger length until trimming removes old entries and never
    /// repeats afterwards.
    pub(crate) fn append_revision(
        &mut self,
        action: RevisionAction,
        at: DateTime<Utc>,
        reason: String,
        evidence: Vec<String>,
        mutate: impl FnOnce(&mut BiTemporalEdge),
    ) -> &Revision {
        let previous_state = match action {
            RevisionAction::Created => None,
            _ => Some(self.state()),
        };
        mutate(self);
        let new_state = self.state();

        let n = self.transaction_time.revision_seq;
        let revision = Revision {
            id: format!("{}_rev_{n}", self.id),
            timestamp: at,
            action,
            previous_state,
            confidence: new_state.confidence,
            new_state,
            reason,
            evidence,
        };
        self.transaction_time.revision_seq = n + 1;
        self.transaction_time.last_modified = at;
        self.transaction_time.revisions.push(revision);
        let last = self.transaction_time.revisions.len() - 1;
        &self.transaction_time.revisions[last]
    }

    /// Keep only the `max_entries` most recent revisions. Returns how many
    /// were dropped. At least one revision is always kept.
    pub(crate) fn trim_revisions(&mut self, max_entries: usize) -> usize {
        let keep = max_entries.max(1);
        let revisions = &mut self.transaction_time.revisions;
        if revisions.len() <= keep {
            return 0;
        }
        // Stable: equal timestamps keep insertion order.
        revisions.sort_by_key(|r| r.timestamp);
        let excess = revisions.len() - keep;
        revisions.drain(..excess);
        excess
    }

    /// The latest revision recorded at or before `t`, if any.
    pub fn state_as_of(&self, t: DateTime<Utc>) -> Option<&Revision> {
        self.transaction_time
            .revisions
            .iter()
            .filter(|r| r.timestamp <= t)
            .max_by_key(|r| r.timestamp)
    }

    /// The edge as the store believed it at transaction time `t`.
    ///
    /// Returns `None` when no retained revision precedes `t`.
    pub fn reconstruct_as_of(&self, t: DateTime<Utc>) -> Option<BiTemporalEdge> {
        let revision = self.state_as_of(t)?;
        let mut edge = self.clone();
        edge.apply_state(&revision.new_state);
        edge.transaction_time.last_modified = revision.timestamp;
        edge.transaction_time.revisions.retain(|r| r.timestamp <= t);
        Some(edge)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
