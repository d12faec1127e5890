//! Context windows: named valid-time intervals that group edges by project
//! epoch ("framework v2 era", "monorepo migration", ...).
//!
//! Membership of an edge in a window is an explicit tag recorded when the
//! edge is created, never inferred from overlapping time ranges.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::interval::TimeRange;
use crate::{ChronoError, Result, ValidTimeInterval};

/// Name of the window created when a registry is bootstrapped.
pub const BOOTSTRAP_WINDOW_NAME: &str = "Project Initialization";

/// How far back the bootstrap window reaches.
pub const BOOTSTRAP_WINDOW_DAYS: i64 = 30;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextWindow {
    /// `slug(name)_<start millis>`.
    pub id: String,
    pub name: String,
    pub valid_time: ValidTimeInterval,
    pub description: String,
    /// Entities touched by edges created while this window was active.
    pub related_nodes: BTreeSet<String>,
    /// e.g. `{"react": "18.2", "rustc": "1.82"}`.
    pub framework_versions: BTreeMap<String, String>,
    pub project_phase: Option<String>,
}

/// Parameters for [`ContextRegistry::create`].
#[derive(Debug, Clone)]
pub struct ContextWindowParams {
    pub name: String,
    pub valid_start: DateTime<Utc>,
    pub valid_end: Option<DateTime<Utc>>,
    pub description: String,
    pub framework_versions: BTreeMap<String, String>,
    pub project_phase: Option<String>,
}

impl ContextWindowParams {
    pub fn new(name: impl Into<String>, valid_start: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            valid_start,
            valid_end: None,
            description: String::new(),
            framework_versions: BTreeMap::new(),
            project_phase: None,
        }
    }
}

/// Deterministic window id from its name and start.
///
/// Two windows with the same name starting in the same millisecond get the
/// same id; the later one replaces the earlier.
pub fn context_window_id(name: &str, start: DateTime<Utc>) -> String {
    format!("{}_{}", slugify(name), start.timestamp_millis())
}

fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_sep = false;
    for c in name.chars() {
        if c.is_alphanumeric() {
            if pending_sep && !slug.is_empty() {
                slug.push('_');
            }
            pending_sep = false;
            slug.extend(c.to_lowercase());
        } else {
            pending_sep = true;
        }
    }
    if slug.is_empty() {
        slug.push_str("context");
    }
    slug
}

/// All known context windows plus the one currently active.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextRegistry {
    windows: BTreeMap<String, ContextWindow>,
    active: Option<String>,
}

impl ContextRegistry {
    /// A registry holding the open-ended bootstrap window covering the
    /// [`BOOTSTRAP_WINDOW_DAYS`] before `now`, marked active.
    pub fn bootstrap(now: DateTime<Utc>) -> Self {
        let mut registry = Self::default();
        let start = now - Duration::days(BOOTSTRAP_WINDOW_DAYS);
        let id = context_window_id(BOOTSTRAP_WINDOW_NAME, start);
        registry.windows.insert(
            id.clone(),
            ContextWindow {
                id: id.clone(),
                name: BOOTSTRAP_WINDOW_NAME.to_string(),
                valid_time: ValidTimeInterval {
                    start,
                    end: None,
                    confidence: 1.0,
                    evidence: Vec::new(),
                },
                description: "Default context window created at store bootstrap".to_string(),
                related_nodes: BTreeSet::new(),
                framework_versions: BTreeMap::new(),
                project_phase: Some("initialization".to_string()),
            },
        );
        registry.active = Some(id);
        registry
    }

    pub fn create(&mut self, params: ContextWindowParams) -> Result<ContextWindow> {
        if params.name.trim().is_empty() {
            return Err(ChronoError::Validation(
                "context window name must not be empty".to_string(),
            ));
        }
        let valid_time = ValidTimeInterval::new(params.valid_start, params.valid_end, 1.0, Vec::new())?;
        let id = context_window_id(&params.name, params.valid_start);
        let window = ContextWindow {
            id: id.clone(),
            name: params.name,
            valid_time,
            description: params.description,
            related_nodes: BTreeSet::new(),
            framework_versions: params.framework_versions,
            project_phase: params.project_phase,
        };
        self.windows.insert(id, window.clone());
        Ok(window)
    }

    pub fn set_active(&mut self, id: &str) -> Result<()> {
        if !self.windows.contains_key(id) {
            return Err(ChronoError::ContextWindowNotFound(id.to_string()));
        }
        self.active = Some(id.to_string());
        Ok(())
    }

    pub fn active_id(&self) -> Option<&str> {
        self.active.as_deref()
    }

    pub fn active(&self) -> Option<&ContextWindow> {
        self.active.as_deref().and_then(|id| self.windows.get(id))
    }

    pub fn get(&self, id: &str) -> Option<&ContextWindow> {
        self.windows.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ContextWindow> {
        self.windows.values()
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    /// Record entities as related to window `id`. Unknown ids are ignored.
    pub(crate) fn note_related<'a>(&mut self, id: &str, nodes: impl IntoIterator<Item = &'a str>) {
        if let Some(window) = self.windows.get_mut(id) {
            window
                .related_nodes
                .extend(nodes.into_iter().map(str::to_string));
        }
    }

    /// Windows whose valid time, widened by `tolerance` on both sides,
    /// contains `t`. Open-ended windows reach up to `now`.
    pub fn windows_at(
        &self,
        t: DateTime<Utc>,
        tolerance: Duration,
        now: DateTime<Utc>,
    ) -> Vec<&ContextWindow> {
        self.windows
            .values()
            .filter(|w| {
                let end = w.valid_time.end.unwrap_or(now);
                let widened = TimeRange {
                    start: w
                        .valid_time
                        .start
                        .checked_sub_signed(tolerance)
                        .unwrap_or(DateTime::<Utc>::MIN_UTC),
                    end: Some(
                        end.checked_add_signed(tolerance)
                            .unwrap_or(DateTime::<Utc>::MAX_UTC),
                    ),
                };
                widened.contains_point(t, now)
            })
            .collect()
    }
}
