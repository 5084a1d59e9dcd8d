//! Build and snapshot lifecycle tracking.
//!
//! The tracker is the single shared record of where a build and each of
//! its snapshots stand. Discovery and upload workers advance per-snapshot
//! status through guarded transitions; the runner consults the tracker to
//! decide when the build may finalize and what the final summary says.

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::{debug, info};

use argus_common::{
    BuildRef, BuildState, DiscoveryWarning, Error, Result, SnapshotStatus,
};

/// Per-snapshot bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct SnapshotEntry {
    pub status: SnapshotStatus,
    /// Set when the snapshot reaches `failed`.
    pub error: Option<String>,
    /// Non-fatal resource problems hit during discovery.
    pub warnings: Vec<DiscoveryWarning>,
}

/// A snapshot that ended in `failed`, with its reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedSnapshot {
    pub name: String,
    pub reason: String,
}

/// Terminal report for a build run.
#[derive(Debug, Clone)]
pub struct BuildSummary {
    pub build: Option<BuildRef>,
    pub state: BuildState,
    /// Snapshot names that reached `uploaded`, in registration order.
    pub uploaded: Vec<String>,
    pub failed: Vec<FailedSnapshot>,
    /// Registered but never reached a terminal status, e.g. skipped by abort.
    pub skipped: Vec<String>,
    pub warning_count: usize,
}

/// Aggregate judgement over the snapshots of a finished build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildOutcome {
    /// Every registered snapshot uploaded.
    Success,
    /// Some uploaded, some failed or were skipped.
    Partial,
    /// Nothing uploaded.
    AllFailed,
    /// No snapshots were ever registered.
    Empty,
}

impl BuildSummary {
    pub fn outcome(&self) -> BuildOutcome {
        if self.uploaded.is_empty() && self.failed.is_empty() && self.skipped.is_empty() {
            BuildOutcome::Empty
        } else if self.uploaded.is_empty() {
            BuildOutcome::AllFailed
        } else if self.failed.is_empty() && self.skipped.is_empty() {
            BuildOutcome::Success
        } else {
            BuildOutcome::Partial
        }
    }
}

#[derive(Default)]
struct Inner {
    state: BuildState,
    build: Option<BuildRef>,
    snapshots: HashMap<String, SnapshotEntry>,
    /// Registration order, for stable summaries.
    order: Vec<String>,
}

/// Shared build state machine.
#[derive(Default)]
pub struct BuildTracker {
    inner: RwLock<Inner>,
}

impl BuildTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> BuildState {
        self.inner.read().state
    }

    pub fn build_ref(&self) -> Option<BuildRef> {
        self.inner.read().build.clone()
    }

    /// Record the remote identity and move `pending -> created`.
    pub fn mark_created(&self, build: BuildRef) -> Result<()> {
        let mut inner = self.inner.write();
        inner.transition(BuildState::Created)?;
        info!(build_id = %build.id, "Build created");
        inner.build = Some(build);
        Ok(())
    }

    /// Move the build to `errored` from any live state.
    pub fn mark_errored(&self) {
        let mut inner = self.inner.write();
        if inner.transition(BuildState::Errored).is_ok() {
            info!("Build errored");
        }
    }

    /// Enter `finalizing`. Unless `force`, every snapshot must already be
    /// terminal and at least one must have uploaded.
    pub fn begin_finalize(&self, force: bool) -> Result<()> {
        let mut inner = self.inner.write();

        if !force {
            let pending = inner
                .order
                .iter()
                .filter(|name| !inner.snapshots[*name].status.is_terminal())
                .count();
            if pending > 0 {
                return Err(Error::InvalidStateTransition {
                    from: inner.state.to_string(),
                    to: format!("{} ({pending} snapshots still active)", BuildState::Finalizing),
                });
            }

            let uploaded = inner
                .snapshots
                .values()
                .any(|entry| entry.status == SnapshotStatus::Uploaded);
            if !uploaded && !inner.snapshots.is_empty() {
                return Err(Error::InvalidStateTransition {
                    from: inner.state.to_string(),
                    to: format!("{} (no snapshot uploaded)", BuildState::Finalizing),
                });
            }
        }

        inner.transition(BuildState::Finalizing)
    }

    /// Leave `finalizing` into one of the terminal states.
    pub fn finish(&self, state: BuildState) -> Result<()> {
        self.inner.write().transition(state)
    }

    /// Admit a snapshot name. Names are unique per build.
    pub fn register(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.snapshots.contains_key(name) {
            return Err(Error::DuplicateSnapshot(name.to_string()));
        }
        inner.snapshots.insert(name.to_string(), SnapshotEntry::default());
        inner.order.push(name.to_string());
        debug!(snapshot = name, "Snapshot registered");
        Ok(())
    }

    /// Advance one snapshot's status through its guarded transitions.
    pub fn advance(&self, name: &str, to: SnapshotStatus) -> Result<()> {
        let mut inner = self.inner.write();
        let entry = inner
            .snapshots
            .get_mut(name)
            .ok_or_else(|| Error::InvalidSnapshot(name.to_string()))?;

        if !entry.status.can_transition(to) {
            return Err(Error::InvalidStateTransition {
                from: entry.status.to_string(),
                to: to.to_string(),
            });
        }

        debug!(snapshot = name, from = %entry.status, to = %to, "Snapshot status");
        entry.status = to;
        Ok(())
    }

    /// Mark a snapshot failed with its reason. Invalid transitions are
    /// swallowed so a late failure report cannot corrupt terminal state.
    pub fn fail(&self, name: &str, reason: &str) {
        let mut inner = self.inner.write();
        if let Some(entry) = inner.snapshots.get_mut(name) {
            if entry.status.can_transition(SnapshotStatus::Failed) {
                info!(snapshot = name, reason, "Snapshot failed");
                entry.status = SnapshotStatus::Failed;
                entry.error = Some(reason.to_string());
            }
        }
    }

    pub fn add_warnings(&self, name: &str, warnings: Vec<DiscoveryWarning>) {
        if warnings.is_empty() {
            return;
        }
        let mut inner = self.inner.write();
        if let Some(entry) = inner.snapshots.get_mut(name) {
            entry.warnings.extend(warnings);
        }
    }

    pub fn status_of(&self, name: &str) -> Option<SnapshotStatus> {
        self.inner.read().snapshots.get(name).map(|e| e.status)
    }

    pub fn snapshot_count(&self) -> usize {
        self.inner.read().snapshots.len()
    }

    /// Whether every registered snapshot reached a terminal status.
    pub fn all_settled(&self) -> bool {
        let inner = self.inner.read();
        inner.snapshots.values().all(|e| e.status.is_terminal())
    }

    pub fn summary(&self) -> BuildSummary {
        let inner = self.inner.read();
        let mut uploaded = Vec::new();
        let mut failed = Vec::new();
        let mut skipped = Vec::new();
        let mut warning_count = 0;

        for name in &inner.order {
            let entry = &inner.snapshots[name];
            warning_count += entry.warnings.len();
            match entry.status {
                SnapshotStatus::Uploaded => uploaded.push(name.clone()),
                SnapshotStatus::Failed => failed.push(FailedSnapshot {
                    name: name.clone(),
                    reason: entry
                        .error
                        .clone()
                        .unwrap_or_else(|| "unknown failure".to_string()),
                }),
                _ => skipped.push(name.clone()),
            }
        }

        BuildSummary {
            build: inner.build.clone(),
            state: inner.state,
            uploaded,
            failed,
            skipped,
            warning_count,
        }
    }
}

impl Inner {
    fn transition(&mut self, to: BuildState) -> Result<()> {
        if !self.state.can_transition(to) {
            return Err(Error::InvalidStateTransition {
                from: self.state.to_string(),
                to: to.to_string(),
            });
        }
        debug!(from = %self.state, to = %to, "Build state");
        self.state = to;
        Ok(())
    }
}
