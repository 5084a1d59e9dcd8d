//! Core types for Argus builds and snapshots

use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Maximum number of viewport widths per snapshot
pub const MAX_WIDTHS: usize = 10;

/// Accepted viewport width range in pixels
pub const WIDTH_RANGE: std::ops::RangeInclusive<u32> = 120..=2000;

/// Default capture widths: one mobile, one desktop
pub const DEFAULT_WIDTHS: [u32; 2] = [375, 1280];

/// Default minimum capture height in pixels
pub const DEFAULT_MIN_HEIGHT: u32 = 1024;

/// Per-snapshot lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotStatus {
    Queued,
    Discovering,
    Discovered,
    Uploading,
    Uploaded,
    Failed,
}

impl SnapshotStatus {
    /// Valid forward transitions. `Failed` is terminal for a snapshot but
    /// not for its build.
    pub fn can_transition(self, to: SnapshotStatus) -> bool {
        use SnapshotStatus::*;
        matches!(
            (self, to),
            (Queued, Discovering)
                | (Queued, Failed)
                | (Discovering, Discovered)
                | (Discovering, Failed)
                | (Discovered, Uploading)
                | (Uploading, Uploaded)
                | (Uploading, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SnapshotStatus::Uploaded | SnapshotStatus::Failed)
    }
}

impl Default for SnapshotStatus {
    fn default() -> Self {
        Self::Queued
    }
}

impl std::fmt::Display for SnapshotStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SnapshotStatus::Queued => write!(f, "queued"),
            SnapshotStatus::Discovering => write!(f, "discovering"),
            SnapshotStatus::Discovered => write!(f, "discovered"),
            SnapshotStatus::Uploading => write!(f, "uploading"),
            SnapshotStatus::Uploaded => write!(f, "uploaded"),
            SnapshotStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Build lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildState {
    Pending,
    Created,
    Finalizing,
    Finished,
    Failed,
    Errored,
}

impl BuildState {
    /// Valid transitions. `Errored` is reachable from any non-terminal
    /// state on unrecoverable setup failure and is terminal.
    pub fn can_transition(self, to: BuildState) -> bool {
        use BuildState::*;
        if self.is_terminal() {
            return false;
        }
        if to == Errored {
            return true;
        }
        matches!(
            (self, to),
            (Pending, Created) | (Created, Finalizing) | (Finalizing, Finished) | (Finalizing, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, BuildState::Finished | BuildState::Failed | BuildState::Errored)
    }
}

impl Default for BuildState {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for BuildState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildState::Pending => write!(f, "pending"),
            BuildState::Created => write!(f, "created"),
            BuildState::Finalizing => write!(f, "finalizing"),
            BuildState::Finished => write!(f, "finished"),
            BuildState::Failed => write!(f, "failed"),
            BuildState::Errored => write!(f, "errored"),
        }
    }
}

/// A snapshot capture request accepted by the orchestrator.
///
/// Either `dom_snapshot` carries serialized HTML from an SDK, or the page
/// at `url` is navigated to and serialized by the browser.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRequest {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub dom_snapshot: Option<String>,
    #[serde(default)]
    pub widths: Vec<u32>,
    #[serde(default)]
    pub min_height: Option<u32>,
    #[serde(default)]
    pub enable_javascript: Option<bool>,
}

impl SnapshotRequest {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            dom_snapshot: None,
            widths: Vec::new(),
            min_height: None,
            enable_javascript: None,
        }
    }

    pub fn with_dom(mut self, dom: impl Into<String>) -> Self {
        self.dom_snapshot = Some(dom.into());
        self
    }

    pub fn with_widths(mut self, widths: Vec<u32>) -> Self {
        self.widths = widths;
        self
    }

    /// Validate and normalize: name required, URL parseable, widths
    /// deduped, sorted, bounded, defaulted when empty.
    pub fn validate(&mut self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::InvalidSnapshot("missing snapshot name".to_string()));
        }

        url::Url::parse(&self.url).map_err(|e| Error::InvalidUrl {
            url: self.url.clone(),
            reason: e.to_string(),
        })?;

        if self.widths.is_empty() {
            self.widths = DEFAULT_WIDTHS.to_vec();
        } else {
            self.widths.sort_unstable();
            self.widths.dedup();
        }

        if self.widths.len() > MAX_WIDTHS {
            return Err(Error::InvalidSnapshot(format!(
                "snapshot '{}' requests {} widths, maximum is {}",
                self.name,
                self.widths.len(),
                MAX_WIDTHS
            )));
        }

        for width in &self.widths {
            if !WIDTH_RANGE.contains(width) {
                return Err(Error::InvalidSnapshot(format!(
                    "snapshot '{}' width {} outside {}..={}",
                    self.name,
                    width,
                    WIDTH_RANGE.start(),
                    WIDTH_RANGE.end()
                )));
            }
        }

        Ok(())
    }
}

/// Build metadata passed through to the remote service; nothing here is
/// probed from the environment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildInfo {
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub commit_sha: Option<String>,
    #[serde(default)]
    pub target_branch: Option<String>,
    #[serde(default)]
    pub parallel_nonce: Option<String>,
    #[serde(default)]
    pub parallel_total: Option<i64>,
}

impl BuildInfo {
    /// Parallel shard builds are created as partial and finalized with an
    /// all-shards flag by the last shard.
    pub fn is_partial(&self) -> bool {
        self.parallel_total.is_some_and(|t| t != 0)
    }
}

/// Remote identity of a created build
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRef {
    pub id: String,
    #[serde(default)]
    pub web_url: Option<String>,
    #[serde(default)]
    pub number: Option<u64>,
}

/// Remote identity of a created snapshot, with the content the service
/// still needs uploaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRef {
    pub id: String,
    /// Shas the remote service does not already have
    #[serde(default)]
    pub missing_shas: Vec<String>,
}

/// Remote build status as reported by the service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildStatus {
    pub state: String,
    #[serde(default)]
    pub is_pending: bool,
    #[serde(default)]
    pub total_snapshots: u64,
}

/// A non-fatal problem recorded against a snapshot during discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryWarning {
    pub url: String,
    pub reason: String,
}

impl std::fmt::Display for DiscoveryWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.url, self.reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_status_transitions() {
        use SnapshotStatus::*;

        assert!(Queued.can_transition(Discovering));
        assert!(Discovering.can_transition(Discovered));
        assert!(Discovered.can_transition(Uploading));
        assert!(Uploading.can_transition(Uploaded));
        assert!(Discovering.can_transition(Failed));
        assert!(Uploading.can_transition(Failed));

        assert!(!Queued.can_transition(Uploaded));
        assert!(!Discovered.can_transition(Failed));
        assert!(!Uploaded.can_transition(Failed));
        assert!(!Failed.can_transition(Queued));
        assert!(Uploaded.is_terminal());
        assert!(Failed.is_terminal());
    }

    #[test]
    fn test_build_state_transitions() {
        use BuildState::*;

        assert!(Pending.can_transition(Created));
        assert!(Created.can_transition(Finalizing));
        assert!(Finalizing.can_transition(Finished));
        assert!(Finalizing.can_transition(Failed));
        assert!(Pending.can_transition(Errored));
        assert!(Created.can_transition(Errored));

        assert!(!Created.can_transition(Created));
        assert!(!Pending.can_transition(Finalizing));
        assert!(!Finished.can_transition(Errored));
        assert!(!Errored.can_transition(Created));
    }

    #[test]
    fn test_snapshot_request_validation() {
        let mut req = SnapshotRequest::new("home", "https://app.example.com/");
        req.validate().unwrap();
        assert_eq!(req.widths, DEFAULT_WIDTHS.to_vec());

        let mut req = SnapshotRequest::new("home", "https://app.example.com/")
            .with_widths(vec![1280, 375, 1280]);
        req.validate().unwrap();
        assert_eq!(req.widths, vec![375, 1280]);

        let mut unnamed = SnapshotRequest::new("  ", "https://app.example.com/");
        assert!(unnamed.validate().is_err());

        let mut bad_url = SnapshotRequest::new("home", "not a url");
        assert!(bad_url.validate().is_err());

        let mut too_wide = SnapshotRequest::new("home", "https://app.example.com/")
            .with_widths(vec![5000]);
        assert!(too_wide.validate().is_err());

        let mut too_many = SnapshotRequest::new("home", "https://app.example.com/")
            .with_widths((0..11).map(|i| 200 + i * 10).collect());
        assert!(too_many.validate().is_err());
    }

    #[test]
    fn test_build_info_partial() {
        let mut info = BuildInfo::default();
        assert!(!info.is_partial());
        info.parallel_total = Some(4);
        assert!(info.is_partial());
    }
}
