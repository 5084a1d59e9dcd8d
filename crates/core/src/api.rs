//! Remote API seam.
//!
//! The discovery and upload pipelines talk to the build service through the
//! [`RemoteApi`] trait so tests can substitute an in-memory fake. The real
//! HTTP client lives in the `argus-client` crate.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use argus_common::{BuildInfo, BuildRef, BuildStatus, Resource, SnapshotRef};

/// Errors surfaced by a [`RemoteApi`] implementation.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The token was missing, malformed, or rejected.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The service asked us to slow down.
    #[error("rate limited by the API")]
    RateLimit {
        /// Parsed from the Retry-After header when present.
        retry_after: Option<Duration>,
    },

    /// The request was well-formed but the payload was rejected.
    #[error("request rejected: {0}")]
    Validation(String),

    /// The addressed build or snapshot does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A 5xx from the service.
    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },

    /// Connection-level failures, timeouts, TLS errors.
    #[error("transport error: {0}")]
    Transport(String),
}

impl ApiError {
    /// Whether a retry with backoff has a chance of succeeding.
    ///
    /// Authentication and validation failures are permanent for a given
    /// request and retrying them only burns quota.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ApiError::RateLimit { .. } | ApiError::Server { .. } | ApiError::Transport(_)
        )
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Everything the service needs to render one snapshot.
///
/// `resources` carries the root DOM resource plus every discovered asset;
/// the service answers with the subset of shas it has not seen before.
#[derive(Debug, Clone)]
pub struct SnapshotManifest {
    pub name: String,
    pub widths: Vec<u32>,
    pub min_height: u32,
    pub enable_javascript: bool,
    pub resources: Vec<Arc<Resource>>,
}

impl SnapshotManifest {
    /// Look up a manifest resource by its content sha.
    pub fn resource_by_sha(&self, sha: &str) -> Option<Arc<Resource>> {
        self.resources.iter().find(|r| r.sha() == sha).cloned()
    }
}

/// Client-side view of the build service.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Register a new build and return its server-side identity.
    async fn create_build(&self, info: &BuildInfo) -> ApiResult<BuildRef>;

    /// Register a snapshot with its full resource listing. The returned
    /// [`SnapshotRef`] names the shas the service still needs uploaded.
    async fn create_snapshot(
        &self,
        build_id: &str,
        manifest: &SnapshotManifest,
    ) -> ApiResult<SnapshotRef>;

    /// Upload one resource body to the build.
    async fn upload_resource(&self, build_id: &str, resource: &Resource) -> ApiResult<()>;

    /// Mark a snapshot complete once its missing resources are uploaded.
    async fn finalize_snapshot(&self, snapshot_id: &str) -> ApiResult<()>;

    /// Finalize the build. With `all_shards` the service also finalizes
    /// parallel shards sharing this build's nonce.
    async fn finalize_build(&self, build_id: &str, all_shards: bool) -> ApiResult<()>;

    /// Current server-side state of a build.
    async fn get_build_status(&self, build_id: &str) -> ApiResult<BuildStatus>;
}
