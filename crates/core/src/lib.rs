//! Argus Core
//!
//! Browser-driven asset discovery and build orchestration. The pieces
//! compose bottom-up: a CDP connection carries commands and events, a
//! page wraps one browser tab, the interceptor turns its network traffic
//! into content-addressed resources, and the runner schedules discovery
//! and upload across a whole build.

pub mod api;
pub mod browser;
pub mod build;
pub mod discovery;
pub mod error;
pub mod idle;
pub mod network;
pub mod protocol;
pub mod queue;
pub mod retry;
pub mod runner;
pub mod session;
pub mod upload;

// Re-export the surface most callers need
pub use api::{ApiError, ApiResult, RemoteApi, SnapshotManifest};
pub use browser::{Browser, Page, PageSession};
pub use build::{BuildOutcome, BuildSummary, BuildTracker, FailedSnapshot};
pub use discovery::{BrowserDiscoverer, Discovered, Discoverer};
pub use error::{Error, Result};
pub use runner::BuildRunner;
pub use session::{AbortReason, NetworkEvent, NetworkSession, ResponseInfo};
pub use upload::Uploader;

/// Argus version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
