//! Argus Common Library
//!
//! Shared resource model, caches, hostname policy, and configuration for
//! the Argus visual-testing pipeline.

pub mod cache;
pub mod config;
pub mod error;
pub mod hostname;
pub mod resource;
pub mod types;

// Re-export commonly used types
pub use cache::{CacheStats, CachedExchange, ResourceCache, ResponseCache};
pub use config::{
    ApiConfig, Config, DiscoveryConfig, LaunchOptions, RetryPolicy, SnapshotDefaults, UploadConfig,
};
pub use error::{Error, Result};
pub use hostname::{BlockReason, HostnamePattern, HostnamePolicy, PolicyDecision};
pub use resource::{mimetype_of, normalize_url, sha256_hex, Resource, ALLOWED_STATUSES, MAX_REDIRECTS, MAX_RESOURCE_SIZE};
pub use types::*;

/// Argus version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
