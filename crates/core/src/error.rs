//! Error types for the discovery and upload engine

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while driving a build.
///
/// Per-resource problems are absorbed as snapshot warnings and never reach
/// this type; what does reach it is classified so the queue knows what to
/// retry (`is_retryable`) and what is a clean shutdown (`is_abort`).
#[derive(Error, Debug)]
pub enum Error {
    #[error("Browser error: {0}")]
    Browser(String),

    #[error("Browser executable not found, set discovery.launch.executable")]
    BrowserNotFound,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Page crashed or detached: {0}")]
    TabCrash(String),

    #[error("Network did not idle within {0:?}")]
    NetworkIdleTimeout(std::time::Duration),

    #[error("Aborted")]
    Aborted,

    #[error("Discovery failed for snapshot '{name}': {reason}")]
    DiscoveryFailed { name: String, reason: String },

    #[error("Upload failed for snapshot '{name}': {reason}")]
    UploadFailed { name: String, reason: String },

    #[error("Remote API error: {0}")]
    Api(String),

    #[error(transparent)]
    Common(#[from] argus_common::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Transient faults worth retrying with the same snapshot inputs.
    ///
    /// Browser and protocol errors are included: a flaky navigation or a
    /// command racing a closing session usually succeeds on a fresh page.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::NetworkIdleTimeout(_)
                | Error::TabCrash(_)
                | Error::Browser(_)
                | Error::Protocol(_)
        )
    }

    /// Cooperative shutdown, never counted as a failure.
    pub fn is_abort(&self) -> bool {
        matches!(self, Error::Aborted)
    }
}
