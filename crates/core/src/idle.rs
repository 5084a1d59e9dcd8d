//! Network idle detection.
//!
//! A page is considered idle once no tracked request has been in flight
//! for a full settle window. The probe is re-checked after the window
//! elapses so a request that starts mid-window restarts the wait, which
//! catches scripts that fire follow-up fetches right after the first
//! burst finishes.

use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::{Error, Result};

/// Timing knobs for [`wait_for_idle`].
#[derive(Debug, Clone, Copy)]
pub struct IdleOptions {
    /// How long the network must stay quiet before the page counts as idle.
    pub settle: Duration,
    /// Delay between probe evaluations.
    pub poll: Duration,
    /// Hard cap on the whole wait, settle windows included.
    pub timeout: Duration,
}

impl Default for IdleOptions {
    fn default() -> Self {
        Self {
            settle: Duration::from_millis(100),
            poll: Duration::from_millis(10),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Poll `probe` until it reports quiet twice across a settle window.
///
/// `probe` returns whether the network is currently quiet, or an error to
/// abort the wait immediately (used to surface crashed pages). Exceeding
/// the hard timeout yields [`Error::NetworkIdleTimeout`].
pub async fn wait_for_idle<F>(mut probe: F, opts: IdleOptions) -> Result<()>
where
    F: FnMut() -> Result<bool>,
{
    let start = Instant::now();
    let mut settled = false;

    loop {
        if start.elapsed() >= opts.timeout {
            return Err(Error::NetworkIdleTimeout(opts.timeout));
        }

        if !probe()? {
            settled = false;
            tokio::time::sleep(opts.poll).await;
        } else if !settled {
            // quiet now, confirm it holds for the settle window
            settled = true;
            tokio::time::sleep(opts.settle).await;
        } else {
            debug!(elapsed_ms = start.elapsed().as_millis() as u64, "network idle");
            return Ok(());
        }
    }
}
