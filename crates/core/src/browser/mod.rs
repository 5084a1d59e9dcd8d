//! Headless browser lifecycle.
//!
//! Launches a Chromium with a throwaway profile directory and
//! `--remote-debugging-port=0`, waits for the devtools endpoint to come up,
//! and hands out pages over one shared protocol connection. Closing shuts
//! the browser down and the profile directory is removed with it.

mod page;

pub use page::{Page, PageSession};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tempfile::TempDir;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use argus_common::LaunchOptions;

use crate::error::{Error, Result};
use crate::protocol::CdpConnection;

/// Environment variable naming the browser binary, checked after the
/// configured path and before the well-known install locations.
pub const EXECUTABLE_ENV: &str = "ARGUS_BROWSER_EXECUTABLE";

const DEFAULT_ARGS: &[&str] = &[
    "--enable-features=NetworkService,NetworkServiceInProcess",
    "--disable-background-networking",
    "--disable-background-timer-throttling",
    "--disable-backgrounding-occluded-windows",
    "--disable-breakpad",
    "--disable-client-side-phishing-detection",
    "--disable-component-extensions-with-background-pages",
    "--disable-default-apps",
    "--disable-dev-shm-usage",
    "--disable-extensions",
    "--disable-features=TranslateUI",
    "--disable-hang-monitor",
    "--disable-ipc-flooding-protection",
    "--disable-popup-blocking",
    "--disable-prompt-on-repost",
    "--disable-renderer-backgrounding",
    "--disable-sync",
    "--disable-web-security",
    "--force-color-profile=srgb",
    "--metrics-recording-only",
    "--no-first-run",
    "--no-sandbox",
    "--enable-automation",
    "--password-store=basic",
    "--use-mock-keychain",
    "--remote-debugging-port=0",
];

#[cfg(target_os = "linux")]
const INSTALL_PATHS: &[&str] = &[
    "/usr/bin/google-chrome",
    "/usr/bin/google-chrome-stable",
    "/usr/bin/chromium",
    "/usr/bin/chromium-browser",
    "/snap/bin/chromium",
];

#[cfg(target_os = "macos")]
const INSTALL_PATHS: &[&str] = &[
    "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
    "/Applications/Chromium.app/Contents/MacOS/Chromium",
];

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
const INSTALL_PATHS: &[&str] = &[];

/// A running headless browser.
pub struct Browser {
    connection: Arc<CdpConnection>,
    child: tokio::sync::Mutex<Option<Child>>,
    profile: TempDir,
}

impl Browser {
    /// Spawn the browser and connect to its devtools endpoint.
    pub async fn launch(options: &LaunchOptions) -> Result<Self> {
        let executable = find_executable(options.executable.as_deref())?;
        let profile = tempfile::Builder::new()
            .prefix("argus-browser-")
            .tempdir()?;

        let args = launch_args(options, profile.path());
        debug!(executable = %executable.display(), "Launching browser");

        let mut child = Command::new(&executable)
            .args(&args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Browser(format!("failed to spawn {}: {e}", executable.display())))?;

        let ws_url = match wait_for_devtools(&mut child, profile.path(), options.launch_timeout())
            .await
        {
            Ok(url) => url,
            Err(err) => {
                let _ = child.kill().await;
                return Err(err);
            }
        };

        let connection = Arc::new(CdpConnection::connect(&ws_url).await?);
        info!(url = %ws_url, "Browser ready");

        let browser = Self {
            connection,
            child: tokio::sync::Mutex::new(Some(child)),
            profile,
        };
        browser.close_initial_page().await;
        Ok(browser)
    }

    /// Open a fresh page with its own devtools session.
    pub async fn page(&self, enable_javascript: bool) -> Result<Page> {
        Page::open(self.connection.clone(), enable_javascript).await
    }

    pub fn profile_path(&self) -> &Path {
        self.profile.path()
    }

    /// Shut the browser down, forcefully if it ignores the polite request.
    pub async fn close(&self) {
        let graceful = tokio::time::timeout(
            Duration::from_secs(2),
            self.connection.send("Browser.close", None, json!({})),
        )
        .await;

        if !matches!(graceful, Ok(Ok(_))) {
            debug!("Browser did not close gracefully, killing the process");
        }
        self.connection.close("Browser closed.").await;

        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(err) = child.kill().await {
                warn!("Failed to kill browser process: {err}");
            }
            let _ = child.wait().await;
        }
    }

    /// Chromium opens a default tab on startup that nothing will ever use.
    async fn close_initial_page(&self) {
        let targets = match self.connection.send("Target.getTargets", None, json!({})).await {
            Ok(targets) => targets,
            Err(_) => return,
        };
        let Some(list) = targets["targetInfos"].as_array() else {
            return;
        };
        for target in list {
            if target["type"] == "page" {
                let _ = self
                    .connection
                    .send(
                        "Target.closeTarget",
                        None,
                        json!({ "targetId": target["targetId"] }),
                    )
                    .await;
            }
        }
    }
}

fn find_executable(configured: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = configured {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        warn!(path = %path.display(), "Configured browser executable not found, probing defaults");
    }

    if let Some(path) = std::env::var_os(EXECUTABLE_ENV).map(PathBuf::from) {
        if path.exists() {
            return Ok(path);
        }
    }

    INSTALL_PATHS
        .iter()
        .map(PathBuf::from)
        .find(|p| p.exists())
        .ok_or(Error::BrowserNotFound)
}

fn launch_args(options: &LaunchOptions, profile: &Path) -> Vec<String> {
    let mut args: Vec<String> = DEFAULT_ARGS.iter().map(|a| a.to_string()).collect();
    args.push(format!("--user-data-dir={}", profile.display()));

    if options.headless {
        args.push("--headless".to_string());
        args.push("--hide-scrollbars".to_string());
        args.push("--mute-audio".to_string());
    }

    for arg in &options.args {
        if !args.contains(arg) {
            args.push(arg.clone());
        }
    }
    args
}

/// Poll the profile's `DevToolsActivePort` file until the browser writes
/// its port and endpoint path, then assemble the WebSocket URL.
async fn wait_for_devtools(child: &mut Child, profile: &Path, timeout: Duration) -> Result<String> {
    let marker = profile.join("DevToolsActivePort");
    let start = Instant::now();

    loop {
        if let Some(status) = child.try_wait()? {
            return Err(Error::Browser(format!(
                "browser exited during startup ({status})"
            )));
        }
        if start.elapsed() > timeout {
            return Err(Error::Browser(format!(
                "timed out after {timeout:?} waiting for the devtools endpoint"
            )));
        }

        if let Ok(content) = tokio::fs::read_to_string(&marker).await {
            if let Some(url) = parse_devtools_endpoint(&content) {
                return Ok(url);
            }
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

fn parse_devtools_endpoint(content: &str) -> Option<String> {
    let mut lines = content.lines();
    let port: u16 = lines.next()?.trim().parse().ok()?;
    let path = lines.next()?.trim();
    if !path.starts_with('/') {
        return None;
    }
    Some(format!("ws://127.0.0.1:{port}{path}"))
}
