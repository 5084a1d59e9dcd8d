//! Build orchestration.
//!
//! One [`BuildRunner`] owns the whole lifetime of a build: it registers
//! the build with the service, fans snapshot requests out over a bounded
//! discovery pool, chains each discovered manifest into a bounded upload
//! pool, and finalizes once everything settles or the user aborts.
//!
//! Discovery and upload run decoupled so a slow page render never holds
//! up finished manifests, and a slow upload never blocks the browser.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use argus_common::{
    BuildRef, BuildState, Config, ResourceCache, ResponseCache, SnapshotRequest, SnapshotStatus,
};

use crate::api::{RemoteApi, SnapshotManifest};
use crate::browser::Browser;
use crate::build::{BuildSummary, BuildTracker};
use crate::discovery::{BrowserDiscoverer, Discoverer};
use crate::error::{Error, Result};
use crate::queue::TaskQueue;
use crate::retry::with_backoff;
use crate::upload::Uploader;

struct Shared {
    config: Config,
    api: Arc<dyn RemoteApi>,
    discoverer: Arc<dyn Discoverer>,
    tracker: BuildTracker,
    uploader: Uploader,
    discovery: TaskQueue,
    uploads: TaskQueue,
    cancel: CancellationToken,
}

/// Drives one build from creation to finalize.
pub struct BuildRunner {
    shared: Arc<Shared>,
}

impl BuildRunner {
    /// Launch a browser and assemble the production pipeline around it.
    pub async fn launch(config: Config, api: Arc<dyn RemoteApi>) -> Result<Self> {
        config.validate()?;

        let cancel = CancellationToken::new();
        let browser = Arc::new(Browser::launch(&config.discovery.launch).await?);
        let discoverer = Arc::new(BrowserDiscoverer::new(
            browser,
            &config,
            Arc::new(ResponseCache::new()),
            Arc::new(ResourceCache::new()),
            cancel.child_token(),
        )?);

        Self::with_parts(config, api, discoverer, cancel)
    }

    /// Assemble a runner around an existing discoverer.
    ///
    /// This is the seam tests use to run the pipeline without a browser;
    /// production code goes through [`BuildRunner::launch`].
    pub fn with_parts(
        config: Config,
        api: Arc<dyn RemoteApi>,
        discoverer: Arc<dyn Discoverer>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        config.validate()?;

        let uploader = Uploader::new(api.clone(), config.upload.retry.clone(), cancel.child_token());
        let discovery = TaskQueue::new(
            "discovery",
            config.discovery.concurrency,
            cancel.child_token(),
        );
        let uploads = TaskQueue::new("upload", config.upload.concurrency, cancel.child_token());

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                api,
                discoverer,
                tracker: BuildTracker::new(),
                uploader,
                discovery,
                uploads,
                cancel,
            }),
        })
    }

    /// Register the build with the service. Snapshots are accepted only
    /// after this succeeds.
    pub async fn start(&self) -> Result<()> {
        let shared = &self.shared;

        let created = with_backoff(
            &shared.config.upload.retry,
            &shared.cancel,
            "build creation",
            || shared.api.create_build(&shared.config.build),
        )
        .await;

        let build = match created {
            Ok(build) => build,
            Err(err) => {
                shared.tracker.mark_errored();
                shared.discoverer.close().await;
                return Err(Error::Api(err.to_string()));
            }
        };

        if let Some(url) = &build.web_url {
            info!(url = %url, "Build page");
        }
        shared.tracker.mark_created(build)?;
        Ok(())
    }

    /// Queue one snapshot for discovery and upload.
    ///
    /// The request is validated and admitted under its unique name; the
    /// call returns as soon as the snapshot is queued.
    pub fn snapshot(&self, mut request: SnapshotRequest) -> Result<()> {
        let shared = &self.shared;

        let state = shared.tracker.state();
        if state != BuildState::Created {
            return Err(argus_common::Error::InvalidStateTransition {
                from: state.to_string(),
                to: format!("snapshot '{}'", request.name),
            }
            .into());
        }

        if request.widths.is_empty() {
            request.widths = shared.config.snapshot.widths.clone();
        }
        request.validate()?;
        shared.tracker.register(&request.name)?;
        shared.spawn_discovery(request);
        Ok(())
    }

    /// Wait for every queued snapshot to settle, then finalize the build.
    pub async fn stop(&self) -> Result<BuildSummary> {
        let shared = &self.shared;

        debug!(pending = shared.discovery.pending(), "Draining discovery");
        shared.discovery.drain().await;
        debug!(pending = shared.uploads.pending(), "Draining uploads");
        shared.uploads.drain().await;

        self.finish(false).await
    }

    /// Cancel outstanding work and finalize whatever already uploaded.
    ///
    /// Running discovery and upload tasks get `abort_grace` to observe the
    /// cancellation before they are torn down.
    pub async fn abort(&self) -> Result<BuildSummary> {
        let shared = &self.shared;

        warn!("Aborting build");
        shared.cancel.cancel();

        let grace = shared.config.discovery.abort_grace();
        shared.discovery.shutdown(grace).await;
        shared.uploads.shutdown(grace).await;

        self.finish(true).await
    }

    /// Remote identity of the build, once `start` has succeeded.
    pub fn build(&self) -> Option<BuildRef> {
        self.shared.tracker.build_ref()
    }

    /// Snapshot of where the build and its snapshots currently stand.
    pub fn summary(&self) -> BuildSummary {
        self.shared.tracker.summary()
    }

    async fn finish(&self, force: bool) -> Result<BuildSummary> {
        let shared = &self.shared;

        shared.discoverer.close().await;

        // stop() racing abort(): whoever gets here second just reports.
        if shared.tracker.state() != BuildState::Created {
            return Ok(shared.tracker.summary());
        }

        let interim = shared.tracker.summary();
        let uploaded_any = !interim.uploaded.is_empty();
        let have_snapshots = shared.tracker.snapshot_count() > 0;

        // An abort or an all-failed run finalizes by force; the state
        // machine still flows created -> finalizing -> terminal.
        shared.tracker.begin_finalize(force || !uploaded_any)?;

        // The remote build is finalized even when nothing uploaded; only
        // the local terminal state reports the failure.
        let mut state = self.remote_finalize().await;
        if state == BuildState::Finished && have_snapshots && !uploaded_any {
            warn!("No snapshot uploaded, reporting the build failed");
            state = BuildState::Failed;
        }

        shared.tracker.finish(state)?;

        let summary = shared.tracker.summary();
        info!(
            state = %summary.state,
            uploaded = summary.uploaded.len(),
            failed = summary.failed.len(),
            skipped = summary.skipped.len(),
            warnings = summary.warning_count,
            "Build complete"
        );
        Ok(summary)
    }

    async fn remote_finalize(&self) -> BuildState {
        let shared = &self.shared;

        let Some(build) = shared.tracker.build_ref() else {
            warn!("Build was never created remotely");
            return BuildState::Failed;
        };

        let done = with_backoff(
            &shared.config.upload.retry,
            &shared.cancel,
            "build finalize",
            || shared.api.finalize_build(&build.id, false),
        )
        .await;

        match done {
            Ok(()) => {
                info!(build_id = %build.id, "Build finalized");
                BuildState::Finished
            }
            Err(err) => {
                warn!(build_id = %build.id, error = %err, "Remote finalize failed");
                BuildState::Failed
            }
        }
    }
}

impl Shared {
    fn spawn_discovery(self: &Arc<Self>, request: SnapshotRequest) {
        let name = request.name.clone();
        let shared = self.clone();
        let queued = self
            .discovery
            .enqueue(name.clone(), async move { shared.run_discovery(request).await });
        if !queued {
            debug!(snapshot = %name, "Discovery not queued, build is shutting down");
        }
    }

    async fn run_discovery(self: Arc<Self>, request: SnapshotRequest) {
        let name = request.name.clone();

        if let Err(err) = self.tracker.advance(&name, SnapshotStatus::Discovering) {
            warn!(snapshot = %name, error = %err, "Cannot start discovery");
            return;
        }

        match self.discoverer.discover(&request).await {
            Ok(discovered) => {
                self.tracker.add_warnings(&name, discovered.warnings);
                if let Err(err) = self.tracker.advance(&name, SnapshotStatus::Discovered) {
                    warn!(snapshot = %name, error = %err, "Discovery finished out of order");
                    return;
                }
                self.spawn_upload(discovered.manifest);
            }
            Err(err) if err.is_abort() => {
                debug!(snapshot = %name, "Discovery aborted");
            }
            Err(err) => {
                self.tracker.fail(&name, &err.to_string());
            }
        }
    }

    fn spawn_upload(self: &Arc<Self>, manifest: SnapshotManifest) {
        let name = manifest.name.clone();
        let shared = self.clone();
        let queued = self
            .uploads
            .enqueue(name.clone(), async move { shared.run_upload(manifest).await });
        if !queued {
            debug!(snapshot = %name, "Upload not queued, build is shutting down");
        }
    }

    async fn run_upload(self: Arc<Self>, manifest: SnapshotManifest) {
        let name = manifest.name.clone();

        let Some(build) = self.tracker.build_ref() else {
            warn!(snapshot = %name, "No remote build to upload to");
            return;
        };

        if let Err(err) = self.tracker.advance(&name, SnapshotStatus::Uploading) {
            warn!(snapshot = %name, error = %err, "Cannot start upload");
            return;
        }

        match self.uploader.upload_snapshot(&build.id, &manifest).await {
            Ok(_) => {
                if let Err(err) = self.tracker.advance(&name, SnapshotStatus::Uploaded) {
                    warn!(snapshot = %name, error = %err, "Upload finished out of order");
                }
            }
            Err(err) if err.is_abort() => {
                debug!(snapshot = %name, "Upload aborted");
            }
            Err(err) => {
                self.tracker.fail(&name, &err.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;

    use argus_common::{BuildInfo, BuildStatus, Resource, SnapshotRef};

    use crate::api::{ApiError, ApiResult};
    use crate::build::BuildOutcome;
    use crate::discovery::Discovered;

    struct NullDiscoverer;

    #[async_trait]
    impl Discoverer for NullDiscoverer {
        async fn discover(&self, request: &SnapshotRequest) -> Result<Discovered> {
            Ok(Discovered {
                manifest: SnapshotManifest {
                    name: request.name.clone(),
                    widths: request.widths.clone(),
                    min_height: 1024,
                    enable_javascript: false,
                    resources: vec![Arc::new(Resource::root(
                        "https://app.test/",
                        "<html></html>",
                    ))],
                },
                warnings: Vec::new(),
            })
        }
    }

    struct HappyApi;

    #[async_trait]
    impl RemoteApi for HappyApi {
        async fn create_build(&self, _info: &BuildInfo) -> ApiResult<BuildRef> {
            Ok(BuildRef {
                id: "build-7".into(),
                web_url: Some("https://argus-ci.dev/builds/7".into()),
                number: Some(7),
            })
        }

        async fn create_snapshot(
            &self,
            _build_id: &str,
            manifest: &SnapshotManifest,
        ) -> ApiResult<SnapshotRef> {
            Ok(SnapshotRef {
                id: format!("snap-{}", manifest.name),
                missing_shas: Vec::new(),
            })
        }

        async fn upload_resource(&self, _build_id: &str, _resource: &Resource) -> ApiResult<()> {
            Ok(())
        }

        async fn finalize_snapshot(&self, _snapshot_id: &str) -> ApiResult<()> {
            Ok(())
        }

        async fn finalize_build(&self, _build_id: &str, _all_shards: bool) -> ApiResult<()> {
            Ok(())
        }

        async fn get_build_status(&self, _build_id: &str) -> ApiResult<BuildStatus> {
            Err(ApiError::NotFound("not used".into()))
        }
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        config.api.token = "web_test".into();
        config
    }

    fn test_runner() -> BuildRunner {
        BuildRunner::with_parts(
            test_config(),
            Arc::new(HappyApi),
            Arc::new(NullDiscoverer),
            CancellationToken::new(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn snapshots_require_a_started_build() {
        let runner = test_runner();

        let early = runner.snapshot(SnapshotRequest::new("home", "https://app.test/"));
        assert!(early.is_err());

        runner.start().await.unwrap();
        runner
            .snapshot(SnapshotRequest::new("home", "https://app.test/"))
            .unwrap();
    }

    #[tokio::test]
    async fn duplicate_names_are_rejected_at_admission() {
        let runner = test_runner();
        runner.start().await.unwrap();

        runner
            .snapshot(SnapshotRequest::new("home", "https://app.test/"))
            .unwrap();
        let dup = runner.snapshot(SnapshotRequest::new("home", "https://app.test/"));
        assert!(dup.is_err());
    }

    #[tokio::test]
    async fn a_snapshot_flows_to_uploaded_and_the_build_finishes() {
        let runner = test_runner();
        runner.start().await.unwrap();
        assert_eq!(runner.build().unwrap().id, "build-7");

        runner
            .snapshot(SnapshotRequest::new("home", "https://app.test/"))
            .unwrap();

        let summary = runner.stop().await.unwrap();
        assert_eq!(summary.state, BuildState::Finished);
        assert_eq!(summary.uploaded, vec!["home"]);
        assert_eq!(summary.outcome(), BuildOutcome::Success);
    }
}
