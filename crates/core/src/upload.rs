//! Snapshot upload pipeline.
//!
//! Each discovered manifest is registered with the build service, which
//! answers with the content shas it has not seen before; only those
//! bodies are sent. When two snapshots race over a shared asset, the
//! first claims the upload and the rest wait for its verdict: a skip is
//! honored only for content that actually landed, and a failed claim
//! frees the sha for the next waiter to send itself. API traffic retries
//! with exponential backoff; an exhausted retry fails the one snapshot
//! and leaves the rest of the build alone.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use argus_common::{RetryPolicy, SnapshotRef};

use crate::api::{RemoteApi, SnapshotManifest};
use crate::error::{Error, Result};
use crate::retry::with_backoff;

/// Upload progress of one sha within the build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShaState {
    InFlight,
    Uploaded,
}

/// How a snapshot relates to one missing sha.
enum Claim {
    /// First to claim it: send the bytes and report through the channel.
    Upload(watch::Sender<ShaState>),
    /// Another snapshot is sending it: wait for its verdict.
    Wait(watch::Receiver<ShaState>),
}

/// Pushes manifests to the build service, once per distinct resource.
pub struct Uploader {
    api: Arc<dyn RemoteApi>,
    retry: RetryPolicy,
    cancel: CancellationToken,
    /// One slot per sha claimed for upload. The channel reads `Uploaded`
    /// once the bytes are on the service; a slot that closes without that
    /// verdict failed and may be claimed again.
    uploads: DashMap<String, watch::Receiver<ShaState>>,
}

impl Uploader {
    pub fn new(api: Arc<dyn RemoteApi>, retry: RetryPolicy, cancel: CancellationToken) -> Self {
        Self {
            api,
            retry,
            cancel,
            uploads: DashMap::new(),
        }
    }

    /// Register the snapshot, send what the service is missing, finalize.
    pub async fn upload_snapshot(
        &self,
        build_id: &str,
        manifest: &SnapshotManifest,
    ) -> Result<SnapshotRef> {
        if self.cancel.is_cancelled() {
            return Err(Error::Aborted);
        }

        let snapshot = with_backoff(&self.retry, &self.cancel, "snapshot registration", || {
            self.api.create_snapshot(build_id, manifest)
        })
        .await
        .map_err(|e| self.failed(manifest, e))?;

        debug!(
            snapshot = %manifest.name,
            id = %snapshot.id,
            missing = snapshot.missing_shas.len(),
            "Snapshot registered"
        );

        for sha in &snapshot.missing_shas {
            if self.cancel.is_cancelled() {
                return Err(Error::Aborted);
            }

            let Some(resource) = manifest.resource_by_sha(sha) else {
                warn!(
                    snapshot = %manifest.name,
                    %sha,
                    "Service requested a sha this snapshot never produced"
                );
                continue;
            };

            loop {
                let claim = match self.uploads.entry(sha.clone()) {
                    Entry::Vacant(slot) => {
                        let (verdict, watcher) = watch::channel(ShaState::InFlight);
                        slot.insert(watcher);
                        Claim::Upload(verdict)
                    }
                    Entry::Occupied(slot) => Claim::Wait(slot.get().clone()),
                };

                match claim {
                    Claim::Upload(verdict) => {
                        let sent = with_backoff(&self.retry, &self.cancel, "resource upload", || {
                            self.api.upload_resource(build_id, &resource)
                        })
                        .await;

                        if let Err(err) = sent {
                            // Free the sha before the channel closes so a
                            // waiting snapshot sends the bytes itself.
                            self.uploads.remove(sha);
                            return Err(self.failed(manifest, err));
                        }

                        let _ = verdict.send(ShaState::Uploaded);
                        debug!(%sha, url = %resource.url, size = resource.size(), "Resource uploaded");
                        break;
                    }
                    Claim::Wait(mut watcher) => {
                        let settled = tokio::select! {
                            biased;
                            _ = self.cancel.cancelled() => return Err(Error::Aborted),
                            outcome = watcher.wait_for(|state| *state == ShaState::Uploaded) => {
                                outcome.is_ok()
                            }
                        };

                        if settled {
                            debug!(%sha, "Resource already uploaded for this build");
                            break;
                        }

                        // The owning upload failed without a verdict; clear
                        // the dead slot and claim the sha on the next pass.
                        self.uploads.remove_if(sha, |_, slot| {
                            slot.has_changed().is_err() && *slot.borrow() != ShaState::Uploaded
                        });
                    }
                }
            }
        }

        with_backoff(&self.retry, &self.cancel, "snapshot finalize", || {
            self.api.finalize_snapshot(&snapshot.id)
        })
        .await
        .map_err(|e| self.failed(manifest, e))?;

        info!(snapshot = %manifest.name, id = %snapshot.id, "Snapshot uploaded");
        Ok(snapshot)
    }

    fn failed(&self, manifest: &SnapshotManifest, reason: impl ToString) -> Error {
        Error::UploadFailed {
            name: manifest.name.clone(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use tokio::sync::Semaphore;

    use argus_common::{BuildInfo, BuildRef, BuildStatus, Resource};

    use crate::api::{ApiError, ApiResult};

    #[derive(Default)]
    struct FakeApi {
        /// Shas to report missing on the next create_snapshot call; when
        /// empty, everything in the manifest is reported missing.
        report_missing: Mutex<Option<Vec<String>>>,
        fail_uploads: Mutex<HashSet<String>>,
        uploads: Mutex<Vec<String>>,
        upload_calls: AtomicU32,
        finalized: Mutex<Vec<String>>,
        snapshots: AtomicU32,
    }

    #[async_trait]
    impl RemoteApi for FakeApi {
        async fn create_build(&self, _info: &BuildInfo) -> ApiResult<BuildRef> {
            Ok(BuildRef {
                id: "build-1".into(),
                web_url: None,
                number: Some(1),
            })
        }

        async fn create_snapshot(
            &self,
            _build_id: &str,
            manifest: &SnapshotManifest,
        ) -> ApiResult<SnapshotRef> {
            let id = self.snapshots.fetch_add(1, Ordering::SeqCst) + 1;
            let missing = self
                .report_missing
                .lock()
                .clone()
                .unwrap_or_else(|| manifest.resources.iter().map(|r| r.sha().to_string()).collect());

            Ok(SnapshotRef {
                id: format!("snap-{id}"),
                missing_shas: missing,
            })
        }

        async fn upload_resource(&self, _build_id: &str, resource: &Resource) -> ApiResult<()> {
            self.upload_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_uploads.lock().contains(resource.sha()) {
                return Err(ApiError::Server {
                    status: 502,
                    message: "bad gateway".into(),
                });
            }
            self.uploads.lock().push(resource.sha().to_string());
            Ok(())
        }

        async fn finalize_snapshot(&self, snapshot_id: &str) -> ApiResult<()> {
            self.finalized.lock().push(snapshot_id.to_string());
            Ok(())
        }

        async fn finalize_build(&self, _build_id: &str, _all_shards: bool) -> ApiResult<()> {
            Ok(())
        }

        async fn get_build_status(&self, _build_id: &str) -> ApiResult<BuildStatus> {
            Ok(BuildStatus {
                state: "finished".into(),
                is_pending: false,
                total_snapshots: 0,
            })
        }
    }

    fn quick_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 2,
            initial_delay_ms: 1,
            max_delay_ms: 5,
            multiplier: 2.0,
        }
    }

    fn resource(url: &str, body: &'static [u8], mimetype: &str) -> Arc<Resource> {
        Arc::new(Resource::new(url, Bytes::from_static(body), mimetype))
    }

    fn manifest(name: &str, resources: Vec<Arc<Resource>>) -> SnapshotManifest {
        SnapshotManifest {
            name: name.into(),
            widths: vec![1280],
            min_height: 1024,
            enable_javascript: false,
            resources,
        }
    }

    #[tokio::test]
    async fn only_missing_resources_are_uploaded() {
        let root = Arc::new(Resource::root("https://app.test/", "<html></html>"));
        let css = resource("https://app.test/a.css", b"body{}", "text/css");
        let js = resource("https://app.test/a.js", b"void 0", "application/javascript");

        let api = Arc::new(FakeApi::default());
        *api.report_missing.lock() = Some(vec![css.sha().to_string(), js.sha().to_string()]);

        let uploader = Uploader::new(api.clone(), quick_retry(), CancellationToken::new());
        let snapshot = uploader
            .upload_snapshot("build-1", &manifest("home", vec![root.clone(), css.clone(), js.clone()]))
            .await
            .unwrap();

        let uploads = api.uploads.lock().clone();
        assert_eq!(uploads.len(), 2);
        assert!(uploads.contains(&css.sha().to_string()));
        assert!(uploads.contains(&js.sha().to_string()));
        assert!(!uploads.contains(&root.sha().to_string()));
        assert_eq!(api.finalized.lock().clone(), vec![snapshot.id]);
    }

    #[tokio::test]
    async fn shared_resources_upload_once_per_build() {
        let css = resource("https://app.test/shared.css", b"p{}", "text/css");
        let home = Arc::new(Resource::root("https://app.test/", "<html>home</html>"));
        let about = Arc::new(Resource::root("https://app.test/about", "<html>about</html>"));

        let api = Arc::new(FakeApi::default());
        let uploader = Uploader::new(api.clone(), quick_retry(), CancellationToken::new());

        uploader
            .upload_snapshot("build-1", &manifest("home", vec![home, css.clone()]))
            .await
            .unwrap();
        uploader
            .upload_snapshot("build-1", &manifest("about", vec![about, css.clone()]))
            .await
            .unwrap();

        let shared_uploads = api
            .uploads
            .lock()
            .iter()
            .filter(|sha| *sha == css.sha())
            .count();
        assert_eq!(shared_uploads, 1);
        assert_eq!(api.finalized.lock().len(), 2);
    }

    #[tokio::test]
    async fn exhausted_uploads_fail_the_snapshot_and_free_the_sha() {
        let css = resource("https://app.test/flaky.css", b"i{}", "text/css");
        let home = Arc::new(Resource::root("https://app.test/", "<html></html>"));

        let api = Arc::new(FakeApi::default());
        api.fail_uploads.lock().insert(css.sha().to_string());

        let uploader = Uploader::new(api.clone(), quick_retry(), CancellationToken::new());
        let err = uploader
            .upload_snapshot("build-1", &manifest("home", vec![home.clone(), css.clone()]))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::UploadFailed { ref name, .. } if name == "home"));
        assert!(api.finalized.lock().is_empty());

        // The sha was released, so a healthy retry from another snapshot
        // uploads it instead of assuming the failed attempt counted.
        api.fail_uploads.lock().clear();
        let about = Arc::new(Resource::root("https://app.test/about", "<html></html>"));
        uploader
            .upload_snapshot("build-1", &manifest("about", vec![about, css.clone()]))
            .await
            .unwrap();

        assert!(api.uploads.lock().iter().any(|sha| sha == css.sha()));
    }

    /// Holds the first upload of one sha open until released, then rejects
    /// it; later uploads of that sha go through.
    struct GatedApi {
        inner: FakeApi,
        gated_sha: String,
        gated_calls: AtomicU32,
        entered: Semaphore,
        release: Semaphore,
    }

    impl GatedApi {
        fn new(gated_sha: &str) -> Arc<Self> {
            Arc::new(Self {
                inner: FakeApi::default(),
                gated_sha: gated_sha.to_string(),
                gated_calls: AtomicU32::new(0),
                entered: Semaphore::new(0),
                release: Semaphore::new(0),
            })
        }
    }

    #[async_trait]
    impl RemoteApi for GatedApi {
        async fn create_build(&self, info: &BuildInfo) -> ApiResult<BuildRef> {
            self.inner.create_build(info).await
        }
        async fn create_snapshot(
            &self,
            build_id: &str,
            manifest: &SnapshotManifest,
        ) -> ApiResult<SnapshotRef> {
            self.inner.create_snapshot(build_id, manifest).await
        }
        async fn upload_resource(&self, build_id: &str, resource: &Resource) -> ApiResult<()> {
            if resource.sha() == self.gated_sha
                && self.gated_calls.fetch_add(1, Ordering::SeqCst) == 0
            {
                self.entered.add_permits(1);
                self.release.acquire().await.unwrap().forget();
                return Err(ApiError::Server {
                    status: 500,
                    message: "storage write failed".into(),
                });
            }
            self.inner.upload_resource(build_id, resource).await
        }
        async fn finalize_snapshot(&self, snapshot_id: &str) -> ApiResult<()> {
            self.inner.finalize_snapshot(snapshot_id).await
        }
        async fn finalize_build(&self, build_id: &str, all_shards: bool) -> ApiResult<()> {
            self.inner.finalize_build(build_id, all_shards).await
        }
        async fn get_build_status(&self, build_id: &str) -> ApiResult<BuildStatus> {
            self.inner.get_build_status(build_id).await
        }
    }

    async fn eventually(what: &str, cond: impl Fn() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("timed out waiting for {what}");
    }

    #[tokio::test]
    async fn a_failed_shared_upload_is_retaken_by_the_waiting_snapshot() {
        let css = resource("https://cdn.test/shared.css", b"p{color:red}", "text/css");
        let home = Arc::new(Resource::root("https://app.test/", "<html>home</html>"));
        let about = Arc::new(Resource::root("https://app.test/about", "<html>about</html>"));

        let api = GatedApi::new(css.sha());
        let one_shot = RetryPolicy {
            max_attempts: 1,
            initial_delay_ms: 1,
            max_delay_ms: 1,
            multiplier: 1.0,
        };
        let uploader = Arc::new(Uploader::new(api.clone(), one_shot, CancellationToken::new()));

        let first = {
            let uploader = uploader.clone();
            let manifest = manifest("home", vec![home, css.clone()]);
            tokio::spawn(async move { uploader.upload_snapshot("build-1", &manifest).await })
        };

        // "home" is now parked inside the shared stylesheet upload and
        // holds the claim for its sha.
        api.entered.acquire().await.unwrap().forget();

        let second = {
            let uploader = uploader.clone();
            let manifest = manifest("about", vec![about, css.clone()]);
            tokio::spawn(async move { uploader.upload_snapshot("build-1", &manifest).await })
        };

        // "about" sends its own root, then reaches the claimed sha.
        eventually("both root resources uploaded", || {
            api.inner.uploads.lock().len() == 2
        })
        .await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        api.release.add_permits(1);

        let failed = first.await.unwrap().unwrap_err();
        assert!(matches!(failed, Error::UploadFailed { ref name, .. } if name == "home"));

        let snapshot = second.await.unwrap().unwrap();

        // The sibling sent the stylesheet itself instead of trusting the
        // failed claim, and only then finalized its snapshot.
        let css_uploads = api
            .inner
            .uploads
            .lock()
            .iter()
            .filter(|sha| *sha == css.sha())
            .count();
        assert_eq!(css_uploads, 1);
        assert_eq!(api.gated_calls.load(Ordering::SeqCst), 2);
        assert_eq!(api.inner.finalized.lock().clone(), vec![snapshot.id]);
    }

    #[tokio::test]
    async fn registration_failures_do_not_upload_anything() {
        struct RejectingApi(FakeApi);

        #[async_trait]
        impl RemoteApi for RejectingApi {
            async fn create_build(&self, info: &BuildInfo) -> ApiResult<BuildRef> {
                self.0.create_build(info).await
            }
            async fn create_snapshot(
                &self,
                _build_id: &str,
                _manifest: &SnapshotManifest,
            ) -> ApiResult<SnapshotRef> {
                Err(ApiError::Validation("snapshot name too long".into()))
            }
            async fn upload_resource(&self, build_id: &str, resource: &Resource) -> ApiResult<()> {
                self.0.upload_resource(build_id, resource).await
            }
            async fn finalize_snapshot(&self, snapshot_id: &str) -> ApiResult<()> {
                self.0.finalize_snapshot(snapshot_id).await
            }
            async fn finalize_build(&self, build_id: &str, all_shards: bool) -> ApiResult<()> {
                self.0.finalize_build(build_id, all_shards).await
            }
            async fn get_build_status(&self, build_id: &str) -> ApiResult<BuildStatus> {
                self.0.get_build_status(build_id).await
            }
        }

        let api = Arc::new(RejectingApi(FakeApi::default()));
        let uploader = Uploader::new(api.clone(), quick_retry(), CancellationToken::new());

        let home = Arc::new(Resource::root("https://app.test/", "<html></html>"));
        let err = uploader
            .upload_snapshot("build-1", &manifest("home", vec![home]))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::UploadFailed { .. }));
        assert_eq!(api.0.upload_calls.load(Ordering::SeqCst), 0);
        assert!(api.0.finalized.lock().is_empty());
    }

    #[tokio::test]
    async fn cancellation_aborts_before_any_traffic() {
        let api = Arc::new(FakeApi::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let uploader = Uploader::new(api.clone(), quick_retry(), cancel);
        let home = Arc::new(Resource::root("https://app.test/", "<html></html>"));
        let err = uploader
            .upload_snapshot("build-1", &manifest("home", vec![home]))
            .await
            .unwrap_err();

        assert!(err.is_abort());
        assert_eq!(api.snapshots.load(Ordering::SeqCst), 0);
        assert_eq!(api.upload_calls.load(Ordering::SeqCst), 0);
    }
}
