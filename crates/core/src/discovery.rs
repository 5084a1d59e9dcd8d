//! Per-snapshot asset discovery.
//!
//! A discovery pass renders the captured DOM inside a headless page with
//! request interception installed, once per requested width, and waits
//! for the network to go idle before moving on. Everything fetched along
//! the way lands in the shared caches and comes back as the snapshot's
//! resource manifest.
//!
//! The [`Discoverer`] trait is the seam the build runner drives; the
//! browser-backed implementation lives here, fakes live in tests.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use argus_common::{
    normalize_url, Config, DiscoveryConfig, DiscoveryWarning, HostnamePattern, HostnamePolicy,
    Resource, ResourceCache, ResponseCache, SnapshotDefaults, SnapshotRequest, DEFAULT_WIDTHS,
};

use crate::api::SnapshotManifest;
use crate::browser::{Browser, Page};
use crate::error::{Error, Result};
use crate::idle::IdleOptions;
use crate::network::{InterceptConfig, Interceptor};
use crate::retry::with_retries;

/// Everything a finished discovery pass produces.
#[derive(Debug)]
pub struct Discovered {
    /// Manifest ready to hand to the upload pool.
    pub manifest: SnapshotManifest,
    /// Per-resource problems that did not fail the snapshot.
    pub warnings: Vec<DiscoveryWarning>,
}

/// Turns a snapshot request into an uploadable manifest.
#[async_trait]
pub trait Discoverer: Send + Sync {
    async fn discover(&self, request: &SnapshotRequest) -> Result<Discovered>;

    /// Release everything held for discovery once the build is done.
    async fn close(&self) {}
}

/// [`Discoverer`] backed by a real headless browser.
///
/// Pages are checked out of a bounded pool so a burst of snapshots
/// cannot fan out into an unbounded number of tabs. Each retry attempt
/// gets a fresh page; the caches persist across attempts and snapshots.
pub struct BrowserDiscoverer {
    browser: Arc<Browser>,
    discovery: DiscoveryConfig,
    defaults: SnapshotDefaults,
    allowed: Vec<HostnamePattern>,
    disallowed: Vec<HostnamePattern>,
    response_cache: Arc<ResponseCache>,
    resource_cache: Arc<ResourceCache>,
    pages: Arc<Semaphore>,
    cancel: CancellationToken,
}

impl BrowserDiscoverer {
    pub fn new(
        browser: Arc<Browser>,
        config: &Config,
        response_cache: Arc<ResponseCache>,
        resource_cache: Arc<ResourceCache>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let (allowed, disallowed) = config.discovery.parse_policies()?;
        let pages = Arc::new(Semaphore::new(config.discovery.page_pool_size.max(1)));

        Ok(Self {
            browser,
            discovery: config.discovery.clone(),
            defaults: config.snapshot.clone(),
            allowed,
            disallowed,
            response_cache,
            resource_cache,
            pages,
            cancel,
        })
    }

    /// Wait for a page slot, bailing out if the build is shutting down.
    async fn checkout(&self) -> Result<OwnedSemaphorePermit> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Aborted),
            permit = self.pages.clone().acquire_owned() => permit.map_err(|_| Error::Aborted),
        }
    }

    /// Load the live page once and serialize its DOM.
    ///
    /// Only used when the request did not carry a pre-captured DOM. The
    /// capture page always runs with JavaScript on so the application can
    /// actually render; `enable_javascript` only governs the discovery
    /// renders of the frozen DOM.
    async fn capture_dom(&self, request: &SnapshotRequest, min_height: u32) -> Result<String> {
        let _permit = self.checkout().await?;
        let width = request.widths.first().copied().unwrap_or(DEFAULT_WIDTHS[0]);

        debug!(snapshot = %request.name, width, "Capturing DOM from live page");

        let page = self.browser.page(true).await?;
        let captured = async {
            page.resize(width, min_height).await?;
            page.goto(&request.url, self.discovery.discovery_timeout())
                .await?;
            page.dom().await
        }
        .await;
        page.close().await;

        captured
    }

    /// One full discovery attempt on a fresh page.
    async fn attempt(
        &self,
        request: &SnapshotRequest,
        root_url: &str,
        root_resource: Arc<Resource>,
        policy: HostnamePolicy,
        enable_javascript: bool,
        min_height: u32,
    ) -> Result<(Vec<Arc<Resource>>, Vec<DiscoveryWarning>)> {
        let _permit = self.checkout().await?;

        let page = self.browser.page(enable_javascript).await?;
        let rendered = self
            .render(&page, request, root_url, root_resource, policy, min_height)
            .await;
        page.close().await;

        rendered
    }

    async fn render(
        &self,
        page: &Page,
        request: &SnapshotRequest,
        root_url: &str,
        root_resource: Arc<Resource>,
        policy: HostnamePolicy,
        min_height: u32,
    ) -> Result<(Vec<Arc<Resource>>, Vec<DiscoveryWarning>)> {
        let events = page.intercept().await?;
        let interceptor = Interceptor::install(
            page.session(),
            events,
            InterceptConfig {
                root_url: root_url.to_string(),
                root_resource,
                policy,
                disable_cache: self.discovery.disable_cache,
                response_cache: self.response_cache.clone(),
                resource_cache: self.resource_cache.clone(),
            },
        );

        let idle = IdleOptions {
            settle: self.discovery.network_idle_timeout(),
            poll: self.discovery.idle_poll(),
            timeout: self.discovery.discovery_timeout(),
        };

        for (pass, width) in request.widths.iter().copied().enumerate() {
            if self.cancel.is_cancelled() {
                return Err(Error::Aborted);
            }

            // Resources from the first width apply to every width; later
            // passes tag only what they add.
            interceptor.set_current_width((pass > 0).then_some(width));

            debug!(snapshot = %request.name, width, "Rendering for discovery");
            page.resize(width, min_height).await?;
            page.goto(root_url, self.discovery.discovery_timeout()).await?;
            interceptor.idle(idle).await?;
        }

        Ok(interceptor.collect())
    }
}

#[async_trait]
impl Discoverer for BrowserDiscoverer {
    async fn discover(&self, request: &SnapshotRequest) -> Result<Discovered> {
        let root_url = normalize_url(&request.url)?;
        let parsed = Url::parse(&root_url).map_err(|e| argus_common::Error::InvalidUrl {
            url: root_url.clone(),
            reason: e.to_string(),
        })?;

        let min_height = request.min_height.unwrap_or(self.defaults.min_height);
        let enable_javascript = request
            .enable_javascript
            .unwrap_or(self.defaults.enable_javascript);

        let dom = match &request.dom_snapshot {
            Some(dom) => dom.clone(),
            None => self.capture_dom(request, min_height).await?,
        };

        let root_resource = Arc::new(Resource::root(root_url.clone(), dom));
        let policy = HostnamePolicy::new(self.allowed.clone(), self.disallowed.clone(), &parsed);

        let attempts = self.discovery.retries + 1;
        let (resources, warnings) = with_retries(attempts, &self.cancel, &request.name, || {
            self.attempt(
                request,
                &root_url,
                root_resource.clone(),
                policy.clone(),
                enable_javascript,
                min_height,
            )
        })
        .await?;

        Ok(Discovered {
            manifest: SnapshotManifest {
                name: request.name.clone(),
                widths: request.widths.clone(),
                min_height,
                enable_javascript,
                resources,
            },
            warnings,
        })
    }

    async fn close(&self) {
        let stats = self.resource_cache.stats();
        debug!(
            unique = stats.unique_resources,
            bytes = stats.total_bytes,
            dedup_hits = stats.dedup_hits,
            "Resource cache at shutdown"
        );
        self.browser.close().await;
    }
}
