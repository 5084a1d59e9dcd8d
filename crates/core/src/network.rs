//! Network interception and resource capture.
//!
//! The interceptor pairs devtools fetch pauses with their network events,
//! decides per request whether to serve the root DOM, replay a cached
//! response, block by hostname policy, or let the request through, and
//! materializes completed responses into resources. All pairing state is
//! owned by a single event-loop task; the in-flight count and collected
//! resources are published through shared handles for idle polling and
//! final collection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};
use url::Url;

use argus_common::{
    mimetype_of, normalize_url, CachedExchange, DiscoveryWarning, HostnamePolicy, PolicyDecision,
    Resource, ResourceCache, ResponseCache, ALLOWED_STATUSES, MAX_REDIRECTS, MAX_RESOURCE_SIZE,
};

use crate::error::{Error, Result};
use crate::idle::{wait_for_idle, IdleOptions};
use crate::session::{AbortReason, NetworkEvent, NetworkSession, ResponseInfo};

/// Per-snapshot interception parameters.
pub struct InterceptConfig {
    /// Normalized root URL, served from `root_resource` instead of the network.
    pub root_url: String,
    /// The serialized DOM for this snapshot.
    pub root_resource: Arc<Resource>,
    pub policy: HostnamePolicy,
    /// Skip the shared response cache entirely.
    pub disable_cache: bool,
    pub response_cache: Arc<ResponseCache>,
    pub resource_cache: Arc<ResourceCache>,
}

/// Where a tracked request stands between its first event and completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestPhase {
    /// Seen, but no verdict issued yet.
    Pending,
    /// Continued or fulfilled; waiting for loading to finish.
    Allowed,
    /// Denied by policy or the redirect cap.
    Blocked,
}

/// One in-flight request, keyed by its network request id.
#[derive(Debug)]
struct RequestRecord {
    url: String,
    resource_type: Option<String>,
    phase: RequestPhase,
    response: Option<ResponseInfo>,
    /// URLs of prior redirect hops; the first entry is the originally
    /// requested URL that the captured resource is recorded under.
    redirect_chain: Vec<String>,
}

impl RequestRecord {
    fn new(url: &str, resource_type: Option<String>) -> Self {
        Self {
            url: url.to_string(),
            resource_type,
            phase: RequestPhase::Pending,
            response: None,
            redirect_chain: Vec::new(),
        }
    }
}

#[derive(Debug)]
struct CollectedResource {
    resource: Arc<Resource>,
    /// Set when the resource first appeared during a width-tagged pass.
    widths: Option<Vec<u32>>,
}

#[derive(Default)]
struct Collected {
    entries: Vec<CollectedResource>,
    by_url: HashMap<String, usize>,
    warnings: Vec<DiscoveryWarning>,
}

/// State visible outside the event-loop task.
struct Shared {
    in_flight: AtomicUsize,
    /// Current responsive width being captured; 0 means untagged.
    current_width: AtomicU32,
    collected: Mutex<Collected>,
}

/// Installed interceptor for one page.
pub struct Interceptor {
    shared: Arc<Shared>,
    session: Arc<dyn NetworkSession>,
    config: Arc<InterceptConfig>,
    task: JoinHandle<()>,
}

impl Interceptor {
    /// Start consuming `events` from a page's network session.
    pub fn install(
        session: Arc<dyn NetworkSession>,
        events: mpsc::Receiver<NetworkEvent>,
        config: InterceptConfig,
    ) -> Self {
        let shared = Arc::new(Shared {
            in_flight: AtomicUsize::new(0),
            current_width: AtomicU32::new(0),
            collected: Mutex::new(Collected::default()),
        });
        let config = Arc::new(config);

        let task = tokio::spawn(event_loop(
            events,
            session.clone(),
            shared.clone(),
            config.clone(),
        ));

        Self { shared, session, config, task }
    }

    /// Requests currently tracked between first event and completion.
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::SeqCst)
    }

    /// Tag resources discovered from now on with a responsive width.
    /// `None` reverts to untagged capture.
    pub fn set_current_width(&self, width: Option<u32>) {
        self.shared.current_width.store(width.unwrap_or(0), Ordering::SeqCst);
    }

    /// Wait until tracked requests drain and stay drained for the settle
    /// window. Fails fast when the underlying session has closed.
    pub async fn idle(&self, opts: IdleOptions) -> Result<()> {
        let shared = self.shared.clone();
        let session = self.session.clone();

        wait_for_idle(
            move || {
                if let Some(reason) = session.closed_reason() {
                    return Err(Error::TabCrash(reason));
                }
                Ok(shared.in_flight.load(Ordering::SeqCst) == 0)
            },
            opts,
        )
        .await
    }

    /// Stop event processing and return the snapshot's resources, root
    /// first, followed by discovery order.
    pub fn collect(self) -> (Vec<Arc<Resource>>, Vec<DiscoveryWarning>) {
        self.task.abort();

        let collected = std::mem::take(&mut *self.shared.collected.lock());
        let mut resources = Vec::with_capacity(collected.entries.len() + 1);
        resources.push(self.config.root_resource.clone());

        for entry in collected.entries {
            match entry.widths {
                Some(widths) => {
                    let tagged = (*entry.resource).clone().with_widths(widths);
                    resources.push(Arc::new(tagged));
                }
                None => resources.push(entry.resource),
            }
        }

        (resources, collected.warnings)
    }
}

async fn event_loop(
    mut events: mpsc::Receiver<NetworkEvent>,
    session: Arc<dyn NetworkSession>,
    shared: Arc<Shared>,
    config: Arc<InterceptConfig>,
) {
    let mut state = LoopState {
        session,
        shared,
        config,
        pending: HashMap::new(),
        intercepts: HashMap::new(),
        requests: HashMap::new(),
    };

    while let Some(event) = events.recv().await {
        state.handle(event).await;
    }

    // page is gone; reap whatever never completed
    if !state.requests.is_empty() {
        debug!(reaped = state.requests.len(), "Session ended with requests in flight");
        state.requests.clear();
    }
    state.publish();
}

/// The verdict for a paused request, computed without awaiting.
enum Verdict {
    ServeRoot,
    ServeCached(Arc<CachedExchange>),
    Block(&'static str),
    Continue,
}

struct LoopState {
    session: Arc<dyn NetworkSession>,
    shared: Arc<Shared>,
    config: Arc<InterceptConfig>,
    /// request-will-be-sent events waiting for their fetch pause.
    pending: HashMap<String, PendingRequest>,
    /// Fetch pauses waiting for their request-will-be-sent, network id
    /// mapped to intercept id.
    intercepts: HashMap<String, String>,
    /// Tracked in-flight requests.
    requests: HashMap<String, RequestRecord>,
}

struct PendingRequest {
    url: String,
    resource_type: Option<String>,
}

impl LoopState {
    async fn handle(&mut self, event: NetworkEvent) {
        match event {
            NetworkEvent::RequestWillBeSent {
                request_id,
                url,
                resource_type,
                redirect_response,
            } => {
                // data URIs are inlined content, never intercepted
                if url.starts_with("data:") {
                    return;
                }

                if redirect_response.is_some() {
                    if let Some(record) = self.requests.get_mut(&request_id) {
                        let prior = std::mem::replace(&mut record.url, url.clone());
                        record.redirect_chain.push(prior);
                        record.phase = RequestPhase::Pending;
                        record.response = None;
                    }
                }

                if let Some(intercept_id) = self.intercepts.remove(&request_id) {
                    self.decide(request_id, url, resource_type, intercept_id).await;
                } else {
                    self.pending.insert(request_id, PendingRequest { url, resource_type });
                }
            }

            NetworkEvent::RequestPaused { intercept_id, network_id, url } => {
                let Some(network_id) = network_id else {
                    // nothing to pair against, let the browser proceed
                    trace!(url, "Unpaired fetch pause, continuing");
                    self.command(self.session.continue_request(&intercept_id).await);
                    return;
                };

                if let Some(pending) = self.pending.remove(&network_id) {
                    self.decide(network_id, pending.url, pending.resource_type, intercept_id)
                        .await;
                } else {
                    self.intercepts.insert(network_id, intercept_id);
                }
            }

            NetworkEvent::ResponseReceived { request_id, response } => {
                if let Some(record) = self.requests.get_mut(&request_id) {
                    record.response = Some(response);
                }
            }

            NetworkEvent::EventSourceMessage { request_id } => {
                // event streams never finish loading; stop tracking after
                // the first message so idle can settle
                if self.requests.remove(&request_id).is_some() {
                    debug!(request_id, "Untracking event-source request");
                    self.publish();
                }
            }

            NetworkEvent::LoadingFinished { request_id } => {
                self.finish(request_id).await;
            }

            NetworkEvent::LoadingFailed { request_id, error_text, canceled } => {
                self.fail(&request_id, &error_text, canceled);
            }
        }
    }

    /// Issue the verdict for a freshly paired request.
    async fn decide(
        &mut self,
        request_id: String,
        url: String,
        resource_type: Option<String>,
        intercept_id: String,
    ) {
        let over_redirect_cap = {
            let record = self
                .requests
                .entry(request_id.clone())
                .or_insert_with(|| RequestRecord::new(&url, resource_type));
            record.url = url.clone();
            record.redirect_chain.len() >= MAX_REDIRECTS
        };
        self.publish();

        if over_redirect_cap {
            self.warn(&url, format!("redirect chain exceeded {MAX_REDIRECTS} hops"));
            self.command(self.session.abort(&intercept_id, AbortReason::Failed).await);
            self.set_phase(&request_id, RequestPhase::Blocked);
            return;
        }

        let verdict = self.verdict_for(&url);
        match verdict {
            Verdict::ServeRoot => {
                debug!(url, "Serving root resource");
                let body = self.config.root_resource.content.clone();
                self.command(
                    self.session
                        .fulfill(
                            &intercept_id,
                            200,
                            &[("content-type".to_string(), "text/html".to_string())],
                            &body,
                        )
                        .await,
                );
                self.set_phase(&request_id, RequestPhase::Allowed);
            }
            Verdict::ServeCached(exchange) => {
                debug!(url, "Response cache hit");
                self.command(
                    self.session
                        .fulfill(&intercept_id, exchange.status, &exchange.headers, &exchange.body)
                        .await,
                );
                self.set_phase(&request_id, RequestPhase::Allowed);
            }
            Verdict::Block(reason) => {
                // expected policy outcome, logged but never warned
                debug!(url, reason, "Skipping request");
                self.command(self.session.abort(&intercept_id, AbortReason::Aborted).await);
                self.set_phase(&request_id, RequestPhase::Blocked);
            }
            Verdict::Continue => {
                trace!(url, "Continuing request");
                self.command(self.session.continue_request(&intercept_id).await);
                self.set_phase(&request_id, RequestPhase::Allowed);
            }
        }
    }

    fn verdict_for(&self, url: &str) -> Verdict {
        let Ok(parsed) = Url::parse(url) else {
            // not something we can evaluate, let the browser sort it out
            return Verdict::Continue;
        };
        let normalized = {
            let mut stripped = parsed.clone();
            stripped.set_fragment(None);
            stripped.to_string()
        };

        if normalized == self.config.root_url {
            return Verdict::ServeRoot;
        }

        if let PolicyDecision::Block(reason) = self.config.policy.decide(&parsed) {
            return Verdict::Block(match reason {
                argus_common::BlockReason::Disallowed => "disallowed hostname",
                argus_common::BlockReason::NotAllowed => "not an allowed hostname",
            });
        }

        if !self.config.disable_cache {
            if let Some(exchange) = self.config.response_cache.get(&normalized) {
                return Verdict::ServeCached(exchange);
            }
        }

        Verdict::Continue
    }

    /// Materialize a finished request into a resource.
    async fn finish(&mut self, request_id: String) {
        let Some(record) = self.requests.remove(&request_id) else {
            return;
        };
        self.publish();

        if record.phase == RequestPhase::Blocked {
            return;
        }

        // redirected requests are recorded under the originally requested URL
        let origin_url = record
            .redirect_chain
            .first()
            .cloned()
            .unwrap_or_else(|| record.url.clone());
        let Ok(normalized) = normalize_url(&origin_url) else {
            trace!(url = origin_url, "Skipping resource with unparseable URL");
            return;
        };

        if normalized == self.config.root_url {
            return;
        }

        if !self.config.disable_cache {
            if let Some(exchange) = self.config.response_cache.get(&normalized) {
                self.register(exchange.resource.clone());
                return;
            }
        }

        let Some(response) = record.response else {
            debug!(url = %normalized, "Skipping resource with no response");
            return;
        };

        if !ALLOWED_STATUSES.contains(&response.status) {
            if response.status >= 400 {
                self.warn(&normalized, format!("request failed with status {}", response.status));
            } else {
                debug!(url = %normalized, status = response.status, "Skipping uncaptured status");
            }
            return;
        }

        let body = match self.session.response_body(&request_id).await {
            Ok(body) => body,
            Err(err) => {
                self.warn(&normalized, format!("could not read response body: {err}"));
                return;
            }
        };

        if body.is_empty() {
            debug!(url = %normalized, "Skipping empty response body");
            return;
        }
        if body.len() > MAX_RESOURCE_SIZE {
            self.warn(
                &normalized,
                format!("resource is {} bytes, over the {} byte limit", body.len(), MAX_RESOURCE_SIZE),
            );
            return;
        }

        let mimetype = mimetype_of(response.mimetype.as_deref());
        let resource = Arc::new(Resource::new(normalized.clone(), body.clone(), mimetype));
        debug!(
            url = %normalized,
            sha = %resource.sha(),
            mimetype = %resource.mimetype,
            resource_type = record.resource_type.as_deref().unwrap_or("Other"),
            "Captured resource"
        );

        // first writer wins; later identical content resolves to the winner
        let resource = self.config.resource_cache.put(resource);

        if !self.config.disable_cache {
            self.config.response_cache.put(
                normalized,
                Arc::new(CachedExchange {
                    status: response.status,
                    headers: split_multiline_headers(&response.headers),
                    body,
                    resource: resource.clone(),
                }),
            );
        }

        self.register(resource);
    }

    fn fail(&mut self, request_id: &str, error_text: &str, canceled: bool) {
        let Some(record) = self.requests.remove(request_id) else {
            return;
        };
        self.publish();

        if record.phase == RequestPhase::Blocked {
            trace!(url = record.url, "Blocked request settled");
        } else if canceled || error_text == "net::ERR_ABORTED" {
            trace!(url = record.url, "Request canceled");
        } else if error_text == "net::ERR_FAILED" {
            // generic failure code, the cause was already logged
            debug!(url = record.url, "Request failed");
        } else {
            self.warn(&record.url, error_text.to_string());
        }
    }

    /// Add a resource to the snapshot, tagging it with the current
    /// responsive width when one is active. The first discovery of a URL
    /// owns its content; later passes only extend its width tags.
    fn register(&self, resource: Arc<Resource>) {
        let width = match self.shared.current_width.load(Ordering::SeqCst) {
            0 => None,
            w => Some(w),
        };

        let mut collected = self.shared.collected.lock();
        if let Some(&idx) = collected.by_url.get(resource.url.as_str()) {
            if let Some(w) = width {
                if let Some(widths) = &mut collected.entries[idx].widths {
                    if !widths.contains(&w) {
                        widths.push(w);
                    }
                }
            }
            return;
        }

        debug!(url = %resource.url, "Discovered resource");
        let idx = collected.entries.len();
        collected.by_url.insert(resource.url.clone(), idx);
        collected.entries.push(CollectedResource {
            resource,
            widths: width.map(|w| vec![w]),
        });
    }

    fn warn(&self, url: &str, reason: String) {
        debug!(url, reason, "Discovery warning");
        self.shared.collected.lock().warnings.push(DiscoveryWarning {
            url: url.to_string(),
            reason,
        });
    }

    fn set_phase(&mut self, request_id: &str, phase: RequestPhase) {
        if let Some(record) = self.requests.get_mut(request_id) {
            record.phase = phase;
        }
    }

    fn publish(&self) {
        self.shared.in_flight.store(self.requests.len(), Ordering::SeqCst);
    }

    fn command(&self, result: Result<()>) {
        if let Err(err) = result {
            debug!("Network command failed: {err}");
        }
    }
}

/// Devtools reports repeated headers joined by newlines; a fulfilled
/// response must carry them as separate entries or the browser hangs.
fn split_multiline_headers(headers: &[(String, String)]) -> Vec<(String, String)> {
    let mut split = Vec::with_capacity(headers.len());
    for (name, value) in headers {
        for part in value.split('\n') {
            split.push((name.clone(), part.to_string()));
        }
    }
    split
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::AbortReason;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::time::Duration;

    use argus_common::HostnamePattern;

    const ROOT_URL: &str = "https://app.example.com/";
    const ROOT_DOM: &str = "<html><body>captured</body></html>";

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Command {
        Continue(String),
        Fulfill { id: String, status: u16, body: Vec<u8> },
        Abort(String, AbortReason),
    }

    #[derive(Default)]
    struct FakeSession {
        commands: Mutex<Vec<Command>>,
        bodies: Mutex<HashMap<String, Bytes>>,
        closed: Mutex<Option<String>>,
    }

    impl FakeSession {
        fn commands(&self) -> Vec<Command> {
            self.commands.lock().clone()
        }

        fn set_body(&self, request_id: &str, body: impl Into<Bytes>) {
            self.bodies.lock().insert(request_id.to_string(), body.into());
        }
    }

    #[async_trait]
    impl NetworkSession for FakeSession {
        async fn continue_request(&self, intercept_id: &str) -> Result<()> {
            self.commands.lock().push(Command::Continue(intercept_id.to_string()));
            Ok(())
        }

        async fn fulfill(
            &self,
            intercept_id: &str,
            status: u16,
            _headers: &[(String, String)],
            body: &[u8],
        ) -> Result<()> {
            self.commands.lock().push(Command::Fulfill {
                id: intercept_id.to_string(),
                status,
                body: body.to_vec(),
            });
            Ok(())
        }

        async fn abort(&self, intercept_id: &str, reason: AbortReason) -> Result<()> {
            self.commands.lock().push(Command::Abort(intercept_id.to_string(), reason));
            Ok(())
        }

        async fn response_body(&self, request_id: &str) -> Result<Bytes> {
            self.bodies
                .lock()
                .get(request_id)
                .cloned()
                .ok_or_else(|| Error::Protocol(format!("no body recorded for {request_id}")))
        }

        fn closed_reason(&self) -> Option<String> {
            self.closed.lock().clone()
        }
    }

    struct Harness {
        interceptor: Interceptor,
        events: mpsc::Sender<NetworkEvent>,
        session: Arc<FakeSession>,
        response_cache: Arc<ResponseCache>,
        resource_cache: Arc<ResourceCache>,
    }

    fn harness(allowed: &[&str], disallowed: &[&str]) -> Harness {
        harness_with_caches(
            allowed,
            disallowed,
            Arc::new(ResponseCache::new()),
            Arc::new(ResourceCache::new()),
        )
    }

    fn harness_with_caches(
        allowed: &[&str],
        disallowed: &[&str],
        response_cache: Arc<ResponseCache>,
        resource_cache: Arc<ResourceCache>,
    ) -> Harness {
        let root = Url::parse(ROOT_URL).unwrap();
        let parse = |patterns: &[&str]| {
            patterns
                .iter()
                .map(|p| HostnamePattern::parse(p).unwrap())
                .collect::<Vec<_>>()
        };
        let policy = HostnamePolicy::new(parse(allowed), parse(disallowed), &root);

        let session = Arc::new(FakeSession::default());
        let (tx, rx) = mpsc::channel(64);

        let interceptor = Interceptor::install(
            session.clone(),
            rx,
            InterceptConfig {
                root_url: ROOT_URL.to_string(),
                root_resource: Arc::new(Resource::root(ROOT_URL, ROOT_DOM)),
                policy,
                disable_cache: false,
                response_cache: response_cache.clone(),
                resource_cache: resource_cache.clone(),
            },
        );

        Harness { interceptor, events: tx, session, response_cache, resource_cache }
    }

    impl Harness {
        async fn send(&self, event: NetworkEvent) {
            self.events.send(event).await.unwrap();
        }

        /// Drive a full successful exchange through the interceptor.
        async fn exchange(&self, id: &str, url: &str, status: u16, mimetype: &str, body: &str) {
            self.session.set_body(id, body.as_bytes().to_vec());
            self.send(will_be_sent(id, url)).await;
            self.send(paused(&format!("i-{id}"), id, url)).await;
            self.send(response(id, status, mimetype)).await;
            self.send(finished(id)).await;
        }

        async fn wait_until(&self, what: &str, cond: impl Fn() -> bool) {
            // yield so the spawned event loop can drain queued events
            // before the first check
            tokio::task::yield_now().await;
            for _ in 0..500 {
                if cond() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
            panic!("timed out waiting for {what}");
        }

        async fn wait_for_commands(&self, n: usize) {
            let session = self.session.clone();
            self.wait_until("commands", move || session.commands.lock().len() >= n).await;
        }

        async fn wait_for_drain(&self) {
            let shared = self.interceptor.shared.clone();
            self.wait_until("drain", move || shared.in_flight.load(Ordering::SeqCst) == 0).await;
        }
    }

    fn will_be_sent(id: &str, url: &str) -> NetworkEvent {
        NetworkEvent::RequestWillBeSent {
            request_id: id.to_string(),
            url: url.to_string(),
            resource_type: None,
            redirect_response: None,
        }
    }

    fn redirect_hop(id: &str, url: &str, status: u16) -> NetworkEvent {
        NetworkEvent::RequestWillBeSent {
            request_id: id.to_string(),
            url: url.to_string(),
            resource_type: None,
            redirect_response: Some(ResponseInfo { status, ..Default::default() }),
        }
    }

    fn paused(intercept_id: &str, network_id: &str, url: &str) -> NetworkEvent {
        NetworkEvent::RequestPaused {
            intercept_id: intercept_id.to_string(),
            network_id: Some(network_id.to_string()),
            url: url.to_string(),
        }
    }

    fn response(id: &str, status: u16, mimetype: &str) -> NetworkEvent {
        NetworkEvent::ResponseReceived {
            request_id: id.to_string(),
            response: ResponseInfo {
                status,
                headers: vec![("content-type".to_string(), mimetype.to_string())],
                mimetype: Some(mimetype.to_string()),
            },
        }
    }

    fn finished(id: &str) -> NetworkEvent {
        NetworkEvent::LoadingFinished { request_id: id.to_string() }
    }

    fn failed(id: &str, error_text: &str, canceled: bool) -> NetworkEvent {
        NetworkEvent::LoadingFailed {
            request_id: id.to_string(),
            error_text: error_text.to_string(),
            canceled,
        }
    }

    #[tokio::test]
    async fn root_request_is_served_the_dom() {
        let h = harness(&[], &[]);

        h.send(will_be_sent("1", ROOT_URL)).await;
        h.send(paused("i-1", "1", ROOT_URL)).await;
        h.wait_for_commands(1).await;

        assert_eq!(
            h.session.commands(),
            vec![Command::Fulfill {
                id: "i-1".to_string(),
                status: 200,
                body: ROOT_DOM.as_bytes().to_vec(),
            }]
        );

        h.send(response("1", 200, "text/html")).await;
        h.send(finished("1")).await;
        h.wait_for_drain().await;

        let (resources, warnings) = h.interceptor.collect();
        assert_eq!(resources.len(), 1);
        assert!(resources[0].is_root);
        assert!(warnings.is_empty());
    }

    #[tokio::test]
    async fn disallowed_host_is_aborted_without_a_resource() {
        let h = harness(&[], &["tracker.example.com"]);

        let url = "https://tracker.example.com/px.gif";
        h.send(will_be_sent("1", url)).await;
        h.send(paused("i-1", "1", url)).await;
        h.wait_for_commands(1).await;

        assert_eq!(
            h.session.commands(),
            vec![Command::Abort("i-1".to_string(), AbortReason::Aborted)]
        );

        h.send(failed("1", "net::ERR_BLOCKED_BY_CLIENT", false)).await;
        h.wait_for_drain().await;

        let (resources, warnings) = h.interceptor.collect();
        assert_eq!(resources.len(), 1, "only the root resource remains");
        assert!(warnings.is_empty(), "policy blocks are silent");
    }

    #[tokio::test]
    async fn self_origin_bypasses_the_allow_list() {
        let h = harness(&["cdn.example.com"], &[]);

        let own = "https://app.example.com/app.js";
        h.send(will_be_sent("1", own)).await;
        h.send(paused("i-1", "1", own)).await;

        let other = "https://other.example.com/x.js";
        h.send(will_be_sent("2", other)).await;
        h.send(paused("i-2", "2", other)).await;

        h.wait_for_commands(2).await;
        assert_eq!(
            h.session.commands(),
            vec![
                Command::Continue("i-1".to_string()),
                Command::Abort("i-2".to_string(), AbortReason::Aborted),
            ]
        );
    }

    #[tokio::test]
    async fn completed_responses_become_cached_resources() {
        let h = harness(&[], &[]);

        let url = "https://cdn.example.com/app.css";
        h.exchange("1", url, 200, "text/css", "body { color: red }").await;
        h.wait_for_drain().await;

        assert!(h.response_cache.has(url));
        assert_eq!(h.resource_cache.len(), 1);

        let (resources, warnings) = h.interceptor.collect();
        assert!(warnings.is_empty());
        assert_eq!(resources.len(), 2);
        assert!(resources[0].is_root);
        assert_eq!(resources[1].url, url);
        assert_eq!(resources[1].mimetype, "text/css");
    }

    #[tokio::test]
    async fn pairing_works_in_either_arrival_order() {
        let h = harness(&[], &[]);

        // pause first, then the network event
        let a = "https://app.example.com/a.js";
        h.send(paused("i-1", "1", a)).await;
        h.send(will_be_sent("1", a)).await;

        // network event first, then the pause
        let b = "https://app.example.com/b.js";
        h.send(will_be_sent("2", b)).await;
        h.send(paused("i-2", "2", b)).await;

        h.wait_for_commands(2).await;
        let commands = h.session.commands();
        assert!(commands.contains(&Command::Continue("i-1".to_string())));
        assert!(commands.contains(&Command::Continue("i-2".to_string())));
    }

    #[tokio::test]
    async fn redirects_record_the_resource_under_the_original_url() {
        let h = harness(&[], &[]);

        let original = "https://app.example.com/logo.png";
        let moved = "https://app.example.com/static/logo-v2.png";

        h.send(will_be_sent("1", original)).await;
        h.send(paused("i-1", "1", original)).await;
        h.send(redirect_hop("1", moved, 301)).await;
        h.send(paused("i-2", "1", moved)).await;

        h.session.set_body("1", "png-bytes");
        h.send(response("1", 200, "image/png")).await;
        h.send(finished("1")).await;
        h.wait_for_drain().await;

        let (resources, _) = h.interceptor.collect();
        assert_eq!(resources.len(), 2);
        assert_eq!(resources[1].url, original);
        assert_eq!(resources[1].content, Bytes::from("png-bytes"));
    }

    #[tokio::test]
    async fn event_source_requests_are_untracked_after_first_message() {
        let h = harness(&[], &[]);

        let url = "https://app.example.com/events";
        h.send(will_be_sent("1", url)).await;
        h.send(paused("i-1", "1", url)).await;
        h.wait_for_commands(1).await;
        assert_eq!(h.interceptor.in_flight(), 1);

        h.send(NetworkEvent::EventSourceMessage { request_id: "1".to_string() }).await;
        h.wait_for_drain().await;
        assert_eq!(h.interceptor.in_flight(), 0);
    }

    #[tokio::test]
    async fn oversized_bodies_are_skipped_with_a_warning() {
        let h = harness(&[], &[]);

        let url = "https://app.example.com/huge.bin";
        h.session.set_body("1", vec![0u8; MAX_RESOURCE_SIZE + 1]);
        h.send(will_be_sent("1", url)).await;
        h.send(paused("i-1", "1", url)).await;
        h.send(response("1", 200, "application/octet-stream")).await;
        h.send(finished("1")).await;
        h.wait_for_drain().await;

        let (resources, warnings) = h.interceptor.collect();
        assert_eq!(resources.len(), 1);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].reason.contains("over the"));
    }

    #[tokio::test]
    async fn empty_bodies_are_skipped_silently() {
        let h = harness(&[], &[]);

        let url = "https://app.example.com/empty.js";
        h.exchange("1", url, 200, "application/javascript", "").await;
        h.wait_for_drain().await;

        let (resources, warnings) = h.interceptor.collect();
        assert_eq!(resources.len(), 1);
        assert!(warnings.is_empty());
    }

    #[tokio::test]
    async fn error_statuses_are_not_captured() {
        let h = harness(&[], &[]);

        h.session.set_body("1", "not found page");
        h.send(will_be_sent("1", "https://app.example.com/gone.css")).await;
        h.send(paused("i-1", "1", "https://app.example.com/gone.css")).await;
        h.send(response("1", 404, "text/html")).await;
        h.send(finished("1")).await;

        // 204 is outside the allowed set but below 400, skipped silently
        h.session.set_body("2", "");
        h.send(will_be_sent("2", "https://app.example.com/beacon")).await;
        h.send(paused("i-2", "2", "https://app.example.com/beacon")).await;
        h.send(response("2", 204, "text/plain")).await;
        h.send(finished("2")).await;
        h.wait_for_drain().await;

        let (resources, warnings) = h.interceptor.collect();
        assert_eq!(resources.len(), 1, "only the root resource remains");
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].reason.contains("status 404"));
    }

    #[tokio::test]
    async fn transport_failures_are_recorded_as_warnings() {
        let h = harness(&[], &[]);

        let url = "https://app.example.com/flaky.js";
        h.send(will_be_sent("1", url)).await;
        h.send(paused("i-1", "1", url)).await;
        h.send(failed("1", "net::ERR_NAME_NOT_RESOLVED", false)).await;
        h.wait_for_drain().await;

        let (resources, warnings) = h.interceptor.collect();
        assert_eq!(resources.len(), 1);
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].url, url);
        assert!(warnings[0].reason.contains("ERR_NAME_NOT_RESOLVED"));
    }

    #[tokio::test]
    async fn cached_responses_are_replayed_and_counted_for_the_snapshot() {
        let shared_response_cache = Arc::new(ResponseCache::new());
        let shared_resource_cache = Arc::new(ResourceCache::new());

        let url = "https://cdn.example.com/shared.css";

        // first page captures the resource from the network
        let first = harness_with_caches(
            &[],
            &[],
            shared_response_cache.clone(),
            shared_resource_cache.clone(),
        );
        first.exchange("1", url, 200, "text/css", ".a{}").await;
        first.wait_for_drain().await;
        let (resources, _) = first.interceptor.collect();
        assert_eq!(resources.len(), 2);

        // second page gets a cache fulfillment, no network round trip
        let second = harness_with_caches(
            &[],
            &[],
            shared_response_cache.clone(),
            shared_resource_cache.clone(),
        );
        second.send(will_be_sent("9", url)).await;
        second.send(paused("i-9", "9", url)).await;
        second.wait_for_commands(1).await;

        match &second.session.commands()[0] {
            Command::Fulfill { status, body, .. } => {
                assert_eq!(*status, 200);
                assert_eq!(body, b".a{}");
            }
            other => panic!("expected fulfill, got {other:?}"),
        }

        second.send(response("9", 200, "text/css")).await;
        second.send(finished("9")).await;
        second.wait_for_drain().await;

        let (resources, _) = second.interceptor.collect();
        assert_eq!(resources.len(), 2, "replayed response still joins the snapshot");
        assert_eq!(resources[1].url, url);
        // content was deduplicated, not re-captured
        assert_eq!(shared_resource_cache.len(), 1);
    }

    #[tokio::test]
    async fn responsive_passes_tag_new_resources_with_the_width() {
        let h = harness(&[], &[]);

        h.exchange("1", "https://app.example.com/base.css", 200, "text/css", "base").await;
        h.wait_for_drain().await;

        h.interceptor.set_current_width(Some(768));
        h.exchange("2", "https://app.example.com/tablet.css", 200, "text/css", "tablet").await;
        h.wait_for_drain().await;

        let (resources, _) = h.interceptor.collect();
        assert_eq!(resources.len(), 3);

        let base = resources.iter().find(|r| r.url.ends_with("base.css")).unwrap();
        assert_eq!(base.for_widths, None);

        let tablet = resources.iter().find(|r| r.url.ends_with("tablet.css")).unwrap();
        assert_eq!(tablet.for_widths, Some(vec![768]));
    }
}
