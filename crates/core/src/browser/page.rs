//! One browser page and its devtools session.
//!
//! A page owns a routing task that watches its session's event stream:
//! navigation and execution-context bookkeeping stays here, network and
//! fetch events are translated and forwarded to whoever called
//! [`Page::intercept`]. The [`PageSession`] half implements the network
//! command surface the interceptor drives.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::protocol::{CdpConnection, CdpEvent};
use crate::session::{AbortReason, NetworkEvent, NetworkSession, ResponseInfo};

struct PageShared {
    target_id: String,
    closed: Mutex<Option<String>>,
    context_id: Mutex<Option<i64>>,
    navigated: AtomicBool,
    lifecycle: Mutex<Vec<String>>,
    network_tx: Mutex<Option<mpsc::Sender<NetworkEvent>>>,
}

impl PageShared {
    fn new(target_id: String) -> Self {
        Self {
            target_id,
            closed: Mutex::new(None),
            context_id: Mutex::new(None),
            navigated: AtomicBool::new(false),
            lifecycle: Mutex::new(Vec::new()),
            network_tx: Mutex::new(None),
        }
    }

    fn begin_navigation(&self) {
        self.navigated.store(false, Ordering::SeqCst);
        self.lifecycle.lock().clear();
    }

    fn navigation_done(&self, wait_until: &str) -> bool {
        self.navigated.load(Ordering::SeqCst)
            && self.lifecycle.lock().iter().any(|name| name == wait_until)
    }

    fn mark_closed(&self, reason: &str) {
        let mut closed = self.closed.lock();
        if closed.is_none() {
            *closed = Some(reason.to_string());
        }
    }
}

/// An attached page target.
pub struct Page {
    connection: Arc<CdpConnection>,
    session_id: String,
    target_id: String,
    shared: Arc<PageShared>,
    router: JoinHandle<()>,
}

impl Page {
    pub(super) async fn open(
        connection: Arc<CdpConnection>,
        enable_javascript: bool,
    ) -> Result<Self> {
        let created = connection
            .send("Target.createTarget", None, json!({ "url": "about:blank" }))
            .await?;
        let target_id = created["targetId"]
            .as_str()
            .ok_or_else(|| Error::Protocol("Target.createTarget: missing targetId".to_string()))?
            .to_string();

        let attached = connection
            .send(
                "Target.attachToTarget",
                None,
                json!({ "targetId": target_id, "flatten": true }),
            )
            .await?;
        let session_id = attached["sessionId"]
            .as_str()
            .ok_or_else(|| Error::Protocol("Target.attachToTarget: missing sessionId".to_string()))?
            .to_string();

        let events = connection.attach(&session_id);
        let shared = Arc::new(PageShared::new(target_id.clone()));
        let router = tokio::spawn(route_events(
            events,
            connection.clone(),
            session_id.clone(),
            shared.clone(),
        ));

        let page = Self {
            connection,
            session_id,
            target_id,
            shared,
            router,
        };

        for (method, params) in [
            ("Page.enable", json!({})),
            ("Page.setLifecycleEventsEnabled", json!({ "enabled": true })),
            ("Security.setIgnoreCertificateErrors", json!({ "ignore": true })),
            (
                "Emulation.setScriptExecutionDisabled",
                json!({ "value": !enable_javascript }),
            ),
            (
                "Target.setAutoAttach",
                json!({ "autoAttach": true, "flatten": true, "waitForDebuggerOnStart": false }),
            ),
            ("Runtime.enable", json!({})),
        ] {
            page.send(method, params).await?;
        }

        debug!(target = %page.target_id, "Page ready");
        Ok(page)
    }

    /// Enable network interception and return the event stream to feed an
    /// interceptor. From this point every request pauses until a verdict.
    pub async fn intercept(&self) -> Result<mpsc::Receiver<NetworkEvent>> {
        let (tx, rx) = mpsc::channel(256);
        *self.shared.network_tx.lock() = Some(tx);

        self.send("Network.enable", json!({})).await?;
        self.send(
            "Fetch.enable",
            json!({ "handleAuthRequests": true, "patterns": [{ "urlPattern": "*" }] }),
        )
        .await?;
        Ok(rx)
    }

    /// Command surface for the interceptor, shareable across tasks.
    pub fn session(&self) -> Arc<PageSession> {
        Arc::new(PageSession {
            connection: self.connection.clone(),
            session_id: self.session_id.clone(),
            shared: self.shared.clone(),
        })
    }

    pub async fn resize(&self, width: u32, height: u32) -> Result<()> {
        debug!(width, height, "Resizing viewport");
        self.send(
            "Emulation.setDeviceMetricsOverride",
            json!({ "width": width, "height": height, "deviceScaleFactor": 1, "mobile": false }),
        )
        .await?;
        Ok(())
    }

    /// Navigate and wait for the frame to land and fire its load event.
    pub async fn goto(&self, url: &str, timeout: Duration) -> Result<()> {
        debug!(url, "Navigating");
        self.shared.begin_navigation();

        let result = self.send("Page.navigate", json!({ "url": url })).await?;
        if let Some(error_text) = result["errorText"].as_str() {
            if !error_text.is_empty() {
                return Err(Error::Browser(format!("Navigation failed: {error_text}")));
            }
        }

        let deadline = Instant::now() + timeout;
        loop {
            if let Some(reason) = self.closed_reason() {
                return Err(Error::TabCrash(reason));
            }
            if self.shared.navigation_done("load") {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::Browser(format!(
                    "Navigation failed: timed out after {timeout:?} for {url}"
                )));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Call a function in the page's main execution context and return its
    /// value.
    pub async fn eval(&self, function: &str) -> Result<Value> {
        let context_id = self.wait_for_context(Duration::from_secs(5)).await?;
        let result = self
            .send(
                "Runtime.callFunctionOn",
                json!({
                    "functionDeclaration": function,
                    "executionContextId": context_id,
                    "returnByValue": true,
                    "awaitPromise": true,
                    "userGesture": true,
                }),
            )
            .await?;

        if let Some(exception) = result.get("exceptionDetails").filter(|v| !v.is_null()) {
            let description = exception["exception"]["description"]
                .as_str()
                .or_else(|| exception["text"].as_str())
                .unwrap_or("unknown evaluation error");
            return Err(Error::Browser(format!("Evaluation failed: {description}")));
        }
        Ok(result["result"]["value"].clone())
    }

    /// Serialize the live document, doctype included.
    pub async fn dom(&self) -> Result<String> {
        let value = self
            .eval("() => new XMLSerializer().serializeToString(document)")
            .await?;
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| Error::Browser("DOM serialization returned no string".to_string()))
    }

    pub fn closed_reason(&self) -> Option<String> {
        self.shared
            .closed
            .lock()
            .clone()
            .or_else(|| self.connection.closed_reason())
    }

    /// Close the target and stop routing. Safe to call on a crashed page.
    pub async fn close(&self) {
        self.shared.mark_closed("Page closed.");
        *self.shared.network_tx.lock() = None;

        let _ = self
            .connection
            .send(
                "Target.closeTarget",
                None,
                json!({ "targetId": self.target_id }),
            )
            .await;
        self.connection.detach(&self.session_id);
        self.router.abort();
    }

    async fn send(&self, method: &str, params: Value) -> Result<Value> {
        if let Some(reason) = self.closed_reason() {
            return Err(Error::Protocol(format!("{method}: {reason}")));
        }
        self.connection
            .send(method, Some(&self.session_id), params)
            .await
    }

    async fn wait_for_context(&self, timeout: Duration) -> Result<i64> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(reason) = self.closed_reason() {
                return Err(Error::TabCrash(reason));
            }
            if let Some(id) = *self.shared.context_id.lock() {
                return Ok(id);
            }
            if Instant::now() >= deadline {
                return Err(Error::Browser(
                    "Unable to evaluate script, no execution context".to_string(),
                ));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        self.router.abort();
    }
}

/// The network command half of a page, handed to the interceptor.
pub struct PageSession {
    connection: Arc<CdpConnection>,
    session_id: String,
    shared: Arc<PageShared>,
}

impl PageSession {
    async fn send(&self, method: &str, params: Value) -> Result<Value> {
        if let Some(reason) = self.closed_reason() {
            return Err(Error::Protocol(format!("{method}: {reason}")));
        }
        self.connection
            .send(method, Some(&self.session_id), params)
            .await
    }
}

#[async_trait]
impl NetworkSession for PageSession {
    async fn continue_request(&self, intercept_id: &str) -> Result<()> {
        swallow_gone(
            self.send("Fetch.continueRequest", json!({ "requestId": intercept_id }))
                .await,
        )
    }

    async fn fulfill(
        &self,
        intercept_id: &str,
        status: u16,
        headers: &[(String, String)],
        body: &[u8],
    ) -> Result<()> {
        let header_entries: Vec<Value> = headers
            .iter()
            .map(|(name, value)| json!({ "name": name, "value": value }))
            .collect();

        swallow_gone(
            self.send(
                "Fetch.fulfillRequest",
                json!({
                    "requestId": intercept_id,
                    "responseCode": status,
                    "responseHeaders": header_entries,
                    "body": BASE64.encode(body),
                }),
            )
            .await,
        )
    }

    async fn abort(&self, intercept_id: &str, reason: AbortReason) -> Result<()> {
        let error_reason = match reason {
            AbortReason::Failed => "Failed",
            AbortReason::Aborted => "Aborted",
        };
        swallow_gone(
            self.send(
                "Fetch.failRequest",
                json!({ "requestId": intercept_id, "errorReason": error_reason }),
            )
            .await,
        )
    }

    async fn response_body(&self, request_id: &str) -> Result<Bytes> {
        let result = self
            .send("Network.getResponseBody", json!({ "requestId": request_id }))
            .await?;

        let body = result["body"].as_str().unwrap_or_default();
        if result["base64Encoded"].as_bool().unwrap_or(false) {
            let decoded = BASE64.decode(body).map_err(|e| {
                Error::Protocol(format!("Network.getResponseBody: invalid base64: {e}"))
            })?;
            Ok(Bytes::from(decoded))
        } else {
            Ok(Bytes::copy_from_slice(body.as_bytes()))
        }
    }

    fn closed_reason(&self) -> Option<String> {
        self.shared
            .closed
            .lock()
            .clone()
            .or_else(|| self.connection.closed_reason())
    }
}

/// Interception commands race page teardown; a request that vanished before
/// the command landed is not a failure.
fn swallow_gone(result: Result<Value>) -> Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(Error::Protocol(message))
            if message.contains("Invalid InterceptionId")
                || message.contains("Invalid state")
                || message.contains("Page closed")
                || message.contains("Session crashed")
                || message.contains("Browser closed") =>
        {
            trace!("Dropping command for a finished request: {message}");
            Ok(())
        }
        Err(err) => Err(err),
    }
}

async fn route_events(
    mut events: mpsc::Receiver<CdpEvent>,
    connection: Arc<CdpConnection>,
    session_id: String,
    shared: Arc<PageShared>,
) {
    while let Some(event) = events.recv().await {
        match event.method.as_str() {
            "Page.frameNavigated" => {
                let frame = &event.params["frame"];
                if frame["id"] == shared.target_id.as_str() && frame["parentId"].is_null() {
                    shared.navigated.store(true, Ordering::SeqCst);
                }
            }
            "Page.lifecycleEvent" => {
                if event.params["frameId"] == shared.target_id.as_str() {
                    if let Some(name) = event.params["name"].as_str() {
                        shared.lifecycle.lock().push(name.to_string());
                    }
                }
            }
            "Runtime.executionContextCreated" => {
                let context = &event.params["context"];
                if context["auxData"]["frameId"] == shared.target_id.as_str() {
                    *shared.context_id.lock() = context["id"].as_i64();
                }
            }
            "Runtime.executionContextDestroyed" => {
                let mut context = shared.context_id.lock();
                if *context == event.params["executionContextId"].as_i64() {
                    *context = None;
                }
            }
            "Runtime.executionContextsCleared" => {
                *shared.context_id.lock() = None;
            }
            "Inspector.targetCrashed" => {
                shared.mark_closed("Session crashed!");
            }
            "Fetch.authRequired" => {
                // never prompt; cancelation comes back as a failed request
                let reply = connection
                    .send(
                        "Fetch.continueWithAuth",
                        Some(&session_id),
                        json!({
                            "requestId": event.params["requestId"],
                            "authChallengeResponse": { "response": "Default" },
                        }),
                    )
                    .await;
                if let Err(err) = reply {
                    debug!("Auth challenge reply failed: {err}");
                }
            }
            _ => {
                if let Some(network_event) = translate_network_event(&event.method, &event.params) {
                    let sender = shared.network_tx.lock().clone();
                    if let Some(tx) = sender {
                        if tx.send(network_event).await.is_err() {
                            *shared.network_tx.lock() = None;
                        }
                    }
                }
            }
        }
    }
    shared.mark_closed("Page closed.");
}

fn translate_network_event(method: &str, params: &Value) -> Option<NetworkEvent> {
    let event = match method {
        "Network.requestWillBeSent" => NetworkEvent::RequestWillBeSent {
            request_id: params["requestId"].as_str()?.to_string(),
            url: params["request"]["url"].as_str()?.to_string(),
            resource_type: params["type"].as_str().map(str::to_string),
            redirect_response: params
                .get("redirectResponse")
                .filter(|v| !v.is_null())
                .map(response_info),
        },
        "Fetch.requestPaused" => NetworkEvent::RequestPaused {
            intercept_id: params["requestId"].as_str()?.to_string(),
            network_id: params["networkId"].as_str().map(str::to_string),
            url: params["request"]["url"].as_str()?.to_string(),
        },
        "Network.responseReceived" => NetworkEvent::ResponseReceived {
            request_id: params["requestId"].as_str()?.to_string(),
            response: response_info(&params["response"]),
        },
        "Network.eventSourceMessageReceived" => NetworkEvent::EventSourceMessage {
            request_id: params["requestId"].as_str()?.to_string(),
        },
        "Network.loadingFinished" => NetworkEvent::LoadingFinished {
            request_id: params["requestId"].as_str()?.to_string(),
        },
        "Network.loadingFailed" => NetworkEvent::LoadingFailed {
            request_id: params["requestId"].as_str()?.to_string(),
            error_text: params["errorText"].as_str().unwrap_or_default().to_string(),
            canceled: params["canceled"].as_bool().unwrap_or(false),
        },
        _ => return None,
    };
    Some(event)
}

fn response_info(value: &Value) -> ResponseInfo {
    let headers = value["headers"]
        .as_object()
        .map(|map| {
            map.iter()
                .map(|(name, v)| {
                    (
                        name.to_ascii_lowercase(),
                        v.as_str().unwrap_or_default().to_string(),
                    )
                })
                .collect()
        })
        .unwrap_or_default();

    ResponseInfo {
        status: value["status"].as_u64().unwrap_or(0) as u16,
        headers,
        mimetype: value["mimeType"].as_str().map(str::to_string),
    }
}
