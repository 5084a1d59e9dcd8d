//! Page network session seam.
//!
//! The interceptor consumes devtools network activity as a stream of
//! [`NetworkEvent`]s and answers paused requests through the
//! [`NetworkSession`] trait. The production implementation sits on top of
//! the devtools transport in [`crate::protocol`]; tests drive the
//! interceptor with scripted events and a recording session.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

/// Response metadata reported by the browser.
#[derive(Debug, Clone, Default)]
pub struct ResponseInfo {
    pub status: u16,
    /// Header names are kept as received; values may contain newlines when
    /// the browser joins repeated headers.
    pub headers: Vec<(String, String)>,
    pub mimetype: Option<String>,
}

/// Network activity relevant to asset discovery, in browser order.
#[derive(Debug, Clone)]
pub enum NetworkEvent {
    /// A request is about to leave the page. When `redirect_response` is
    /// set, this event also carries the response that redirected the
    /// request with the same id.
    RequestWillBeSent {
        request_id: String,
        url: String,
        resource_type: Option<String>,
        redirect_response: Option<ResponseInfo>,
    },

    /// An intercepted request is paused awaiting a verdict. `network_id`
    /// ties the pause back to its `RequestWillBeSent` counterpart.
    RequestPaused {
        intercept_id: String,
        network_id: Option<String>,
        url: String,
    },

    /// Response headers arrived for an in-flight request.
    ResponseReceived {
        request_id: String,
        response: ResponseInfo,
    },

    /// An event-source stream delivered a message. These requests never
    /// finish loading, so the first message unblocks idle tracking.
    EventSourceMessage { request_id: String },

    /// The request completed and its body can be fetched.
    LoadingFinished { request_id: String },

    /// The request failed or was aborted by the browser.
    LoadingFailed {
        request_id: String,
        error_text: String,
        canceled: bool,
    },
}

/// How to dispose of a paused request that will not be continued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// A processing error occurred while handling the request.
    Failed,
    /// The request was deliberately skipped, e.g. by hostname policy.
    Aborted,
}

/// Command surface of one page's network domain.
///
/// Implementations must tolerate commands racing page teardown; a request
/// that disappeared before its verdict arrives is not an error worth
/// failing discovery over, so implementations map those to `Ok(())`.
#[async_trait]
pub trait NetworkSession: Send + Sync {
    /// Let a paused request through to the network untouched.
    async fn continue_request(&self, intercept_id: &str) -> Result<()>;

    /// Answer a paused request with a synthetic response.
    async fn fulfill(
        &self,
        intercept_id: &str,
        status: u16,
        headers: &[(String, String)],
        body: &[u8],
    ) -> Result<()>;

    /// Fail or abort a paused request.
    async fn abort(&self, intercept_id: &str, reason: AbortReason) -> Result<()>;

    /// Fetch the response body of a finished request.
    async fn response_body(&self, request_id: &str) -> Result<Bytes>;

    /// Why the session stopped, if it has. A crashed or detached page
    /// reports its reason here so idle waits can fail fast.
    fn closed_reason(&self) -> Option<String>;
}
