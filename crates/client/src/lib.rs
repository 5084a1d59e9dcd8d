//! Argus Client
//!
//! HTTP implementation of the core's [`RemoteApi`] trait against the
//! build service's JSON:API. Requests carry the project token and a
//! stable user agent; error responses map onto [`ApiError`] so the
//! retry layer can tell transient trouble from permanent rejection.

mod wire;

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Response, StatusCode};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use argus_common::{ApiConfig, BuildInfo, BuildRef, BuildStatus, Resource, SnapshotRef};
use argus_core::{ApiError, ApiResult, RemoteApi, SnapshotManifest};

use crate::wire::JSON_API_TYPE;

/// Per-request timeout; covers the largest allowed resource upload.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// JSON:API client for the build service.
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(config: &ApiConfig) -> argus_common::Result<Self> {
        let token = HeaderValue::from_str(&format!("Token token={}", config.token))
            .map_err(|_| argus_common::Error::config("API token contains invalid characters"))?;

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, token);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(JSON_API_TYPE));

        let user_agent = config
            .user_agent
            .clone()
            .unwrap_or_else(|| format!("argus/{}", argus_core::VERSION));

        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(user_agent)
            .default_headers(headers)
            .build()
            .map_err(|e| argus_common::Error::config(format!("cannot build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    /// POST a JSON:API document. The body is pre-encoded so the
    /// `application/vnd.api+json` default header stays in effect.
    async fn post<T: Serialize>(&self, path: &str, body: &T) -> ApiResult<Value> {
        let payload = serde_json::to_vec(body)
            .map_err(|e| ApiError::Validation(format!("cannot encode request: {e}")))?;

        let response = self
            .http
            .post(self.url(path))
            .body(payload)
            .send()
            .await
            .map_err(transport)?;
        read_response(response).await
    }

    async fn post_empty(&self, path: &str) -> ApiResult<Value> {
        self.post(path, &Value::Object(Default::default())).await
    }

    async fn get(&self, path: &str) -> ApiResult<Value> {
        let response = self
            .http
            .get(self.url(path))
            .send()
            .await
            .map_err(transport)?;
        read_response(response).await
    }

    fn document(value: Value) -> ApiResult<wire::ResponseDocument> {
        serde_json::from_value(value)
            .map_err(|e| ApiError::Transport(format!("unexpected response shape: {e}")))
    }
}

#[async_trait]
impl RemoteApi for ApiClient {
    async fn create_build(&self, info: &BuildInfo) -> ApiResult<BuildRef> {
        let value = self.post("builds", &wire::build_document(info)).await?;
        let doc = Self::document(value)?;
        debug!(build_id = %doc.data.id, "Build created remotely");
        Ok(doc.build_ref())
    }

    async fn create_snapshot(
        &self,
        build_id: &str,
        manifest: &SnapshotManifest,
    ) -> ApiResult<SnapshotRef> {
        let value = self
            .post(
                &format!("builds/{build_id}/snapshots"),
                &wire::snapshot_document(manifest),
            )
            .await?;
        Ok(Self::document(value)?.snapshot_ref())
    }

    async fn upload_resource(&self, build_id: &str, resource: &Resource) -> ApiResult<()> {
        self.post(
            &format!("builds/{build_id}/resources"),
            &wire::resource_document(resource),
        )
        .await?;
        Ok(())
    }

    async fn finalize_snapshot(&self, snapshot_id: &str) -> ApiResult<()> {
        self.post_empty(&format!("snapshots/{snapshot_id}/finalize"))
            .await?;
        Ok(())
    }

    async fn finalize_build(&self, build_id: &str, all_shards: bool) -> ApiResult<()> {
        let path = if all_shards {
            format!("builds/{build_id}/finalize?all-shards=true")
        } else {
            format!("builds/{build_id}/finalize")
        };
        self.post_empty(&path).await?;
        Ok(())
    }

    async fn get_build_status(&self, build_id: &str) -> ApiResult<BuildStatus> {
        let value = self.get(&format!("builds/{build_id}")).await?;
        Ok(Self::document(value)?.build_status())
    }
}

async fn read_response(response: Response) -> ApiResult<Value> {
    let status = response.status();

    if status.is_success() {
        if status == StatusCode::NO_CONTENT {
            return Ok(Value::Null);
        }
        return response.json().await.map_err(transport);
    }

    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs);

    let body = response.text().await.unwrap_or_default();
    let detail = wire::error_detail(&body).unwrap_or_else(|| {
        status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string()
    });

    Err(classify(status.as_u16(), retry_after, detail))
}

fn classify(status: u16, retry_after: Option<Duration>, detail: String) -> ApiError {
    match status {
        401 | 403 => ApiError::Auth(detail),
        404 => ApiError::NotFound(detail),
        429 => ApiError::RateLimit { retry_after },
        400..=499 => ApiError::Validation(detail),
        _ => ApiError::Server {
            status,
            message: detail,
        },
    }
}

fn transport(err: reqwest::Error) -> ApiError {
    ApiError::Transport(err.to_string())
}
