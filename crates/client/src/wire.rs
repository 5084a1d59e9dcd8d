//! JSON:API wire shapes for the build service.
//!
//! Request documents are typed so the kebab-case field names live in one
//! place. Responses are read leniently through `serde_json::Value`: the
//! service adds attributes over time and the client only cares about a
//! handful of them.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use argus_common::{BuildInfo, BuildRef, BuildStatus, Resource, SnapshotRef};
use argus_core::SnapshotManifest;

pub(crate) const JSON_API_TYPE: &str = "application/vnd.api+json";

#[derive(Serialize)]
pub(crate) struct Document<T> {
    pub data: T,
}

#[derive(Serialize)]
pub(crate) struct BuildData<'a> {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub attributes: BuildAttributes<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct BuildAttributes<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_branch: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_sha: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parallel_nonce: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parallel_total_shards: Option<i64>,
    pub partial: bool,
}

pub(crate) fn build_document(info: &BuildInfo) -> Document<BuildData<'_>> {
    Document {
        data: BuildData {
            kind: "builds",
            attributes: BuildAttributes {
                branch: info.branch.as_deref(),
                target_branch: info.target_branch.as_deref(),
                commit_sha: info.commit_sha.as_deref(),
                parallel_nonce: info.parallel_nonce.as_deref(),
                parallel_total_shards: info.parallel_total,
                partial: info.is_partial(),
            },
        },
    }
}

#[derive(Serialize)]
pub(crate) struct SnapshotData<'a> {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub attributes: SnapshotAttributes<'a>,
    pub relationships: SnapshotRelationships<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct SnapshotAttributes<'a> {
    pub name: &'a str,
    pub widths: &'a [u32],
    pub minimum_height: u32,
    pub enable_javascript: bool,
}

#[derive(Serialize)]
pub(crate) struct SnapshotRelationships<'a> {
    pub resources: ResourceList<'a>,
}

#[derive(Serialize)]
pub(crate) struct ResourceList<'a> {
    pub data: Vec<ResourceData<'a>>,
}

#[derive(Serialize)]
pub(crate) struct ResourceData<'a> {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub id: &'a str,
    pub attributes: ResourceAttributes<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct ResourceAttributes<'a> {
    pub resource_url: &'a str,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub is_root: bool,
    pub mimetype: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub for_widths: Option<&'a [u32]>,
}

pub(crate) fn snapshot_document(manifest: &SnapshotManifest) -> Document<SnapshotData<'_>> {
    let resources = manifest
        .resources
        .iter()
        .map(|resource| ResourceData {
            kind: "resources",
            id: resource.sha(),
            attributes: ResourceAttributes {
                resource_url: &resource.url,
                is_root: resource.is_root,
                mimetype: &resource.mimetype,
                for_widths: resource.for_widths.as_deref(),
            },
        })
        .collect();

    Document {
        data: SnapshotData {
            kind: "snapshots",
            attributes: SnapshotAttributes {
                name: &manifest.name,
                widths: &manifest.widths,
                minimum_height: manifest.min_height,
                enable_javascript: manifest.enable_javascript,
            },
            relationships: SnapshotRelationships {
                resources: ResourceList { data: resources },
            },
        },
    }
}

#[derive(Serialize)]
pub(crate) struct UploadData<'a> {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub id: &'a str,
    pub attributes: UploadAttributes,
}

#[derive(Serialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct UploadAttributes {
    pub base64_content: String,
}

pub(crate) fn resource_document(resource: &Resource) -> Document<UploadData<'_>> {
    Document {
        data: UploadData {
            kind: "resources",
            id: resource.sha(),
            attributes: UploadAttributes {
                base64_content: BASE64.encode(&resource.content),
            },
        },
    }
}

#[derive(Deserialize)]
pub(crate) struct ResponseDocument {
    pub data: ResponseData,
}

#[derive(Deserialize)]
pub(crate) struct ResponseData {
    pub id: String,
    #[serde(default)]
    pub attributes: Value,
    #[serde(default)]
    pub relationships: Value,
}

impl ResponseDocument {
    pub fn build_ref(&self) -> BuildRef {
        BuildRef {
            id: self.data.id.clone(),
            web_url: self.data.attributes["web-url"].as_str().map(str::to_string),
            number: self.data.attributes["build-number"].as_u64(),
        }
    }

    pub fn snapshot_ref(&self) -> SnapshotRef {
        let missing = self.data.relationships["missing-resources"]["data"]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item["id"].as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        SnapshotRef {
            id: self.data.id.clone(),
            missing_shas: missing,
        }
    }

    pub fn build_status(&self) -> BuildStatus {
        let state = self.data.attributes["state"]
            .as_str()
            .unwrap_or("unknown")
            .to_string();
        let is_pending = self.data.attributes["is-pending"]
            .as_bool()
            .unwrap_or(state == "pending");

        BuildStatus {
            is_pending,
            total_snapshots: self.data.attributes["total-snapshots"].as_u64().unwrap_or(0),
            state,
        }
    }
}

/// Pull the first human-readable message out of a JSON:API error body.
pub(crate) fn error_detail(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    let first = value["errors"].as_array()?.first()?;
    let detail = first["detail"].as_str().or_else(|| first["title"].as_str())?;
    Some(detail.to_string())
}
