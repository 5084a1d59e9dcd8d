//! Resource model
//!
//! A resource is one discovered network asset: the serialized root DOM or
//! any stylesheet, script, image, font, or fetch payload the page depends
//! on. Resources are identified by URL within a snapshot and by content
//! hash across a build.

use crate::{Error, Result};
use bytes::Bytes;
use once_cell::sync::OnceCell;
use sha2::{Digest, Sha256};
use url::Url;

/// Resources above this size are discarded with a warning and never
/// uploaded.
pub const MAX_RESOURCE_SIZE: usize = 15 * 1024 * 1024;

/// Response statuses worth capturing. Redirect statuses are kept so the
/// final hop of a redirect chain resolves to a capturable response.
pub const ALLOWED_STATUSES: [u16; 7] = [200, 201, 301, 302, 304, 307, 308];

/// Redirect chains longer than this are abandoned.
pub const MAX_REDIRECTS: usize = 20;

/// Compute the sha256 hex digest of a byte buffer.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Normalize a URL for use as a resource identity: fragments are stripped
/// so `page#top` and `page#bottom` resolve to one resource.
pub fn normalize_url(url: &str) -> Result<String> {
    let mut parsed = Url::parse(url).map_err(|e| Error::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;
    parsed.set_fragment(None);
    Ok(parsed.to_string())
}

/// One discovered asset with its content and metadata.
#[derive(Debug, Clone)]
pub struct Resource {
    /// Normalized absolute URL, the identity key within one capture
    pub url: String,
    /// Raw response body
    pub content: Bytes,
    /// From the response content-type header, up to the first `;`
    pub mimetype: String,
    /// True for exactly one resource per snapshot, the serialized DOM
    pub is_root: bool,
    /// Responsive widths this resource applies to, when width-specific
    pub for_widths: Option<Vec<u32>>,
    sha: OnceCell<String>,
}

impl Resource {
    /// Create a non-root resource from a completed response.
    pub fn new(url: impl Into<String>, content: impl Into<Bytes>, mimetype: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            content: content.into(),
            mimetype: mimetype.into(),
            is_root: false,
            for_widths: None,
            sha: OnceCell::new(),
        }
    }

    /// Create the root resource for a snapshot from its serialized DOM.
    pub fn root(url: impl Into<String>, dom: impl Into<Bytes>) -> Self {
        Self {
            url: url.into(),
            content: dom.into(),
            mimetype: "text/html".to_string(),
            is_root: true,
            for_widths: None,
            sha: OnceCell::new(),
        }
    }

    pub fn with_widths(mut self, widths: Vec<u32>) -> Self {
        self.for_widths = Some(widths);
        self
    }

    /// Content hash, computed on first access and memoized.
    pub fn sha(&self) -> &str {
        self.sha.get_or_init(|| sha256_hex(&self.content))
    }

    pub fn size(&self) -> usize {
        self.content.len()
    }

    /// Resources that are empty or oversized are not worth uploading.
    pub fn validate_size(&self) -> Result<()> {
        if self.content.is_empty() {
            return Err(Error::InvalidSnapshot(format!("empty response body for {}", self.url)));
        }
        if self.content.len() >= MAX_RESOURCE_SIZE {
            return Err(Error::InvalidSnapshot(format!(
                "resource exceeds {} bytes: {} ({} bytes)",
                MAX_RESOURCE_SIZE,
                self.url,
                self.content.len()
            )));
        }
        Ok(())
    }
}

/// Extract the mimetype from a content-type header value.
pub fn mimetype_of(content_type: Option<&str>) -> String {
    content_type
        .and_then(|ct| ct.split(';').next())
        .map(|m| m.trim().to_string())
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| "application/octet-stream".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha_is_memoized_sha256() {
        let resource = Resource::new("https://x.test/a.js", "console.log(1)", "application/javascript");
        let expected = sha256_hex(b"console.log(1)");
        assert_eq!(resource.sha(), expected);
        // second access returns the same memoized digest
        assert_eq!(resource.sha(), expected);
    }

    #[test]
    fn test_identical_content_identical_sha() {
        let a = Resource::new("https://x.test/a.css", "body{}", "text/css");
        let b = Resource::new("https://x.test/b.css", "body{}", "text/css");
        assert_eq!(a.sha(), b.sha());
    }

    #[test]
    fn test_root_resource() {
        let root = Resource::root("https://x.test/", "<html></html>");
        assert!(root.is_root);
        assert_eq!(root.mimetype, "text/html");
    }

    #[test]
    fn test_normalize_url_strips_fragment() {
        assert_eq!(
            normalize_url("https://x.test/page?q=1#section").unwrap(),
            "https://x.test/page?q=1"
        );
        assert_eq!(normalize_url("https://x.test/page").unwrap(), "https://x.test/page");
    }

    #[test]
    fn test_normalize_url_rejects_garbage() {
        assert!(normalize_url("not a url").is_err());
    }

    #[test]
    fn test_size_validation() {
        let empty = Resource::new("https://x.test/empty", "", "text/plain");
        assert!(empty.validate_size().is_err());

        let ok = Resource::new("https://x.test/ok", "x", "text/plain");
        assert!(ok.validate_size().is_ok());

        let big = Resource::new("https://x.test/big", vec![0u8; MAX_RESOURCE_SIZE], "text/plain");
        assert!(big.validate_size().is_err());
    }

    #[test]
    fn test_mimetype_of() {
        assert_eq!(mimetype_of(Some("text/css; charset=utf-8")), "text/css");
        assert_eq!(mimetype_of(Some("image/png")), "image/png");
        assert_eq!(mimetype_of(None), "application/octet-stream");
        assert_eq!(mimetype_of(Some("")), "application/octet-stream");
    }
}
