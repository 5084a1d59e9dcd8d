//! Hostname allow/deny policy
//!
//! Patterns are parsed eagerly so malformed configuration fails the build
//! before any discovery starts.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use url::Url;

/// A single parsed hostname pattern.
///
/// Supported forms: `*` (everything), `example.com` (exact),
/// `*.example.com` (any subdomain, not the apex), with an optional `:port`
/// suffix on the non-wildcard forms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostnamePattern {
    raw: String,
    kind: PatternKind,
    port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PatternKind {
    Any,
    Exact(String),
    /// Stored with the leading dot, e.g. `.example.com`
    Suffix(String),
}

impl HostnamePattern {
    pub fn parse(pattern: &str) -> Result<Self> {
        let raw = pattern.trim();

        if raw.is_empty() {
            return Err(Error::InvalidHostnamePattern {
                pattern: pattern.to_string(),
                reason: "empty pattern".to_string(),
            });
        }

        if raw == "*" {
            return Ok(Self {
                raw: raw.to_string(),
                kind: PatternKind::Any,
                port: None,
            });
        }

        if raw.contains('/') || raw.contains("://") {
            return Err(Error::InvalidHostnamePattern {
                pattern: raw.to_string(),
                reason: "patterns match hostnames, not URLs or paths".to_string(),
            });
        }

        if raw.chars().any(char::is_whitespace) {
            return Err(Error::InvalidHostnamePattern {
                pattern: raw.to_string(),
                reason: "pattern contains whitespace".to_string(),
            });
        }

        // split an optional :port suffix
        let (host_part, port) = match raw.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|_| Error::InvalidHostnamePattern {
                    pattern: raw.to_string(),
                    reason: format!("invalid port '{}'", port),
                })?;
                (host, Some(port))
            }
            None => (raw, None),
        };

        if host_part.is_empty() {
            return Err(Error::InvalidHostnamePattern {
                pattern: raw.to_string(),
                reason: "missing hostname".to_string(),
            });
        }

        // a leading wildcard is treated the same as a leading dot
        let kind = if let Some(rest) = host_part.strip_prefix('*') {
            if !rest.starts_with('.') || rest.len() < 2 {
                return Err(Error::InvalidHostnamePattern {
                    pattern: raw.to_string(),
                    reason: "wildcard must be of the form '*.domain'".to_string(),
                });
            }
            PatternKind::Suffix(rest.to_ascii_lowercase())
        } else if host_part.starts_with('.') {
            PatternKind::Suffix(host_part.to_ascii_lowercase())
        } else if host_part.contains('*') {
            return Err(Error::InvalidHostnamePattern {
                pattern: raw.to_string(),
                reason: "wildcard is only valid as a leading '*.'".to_string(),
            });
        } else {
            PatternKind::Exact(host_part.to_ascii_lowercase())
        };

        Ok(Self {
            raw: raw.to_string(),
            kind,
            port,
        })
    }

    /// Parse a list of patterns, failing on the first malformed entry.
    pub fn parse_all(patterns: &[String]) -> Result<Vec<Self>> {
        patterns.iter().map(|p| Self::parse(p)).collect()
    }

    /// Returns true when the URL's hostname (and port, if the pattern
    /// constrains one) matches this pattern.
    pub fn matches(&self, url: &Url) -> bool {
        let Some(host) = url.host_str() else {
            return false;
        };
        let host = host.to_ascii_lowercase();

        if let Some(port) = self.port {
            if url.port_or_known_default() != Some(port) {
                return false;
            }
        }

        match &self.kind {
            PatternKind::Any => true,
            PatternKind::Exact(h) => host == *h,
            PatternKind::Suffix(suffix) => host.ends_with(suffix.as_str()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl std::fmt::Display for HostnamePattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.raw)
    }
}

/// Why a request was blocked by policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    /// Hostname matched a disallowed pattern
    Disallowed,
    /// An allow-list is configured and the hostname matched nothing on it
    NotAllowed,
}

impl std::fmt::Display for BlockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockReason::Disallowed => write!(f, "disallowed hostname"),
            BlockReason::NotAllowed => write!(f, "not an allowed hostname"),
        }
    }
}

/// Per-request policy decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyDecision {
    Allow,
    Block(BlockReason),
}

/// Hostname policy for one snapshot's discovery run.
///
/// Requests to the snapshot's own hostname are always allowed, regardless
/// of both lists. Disallowed patterns are checked before the allow-list.
/// An empty allow-list admits every hostname that is not disallowed.
#[derive(Debug, Clone)]
pub struct HostnamePolicy {
    allowed: Vec<HostnamePattern>,
    disallowed: Vec<HostnamePattern>,
    root_host: String,
}

impl HostnamePolicy {
    pub fn new(
        allowed: Vec<HostnamePattern>,
        disallowed: Vec<HostnamePattern>,
        root_url: &Url,
    ) -> Self {
        Self {
            allowed,
            disallowed,
            root_host: root_url
                .host_str()
                .unwrap_or_default()
                .to_ascii_lowercase(),
        }
    }

    pub fn decide(&self, url: &Url) -> PolicyDecision {
        if url
            .host_str()
            .is_some_and(|h| h.eq_ignore_ascii_case(&self.root_host))
        {
            return PolicyDecision::Allow;
        }

        if self.disallowed.iter().any(|p| p.matches(url)) {
            return PolicyDecision::Block(BlockReason::Disallowed);
        }

        if !self.allowed.is_empty() && !self.allowed.iter().any(|p| p.matches(url)) {
            return PolicyDecision::Block(BlockReason::NotAllowed);
        }

        PolicyDecision::Allow
    }
}
