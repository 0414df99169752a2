//! URI-style memory addresses: `domain://path`.
//!
//! The domain is drawn from the configured allowlist (`system` is reserved for
//! virtual views). Paths are slash-separated tokens matching `[a-z0-9_-]+`.
//! A bare path without a scheme falls back to the default domain.

use crate::errors::{PalaceError, Result};

pub const DEFAULT_DOMAIN: &str = "core";
pub const SYSTEM_DOMAIN: &str = "system";

/// A parsed `domain://path` address. `path` may be empty (domain root).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    pub domain: String,
    pub path: String,
}

impl Address {
    pub fn uri(&self) -> String {
        format!("{}://{}", self.domain, self.path)
    }

    /// Parent path, or `None` at the domain root.
    pub fn parent_path(&self) -> Option<&str> {
        if self.path.is_empty() {
            return None;
        }
        match self.path.rsplit_once('/') {
            Some((parent, _)) => Some(parent),
            None => Some(""),
        }
    }

    /// Last path segment (the display name).
    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or("")
    }

    pub fn is_system(&self) -> bool {
        self.domain == SYSTEM_DOMAIN
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.uri())
    }
}

pub fn make_uri(domain: &str, path: &str) -> String {
    format!("{domain}://{path}")
}

/// True when every path segment matches `[a-z0-9_-]+`.
pub fn is_valid_path(path: &str) -> bool {
    if path.is_empty() {
        return true;
    }
    path.split('/').all(|segment| {
        !segment.is_empty()
            && segment
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'-')
    })
}

/// Title constraint for `create_memory`: a single `[a-z0-9_-]+` token.
pub fn is_valid_title(title: &str) -> bool {
    !title.is_empty() && !title.contains('/') && is_valid_path(title)
}

fn is_valid_domain_token(domain: &str) -> bool {
    !domain.is_empty()
        && domain
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_')
}

/// Parse a memory address against the configured domain allowlist.
///
/// Accepts `domain://path`, `domain://` (root), and a bare path (default
/// domain). Trailing and leading slashes on the path are stripped.
pub fn parse_address(uri: &str, valid_domains: &[String]) -> Result<Address> {
    let trimmed = uri.trim();
    if let Some((scheme, rest)) = trimmed.split_once("://") {
        let domain = scheme.to_ascii_lowercase();
        if !is_valid_domain_token(&domain) || !valid_domains.iter().any(|d| d == &domain) {
            return Err(PalaceError::InvalidDomain(domain));
        }
        let path = rest.trim().trim_matches('/').to_string();
        if !domain_is_system(&domain) && !is_valid_path(&path) {
            return Err(PalaceError::InvalidPath(path));
        }
        return Ok(Address { domain, path });
    }

    // Bare path: assume the default domain.
    let path = trimmed.trim_matches('/').to_string();
    if !is_valid_path(&path) {
        return Err(PalaceError::InvalidPath(path));
    }
    Ok(Address {
        domain: DEFAULT_DOMAIN.to_string(),
        path,
    })
}

fn domain_is_system(domain: &str) -> bool {
    domain == SYSTEM_DOMAIN
}
