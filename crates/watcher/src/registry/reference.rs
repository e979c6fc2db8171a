//! Image reference normalization.
//!
//! `nginx` becomes `registry-1.docker.io/library/nginx:latest`; the result's
//! [`ImageCoordinate::cache_key`] is the canonical `host/path:tag` key.

use std::fmt;

use crate::error::RegistryError;

/// API host of the default public registry.
pub const DOCKER_HUB_API_HOST: &str = "registry-1.docker.io";

const DEFAULT_TAG: &str = "latest";
const MAX_TAG_LEN: usize = 128;

/// Parsed and canonicalized image reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageCoordinate {
    pub host: String,
    pub repository: String,
    pub tag: String,
}

impl ImageCoordinate {
    pub fn cache_key(&self) -> String {
        format!("{}/{}:{}", self.host, self.repository, self.tag)
    }
}

impl fmt::Display for ImageCoordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.host, self.repository, self.tag)
    }
}

/// Maps the public registry aliases to its API host; other hosts pass through.
pub fn normalize_registry_host(host: &str) -> String {
    let host = host.trim();
    let host = host
        .strip_prefix("https://")
        .or_else(|| host.strip_prefix("http://"))
        .unwrap_or(host)
        .trim_end_matches('/');
    match host {
        "docker.io" | "index.docker.io" | "dockerhub" => DOCKER_HUB_API_HOST.to_owned(),
        other => other.to_owned(),
    }
}

/// Parses a reference into host, repository path and tag.
///
/// Digest-only references (`repo@sha256:...`) resolve the `latest` tag.
pub fn normalize(reference: &str) -> Result<ImageCoordinate, RegistryError> {
    let invalid = |reason: &str| RegistryError::InvalidReference {
        reference: reference.to_owned(),
        reason: reason.to_owned(),
    };

    let trimmed = reference.trim();
    if trimmed.is_empty() {
        return Err(invalid("empty reference"));
    }

    let name_and_tag = match trimmed.split_once('@') {
        Some((name, digest)) => {
            if digest.is_empty() {
                return Err(invalid("empty digest"));
            }
            name
        }
        None => trimmed,
    };

    let last_slash = name_and_tag.rfind('/').map(|i| i + 1).unwrap_or(0);
    let (name, tag) = match name_and_tag[last_slash..].rfind(':') {
        Some(colon) => {
            let split = last_slash + colon;
            (&name_and_tag[..split], Some(&name_and_tag[split + 1..]))
        }
        None => (name_and_tag, None),
    };

    let (host, path) = match name.split_once('/') {
        Some((first, rest)) if is_domain(first) => (normalize_registry_host(first), rest.to_owned()),
        _ => (DOCKER_HUB_API_HOST.to_owned(), name.to_owned()),
    };

    let path = if host == DOCKER_HUB_API_HOST && !path.contains('/') {
        format!("library/{path}")
    } else {
        path
    };

    if path.is_empty() || path.split('/').any(str::is_empty) {
        return Err(invalid("empty path component"));
    }
    if !path
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'.' | b'_' | b'-' | b'/'))
    {
        return Err(invalid("repository name must be lowercase alphanumerics"));
    }

    let tag = match tag {
        Some(t) => {
            if t.is_empty() || t.len() > MAX_TAG_LEN {
                return Err(invalid("invalid tag length"));
            }
            if !t
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
            {
                return Err(invalid("invalid tag characters"));
            }
            t.to_owned()
        }
        None => DEFAULT_TAG.to_owned(),
    };

    Ok(ImageCoordinate {
        host,
        repository: path,
        tag,
    })
}

fn is_domain(component: &str) -> bool {
    component.contains('.') || component.contains(':') || component == "localhost"
}
