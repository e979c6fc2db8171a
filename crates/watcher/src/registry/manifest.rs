//! Manifest response interpretation: index detection, platform selection
//! and digest computation.

use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::error::RegistryError;

/// Media types sent in the `Accept` header of manifest requests.
pub const ACCEPTED_MEDIA_TYPES: [&str; 4] = [
    "application/vnd.docker.distribution.manifest.list.v2+json",
    "application/vnd.oci.image.index.v1+json",
    "application/vnd.docker.distribution.manifest.v2+json",
    "application/vnd.oci.image.manifest.v1+json",
];

/// Raw manifest response as returned by a [`super::ManifestFetcher`].
#[derive(Debug, Clone, Default)]
pub struct FetchedManifest {
    pub content_type: String,
    /// `Docker-Content-Digest` response header, if present
    pub digest_header: Option<String>,
    pub body: Vec<u8>,
}

/// Digests resolved for one reference.
///
/// For single-platform images both fields hold the same value. Cache hits
/// carry only `index_digest`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteDigest {
    pub index_digest: String,
    pub child_digest: String,
}

impl RemoteDigest {
    pub fn cached(index_digest: impl Into<String>) -> Self {
        Self {
            index_digest: index_digest.into(),
            child_digest: String::new(),
        }
    }

    /// Index digest, falling back to the platform child digest.
    pub fn preferred(&self) -> &str {
        if self.index_digest.is_empty() {
            &self.child_digest
        } else {
            &self.index_digest
        }
    }
}

#[derive(Debug, Deserialize)]
struct ImageIndex {
    #[serde(default)]
    manifests: Vec<IndexEntry>,
}

#[derive(Debug, Deserialize)]
struct IndexEntry {
    #[serde(default)]
    digest: String,
    platform: Option<Platform>,
}

#[derive(Debug, Deserialize)]
struct Platform {
    #[serde(default)]
    os: String,
    #[serde(default)]
    architecture: String,
}

/// True when the response is a multi-platform index or manifest list.
pub fn is_index(content_type: &str, body: &[u8]) -> bool {
    let ct = content_type.to_ascii_lowercase();
    if ct.contains("manifest.list") || ct.contains("image.index") {
        return true;
    }
    ct.contains("+json") && contains_bytes(body, b"manifests")
}

/// Architecture name used by registries for the running host.
pub fn host_architecture() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        "powerpc64" => "ppc64le",
        other => other,
    }
}

/// Computes both digests from a fetched manifest for the given platform.
pub fn resolve_digests(
    fetched: &FetchedManifest,
    os: &str,
    architecture: &str,
) -> Result<RemoteDigest, RegistryError> {
    let top = match fetched.digest_header.as_deref().map(str::trim) {
        Some(d) if !d.is_empty() => d.to_owned(),
        _ => format!("sha256:{}", hex::encode(Sha256::digest(&fetched.body))),
    };

    if !is_index(&fetched.content_type, &fetched.body) {
        return Ok(RemoteDigest {
            index_digest: top.clone(),
            child_digest: top,
        });
    }

    let index: ImageIndex = serde_json::from_slice(&fetched.body)
        .map_err(|e| RegistryError::ManifestParse(e.to_string()))?;
    let child = select_platform(&index.manifests, os, architecture)?;
    if child.is_empty() {
        return Err(RegistryError::EmptyDigest);
    }

    Ok(RemoteDigest {
        index_digest: top,
        child_digest: child.to_owned(),
    })
}

fn select_platform<'a>(
    entries: &'a [IndexEntry],
    os: &str,
    architecture: &str,
) -> Result<&'a str, RegistryError> {
    let first = entries.first().ok_or(RegistryError::NoManifests)?;
    let matched = entries.iter().find(|e| {
        e.platform.as_ref().is_some_and(|p| {
            p.os.eq_ignore_ascii_case(os) && p.architecture.eq_ignore_ascii_case(architecture)
        })
    });
    Ok(matched.unwrap_or(first).digest.as_str())
}

fn contains_bytes(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}
