//! Registry HTTP v2 manifest fetcher.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use dockwatch_core::config::RegistryConfig;
use dockwatch_core::RegistryAuth;
use reqwest::header::{ACCEPT, CONTENT_TYPE, WWW_AUTHENTICATE};
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use serde::Deserialize;
use tracing::debug;

use super::manifest::{ACCEPTED_MEDIA_TYPES, FetchedManifest};
use super::reference::ImageCoordinate;
use crate::error::RegistryError;

const DIGEST_HEADER: &str = "Docker-Content-Digest";
const TRANSPORT_RETRIES: u32 = 1;
const RETRY_DELAY: Duration = Duration::from_millis(500);

/// Fetches the manifest for an image coordinate.
///
/// Implemented over HTTP by [`HttpManifestFetcher`]; tests substitute an
/// in-memory fetcher.
pub trait ManifestFetcher: Send + Sync + 'static {
    fn fetch_manifest(
        &self,
        image: &ImageCoordinate,
        credentials: Option<&RegistryAuth>,
    ) -> impl Future<Output = Result<FetchedManifest, RegistryError>> + Send;
}

/// reqwest-backed fetcher speaking the distribution v2 API, including the
/// bearer token challenge flow.
#[derive(Debug, Clone)]
pub struct HttpManifestFetcher {
    client: Client,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: String,
    #[serde(default)]
    access_token: String,
}

impl HttpManifestFetcher {
    pub fn new(config: &RegistryConfig) -> Result<Self, RegistryError> {
        let mut builder = Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(Duration::from_secs(config.request_timeout_secs));

        if !config.proxy_url.is_empty() {
            let proxy = reqwest::Proxy::all(&config.proxy_url)
                .map_err(|e| RegistryError::Http(format!("proxy {}: {e}", config.proxy_url)))?;
            builder = builder.proxy(proxy);
        }

        let client = builder
            .build()
            .map_err(|e| RegistryError::Http(format!("client: {e}")))?;
        Ok(Self { client })
    }

    fn manifest_request(&self, url: &str) -> RequestBuilder {
        self.client
            .get(url)
            .header(ACCEPT, ACCEPTED_MEDIA_TYPES.join(", "))
    }

    async fn bearer_token(
        &self,
        image: &ImageCoordinate,
        challenge: &str,
        credentials: Option<&RegistryAuth>,
    ) -> Result<String, RegistryError> {
        let params = parse_bearer_challenge(challenge)
            .ok_or_else(|| RegistryError::Auth(format!("unsupported challenge: {challenge}")))?;
        let realm = params
            .get("realm")
            .filter(|r| !r.is_empty())
            .ok_or_else(|| RegistryError::Auth("challenge has no realm".to_owned()))?;

        let mut url = Url::parse(realm).map_err(|e| RegistryError::Auth(format!("realm: {e}")))?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(service) = params.get("service") {
                query.append_pair("service", service);
            }
            let scope = params
                .get("scope")
                .cloned()
                .unwrap_or_else(|| format!("repository:{}:pull", image.repository));
            query.append_pair("scope", &scope);
        }

        let mut req = self.client.get(url);
        if let Some(c) = credentials {
            req = req.basic_auth(&c.username, Some(&c.token));
        }
        let resp = send_with_retry(req).await?;
        if !resp.status().is_success() {
            return Err(RegistryError::Auth(format!("token endpoint: {}", resp.status())));
        }
        let body: TokenResponse = resp
            .json()
            .await
            .map_err(|e| RegistryError::Auth(format!("decode: {e}")))?;

        let token = if body.token.is_empty() {
            body.access_token
        } else {
            body.token
        };
        if token.is_empty() {
            return Err(RegistryError::Auth("empty token".to_owned()));
        }
        Ok(token)
    }
}

impl ManifestFetcher for HttpManifestFetcher {
    async fn fetch_manifest(
        &self,
        image: &ImageCoordinate,
        credentials: Option<&RegistryAuth>,
    ) -> Result<FetchedManifest, RegistryError> {
        let url = format!(
            "https://{}/v2/{}/manifests/{}",
            image.host, image.repository, image.tag
        );

        let mut req = self.manifest_request(&url);
        if let Some(c) = credentials {
            req = req.basic_auth(&c.username, Some(&c.token));
        }
        let mut resp = send_with_retry(req).await?;

        if resp.status() == StatusCode::UNAUTHORIZED {
            let challenge = header_str(&resp, WWW_AUTHENTICATE.as_str()).unwrap_or_default();
            debug!(image = %image, "registry requested bearer auth");
            let token = self.bearer_token(image, &challenge, credentials).await?;
            resp = send_with_retry(self.manifest_request(&url).bearer_auth(token)).await?;
        }

        let status = resp.status();
        if !status.is_success() {
            return Err(RegistryError::Status(status.to_string()));
        }

        let content_type = header_str(&resp, CONTENT_TYPE.as_str()).unwrap_or_default();
        let digest_header = header_str(&resp, DIGEST_HEADER);
        let body = resp
            .bytes()
            .await
            .map_err(|e| RegistryError::Http(e.to_string()))?
            .to_vec();

        Ok(FetchedManifest {
            content_type,
            digest_header,
            body,
        })
    }
}

/// Retries transport failures; HTTP status codes are returned as-is.
async fn send_with_retry(req: RequestBuilder) -> Result<Response, RegistryError> {
    let mut attempt = 0;
    loop {
        let Some(this_try) = req.try_clone() else {
            return req.send().await.map_err(|e| RegistryError::Http(e.to_string()));
        };
        match this_try.send().await {
            Ok(resp) => return Ok(resp),
            Err(e) if attempt < TRANSPORT_RETRIES => {
                attempt += 1;
                debug!(error = %e, attempt, "registry request failed, retrying");
                tokio::time::sleep(RETRY_DELAY).await;
            }
            Err(e) => return Err(RegistryError::Http(e.to_string())),
        }
    }
}

fn header_str(resp: &Response, name: &str) -> Option<String> {
    resp.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}

/// Parses `Bearer realm="...",service="...",scope="..."`.
///
/// Returns `None` for non-bearer schemes.
pub fn parse_bearer_challenge(header: &str) -> Option<HashMap<String, String>> {
    let header = header.trim();
    let (scheme, rest) = header.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }

    let mut params = HashMap::new();
    let mut rest = rest.trim();
    while !rest.is_empty() {
        let Some((key, after_eq)) = rest.split_once('=') else {
            break;
        };
        let key = key.trim().trim_start_matches(',').trim().to_ascii_lowercase();
        let after_eq = after_eq.trim_start();

        let (value, remainder) = if let Some(quoted) = after_eq.strip_prefix('"') {
            match quoted.find('"') {
                Some(end) => (&quoted[..end], &quoted[end + 1..]),
                None => (quoted, ""),
            }
        } else {
            match after_eq.find(',') {
                Some(end) => (&after_eq[..end], &after_eq[end..]),
                None => (after_eq, ""),
            }
        };

        params.insert(key, value.trim().to_owned());
        rest = remainder.trim_start().trim_start_matches(',').trim_start();
    }
    Some(params)
}
