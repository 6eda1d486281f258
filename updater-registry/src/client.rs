//! Registry HTTP client (Docker Registry HTTP API v2 / OCI distribution).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, ACCEPT, LAST_MODIFIED, LINK, WWW_AUTHENTICATE};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use updater_core::config::default_endpoint;
use updater_core::{Digest, ImageRef, RegistryCredentials, Settings, TagInfo};

use crate::auth::{fetch_token, Challenge, CredentialsProvider, StaticCredentials, TokenCache};
use crate::error::RegistryError;

/// Manifest media types accepted on HEAD, so multi-arch images report the
/// index digest rather than a single platform's.
pub const MANIFEST_ACCEPT: &str = "application/vnd.docker.distribution.manifest.list.v2+json, \
application/vnd.oci.image.index.v1+json, \
application/vnd.docker.distribution.manifest.v2+json, \
application/vnd.oci.image.manifest.v1+json";

const DIGEST_HEADER: &str = "Docker-Content-Digest";
/// Upper bound on followed `Link: rel="next"` pages.
const MAX_TAG_PAGES: usize = 1_000;

/// Tag and digest lookups against a container registry.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// All tags of `image` in registry order, duplicates removed.
    async fn list_tags(&self, image: &ImageRef) -> Result<Vec<String>, RegistryError>;

    /// Digest the registry currently serves for `image:tag`.
    async fn resolve_digest(&self, image: &ImageRef, tag: &str) -> Result<Digest, RegistryError>;

    /// Digest plus creation time when the registry reports one.
    async fn tag_info(&self, image: &ImageRef, tag: &str) -> Result<TagInfo, RegistryError>;
}

/// Connection settings for [`HttpRegistryClient`].
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub timeout: Duration,
    pub connect_timeout: Duration,
    /// Registry host → base URL overrides.
    pub endpoints: HashMap<String, String>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            endpoints: HashMap::new(),
        }
    }
}

/// [`RegistryClient`] over HTTP. Holds one pooled `reqwest::Client`; build it
/// once per process and share it.
pub struct HttpRegistryClient {
    http: reqwest::Client,
    credentials: Arc<dyn CredentialsProvider>,
    endpoints: HashMap<String, String>,
    tokens: TokenCache,
}

#[derive(Debug, Deserialize)]
struct TagList {
    #[serde(default)]
    tags: Option<Vec<String>>,
}

impl HttpRegistryClient {
    pub fn new(credentials: Arc<dyn CredentialsProvider>) -> Result<Self, RegistryError> {
        Self::with_options(credentials, ClientOptions::default())
    }

    pub fn with_options(
        credentials: Arc<dyn CredentialsProvider>,
        options: ClientOptions,
    ) -> Result<Self, RegistryError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("image-updater/", env!("CARGO_PKG_VERSION")))
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .timeout(options.timeout)
            .connect_timeout(options.connect_timeout)
            .build()
            .map_err(|e| RegistryError::Setup(e.to_string()))?;

        let endpoints = options
            .endpoints
            .into_iter()
            .map(|(host, url)| (host, url.trim_end_matches('/').to_string()))
            .collect();

        Ok(Self {
            http,
            credentials,
            endpoints,
            tokens: TokenCache::new(),
        })
    }

    /// Client for every registry declared in the resolved configuration.
    pub fn from_settings(settings: &Settings) -> Result<Self, RegistryError> {
        let options = ClientOptions {
            endpoints: settings
                .registries
                .iter()
                .map(|r| (r.host.clone(), r.endpoint.clone()))
                .collect(),
            ..ClientOptions::default()
        };
        let credentials = Arc::new(StaticCredentials::from_endpoints(&settings.registries));
        Self::with_options(credentials, options)
    }

    fn base_url(&self, registry: &str) -> String {
        self.endpoints
            .get(registry)
            .cloned()
            .unwrap_or_else(|| default_endpoint(registry))
    }

    fn token_key(image: &ImageRef) -> String {
        format!("{}/{}", image.registry, image.repository())
    }

    fn authorize(
        &self,
        request: RequestBuilder,
        key: &str,
        credentials: &RegistryCredentials,
    ) -> RequestBuilder {
        if let Some(token) = self.tokens.get(key) {
            return request.bearer_auth(token);
        }
        if let Some(token) = &credentials.token {
            return request.bearer_auth(token.expose());
        }
        match credentials.basic() {
            Some((username, password)) => request.basic_auth(username, Some(password)),
            None => request,
        }
    }

    /// Send a request, re-authenticating exactly once on 401.
    async fn send<F>(&self, image: &ImageRef, build: F) -> Result<Response, RegistryError>
    where
        F: Fn(&reqwest::Client) -> RequestBuilder + Send + Sync,
    {
        let registry = image.registry.as_str();
        let credentials = self.credentials.credentials(registry);
        let key = Self::token_key(image);

        let request = self.authorize(build(&self.http), &key, &credentials);
        let response = request.send().await.map_err(|e| unreachable(registry, e))?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        self.tokens.invalidate(&key);
        let challenge = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .and_then(Challenge::parse);

        let retry = build(&self.http);
        let retry = match challenge {
            Some(challenge) => {
                tracing::debug!(registry, image = %image, "registry challenged, exchanging token");
                let issued =
                    fetch_token(&self.http, registry, &challenge, &image.repository(), &credentials)
                        .await?;
                self.tokens
                    .insert(key.clone(), issued.token.clone(), issued.expires_in);
                retry.bearer_auth(issued.token)
            }
            None => match credentials.basic() {
                Some((username, password)) => retry.basic_auth(username, Some(password)),
                None => {
                    return Err(RegistryError::AuthFailed {
                        registry: registry.to_string(),
                        status: StatusCode::UNAUTHORIZED.as_u16(),
                    })
                }
            },
        };

        let response = retry.send().await.map_err(|e| unreachable(registry, e))?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            self.tokens.invalidate(&key);
            tracing::warn!(registry, image = %image, status = status.as_u16(), "registry rejected credentials after re-authentication");
            return Err(RegistryError::AuthFailed {
                registry: registry.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(response)
    }

    async fn head_manifest(&self, image: &ImageRef, tag: &str) -> Result<HeaderMap, RegistryError> {
        let url = format!(
            "{}/v2/{}/manifests/{}",
            self.base_url(&image.registry),
            image.repository(),
            tag
        );
        let response = self
            .send(image, |http| http.head(&url).header(ACCEPT, MANIFEST_ACCEPT))
            .await?;
        check_status(image, &format!("{image}:{tag}"), &response)?;
        Ok(response.headers().clone())
    }
}

#[async_trait]
impl RegistryClient for HttpRegistryClient {
    async fn list_tags(&self, image: &ImageRef) -> Result<Vec<String>, RegistryError> {
        let base = self.base_url(&image.registry);
        let mut url = format!("{base}/v2/{}/tags/list", image.repository());
        let mut seen = HashSet::new();
        let mut tags = Vec::new();

        for _ in 0..MAX_TAG_PAGES {
            let page_url = url.clone();
            let response = self.send(image, |http| http.get(&page_url)).await?;
            check_status(image, &image.to_string(), &response)?;

            let next = response
                .headers()
                .get(LINK)
                .and_then(|v| v.to_str().ok())
                .and_then(next_link)
                .map(|link| absolutize(&base, &link));

            let page: TagList = response.json().await.map_err(|e| RegistryError::Protocol {
                registry: image.registry.clone(),
                message: format!("invalid tag list: {e}"),
            })?;
            for tag in page.tags.unwrap_or_default() {
                if seen.insert(tag.clone()) {
                    tags.push(tag);
                }
            }

            match next {
                Some(next_url) => url = next_url,
                None => {
                    tracing::debug!(image = %image, count = tags.len(), "listed tags");
                    return Ok(tags);
                }
            }
        }

        Err(RegistryError::Protocol {
            registry: image.registry.clone(),
            message: format!("tag list for {image} exceeded {MAX_TAG_PAGES} pages"),
        })
    }

    async fn resolve_digest(&self, image: &ImageRef, tag: &str) -> Result<Digest, RegistryError> {
        let headers = self.head_manifest(image, tag).await?;
        digest_header(&headers).ok_or_else(|| RegistryError::DigestUnavailable {
            image: image.to_string(),
            tag: tag.to_string(),
        })
    }

    async fn tag_info(&self, image: &ImageRef, tag: &str) -> Result<TagInfo, RegistryError> {
        let headers = self.head_manifest(image, tag).await?;
        let digest = digest_header(&headers).ok_or_else(|| RegistryError::DigestUnavailable {
            image: image.to_string(),
            tag: tag.to_string(),
        })?;
        let created_at = headers
            .get(LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
            .map(|t| t.with_timezone(&Utc));

        Ok(TagInfo {
            name: tag.to_string(),
            digest,
            created_at,
            observed_at: Utc::now(),
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn unreachable(registry: &str, err: reqwest::Error) -> RegistryError {
    RegistryError::Unreachable {
        registry: registry.to_string(),
        message: err.to_string(),
    }
}

fn check_status(image: &ImageRef, resource: &str, response: &Response) -> Result<(), RegistryError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    Err(match status {
        StatusCode::NOT_FOUND => RegistryError::NotFound {
            resource: resource.to_string(),
        },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RegistryError::AuthFailed {
            registry: image.registry.clone(),
            status: status.as_u16(),
        },
        other => RegistryError::Protocol {
            registry: image.registry.clone(),
            message: format!("HTTP {other} for {resource}"),
        },
    })
}

fn digest_header(headers: &HeaderMap) -> Option<Digest> {
    headers
        .get(DIGEST_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(Digest::from)
}

/// Extract the `rel="next"` target from a `Link` header.
fn next_link(header: &str) -> Option<String> {
    header.split(',').find_map(|entry| {
        let mut parts = entry.split(';');
        let target = parts.next()?.trim();
        let is_next = parts.any(|p| {
            let p = p.trim().replace(' ', "");
            p == "rel=\"next\"" || p == "rel=next"
        });
        if !is_next {
            return None;
        }
        target
            .strip_prefix('<')
            .and_then(|t| t.strip_suffix('>'))
            .map(str::to_string)
    })
}

fn absolutize(base: &str, link: &str) -> String {
    if link.starts_with("http://") || link.starts_with("https://") {
        link.to_string()
    } else if link.starts_with('/') {
        format!("{base}{link}")
    } else {
        format!("{base}/{link}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_link_forms() {
        assert_eq!(
            next_link(r#"</v2/library/nginx/tags/list?last=1.25&n=2>; rel="next""#).as_deref(),
            Some("/v2/library/nginx/tags/list?last=1.25&n=2")
        );
        assert_eq!(next_link(r#"</v2/a/tags/list?last=x>; rel="prev""#), None);
        assert_eq!(next_link(""), None);
    }

    #[test]
    fn absolutize_relative_and_absolute() {
        assert_eq!(absolutize("https://r.io", "/v2/x"), "https://r.io/v2/x");
        assert_eq!(absolutize("https://r.io", "https://cdn/v2/x"), "https://cdn/v2/x");
    }

    #[test]
    fn default_endpoints() {
        let client = HttpRegistryClient::new(Arc::new(StaticCredentials::new())).expect("client");
        assert_eq!(client.base_url("docker.io"), "https://registry-1.docker.io");
        assert_eq!(client.base_url("ghcr.io"), "https://ghcr.io");
    }
}
