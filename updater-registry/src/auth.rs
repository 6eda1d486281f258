//! Registry credentials and the bearer token exchange.
//!
//! Registries answer an unauthenticated request with
//! `401` + `WWW-Authenticate: Bearer realm="…",service="…",scope="…"`.
//! The client then asks the realm for a token (sending basic credentials
//! when configured) and retries with `Authorization: Bearer <token>`.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Deserialize;
use updater_core::{RegistryCredentials, RegistryEndpoint};

use crate::error::RegistryError;

/// Tokens without `expires_in` are assumed to live this long.
const DEFAULT_TOKEN_EXPIRY_SECS: u64 = 300;
/// Tokens are dropped this long before the registry would expire them.
const TOKEN_EXPIRY_SAFETY_MARGIN_SECS: u64 = 30;

/// Supplies credentials for a registry host, resolved per call.
pub trait CredentialsProvider: Send + Sync {
    fn credentials(&self, registry: &str) -> RegistryCredentials;
}

/// Fixed host → credentials map, built from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    by_host: HashMap<String, RegistryCredentials>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, host: impl Into<String>, credentials: RegistryCredentials) {
        self.by_host.insert(host.into(), credentials);
    }

    pub fn from_endpoints(endpoints: &[RegistryEndpoint]) -> Self {
        let mut provider = Self::new();
        for endpoint in endpoints {
            provider.insert(endpoint.host.clone(), endpoint.credentials.clone());
        }
        provider
    }
}

impl CredentialsProvider for StaticCredentials {
    fn credentials(&self, registry: &str) -> RegistryCredentials {
        self.by_host.get(registry).cloned().unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Challenge parsing
// ---------------------------------------------------------------------------

/// A parsed `WWW-Authenticate: Bearer …` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub realm: String,
    pub service: Option<String>,
    pub scope: Option<String>,
}

impl Challenge {
    /// Parse a bearer challenge. `None` for other schemes or a missing realm.
    pub fn parse(header: &str) -> Option<Self> {
        let header = header.trim();
        let (scheme, params) = header.split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("bearer") {
            return None;
        }

        let mut realm = None;
        let mut service = None;
        let mut scope = None;
        for (key, value) in auth_params(params) {
            match key.to_ascii_lowercase().as_str() {
                "realm" => realm = Some(value),
                "service" => service = Some(value),
                "scope" => scope = Some(value),
                _ => {}
            }
        }

        Some(Self {
            realm: realm?,
            service,
            scope,
        })
    }
}

/// Split `k1="v1",k2=v2` into pairs. Commas inside quotes belong to the value
/// (`scope="repository:a:pull,push"`).
fn auth_params(params: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    let mut rest = params.trim();

    while !rest.is_empty() {
        let Some(eq) = rest.find('=') else { break };
        let key = rest[..eq].trim().trim_start_matches(',').trim().to_string();
        let after = rest[eq + 1..].trim_start();

        let (value, remaining) = if let Some(quoted) = after.strip_prefix('"') {
            match quoted.find('"') {
                Some(end) => (quoted[..end].to_string(), &quoted[end + 1..]),
                None => (quoted.to_string(), ""),
            }
        } else {
            match after.find(',') {
                Some(end) => (after[..end].trim().to_string(), &after[end..]),
                None => (after.trim().to_string(), ""),
            }
        };

        if !key.is_empty() {
            pairs.push((key, value));
        }
        rest = remaining.trim_start().trim_start_matches(',').trim_start();
    }
    pairs
}

// ---------------------------------------------------------------------------
// Token cache
// ---------------------------------------------------------------------------

struct CachedToken {
    token: String,
    expires_at: Instant,
}

/// Bearer tokens keyed by `registry/repository`.
#[derive(Default)]
pub struct TokenCache {
    tokens: Mutex<HashMap<String, CachedToken>>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let tokens = self.tokens.lock().ok()?;
        tokens
            .get(key)
            .filter(|cached| cached.expires_at > Instant::now())
            .map(|cached| cached.token.clone())
    }

    pub fn insert(&self, key: String, token: String, expires_in_secs: Option<u64>) {
        let lifetime = expires_in_secs
            .unwrap_or(DEFAULT_TOKEN_EXPIRY_SECS)
            .saturating_sub(TOKEN_EXPIRY_SAFETY_MARGIN_SECS);
        let expires_at = Instant::now() + Duration::from_secs(lifetime);
        if let Ok(mut tokens) = self.tokens.lock() {
            tokens.retain(|_, cached| cached.expires_at > Instant::now());
            tokens.insert(key, CachedToken { token, expires_at });
        }
    }

    pub fn invalidate(&self, key: &str) {
        if let Ok(mut tokens) = self.tokens.lock() {
            tokens.remove(key);
        }
    }
}

// ---------------------------------------------------------------------------
// Token exchange
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
    expires_in: Option<u64>,
}

/// A token obtained from the realm.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub expires_in: Option<u64>,
}

/// Request a pull token from the challenge realm.
///
/// The scope defaults to `repository:<repository>:pull` when the challenge
/// carries none.
pub async fn fetch_token(
    http: &reqwest::Client,
    registry: &str,
    challenge: &Challenge,
    repository: &str,
    credentials: &RegistryCredentials,
) -> Result<IssuedToken, RegistryError> {
    let scope = challenge
        .scope
        .clone()
        .unwrap_or_else(|| format!("repository:{repository}:pull"));

    let mut query: Vec<(&str, &str)> = vec![("scope", scope.as_str())];
    if let Some(service) = &challenge.service {
        query.push(("service", service.as_str()));
    }

    let mut request = http.get(&challenge.realm).query(&query);
    if let Some((username, password)) = credentials.basic() {
        request = request.basic_auth(username, Some(password));
    }

    tracing::debug!(registry, realm = %challenge.realm, scope = %scope, "requesting registry token");
    let response = request.send().await.map_err(|e| RegistryError::Unreachable {
        registry: registry.to_string(),
        message: e.to_string(),
    })?;

    let status = response.status();
    if status.as_u16() == 401 || status.as_u16() == 403 {
        return Err(RegistryError::AuthFailed {
            registry: registry.to_string(),
            status: status.as_u16(),
        });
    }
    if !status.is_success() {
        return Err(RegistryError::Protocol {
            registry: registry.to_string(),
            message: format!("token endpoint returned HTTP {status}"),
        });
    }

    let body: TokenResponse = response.json().await.map_err(|e| RegistryError::Protocol {
        registry: registry.to_string(),
        message: format!("invalid token response: {e}"),
    })?;

    // Docker Hub answers with `token`, some registries with `access_token`.
    let token = body
        .token
        .or(body.access_token)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| RegistryError::Protocol {
            registry: registry.to_string(),
            message: "token response carried no token".to_string(),
        })?;

    Ok(IssuedToken {
        token,
        expires_in: body.expires_in,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use updater_core::Secret;

    #[test]
    fn parses_docker_hub_challenge() {
        let header = r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:library/nginx:pull""#;
        let challenge = Challenge::parse(header).expect("challenge");
        assert_eq!(challenge.realm, "https://auth.docker.io/token");
        assert_eq!(challenge.service.as_deref(), Some("registry.docker.io"));
        assert_eq!(
            challenge.scope.as_deref(),
            Some("repository:library/nginx:pull")
        );
    }

    #[test]
    fn quoted_commas_stay_in_value() {
        let header = r#"bearer realm="https://r.example/token", scope="repository:a/b:pull,push""#;
        let challenge = Challenge::parse(header).expect("challenge");
        assert_eq!(challenge.scope.as_deref(), Some("repository:a/b:pull,push"));
        assert_eq!(challenge.service, None);
    }

    #[test]
    fn non_bearer_and_realmless_challenges_rejected() {
        assert!(Challenge::parse(r#"Basic realm="registry""#).is_none());
        assert!(Challenge::parse(r#"Bearer service="x""#).is_none());
        assert!(Challenge::parse("").is_none());
    }

    #[test]
    fn token_cache_expires_and_invalidates() {
        let cache = TokenCache::new();
        cache.insert("k".into(), "t1".into(), Some(600));
        assert_eq!(cache.get("k").as_deref(), Some("t1"));

        cache.invalidate("k");
        assert!(cache.get("k").is_none());

        // Lifetime shorter than the safety margin is already stale.
        cache.insert("short".into(), "t2".into(), Some(10));
        assert!(cache.get("short").is_none());
    }

    #[test]
    fn static_credentials_default_to_anonymous() {
        let mut provider = StaticCredentials::new();
        provider.insert(
            "ghcr.io",
            RegistryCredentials {
                username: None,
                password: None,
                token: Some(Secret::new("t")),
            },
        );
        assert!(!provider.credentials("ghcr.io").is_anonymous());
        assert!(provider.credentials("quay.io").is_anonymous());
    }
}
