//! OAuth 2.0 client-credentials token fetching with a shared token cache.

use anyhow::{Context, Result};
use moka::future::Cache;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::time::{Duration, Instant, SystemTime};

/// Tokens this close to expiry are refreshed instead of handed out. Capped at
/// half the token's lifetime so short-lived tokens are still usable.
const EXPIRY_BUFFER: Duration = Duration::from_secs(60);
const DEFAULT_EXPIRES_IN_SECS: u64 = 3600;

#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
}

#[derive(Clone)]
pub struct CachedToken {
    pub access_token: SecretString,
    pub expires_at: Instant,
    /// Wall-clock expiry, carried into the resulting credential.
    pub expires_at_wall: SystemTime,
    refresh_at: Instant,
}

impl CachedToken {
    fn issued(access_token: String, expires_in: Duration) -> Self {
        let now = Instant::now();
        let expires_at = now + expires_in;
        Self {
            access_token: SecretString::from(access_token),
            expires_at,
            expires_at_wall: SystemTime::now() + expires_in,
            refresh_at: expires_at - EXPIRY_BUFFER.min(expires_in / 2),
        }
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.refresh_at
    }
}

#[derive(Clone)]
pub struct OAuthClientCredentialsConfig {
    pub client_id: String,
    pub client_secret: SecretString,
    pub token_url: String,
    pub scopes: Vec<String>,
}

/// Token cache keyed by token URL, client id and a digest of the client
/// secret, so a rotated secret never reuses a token issued for the old one.
pub struct OAuthTokenCache {
    cache: Cache<String, CachedToken>,
    client: reqwest::Client,
}

impl OAuthTokenCache {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            cache: Cache::builder()
                .time_to_live(Duration::from_secs(DEFAULT_EXPIRES_IN_SECS))
                .max_capacity(100)
                .build(),
            client,
        }
    }

    /// A valid token, fetched or refreshed as needed. Concurrent callers for
    /// the same key share one fetch.
    pub async fn get_token(&self, config: &OAuthClientCredentialsConfig) -> Result<CachedToken> {
        let secret_digest = Sha256::digest(config.client_secret.expose_secret().as_bytes());
        let cache_key = format!(
            "{}:{}:{:x}",
            config.token_url, config.client_id, secret_digest
        );

        let cached = self.cached_or_fetch(&cache_key, config).await?;
        if !cached.is_expired() {
            return Ok(cached);
        }

        tracing::info!("OAuth token for '{}' expired, refreshing", config.client_id);
        self.cache.invalidate(&cache_key).await;
        self.cached_or_fetch(&cache_key, config).await
    }

    async fn cached_or_fetch(
        &self,
        cache_key: &str,
        config: &OAuthClientCredentialsConfig,
    ) -> Result<CachedToken> {
        self.cache
            .try_get_with(cache_key.to_string(), async move {
                tracing::info!("Fetching new OAuth token from {}", config.token_url);
                let response = self.fetch_token(config).await?;
                let expires_in =
                    Duration::from_secs(response.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS));
                Ok(CachedToken::issued(response.access_token, expires_in)) as Result<CachedToken>
            })
            .await
            .map_err(|e| anyhow::anyhow!("Token fetch failed: {}", e))
    }

    async fn fetch_token(&self, config: &OAuthClientCredentialsConfig) -> Result<TokenResponse> {
        let scope = config.scopes.join(" ");

        let mut form = vec![
            ("grant_type", "client_credentials"),
            ("client_id", config.client_id.as_str()),
            ("client_secret", config.client_secret.expose_secret()),
        ];
        if !scope.is_empty() {
            form.push(("scope", scope.as_str()));
        }

        let resp = self
            .client
            .post(&config.token_url)
            .form(&form)
            .send()
            .await
            .context("Failed to send OAuth token request")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("OAuth token request failed: {} - {}", status, body);
        }

        resp.json::<TokenResponse>()
            .await
            .context("Failed to parse OAuth token response")
    }
}

impl Default for OAuthTokenCache {
    fn default() -> Self {
        Self::new(reqwest::Client::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(server: &MockServer, client_id: &str) -> OAuthClientCredentialsConfig {
        OAuthClientCredentialsConfig {
            client_id: client_id.to_string(),
            client_secret: SecretString::from("secret".to_string()),
            token_url: format!("{}/oauth/token", server.uri()),
            scopes: vec!["read".to_string()],
        }
    }

    #[tokio::test]
    async fn test_fetch_and_cache_token() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .and(body_string_contains("grant_type=client_credentials"))
            .and(body_string_contains("client_id=svc"))
            .and(body_string_contains("scope=read"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "mock_token",
                "token_type": "Bearer",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let cache = OAuthTokenCache::default();
        let cfg = config(&mock_server, "svc");
        let first = cache.get_token(&cfg).await.unwrap();
        let second = cache.get_token(&cfg).await.unwrap();
        assert_eq!(first.access_token.expose_secret(), "mock_token");
        assert_eq!(second.access_token.expose_secret(), "mock_token");
    }

    #[tokio::test]
    async fn test_short_lived_token_is_served_then_refreshed() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "short_lived",
                "expires_in": 1
            })))
            .up_to_n_times(1)
            .expect(1)
            .mount(&mock_server)
            .await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "fresh",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let cache = OAuthTokenCache::default();
        let cfg = config(&mock_server, "svc");
        let token = cache.get_token(&cfg).await.unwrap();
        assert_eq!(token.access_token.expose_secret(), "short_lived");

        tokio::time::sleep(Duration::from_millis(600)).await;
        let token = cache.get_token(&cfg).await.unwrap();
        assert_eq!(token.access_token.expose_secret(), "fresh");
    }

    #[tokio::test]
    async fn test_rotated_secret_fetches_new_token() {
        let mock_server = MockServer::start().await;
        for (secret, token) in [("old", "token_old"), ("new", "token_new")] {
            Mock::given(method("POST"))
                .and(path("/oauth/token"))
                .and(body_string_contains(format!("client_secret={}", secret)))
                .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                    "access_token": token,
                    "expires_in": 3600
                })))
                .expect(1)
                .mount(&mock_server)
                .await;
        }

        let cache = OAuthTokenCache::default();
        let mut cfg = config(&mock_server, "svc");
        cfg.client_secret = SecretString::from("old".to_string());
        let first = cache.get_token(&cfg).await.unwrap();
        assert_eq!(first.access_token.expose_secret(), "token_old");

        cfg.client_secret = SecretString::from("new".to_string());
        let second = cache.get_token(&cfg).await.unwrap();
        assert_eq!(second.access_token.expose_secret(), "token_new");
    }

    #[tokio::test]
    async fn test_token_endpoint_failure() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid_client"))
            .mount(&mock_server)
            .await;

        let cache = OAuthTokenCache::default();
        let err = cache
            .get_token(&config(&mock_server, "bad"))
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("401"));
    }
}
