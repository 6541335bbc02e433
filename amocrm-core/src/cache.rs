//! Read-side response cache with prefix invalidation.
//!
//! The cache stores decoded bodies of successful GET/HEAD responses for an
//! allow-list of reference paths (account info, users, widgets, custom fields,
//! pipelines). Transactional listings such as leads or contacts are never
//! cached, but their mutations still invalidate everything cached under their
//! path.
//!
//! # Architecture
//!
//! - [`ResponseCache`] wraps a moka async cache bounded by entry count and TTL.
//! - [`CachingTransport`] decorates any [`Transport`] and consults the cache.
//! - [`CacheInvalidator`] is the seam used by the mutation wrapper in
//!   [`crate::rest::cached`].
//!
//! Invalidation after a mutation is a separate step. A concurrent reader may
//! observe the previous value between the mutation committing and the
//! invalidation completing.

use crate::transport::{self, Request, Transport};
use async_trait::async_trait;
use moka::future::Cache;
use reqwest::Method;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Paths whose GET responses may be cached.
pub const DEFAULT_CACHEABLE_PATHS: &[&str] = &[
    "/api/v4/account",
    "/api/v4/widgets",
    "/api/v4/users",
    "/api/v4/leads/custom_fields",
    "/api/v4/contacts/custom_fields",
    "/api/v4/companies/custom_fields",
    "/api/v4/customers/custom_fields",
    "/api/v4/leads/pipelines",
    "/oauth2/access_token",
];

/// Response cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Time-to-live of each entry.
    pub ttl: Duration,
    /// Maximum number of entries.
    pub max_entries: u64,
    /// Path prefixes eligible for caching.
    pub cacheable_paths: Vec<String>,
}

impl Default for CacheConfig {
    /// Reads `AMOCRM_CACHE_TTL_MINUTES` and `AMOCRM_CACHE_MAX_ENTRIES`,
    /// falling back to the crate defaults.
    fn default() -> Self {
        let ttl_minutes = std::env::var("AMOCRM_CACHE_TTL_MINUTES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(crate::DEFAULT_CACHE_TTL_MINUTES);
        let max_entries = std::env::var("AMOCRM_CACHE_MAX_ENTRIES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(crate::DEFAULT_CACHE_MAX_ENTRIES);

        Self {
            ttl: Duration::from_secs(ttl_minutes.saturating_mul(60)),
            max_entries,
            cacheable_paths: DEFAULT_CACHEABLE_PATHS
                .iter()
                .map(|path| path.to_string())
                .collect(),
        }
    }
}

impl CacheConfig {
    /// Sets the entry lifetime in minutes.
    pub fn with_ttl_minutes(mut self, minutes: u64) -> Self {
        self.ttl = Duration::from_secs(minutes.saturating_mul(60));
        self
    }

    /// Sets the entry lifetime.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Sets the maximum number of entries.
    pub fn with_max_entries(mut self, max_entries: u64) -> Self {
        self.max_entries = max_entries;
        self
    }

    /// Replaces the cacheable path allow-list.
    pub fn with_cacheable_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cacheable_paths = paths.into_iter().map(Into::into).collect();
        self
    }
}

/// Normalized request identity: method, URL with sorted query pairs and a
/// fingerprint of the bearer token.
///
/// Entries are never shared between tokens, so a revoked or less privileged
/// token still reaches the server and gets its own 401/403.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    method: Method,
    path: String,
    url: String,
    token: String,
}

impl CacheKey {
    /// Builds the key for `method` and `url` as requested with `access_token`.
    ///
    /// Only a SHA-256 digest of the token is kept.
    pub fn new(method: &Method, url: &Url, access_token: &str) -> Self {
        let mut normalized = url.clone();
        normalized.set_fragment(None);

        let mut pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        if pairs.is_empty() {
            normalized.set_query(None);
        } else {
            pairs.sort();
            normalized.query_pairs_mut().clear().extend_pairs(pairs);
        }

        Self {
            method: method.clone(),
            path: url.path().to_string(),
            url: normalized.to_string(),
            token: token_fingerprint(access_token),
        }
    }

    /// URL path the key belongs to.
    pub fn path(&self) -> &str {
        &self.path
    }
}

fn token_fingerprint(access_token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(access_token.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Evicts cached entries by resource path.
#[async_trait]
pub trait CacheInvalidator: Send + Sync {
    /// Evicts every entry whose URL path starts with `path_prefix` and returns
    /// the number of evicted entries.
    async fn invalidate_prefix(&self, path_prefix: &str) -> u64;
}

/// Concurrent, bounded cache of successful read responses.
#[derive(Clone)]
pub struct ResponseCache {
    cache: Cache<CacheKey, Value>,
    config: CacheConfig,
}

impl std::fmt::Debug for ResponseCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseCache")
            .field("config", &self.config)
            .field("entry_count", &self.cache.entry_count())
            .finish()
    }
}

impl ResponseCache {
    /// Creates an empty cache.
    pub fn new(config: CacheConfig) -> Self {
        debug!(
            ttl_seconds = config.ttl.as_secs(),
            max_entries = config.max_entries,
            "Response cache configured"
        );

        let cache = Cache::builder()
            .max_capacity(config.max_entries)
            .time_to_live(config.ttl)
            .build();

        Self { cache, config }
    }

    /// Returns the cache configuration.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Whether a request with this method and URL may be served from or stored
    /// in the cache.
    pub fn should_cache(&self, method: &Method, url: &Url) -> bool {
        if *method != Method::GET && *method != Method::HEAD {
            return false;
        }
        let path = url.path();
        self.config
            .cacheable_paths
            .iter()
            .any(|allowed| path.starts_with(allowed.as_str()))
    }

    /// Looks up a cached response.
    pub async fn get(&self, key: &CacheKey) -> Option<Value> {
        let result = self.cache.get(key).await;
        debug!(url = %key.url, hit = result.is_some(), "Response cache lookup");
        result
    }

    /// Stores a successful response.
    pub async fn insert(&self, key: CacheKey, body: Value) {
        self.cache.insert(key, body).await;
    }

    /// Returns the approximate number of entries.
    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }

    /// Runs pending eviction work.
    pub async fn run_pending_tasks(&self) {
        self.cache.run_pending_tasks().await;
    }
}

#[async_trait]
impl CacheInvalidator for ResponseCache {
    async fn invalidate_prefix(&self, path_prefix: &str) -> u64 {
        let prefix = format!("/{}", path_prefix.trim_start_matches('/'));

        self.cache.run_pending_tasks().await;
        let keys: Vec<CacheKey> = self
            .cache
            .iter()
            .filter(|(key, _)| key.path.starts_with(&prefix))
            .map(|(key, _)| (*key).clone())
            .collect();

        for key in &keys {
            self.cache.invalidate(key).await;
        }

        debug!(prefix = %prefix, evicted = keys.len(), "Response cache invalidated");
        keys.len() as u64
    }
}

/// [`Transport`] decorator serving allow-listed reads from a [`ResponseCache`].
#[derive(Debug, Clone)]
pub struct CachingTransport<T> {
    inner: T,
    cache: Arc<ResponseCache>,
}

impl<T: Transport> CachingTransport<T> {
    /// Wraps `inner` with `cache`.
    pub fn new(inner: T, cache: Arc<ResponseCache>) -> Self {
        Self { inner, cache }
    }

    /// Returns the shared cache.
    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }
}

#[async_trait]
impl<T: Transport> Transport for CachingTransport<T> {
    async fn send(&self, request: Request) -> Result<Value, transport::Error> {
        if !self.cache.should_cache(&request.method, &request.url) {
            return self.inner.send(request).await;
        }

        let key = CacheKey::new(&request.method, &request.url, &request.access_token);
        if let Some(body) = self.cache.get(&key).await {
            return Ok(body);
        }

        let body = self.inner.send(request).await?;
        self.cache.insert(key, body.clone()).await;
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::AccessContext;
    use crate::rest::testing::ScriptedTransport;
    use serde_json::json;

    fn url(raw: &str) -> Url {
        Url::parse(raw).unwrap()
    }

    fn context() -> AccessContext {
        AccessContext::new("example.amocrm.ru", "token").unwrap()
    }

    fn cache() -> Arc<ResponseCache> {
        Arc::new(ResponseCache::new(
            CacheConfig::default()
                .with_ttl_minutes(5)
                .with_max_entries(100),
        ))
    }

    #[test]
    fn test_config_builders() {
        let config = CacheConfig::default()
            .with_ttl_minutes(2)
            .with_max_entries(7)
            .with_cacheable_paths(["/api/v4/account"]);
        assert_eq!(config.ttl, Duration::from_secs(120));
        assert_eq!(config.max_entries, 7);
        assert_eq!(config.cacheable_paths, vec!["/api/v4/account".to_string()]);
    }

    #[test]
    fn test_should_cache_allow_list() {
        let cache = cache();
        assert!(cache.should_cache(&Method::GET, &url("https://a.amocrm.ru/api/v4/account")));
        assert!(cache.should_cache(
            &Method::HEAD,
            &url("https://a.amocrm.ru/api/v4/users?page=2")
        ));
        assert!(cache.should_cache(
            &Method::GET,
            &url("https://a.amocrm.ru/api/v4/leads/pipelines/12/statuses")
        ));
        assert!(!cache.should_cache(&Method::GET, &url("https://a.amocrm.ru/api/v4/leads")));
        assert!(!cache.should_cache(
            &Method::GET,
            &url("https://a.amocrm.ru/api/v4/contacts?page=1")
        ));
        assert!(!cache.should_cache(&Method::POST, &url("https://a.amocrm.ru/api/v4/users")));
        assert!(!cache.should_cache(
            &Method::PATCH,
            &url("https://a.amocrm.ru/api/v4/account")
        ));
    }

    #[test]
    fn test_cache_key_normalizes_query_order() {
        let a = CacheKey::new(
            &Method::GET,
            &url("https://a.amocrm.ru/api/v4/users?limit=250&page=1"),
            "token",
        );
        let b = CacheKey::new(
            &Method::GET,
            &url("https://a.amocrm.ru/api/v4/users?page=1&limit=250#top"),
            "token",
        );
        assert_eq!(a, b);
        assert_eq!(a.path(), "/api/v4/users");

        let head = CacheKey::new(
            &Method::HEAD,
            &url("https://a.amocrm.ru/api/v4/users?page=1&limit=250"),
            "token",
        );
        assert_ne!(a, head);
    }

    #[test]
    fn test_cache_key_separates_tokens_without_storing_them() {
        let account = url("https://a.amocrm.ru/api/v4/account");
        let first = CacheKey::new(&Method::GET, &account, "token-a");
        let second = CacheKey::new(&Method::GET, &account, "token-b");

        assert_ne!(first, second);
        assert_eq!(first, CacheKey::new(&Method::GET, &account, "token-a"));
        assert!(!format!("{first:?}").contains("token-a"));
    }

    #[tokio::test]
    async fn test_invalidate_prefix_evicts_matching_paths_only() {
        let cache = cache();
        cache
            .insert(
                CacheKey::new(
                    &Method::GET,
                    &url("https://a.amocrm.ru/api/v4/leads/pipelines"),
                    "token",
                ),
                json!({"pipelines": 1}),
            )
            .await;
        cache
            .insert(
                CacheKey::new(
                    &Method::GET,
                    &url("https://a.amocrm.ru/api/v4/leads/pipelines?page=2"),
                    "other-token",
                ),
                json!({"pipelines": 2}),
            )
            .await;
        let account = CacheKey::new(
            &Method::GET,
            &url("https://a.amocrm.ru/api/v4/account"),
            "token",
        );
        cache.insert(account.clone(), json!({"id": 1})).await;

        let evicted = cache.invalidate_prefix("api/v4/leads").await;
        assert_eq!(evicted, 2);
        assert_eq!(cache.get(&account).await, Some(json!({"id": 1})));

        cache.run_pending_tasks().await;
        assert_eq!(cache.entry_count(), 1);
    }

    #[tokio::test]
    async fn test_caching_transport_serves_repeated_reads_from_cache() {
        let inner = ScriptedTransport::new(vec![Ok(json!({"id": 7, "name": "Account"}))]);
        let transport = CachingTransport::new(inner.clone(), cache());
        let request = Request::get(url("https://a.amocrm.ru/api/v4/account"), &context());

        let first = transport.send(request.clone()).await.unwrap();
        let second = transport.send(request).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(inner.request_count(), 1);
    }

    #[tokio::test]
    async fn test_caching_transport_does_not_share_entries_between_tokens() {
        let inner = ScriptedTransport::new(vec![
            Ok(json!({"id": 7, "name": "Account"})),
            Err(transport::Error::Authentication {
                status: 401,
                message: "Unauthorized".to_string(),
            }),
        ]);
        let transport = CachingTransport::new(inner.clone(), cache());
        let account = url("https://a.amocrm.ru/api/v4/account");
        let other = AccessContext::new("a.amocrm.ru", "revoked-token").unwrap();

        transport
            .send(Request::get(account.clone(), &context()))
            .await
            .unwrap();
        let error = transport
            .send(Request::get(account.clone(), &other))
            .await
            .unwrap_err();

        assert!(matches!(error, transport::Error::Authentication { status: 401, .. }));
        assert_eq!(inner.request_count(), 2);
        assert_eq!(inner.requests()[1].access_token, "revoked-token");
        assert!(transport
            .send(Request::get(account, &context()))
            .await
            .is_ok());
        assert_eq!(inner.request_count(), 2);
    }

    #[tokio::test]
    async fn test_caching_transport_bypasses_transactional_paths() {
        let inner = ScriptedTransport::new(vec![Ok(json!({"a": 1})), Ok(json!({"a": 2}))]);
        let transport = CachingTransport::new(inner.clone(), cache());
        let request = Request::get(url("https://a.amocrm.ru/api/v4/leads"), &context());

        assert_eq!(transport.send(request.clone()).await.unwrap(), json!({"a": 1}));
        assert_eq!(transport.send(request).await.unwrap(), json!({"a": 2}));
        assert_eq!(inner.request_count(), 2);
        assert_eq!(transport.cache().entry_count(), 0);
    }

    #[tokio::test]
    async fn test_caching_transport_does_not_cache_failures() {
        let inner = ScriptedTransport::new(vec![
            Err(transport::Error::Http {
                status: 503,
                message: "Service Unavailable".to_string(),
            }),
            Ok(json!({"id": 7})),
        ]);
        let transport = CachingTransport::new(inner.clone(), cache());
        let request = Request::get(url("https://a.amocrm.ru/api/v4/account"), &context());

        assert!(transport.send(request.clone()).await.is_err());
        assert_eq!(transport.send(request.clone()).await.unwrap(), json!({"id": 7}));
        assert_eq!(transport.send(request).await.unwrap(), json!({"id": 7}));
        assert_eq!(inner.request_count(), 2);
    }

    #[tokio::test]
    async fn test_caching_transport_passes_mutations_through() {
        let inner = ScriptedTransport::new(vec![Ok(json!({})), Ok(json!({}))]);
        let transport = CachingTransport::new(inner.clone(), cache());
        let request = Request::with_body(
            Method::POST,
            url("https://a.amocrm.ru/api/v4/users"),
            &context(),
            json!([{"name": "Manager"}]),
        );

        transport.send(request.clone()).await.unwrap();
        transport.send(request).await.unwrap();
        assert_eq!(inner.request_count(), 2);
    }
}
