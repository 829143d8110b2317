// =============================================================================
// Upstream API proxy — /api/1/binance/proxy/* with a one second cache
// =============================================================================
//
// Requests are shelled through to the exchange REST API. Responses are
// cached in memory for one second, keyed by the fully-reconstructed upstream
// URL, which collapses dashboard polling bursts into a single upstream hit.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use parking_lot::RwLock;
use tracing::{debug, warn};

const DEFAULT_UPSTREAM: &str = "https://api.binance.com";

/// How long a cached upstream response stays servable.
const CACHE_TTL: Duration = Duration::from_secs(1);

#[derive(Clone)]
struct CacheEntry {
    at: Instant,
    status: u16,
    content_type: String,
    content: Vec<u8>,
}

pub struct ApiProxy {
    upstream: String,
    client: reqwest::Client,
    cache: RwLock<HashMap<String, CacheEntry>>,
    /// Number of requests that actually went upstream; cache hits do not
    /// count. Exposed for tests.
    upstream_fetches: AtomicU64,
}

impl Default for ApiProxy {
    fn default() -> Self {
        Self::new(DEFAULT_UPSTREAM)
    }
}

impl ApiProxy {
    pub fn new(upstream: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            upstream: upstream.into(),
            client,
            cache: RwLock::new(HashMap::new()),
            upstream_fetches: AtomicU64::new(0),
        }
    }

    pub fn upstream_fetch_count(&self) -> u64 {
        self.upstream_fetches.load(Ordering::Relaxed)
    }

    /// Proxy `path` (+ optional raw query) to the upstream, serving from the
    /// one second cache when possible.
    pub async fn handle(&self, path: &str, raw_query: Option<&str>) -> Response {
        let url = match raw_query {
            Some(query) if !query.is_empty() => {
                format!("{}/{}?{}", self.upstream, path, query)
            }
            _ => format!("{}/{}", self.upstream, path),
        };

        if let Some(entry) = self.get_cached(&url) {
            debug!(url = %url, "proxy cache hit");
            return Self::respond(entry);
        }

        self.upstream_fetches.fetch_add(1, Ordering::Relaxed);
        let resp = match self.client.get(&url).send().await {
            Ok(resp) => resp,
            Err(e) => {
                warn!(url = %url, error = %e, "proxy upstream request failed");
                return StatusCode::BAD_GATEWAY.into_response();
            }
        };

        let status = resp.status().as_u16();
        let content_type = resp
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/json")
            .to_string();
        let content = match resp.bytes().await {
            Ok(bytes) => bytes.to_vec(),
            Err(e) => {
                warn!(url = %url, error = %e, "proxy upstream body read failed");
                return StatusCode::BAD_GATEWAY.into_response();
            }
        };

        let entry = CacheEntry {
            at: Instant::now(),
            status,
            content_type,
            content,
        };
        self.cache.write().insert(url, entry.clone());

        Self::respond(entry)
    }

    fn get_cached(&self, url: &str) -> Option<CacheEntry> {
        let cache = self.cache.read();
        let entry = cache.get(url)?;
        if entry.at.elapsed() <= CACHE_TTL {
            Some(entry.clone())
        } else {
            None
        }
    }

    fn respond(entry: CacheEntry) -> Response {
        (
            StatusCode::from_u16(entry.status).unwrap_or(StatusCode::OK),
            [
                (header::CONTENT_TYPE, entry.content_type),
                (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*".to_string()),
            ],
            entry.content,
        )
            .into_response()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(age: Duration) -> CacheEntry {
        CacheEntry {
            at: Instant::now() - age,
            status: 200,
            content_type: "application/json".into(),
            content: b"{}".to_vec(),
        }
    }

    #[test]
    fn fresh_entries_are_served_from_cache() {
        let proxy = ApiProxy::default();
        let url = "https://api.binance.com/api/v3/time";
        proxy.cache.write().insert(url.into(), entry(Duration::ZERO));

        assert!(proxy.get_cached(url).is_some());
        assert_eq!(proxy.upstream_fetch_count(), 0);
    }

    #[test]
    fn stale_entries_are_not_served() {
        let proxy = ApiProxy::default();
        let url = "https://api.binance.com/api/v3/time";
        proxy
            .cache
            .write()
            .insert(url.into(), entry(Duration::from_millis(1500)));

        assert!(proxy.get_cached(url).is_none());
    }

    #[test]
    fn distinct_urls_have_distinct_entries() {
        let proxy = ApiProxy::default();
        proxy
            .cache
            .write()
            .insert("https://x/a?s=1".into(), entry(Duration::ZERO));

        assert!(proxy.get_cached("https://x/a?s=1").is_some());
        assert!(proxy.get_cached("https://x/a?s=2").is_none());
    }
}
