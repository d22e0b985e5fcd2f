//! Provider preflight cache
//!
//! Local LLM servers (LM Studio, Ollama) are routinely not running; probing
//! them in parallel with retrieval costs nothing, and caching the result for
//! 60 seconds keeps repeated turns from hammering a dead port. The cached
//! value includes the error string, so a failing probe short-circuits
//! identically until the TTL expires.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;

/// Cache TTL
const TTL: Duration = Duration::from_secs(60);

/// Probe deadline
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Cached probe results keyed `provider:base_url`.
pub struct PreflightCache {
    entries: Mutex<LruCache<String, (Instant, Option<String>)>>,
}

impl Default for PreflightCache {
    fn default() -> Self {
        Self::new()
    }
}

impl PreflightCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(LruCache::new(
                NonZeroUsize::new(32).expect("cache capacity is non-zero"),
            )),
        }
    }

    /// Check a local provider. Returns `None` when reachable, or a
    /// user-facing error message. Results (including errors) are cached for
    /// the TTL.
    pub async fn check(&self, provider: &str, base_url: &str) -> Option<String> {
        let key = format!("{provider}:{base_url}");
        if let Ok(mut cache) = self.entries.lock() {
            if let Some((stamp, cached)) = cache.get(&key) {
                if stamp.elapsed() < TTL {
                    return cached.clone();
                }
            }
        }

        let result = probe(provider, base_url).await;
        if let Ok(mut cache) = self.entries.lock() {
            cache.put(key, (Instant::now(), result.clone()));
        }
        result
    }

    /// Seed a cache entry (tests).
    #[cfg(test)]
    pub fn seed(&self, provider: &str, base_url: &str, error: Option<String>) {
        let key = format!("{provider}:{base_url}");
        if let Ok(mut cache) = self.entries.lock() {
            cache.put(key, (Instant::now(), error));
        }
    }
}

async fn probe(provider: &str, base_url: &str) -> Option<String> {
    let probe_url = match provider {
        "ollama" => format!("{}/api/tags", base_url.trim_end_matches('/')),
        _ => format!("{}/v1/models", base_url.trim_end_matches('/')),
    };
    let client = reqwest::Client::builder()
        .timeout(PROBE_TIMEOUT)
        .build()
        .ok()?;

    let reachable = match client.get(&probe_url).send().await {
        Ok(response) => response.status().as_u16() < 400,
        Err(_) => false,
    };
    if reachable {
        return None;
    }

    let server_name = if provider == "lmstudio" { "LM Studio" } else { "Ollama" };
    Some(format!(
        "⚠️ **{server_name} is selected but not reachable at `{base_url}`.**\n\n\
         Make sure {server_name} is running and its API server is started.",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cached_error_is_returned_within_ttl() {
        let cache = PreflightCache::new();
        cache.seed("lmstudio", "http://localhost:1234", Some("down".to_string()));
        // Fresh probe never runs; the seeded value comes straight back
        assert_eq!(
            cache.check("lmstudio", "http://localhost:1234").await,
            Some("down".to_string())
        );
        // Same tuple again on a second hit
        assert_eq!(
            cache.check("lmstudio", "http://localhost:1234").await,
            Some("down".to_string())
        );
    }

    #[tokio::test]
    async fn test_cached_success_is_returned() {
        let cache = PreflightCache::new();
        cache.seed("ollama", "http://localhost:11434", None);
        assert_eq!(cache.check("ollama", "http://localhost:11434").await, None);
    }

    #[tokio::test]
    async fn test_distinct_urls_have_distinct_entries() {
        let cache = PreflightCache::new();
        cache.seed("lmstudio", "http://a:1234", Some("down".to_string()));
        cache.seed("lmstudio", "http://b:1234", None);
        assert!(cache.check("lmstudio", "http://a:1234").await.is_some());
        assert!(cache.check("lmstudio", "http://b:1234").await.is_none());
    }
}
