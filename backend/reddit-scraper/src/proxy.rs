/// Proxy pool: loading, connectivity testing, rotation, health counters
///
/// Proxies live in `reddit_proxies` and are curated by hand; the rotator
/// never deactivates one mid-cycle, it only reports success/error counts
/// back for the humans to act on.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::future::join_all;
use tracing::{error, info, warn};

use crate::api::user_agents::UserAgents;
use crate::store::RedditStore;

/// Probe endpoint: any response at all proves the proxy routes traffic
const TEST_URL: &str = "https://www.reddit.com/api/v1/me.json";
const TEST_ATTEMPTS: u32 = 3;
const TEST_ATTEMPT_PAUSE: Duration = Duration::from_secs(2);
const TEST_TIMEOUT: Duration = Duration::from_secs(15);

/// One `reddit_proxies` row
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Proxy {
    pub id: i64,
    pub service_name: Option<String>,
    pub proxy_url: String,
    pub proxy_username: Option<String>,
    pub proxy_password: Option<String>,
    pub display_name: Option<String>,
    pub priority: i32,
    pub max_threads: i32,
}

impl Proxy {
    /// Name used in logs
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.proxy_url)
    }

    /// Build the reqwest proxy, attaching basic auth when configured
    pub fn as_reqwest_proxy(&self) -> Result<reqwest::Proxy, reqwest::Error> {
        let proxy = reqwest::Proxy::all(format!("http://{}", self.proxy_url))?;
        Ok(
            match (&self.proxy_username, &self.proxy_password) {
                (Some(user), Some(pass)) => proxy.basic_auth(user, pass),
                _ => proxy,
            },
        )
    }
}

/// Round-robin rotation over the active proxies
pub struct ProxyPool<S: RedditStore> {
    store: Arc<S>,
    proxies: RwLock<Vec<Proxy>>,
    index: AtomicUsize,
}

impl<S: RedditStore> ProxyPool<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            proxies: RwLock::new(Vec::new()),
            index: AtomicUsize::new(0),
        }
    }

    /// Load active proxies ordered by priority. Returns the count.
    pub async fn load(&self) -> Result<usize, crate::store::StoreError> {
        let proxies = self.store.load_active_proxies().await?;
        let count = proxies.len();
        if count == 0 {
            error!("no active proxies found in database");
        }
        *self.proxies.write().unwrap() = proxies;
        self.index.store(0, Ordering::SeqCst);
        Ok(count)
    }

    pub fn len(&self) -> usize {
        self.proxies.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Next proxy in round-robin order. Concurrent callers get distinct
    /// successive proxies; the counter may skip harmlessly under races.
    pub fn next(&self) -> Option<Proxy> {
        let proxies = self.proxies.read().unwrap();
        if proxies.is_empty() {
            return None;
        }
        let idx = self.index.fetch_add(1, Ordering::Relaxed) % proxies.len();
        Some(proxies[idx].clone())
    }

    /// Probe every proxy concurrently; returns how many passed.
    ///
    /// Each proxy gets up to three attempts with early exit on the first
    /// response. 200/401/403 all count: reaching Reddit at all proves the
    /// route works.
    pub async fn test_all(&self, ua: &UserAgents) -> usize {
        let proxies = self.proxies.read().unwrap().clone();
        if proxies.is_empty() {
            return 0;
        }

        info!("testing {} proxies...", proxies.len());

        let probes = proxies.iter().map(|proxy| {
            let ua = ua.clone();
            async move {
                let passed = test_proxy(proxy, &ua).await;
                (proxy.id, proxy.label().to_string(), passed)
            }
        });
        let results = join_all(probes).await;

        // Record the test round in the proxy health counters (best-effort)
        for (id, label, passed) in &results {
            self.update_stats(*id, *passed).await;
            if *passed {
                info!("proxy {} passed connectivity test", label);
            } else {
                warn!("proxy {} failed connectivity test", label);
            }
        }

        self.index.store(0, Ordering::SeqCst);
        results.iter().filter(|(_, _, passed)| *passed).count()
    }

    /// Increment success/error counters; failures here are swallowed
    /// (best-effort telemetry).
    pub async fn update_stats(&self, proxy_id: i64, success: bool) {
        if let Err(e) = self.store.bump_proxy_stat(proxy_id, success).await {
            tracing::debug!(proxy_id, "failed to update proxy stats: {}", e);
        }
    }
}

async fn test_proxy(proxy: &Proxy, ua: &UserAgents) -> bool {
    for attempt in 0..TEST_ATTEMPTS {
        let Ok(reqwest_proxy) = proxy.as_reqwest_proxy() else {
            return false;
        };
        let client = reqwest::Client::builder()
            .proxy(reqwest_proxy)
            .timeout(TEST_TIMEOUT)
            .build();

        if let Ok(client) = client {
            let response = client
                .get(TEST_URL)
                .header(reqwest::header::USER_AGENT, ua.generate())
                .send()
                .await;

            if let Ok(response) = response {
                // 401/403 are expected without credentials
                if matches!(response.status().as_u16(), 200 | 401 | 403) {
                    return true;
                }
            }
        }

        if attempt + 1 < TEST_ATTEMPTS {
            tokio::time::sleep(TEST_ATTEMPT_PAUSE).await;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::MemoryStore;
    use std::collections::HashMap;

    fn proxy(id: i64, priority: i32) -> Proxy {
        Proxy {
            id,
            service_name: Some("testsvc".into()),
            proxy_url: format!("proxy-{}.example.com:8080", id),
            proxy_username: Some("user".into()),
            proxy_password: Some("pass".into()),
            display_name: Some(format!("proxy-{}", id)),
            priority,
            max_threads: 5,
        }
    }

    #[tokio::test]
    async fn load_orders_and_counts() {
        let store = Arc::new(MemoryStore::default());
        store.seed_proxies(vec![proxy(1, 10), proxy(2, 20), proxy(3, 5)]);

        let pool = ProxyPool::new(store);
        assert_eq!(pool.load().await.unwrap(), 3);
        // Highest priority first
        assert_eq!(pool.next().unwrap().id, 2);
    }

    #[tokio::test]
    async fn rotation_is_fair() {
        let store = Arc::new(MemoryStore::default());
        store.seed_proxies(vec![proxy(1, 3), proxy(2, 2), proxy(3, 1)]);

        let pool = ProxyPool::new(store);
        pool.load().await.unwrap();

        // 3 proxies, 9 calls: each proxy exactly 3 times
        let mut seen: HashMap<i64, usize> = HashMap::new();
        for _ in 0..9 {
            *seen.entry(pool.next().unwrap().id).or_default() += 1;
        }
        assert!(seen.values().all(|&n| n == 3), "unfair rotation: {:?}", seen);
    }

    #[tokio::test]
    async fn next_on_empty_pool_is_none() {
        let store = Arc::new(MemoryStore::default());
        let pool = ProxyPool::new(store);
        pool.load().await.unwrap();
        assert!(pool.next().is_none());
    }

    #[test]
    fn proxy_url_with_auth() {
        let p = proxy(1, 1);
        // Builds without error; auth is attached via basic_auth
        assert!(p.as_reqwest_proxy().is_ok());
        assert_eq!(p.label(), "proxy-1");
    }
}
