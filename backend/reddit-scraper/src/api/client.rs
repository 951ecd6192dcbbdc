/// HTTP client for the public Reddit JSON API
///
/// Every attempt uses a fresh transport and a fresh user agent so
/// consecutive requests do not share a TLS/connection fingerprint.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::api::user_agents::UserAgents;
use crate::proxy::{Proxy, ProxyPool};
use crate::store::RedditStore;

/// Per-attempt timeout
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
/// Rate-limit retries allowed before giving up
const RATE_LIMIT_MAX_RETRIES: u32 = 5;

/// Transport-layer error classification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiErrorKind {
    /// 404 with `reason=banned` body
    Banned,
    /// Plain 404
    NotFound,
    /// 403 (quarantined/private/suspended)
    Forbidden,
    /// 429 beyond the retry budget
    RateLimited,
    Timeout,
    Network(String),
    Decode(String),
    /// The rotator had no proxy to offer
    NoProxy,
}

impl ApiErrorKind {
    /// Terminal for the current entity: convert to a domain outcome
    /// (e.g. mark the subreddit Banned) instead of retrying.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Banned | Self::NotFound | Self::Forbidden)
    }
}

impl fmt::Display for ApiErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Banned => write!(f, "banned"),
            Self::NotFound => write!(f, "not_found"),
            Self::Forbidden => write!(f, "forbidden"),
            Self::RateLimited => write!(f, "rate_limited"),
            Self::Timeout => write!(f, "timeout"),
            Self::Network(e) => write!(f, "network: {}", e),
            Self::Decode(e) => write!(f, "decode: {}", e),
            Self::NoProxy => write!(f, "no_proxy"),
        }
    }
}

pub struct HttpClient<S: RedditStore> {
    pool: Arc<ProxyPool<S>>,
    ua: UserAgents,
    max_retries: u32,
    base_delay: Duration,
}

impl<S: RedditStore> HttpClient<S> {
    pub fn new(pool: Arc<ProxyPool<S>>, ua: UserAgents, max_retries: u32, base_delay: Duration) -> Self {
        Self {
            pool,
            ua,
            max_retries,
            base_delay,
        }
    }

    /// GET `url` through `proxy`, with retry and status classification.
    pub async fn get_json(
        &self,
        url: &str,
        proxy: &Proxy,
    ) -> Result<serde_json::Value, ApiErrorKind> {
        let mut retries = 0u32;
        let mut rate_limit_retries = 0u32;

        loop {
            let started = Instant::now();

            let response = self.attempt(url, proxy).await;
            let elapsed_ms = started.elapsed().as_millis() as u64;

            match response {
                Ok(response) => {
                    let status = response.status().as_u16();
                    let endpoint = endpoint_of(url);
                    info!("REDDIT API: {} [{}] {}ms", endpoint, status, elapsed_ms);

                    match status {
                        200 => {
                            self.pool.update_stats(proxy.id, true).await;
                            return response
                                .json::<serde_json::Value>()
                                .await
                                .map_err(|e| ApiErrorKind::Decode(e.to_string()));
                        }
                        404 => {
                            // A banned subreddit still answers 404, but the
                            // body names the reason
                            self.pool.update_stats(proxy.id, true).await;
                            let body: Option<serde_json::Value> = response.json().await.ok();
                            let banned = body
                                .as_ref()
                                .and_then(|b| b.get("reason"))
                                .and_then(|r| r.as_str())
                                == Some("banned");
                            return Err(if banned {
                                warn!("banned: {}", endpoint);
                                ApiErrorKind::Banned
                            } else {
                                warn!("not found: {}", endpoint);
                                ApiErrorKind::NotFound
                            });
                        }
                        403 => {
                            self.pool.update_stats(proxy.id, true).await;
                            warn!("forbidden: {}", endpoint);
                            return Err(ApiErrorKind::Forbidden);
                        }
                        429 => {
                            let delay = Duration::from_secs((5 + 2 * rate_limit_retries as u64).min(30));
                            warn!("rate limited - waiting {:?}", delay);
                            if rate_limit_retries >= RATE_LIMIT_MAX_RETRIES {
                                self.pool.update_stats(proxy.id, false).await;
                                return Err(ApiErrorKind::RateLimited);
                            }
                            tokio::time::sleep(delay).await;
                            rate_limit_retries += 1;
                            continue;
                        }
                        _ => {
                            // Unexpected status: treat like a transport error
                            self.pool.update_stats(proxy.id, false).await;
                            retries += 1;
                            if retries >= self.max_retries {
                                return Err(ApiErrorKind::Network(format!("HTTP {}", status)));
                            }
                            tokio::time::sleep(self.base_delay).await;
                        }
                    }
                }
                Err(e) => {
                    self.pool.update_stats(proxy.id, false).await;
                    retries += 1;

                    if retries < self.max_retries {
                        debug!(
                            "request failed (attempt {}/{}) - retrying in {:?}",
                            retries, self.max_retries, self.base_delay
                        );
                        tokio::time::sleep(self.base_delay).await;
                    } else {
                        warn!("request failed after {} retries: {}", self.max_retries, e);
                        return Err(if e.is_timeout() {
                            ApiErrorKind::Timeout
                        } else {
                            ApiErrorKind::Network(e.to_string())
                        });
                    }
                }
            }
        }
    }

    /// One attempt: fresh client, fresh UA.
    async fn attempt(&self, url: &str, proxy: &Proxy) -> Result<reqwest::Response, reqwest::Error> {
        let client = reqwest::Client::builder()
            .proxy(proxy.as_reqwest_proxy()?)
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        client
            .get(url)
            .header(reqwest::header::USER_AGENT, self.ua.generate())
            .send()
            .await
    }
}

fn endpoint_of(url: &str) -> &str {
    url.split_once("reddit.com").map(|(_, e)| e).unwrap_or(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_kinds() {
        assert!(ApiErrorKind::Banned.is_terminal());
        assert!(ApiErrorKind::NotFound.is_terminal());
        assert!(ApiErrorKind::Forbidden.is_terminal());
        assert!(!ApiErrorKind::Timeout.is_terminal());
        assert!(!ApiErrorKind::RateLimited.is_terminal());
        assert!(!ApiErrorKind::Network("boom".into()).is_terminal());
    }

    #[test]
    fn endpoint_strips_host() {
        assert_eq!(
            endpoint_of("https://www.reddit.com/r/foo/about.json"),
            "/r/foo/about.json"
        );
        assert_eq!(endpoint_of("https://other.example/x"), "https://other.example/x");
    }
}
