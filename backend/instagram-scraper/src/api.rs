/// Instagram proxy HTTP API client
///
/// All three endpoints (profile by username, reels and feed posts by user
/// id) go through one pooled client behind a global requests-per-second
/// gate. Pagination pulls 12 items per page via `max_id` until
/// `paging_info.more_available` clears; empty pages retry with a short
/// exponential backoff before being accepted as "no content".

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::InstagramConfig;
use crate::error::IgApiError;
use crate::models::{CreatorProfile, MediaItem, RawProfile};

/// Items requested per pagination page
const PAGE_SIZE: u32 = 12;
/// Empty-page backoff: 2s, 5s, 12.5s
const EMPTY_RETRY_BASE_SECS: f64 = 2.0;
const EMPTY_RETRY_FACTOR: f64 = 2.5;
/// 429 backoff: 2s doubling, capped
const RATE_LIMIT_BASE_SECS: u64 = 2;
const RATE_LIMIT_MAX_SECS: u64 = 10;

/// The API surface the engine depends on; swapped for a scripted fake in
/// engine tests.
#[async_trait]
pub trait InstagramApiClient: Send + Sync + 'static {
    async fn fetch_profile(&self, username: &str) -> Result<Option<CreatorProfile>, IgApiError>;

    /// Paginated reels; partial results are returned on mid-stream errors
    async fn fetch_reels(&self, user_id: &str, count: u32) -> Vec<MediaItem>;

    /// Paginated feed posts; same error policy as reels
    async fn fetch_posts(&self, user_id: &str, count: u32) -> Vec<MediaItem>;

    /// Requests issued so far (per-creator accounting)
    fn api_calls_made(&self) -> i64;
}

#[derive(Debug, Default, Deserialize)]
struct PagingInfo {
    more_available: Option<bool>,
    max_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct MediaPage {
    #[serde(default = "Vec::new")]
    items: Vec<serde_json::Value>,
    #[serde(default)]
    paging_info: PagingInfo,
}

pub struct InstagramApi {
    client: reqwest::Client,
    config: InstagramConfig,
    /// Global inter-request gate: the instant of the last dispatched call
    last_request: Mutex<Option<Instant>>,
    api_calls: AtomicI64,
}

impl InstagramApi {
    pub fn new(config: InstagramConfig) -> Result<Self, IgApiError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| IgApiError::Network(e.to_string()))?;

        Ok(Self {
            client,
            config,
            last_request: Mutex::new(None),
            api_calls: AtomicI64::new(0),
        })
    }

    /// Wait for the next free request slot.
    async fn rate_gate(&self) {
        let delay = self.config.rate_limit_delay();
        let mut last = self.last_request.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < delay {
                tokio::time::sleep(delay - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }

    /// One gated GET with 429 retry.
    async fn get(
        &self,
        endpoint: &str,
        params: &[(&str, &str)],
    ) -> Result<serde_json::Value, IgApiError> {
        let mut attempt = 0u32;
        loop {
            self.rate_gate().await;
            self.api_calls.fetch_add(1, Ordering::Relaxed);

            let response = self
                .client
                .get(endpoint)
                .query(params)
                .header("x-rapidapi-key", &self.config.rapidapi_key)
                .header("x-rapidapi-host", &self.config.rapidapi_host)
                .header("accept", "application/json")
                .send()
                .await;

            match response {
                Ok(response) if response.status().as_u16() == 429 => {
                    attempt += 1;
                    if attempt >= self.config.retry_max_attempts {
                        error!("rate limit exceeded after {} attempts", attempt);
                        return Err(IgApiError::RateLimited);
                    }
                    let backoff = Duration::from_secs(
                        (RATE_LIMIT_BASE_SECS * 2u64.pow(attempt - 1)).min(RATE_LIMIT_MAX_SECS),
                    );
                    warn!("rate limited - retrying in {:?}", backoff);
                    tokio::time::sleep(backoff).await;
                }
                Ok(response) => {
                    let response = response
                        .error_for_status()
                        .map_err(|e| IgApiError::Network(e.to_string()))?;
                    return response
                        .json::<serde_json::Value>()
                        .await
                        .map_err(|e| IgApiError::Decode(e.to_string()));
                }
                Err(e) if e.is_timeout() => {
                    error!(
                        "API request timed out after {}s",
                        self.config.request_timeout_secs
                    );
                    return Err(IgApiError::Timeout);
                }
                Err(e) => {
                    error!("API request failed: {}", e);
                    return Err(IgApiError::Network(e.to_string()));
                }
            }
        }
    }

    /// One endpoint's pagination loop. Shared by reels and posts.
    async fn fetch_paginated(&self, endpoint: &str, user_id: &str, count: u32) -> Vec<MediaItem> {
        let mut items: Vec<MediaItem> = Vec::new();
        let mut max_id: Option<String> = None;
        let mut empty_retries = 0u32;

        while (items.len() as u32) < count {
            let remaining = (count - items.len() as u32).min(PAGE_SIZE).to_string();
            let mut params: Vec<(&str, &str)> =
                vec![("id", user_id), ("count", remaining.as_str())];
            if let Some(max_id) = &max_id {
                params.push(("max_id", max_id.as_str()));
            }

            let page = match self.get(endpoint, &params).await {
                Ok(value) => match serde_json::from_value::<MediaPage>(value) {
                    Ok(page) => page,
                    Err(e) => {
                        error!("failed to decode media page: {}", e);
                        break;
                    }
                },
                Err(e) => {
                    warn!("media fetch failed mid-pagination: {}", e);
                    break;
                }
            };

            if page.items.is_empty() {
                if empty_retries < self.config.retry_empty_response {
                    empty_retries += 1;
                    let backoff = Duration::from_secs_f64(
                        EMPTY_RETRY_BASE_SECS * EMPTY_RETRY_FACTOR.powi(empty_retries as i32 - 1),
                    );
                    warn!(
                        "empty response, retry {}/{} in {:?}",
                        empty_retries, self.config.retry_empty_response, backoff
                    );
                    tokio::time::sleep(backoff).await;
                    continue;
                }
                debug!("user {} has no more content available", user_id);
                break;
            }
            empty_retries = 0;

            // Reels pages nest the media object inside `{media: ...}`
            for raw in page.items {
                let unwrapped = match raw.get("media") {
                    Some(media) => media.clone(),
                    None => raw,
                };
                match serde_json::from_value::<MediaItem>(unwrapped) {
                    Ok(item) => items.push(item),
                    Err(e) => debug!("skipping undecodable media item: {}", e),
                }
            }

            if !page.paging_info.more_available.unwrap_or(false) {
                break;
            }
            max_id = page.paging_info.max_id;
            if max_id.is_none() {
                break;
            }
        }

        items.truncate(count as usize);
        items
    }
}

#[async_trait]
impl InstagramApiClient for InstagramApi {
    async fn fetch_profile(&self, username: &str) -> Result<Option<CreatorProfile>, IgApiError> {
        info!("fetching profile for {}", username);

        let value = self
            .get(&self.config.profile_endpoint(), &[("username", username)])
            .await?;

        let raw: RawProfile =
            serde_json::from_value(value).map_err(|e| IgApiError::Decode(e.to_string()))?;
        if !raw.status.unwrap_or(false) {
            return Ok(None);
        }
        Ok(Some(CreatorProfile::from_raw(&raw)))
    }

    async fn fetch_reels(&self, user_id: &str, count: u32) -> Vec<MediaItem> {
        self.fetch_paginated(&self.config.reels_endpoint(), user_id, count)
            .await
    }

    async fn fetch_posts(&self, user_id: &str, count: u32) -> Vec<MediaItem> {
        self.fetch_paginated(&self.config.posts_endpoint(), user_id, count)
            .await
    }

    fn api_calls_made(&self) -> i64 {
        self.api_calls.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_page_decodes_with_missing_fields() {
        let page: MediaPage = serde_json::from_value(serde_json::json!({})).unwrap();
        assert!(page.items.is_empty());
        assert_eq!(page.paging_info.more_available, None);

        let page: MediaPage = serde_json::from_value(serde_json::json!({
            "items": [{"pk": 1}],
            "paging_info": {"more_available": true, "max_id": "abc"}
        }))
        .unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.paging_info.max_id.as_deref(), Some("abc"));
    }

    #[test]
    fn nested_media_items_unwrap() {
        let raw = serde_json::json!({"media": {"pk": 42, "like_count": 7}});
        let unwrapped = raw.get("media").cloned().unwrap();
        let item: MediaItem = serde_json::from_value(unwrapped).unwrap();
        assert_eq!(item.media_pk().as_deref(), Some("42"));
        assert_eq!(item.like_count, Some(7));
    }

    #[tokio::test]
    async fn rate_gate_spaces_requests() {
        let config = InstagramConfig {
            rapidapi_key: "k".into(),
            requests_per_second: 100, // 10ms slots
            ..Default::default()
        };
        let api = InstagramApi::new(config).unwrap();

        let start = std::time::Instant::now();
        for _ in 0..5 {
            api.rate_gate().await;
        }
        // 5 calls at 10ms spacing: at least 40ms after the first
        assert!(start.elapsed() >= Duration::from_millis(40));
    }
}
