/// Typed facade over the public Reddit JSON API
///
/// Endpoints live at `https://www.reddit.com/{path}.json`. List endpoints
/// unwrap the `{data: {children: [{data: ...}]}}` envelope; info endpoints
/// unwrap `{data: ...}`. Terminal statuses (banned/forbidden/not_found)
/// surface as typed errors for the engine's error gate.

pub mod client;
pub mod user_agents;

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;

pub use client::{ApiErrorKind, HttpClient};
pub use user_agents::UserAgents;

use crate::models::{PostData, SubredditInfo, SubredditRule, UserInfo};
use crate::proxy::{Proxy, ProxyPool};
use crate::store::RedditStore;

const BASE_URL: &str = "https://www.reddit.com";

#[derive(Debug, Deserialize)]
struct Wrapped<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct ListingData<T> {
    #[serde(default = "Vec::new")]
    children: Vec<Wrapped<T>>,
}

#[derive(Debug, Deserialize)]
struct RulesResponse {
    #[serde(default = "Vec::new")]
    rules: Vec<SubredditRule>,
}

fn parse_wrapped<T: DeserializeOwned>(value: serde_json::Value) -> Result<T, ApiErrorKind> {
    serde_json::from_value::<Wrapped<T>>(value)
        .map(|w| w.data)
        .map_err(|e| ApiErrorKind::Decode(e.to_string()))
}

fn parse_listing<T: DeserializeOwned>(value: serde_json::Value) -> Result<Vec<T>, ApiErrorKind> {
    serde_json::from_value::<Wrapped<ListingData<T>>>(value)
        .map(|w| w.data.children.into_iter().map(|c| c.data).collect())
        .map_err(|e| ApiErrorKind::Decode(e.to_string()))
}

/// The facade surface the engine depends on; swapped for a scripted fake
/// in engine tests.
#[async_trait::async_trait]
pub trait RedditApiClient: Send + Sync + 'static {
    async fn subreddit_info(&self, name: &str, proxy: &Proxy)
        -> Result<SubredditInfo, ApiErrorKind>;
    async fn subreddit_rules(
        &self,
        name: &str,
        proxy: &Proxy,
    ) -> Result<Vec<SubredditRule>, ApiErrorKind>;
    async fn subreddit_hot_posts(
        &self,
        name: &str,
        limit: u32,
        proxy: &Proxy,
    ) -> Result<Vec<PostData>, ApiErrorKind>;
    async fn subreddit_top_posts(
        &self,
        name: &str,
        time_filter: &str,
        limit: u32,
        proxy: &Proxy,
    ) -> Result<Vec<PostData>, ApiErrorKind>;
    async fn user_info(&self, username: &str, proxy: &Proxy) -> Result<UserInfo, ApiErrorKind>;
    async fn user_posts(
        &self,
        username: &str,
        limit: u32,
        proxy: &Proxy,
    ) -> Result<Vec<PostData>, ApiErrorKind>;
}

pub struct RedditApi<S: RedditStore> {
    client: HttpClient<S>,
}

impl<S: RedditStore> RedditApi<S> {
    pub fn new(pool: Arc<ProxyPool<S>>, max_retries: u32, base_delay: Duration) -> Self {
        Self {
            client: HttpClient::new(pool, UserAgents::new(), max_retries, base_delay),
        }
    }
}

#[async_trait::async_trait]
impl<S: RedditStore> RedditApiClient for RedditApi<S> {
    /// Subreddit metadata from `about.json`
    async fn subreddit_info(
        &self,
        name: &str,
        proxy: &Proxy,
    ) -> Result<SubredditInfo, ApiErrorKind> {
        let url = format!("{}/r/{}/about.json", BASE_URL, name);
        let value = self.client.get_json(&url, proxy).await?;
        parse_wrapped(value)
    }

    /// Subreddit rules
    async fn subreddit_rules(
        &self,
        name: &str,
        proxy: &Proxy,
    ) -> Result<Vec<SubredditRule>, ApiErrorKind> {
        let url = format!("{}/r/{}/about/rules.json", BASE_URL, name);
        let value = self.client.get_json(&url, proxy).await?;
        serde_json::from_value::<RulesResponse>(value)
            .map(|r| r.rules)
            .map_err(|e| ApiErrorKind::Decode(e.to_string()))
    }

    /// Hot posts
    async fn subreddit_hot_posts(
        &self,
        name: &str,
        limit: u32,
        proxy: &Proxy,
    ) -> Result<Vec<PostData>, ApiErrorKind> {
        let url = format!("{}/r/{}/hot.json?limit={}", BASE_URL, name, limit);
        let value = self.client.get_json(&url, proxy).await?;
        parse_listing(value)
    }

    /// Top posts for a time filter (hour/day/week/month/year/all)
    async fn subreddit_top_posts(
        &self,
        name: &str,
        time_filter: &str,
        limit: u32,
        proxy: &Proxy,
    ) -> Result<Vec<PostData>, ApiErrorKind> {
        let url = format!(
            "{}/r/{}/top.json?t={}&limit={}",
            BASE_URL, name, time_filter, limit
        );
        let value = self.client.get_json(&url, proxy).await?;
        parse_listing(value)
    }

    /// User profile from `about.json`
    async fn user_info(&self, username: &str, proxy: &Proxy) -> Result<UserInfo, ApiErrorKind> {
        let url = format!("{}/user/{}/about.json", BASE_URL, username);
        let value = self.client.get_json(&url, proxy).await?;
        parse_wrapped(value)
    }

    /// A user's submitted posts
    async fn user_posts(
        &self,
        username: &str,
        limit: u32,
        proxy: &Proxy,
    ) -> Result<Vec<PostData>, ApiErrorKind> {
        let url = format!("{}/user/{}/submitted.json?limit={}", BASE_URL, username, limit);
        let value = self.client.get_json(&url, proxy).await?;
        parse_listing(value)
    }
}
