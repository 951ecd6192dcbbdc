/// Configuration for the Instagram harvester

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct InstagramConfig {
    /// Instagram proxy API credentials
    pub rapidapi_key: String,
    pub rapidapi_host: String,

    /// Max creator tasks in flight simultaneously
    pub concurrent_creators: usize,
    /// Global request rate cap
    pub requests_per_second: u32,
    /// Content depth for creators with no stored content
    pub new_creator_reels_count: u32,
    pub new_creator_posts_count: u32,
    /// Incremental depth for creators already in the store
    pub existing_creator_reels_count: u32,
    pub existing_creator_posts_count: u32,
    /// Empty-page retries per pagination
    pub retry_empty_response: u32,
    /// Rate-limit retries per request
    pub retry_max_attempts: u32,
    /// Per-request timeout
    pub request_timeout_secs: u64,
    /// Viral detection thresholds
    pub viral_min_views: u64,
    pub viral_multiplier: f64,
    /// Wait between cycles
    pub cycle_wait_hours: u64,
    /// Per-creator task ceiling
    pub creator_task_timeout_secs: u64,
    /// Substring that marks a media URL as already migrated to our CDN;
    /// such URLs are preserved on re-scrape
    pub media_cdn_marker: String,

    // Supervisor
    pub supervisor_check_interval_seconds: u64,
}

impl Default for InstagramConfig {
    fn default() -> Self {
        Self {
            rapidapi_key: String::new(),
            rapidapi_host: "instagram-looter2.p.rapidapi.com".into(),
            concurrent_creators: 10,
            requests_per_second: 55,
            new_creator_reels_count: 90,
            new_creator_posts_count: 30,
            existing_creator_reels_count: 30,
            existing_creator_posts_count: 10,
            retry_empty_response: 3,
            retry_max_attempts: 3,
            request_timeout_secs: 30,
            viral_min_views: 50_000,
            viral_multiplier: 5.0,
            cycle_wait_hours: 4,
            creator_task_timeout_secs: 300,
            media_cdn_marker: "media-cdn".into(),
            supervisor_check_interval_seconds: 30,
        }
    }
}

impl InstagramConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            rapidapi_key: std::env::var("RAPIDAPI_KEY").unwrap_or_default(),
            rapidapi_host: std::env::var("RAPIDAPI_HOST").unwrap_or(defaults.rapidapi_host),
            concurrent_creators: env_or("INSTAGRAM_CONCURRENT_CREATORS", defaults.concurrent_creators),
            requests_per_second: env_or("INSTAGRAM_REQUESTS_PER_SECOND", defaults.requests_per_second),
            new_creator_reels_count: env_or(
                "INSTAGRAM_NEW_CREATOR_REELS_COUNT",
                defaults.new_creator_reels_count,
            ),
            new_creator_posts_count: env_or(
                "INSTAGRAM_NEW_CREATOR_POSTS_COUNT",
                defaults.new_creator_posts_count,
            ),
            existing_creator_reels_count: env_or(
                "INSTAGRAM_EXISTING_CREATOR_REELS_COUNT",
                defaults.existing_creator_reels_count,
            ),
            existing_creator_posts_count: env_or(
                "INSTAGRAM_EXISTING_CREATOR_POSTS_COUNT",
                defaults.existing_creator_posts_count,
            ),
            retry_empty_response: env_or("INSTAGRAM_RETRY_EMPTY_RESPONSE", defaults.retry_empty_response),
            retry_max_attempts: env_or("INSTAGRAM_RETRY_MAX_ATTEMPTS", defaults.retry_max_attempts),
            request_timeout_secs: env_or("INSTAGRAM_REQUEST_TIMEOUT", defaults.request_timeout_secs),
            viral_min_views: env_or("INSTAGRAM_VIRAL_MIN_VIEWS", defaults.viral_min_views),
            viral_multiplier: env_or("INSTAGRAM_VIRAL_MULTIPLIER", defaults.viral_multiplier),
            cycle_wait_hours: env_or("INSTAGRAM_CYCLE_WAIT_HOURS", defaults.cycle_wait_hours),
            creator_task_timeout_secs: env_or(
                "INSTAGRAM_CREATOR_TASK_TIMEOUT_SECS",
                defaults.creator_task_timeout_secs,
            ),
            media_cdn_marker: std::env::var("MEDIA_CDN_MARKER").unwrap_or(defaults.media_cdn_marker),
            supervisor_check_interval_seconds: env_or(
                "SUPERVISOR_CHECK_INTERVAL_SECONDS",
                defaults.supervisor_check_interval_seconds,
            ),
        }
    }

    /// Validate required settings before the engine starts
    pub fn validate(&self) -> Result<(), String> {
        if self.rapidapi_key.is_empty() {
            return Err("RAPIDAPI_KEY is not set".into());
        }
        if self.requests_per_second == 0 {
            return Err("INSTAGRAM_REQUESTS_PER_SECOND must be positive".into());
        }
        Ok(())
    }

    /// Minimum pause between consecutive requests
    pub fn rate_limit_delay(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.requests_per_second as f64)
    }

    pub fn cycle_wait(&self) -> Duration {
        Duration::from_secs(self.cycle_wait_hours * 3600)
    }

    pub fn profile_endpoint(&self) -> String {
        format!("https://{}/profile", self.rapidapi_host)
    }

    pub fn reels_endpoint(&self) -> String {
        format!("https://{}/reels", self.rapidapi_host)
    }

    pub fn posts_endpoint(&self) -> String {
        format!("https://{}/user-feeds", self.rapidapi_host)
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
