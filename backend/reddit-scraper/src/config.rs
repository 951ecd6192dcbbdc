/// Configuration for the Reddit harvester
///
/// Every knob is an environment variable with a sane default, read once at
/// startup.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RedditConfig {
    /// Sleep between cycles (overridable per cycle via system_control.config)
    pub cycle_cooldown_seconds: u64,
    /// Concurrent Ok subreddits per batch
    pub ok_batch_size: usize,
    /// Per-task launch gap within an Ok batch
    pub ok_stagger_seconds: f64,
    /// Per-task launch gap range in the discovery wave
    pub discovery_stagger_min_seconds: f64,
    pub discovery_stagger_max_seconds: f64,
    /// Per-user launch gap range in the author fetch fan-out
    pub user_stagger_min_seconds: f64,
    pub user_stagger_max_seconds: f64,
    /// Skip-cache refresh interval
    pub cache_ttl_minutes: u64,
    /// Hours after which an existing subreddit counts as stale for
    /// discovery re-scraping
    pub staleness_hours: u64,
    /// HTTP retry attempts per request
    pub max_retries: u32,
    /// Pause between transport-level retries
    pub base_delay_ms: u64,
    /// Posts pulled from each author during discovery
    pub user_posts_limit: u32,
    /// Top-weekly posts pulled per subreddit
    pub top_posts_limit: u32,

    // Batched writer
    pub writer_batch_size: usize,
    pub writer_flush_interval_seconds: u64,
    pub writer_max_retry_attempts: u32,

    // Supervisor
    pub supervisor_check_interval_seconds: u64,
    /// No-log watchdog threshold; 0 disables
    pub supervisor_hang_threshold_seconds: u64,
}

impl Default for RedditConfig {
    fn default() -> Self {
        Self {
            cycle_cooldown_seconds: 300,
            ok_batch_size: 5,
            ok_stagger_seconds: 0.5,
            discovery_stagger_min_seconds: 0.1,
            discovery_stagger_max_seconds: 0.2,
            user_stagger_min_seconds: 0.05,
            user_stagger_max_seconds: 0.15,
            cache_ttl_minutes: 60,
            staleness_hours: 24,
            max_retries: 3,
            base_delay_ms: 100,
            user_posts_limit: 10,
            top_posts_limit: 10,
            writer_batch_size: 50,
            writer_flush_interval_seconds: 10,
            writer_max_retry_attempts: 3,
            supervisor_check_interval_seconds: 30,
            supervisor_hang_threshold_seconds: 600,
        }
    }
}

impl RedditConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            cycle_cooldown_seconds: env_or("REDDIT_CYCLE_COOLDOWN_SECONDS", defaults.cycle_cooldown_seconds),
            ok_batch_size: env_or("REDDIT_OK_BATCH_SIZE", defaults.ok_batch_size),
            ok_stagger_seconds: env_or("REDDIT_OK_STAGGER_SECONDS", defaults.ok_stagger_seconds),
            discovery_stagger_min_seconds: env_or(
                "REDDIT_DISCOVERY_STAGGER_MIN_SECONDS",
                defaults.discovery_stagger_min_seconds,
            ),
            discovery_stagger_max_seconds: env_or(
                "REDDIT_DISCOVERY_STAGGER_MAX_SECONDS",
                defaults.discovery_stagger_max_seconds,
            ),
            user_stagger_min_seconds: env_or(
                "REDDIT_USER_STAGGER_MIN_SECONDS",
                defaults.user_stagger_min_seconds,
            ),
            user_stagger_max_seconds: env_or(
                "REDDIT_USER_STAGGER_MAX_SECONDS",
                defaults.user_stagger_max_seconds,
            ),
            cache_ttl_minutes: env_or("REDDIT_CACHE_TTL_MINUTES", defaults.cache_ttl_minutes),
            staleness_hours: env_or("REDDIT_STALENESS_HOURS", defaults.staleness_hours),
            max_retries: env_or("REDDIT_MAX_RETRIES", defaults.max_retries),
            base_delay_ms: env_or("REDDIT_BASE_DELAY_MS", defaults.base_delay_ms),
            user_posts_limit: env_or("REDDIT_USER_POSTS_LIMIT", defaults.user_posts_limit),
            top_posts_limit: env_or("REDDIT_TOP_POSTS_LIMIT", defaults.top_posts_limit),
            writer_batch_size: env_or("WRITER_BATCH_SIZE", defaults.writer_batch_size),
            writer_flush_interval_seconds: env_or(
                "WRITER_FLUSH_INTERVAL_SECONDS",
                defaults.writer_flush_interval_seconds,
            ),
            writer_max_retry_attempts: env_or(
                "WRITER_MAX_RETRY_ATTEMPTS",
                defaults.writer_max_retry_attempts,
            ),
            supervisor_check_interval_seconds: env_or(
                "SUPERVISOR_CHECK_INTERVAL_SECONDS",
                defaults.supervisor_check_interval_seconds,
            ),
            supervisor_hang_threshold_seconds: env_or(
                "SUPERVISOR_HANG_THRESHOLD_SECONDS",
                defaults.supervisor_hang_threshold_seconds,
            ),
        }
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_minutes * 60)
    }

    pub fn hang_threshold(&self) -> Option<Duration> {
        if self.supervisor_hang_threshold_seconds == 0 {
            None
        } else {
            Some(Duration::from_secs(self.supervisor_hang_threshold_seconds))
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
