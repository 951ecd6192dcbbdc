/// The Instagram creator engine
///
/// One cycle walks every approved creator with a bounded task pool:
/// profile snapshot + follower-growth tracking, paginated reels and
/// posts (depth keyed on whether the creator has stored content),
/// analytics computation, and media-CDN-aware persistence. The control
/// flag is re-checked between every major step.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use control_plane::{Engine, StopFlag};
use rand::seq::SliceRandom;
use resilience::{with_retry, RetryConfig};
use system_logging::SystemLogger;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::api::InstagramApiClient;
use crate::config::InstagramConfig;
use crate::error::IgScraperError;
use crate::models::{
    CreatorProfile, CreatorProfileUpdate, CreatorRef, FollowerHistoryRow, IgPostRow, MediaItem,
    ReelRow,
};
use crate::services::analytics::{compute_analytics, ViralThresholds};
use crate::services::links;
use crate::store::InstagramStore;

/// Launch gap between creator tasks (staggered start)
const CREATOR_LAUNCH_GAP: Duration = Duration::from_millis(50);
/// Store writes retry this many times, half a second apart
fn store_retry() -> RetryConfig {
    RetryConfig::fixed(3, Duration::from_millis(500))
}

/// Daily/weekly growth derived from the follower history
#[derive(Debug, Default, Clone, Copy)]
struct GrowthRates {
    daily: Option<f64>,
    weekly: Option<f64>,
    previous_followers: Option<i64>,
}

pub struct InstagramScraper<S: InstagramStore, A: InstagramApiClient> {
    store: Arc<S>,
    api: Arc<A>,
    config: InstagramConfig,
    logger: SystemLogger,
}

#[async_trait]
impl<S: InstagramStore, A: InstagramApiClient> Engine for InstagramScraper<S, A> {
    fn script_name(&self) -> &'static str {
        "instagram_scraper"
    }

    fn log_source(&self) -> &'static str {
        "instagram_scraper"
    }

    async fn run(
        self: Arc<Self>,
        stop: StopFlag,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        if let Err(e) = self.config.validate() {
            self.logger
                .critical(format!("configuration validation failed: {}", e), None)
                .await;
            return Err(IgScraperError::Config(e).into());
        }

        self.logger
            .info(
                "starting Instagram scraper",
                Some(serde_json::json!({
                    "concurrent_creators": self.config.concurrent_creators,
                    "target_rps": self.config.requests_per_second,
                })),
            )
            .await;

        let mut cycle_number: u64 = 1;
        while stop.should_continue() {
            self.run_cycle(cycle_number, &stop).await;

            self.logger
                .info(
                    format!(
                        "cycle #{} complete, next cycle in {}h",
                        cycle_number, self.config.cycle_wait_hours
                    ),
                    None,
                )
                .await;
            if stop.sleep(self.config.cycle_wait()).await {
                break;
            }
            cycle_number += 1;
        }

        self.logger.info("Instagram scraper stopped", None).await;
        Ok(())
    }
}

impl<S: InstagramStore, A: InstagramApiClient> InstagramScraper<S, A> {
    pub fn new(
        store: Arc<S>,
        api: Arc<A>,
        config: InstagramConfig,
        logger: SystemLogger,
    ) -> Self {
        Self {
            store,
            api,
            config,
            logger,
        }
    }

    pub async fn run_cycle(self: &Arc<Self>, cycle_number: u64, stop: &StopFlag) {
        let mut creators = match self.store.approved_creators().await {
            Ok(creators) => creators,
            Err(e) => {
                self.logger
                    .error(format!("failed to fetch creators: {}", e), None)
                    .await;
                return;
            }
        };

        if creators.is_empty() {
            self.logger
                .warning("no creators to process in this cycle", None)
                .await;
            return;
        }
        creators.shuffle(&mut rand::thread_rng());

        self.logger
            .info(
                format!(
                    "cycle #{}: processing {} creators with {} concurrent tasks",
                    cycle_number,
                    creators.len(),
                    self.config.concurrent_creators
                ),
                None,
            )
            .await;

        let total = creators.len();
        let task_ceiling = Duration::from_secs(self.config.creator_task_timeout_secs);
        let mut tasks: JoinSet<()> = JoinSet::new();

        for creator in creators {
            if stop.is_stopped() {
                break;
            }

            // Bounded pool: wait for a slot before launching the next task
            while tasks.len() >= self.config.concurrent_creators {
                if tasks.join_next().await.is_none() || stop.is_stopped() {
                    break;
                }
            }
            if stop.is_stopped() {
                break;
            }

            let scraper = self.clone();
            let task_stop = stop.clone();
            tasks.spawn(async move {
                let username = creator.username.clone();
                match tokio::time::timeout(
                    task_ceiling,
                    scraper.process_creator(&creator, &task_stop),
                )
                .await
                {
                    Ok(true) => debug!("creator {} processed", username),
                    Ok(false) => debug!("creator {} skipped or failed", username),
                    Err(_) => {
                        scraper
                            .logger
                            .warning(
                                format!(
                                    "creator {} timed out after {:?}",
                                    username, task_ceiling
                                ),
                                None,
                            )
                            .await;
                    }
                }
            });

            // Staggered launch avoids a thundering herd on the API
            stop.sleep(CREATOR_LAUNCH_GAP).await;
        }

        while tasks.join_next().await.is_some() {}

        self.logger
            .log_activity(
                &format!("cycle #{} completed", cycle_number),
                total as i64,
                Some(serde_json::json!({"api_calls": self.api.api_calls_made()})),
            )
            .await;
    }

    /// Full pass over one creator. Returns false when skipped (stop
    /// request) or failed.
    pub async fn process_creator(&self, creator: &CreatorRef, stop: &StopFlag) -> bool {
        let creator_id = &creator.ig_user_id;
        let username = &creator.username;
        let api_calls_start = self.api.api_calls_made();

        self.logger
            .info(
                format!("processing creator {} ({})", username, creator_id),
                Some(serde_json::json!({"creator_id": creator_id, "username": username})),
            )
            .await;

        // Depth depends on whether this creator has stored content yet
        let (reels_count, posts_count) = match self.store.content_counts(creator_id).await {
            Ok(counts) => counts,
            Err(e) => {
                warn!("failed to get content counts for {}: {}", creator_id, e);
                (0, 0)
            }
        };
        let is_new = reels_count == 0 && posts_count == 0;

        if stop.is_stopped() {
            debug!("stop requested, skipping {}", username);
            return false;
        }

        // Step 1: profile
        let profile = match self.api.fetch_profile(username).await {
            Ok(profile) => profile,
            Err(e) => {
                self.logger
                    .error(format!("failed to fetch profile for {}: {}", username, e), None)
                    .await;
                None
            }
        };

        let mut followers = 0i64;
        if let Some(profile) = &profile {
            followers = profile.follower_count;
            self.apply_profile(creator_id, username, profile).await;
        }

        let (reels_to_fetch, posts_to_fetch) = if is_new {
            (
                self.config.new_creator_reels_count,
                self.config.new_creator_posts_count,
            )
        } else {
            (
                self.config.existing_creator_reels_count,
                self.config.existing_creator_posts_count,
            )
        };
        debug!(
            "{} creator - fetching {} reels, {} posts",
            if is_new { "new" } else { "existing" },
            reels_to_fetch,
            posts_to_fetch
        );

        if stop.is_stopped() {
            return false;
        }

        // Step 2: reels
        let reels = self.api.fetch_reels(creator_id, reels_to_fetch).await;

        if stop.is_stopped() {
            return false;
        }

        // Step 3: posts
        let posts = self.api.fetch_posts(creator_id, posts_to_fetch).await;

        if stop.is_stopped() {
            return false;
        }

        // Step 4: persist
        let reels_saved = self
            .store_reels(creator_id, username, creator.niche.as_deref(), &reels, followers)
            .await;
        let posts_saved = self
            .store_posts(creator_id, username, creator.niche.as_deref(), &posts, followers)
            .await;

        // Step 5: analytics, cached atomically onto the creator row
        let analytics = compute_analytics(
            &reels,
            &posts,
            profile.as_ref(),
            ViralThresholds {
                min_views: self.config.viral_min_views,
                multiplier: self.config.viral_multiplier,
            },
        );
        let engagement_rate = analytics.engagement_rate;
        let api_calls_used = self.api.api_calls_made() - api_calls_start;

        let result = with_retry("creator analytics update", store_retry(), || {
            let analytics = analytics.clone();
            async move {
                self.store
                    .update_creator_analytics(creator_id, &analytics, api_calls_used)
                    .await
            }
        })
        .await;
        if let Err(e) = result {
            self.logger
                .error(
                    format!("failed to update analytics for {}: {}", username, e),
                    None,
                )
                .await;
        }

        self.logger
            .log_activity(
                &format!("processed {}", username),
                (reels_saved + posts_saved) as i64,
                Some(serde_json::json!({
                    "username": username,
                    "reels_fetched": reels.len(),
                    "posts_fetched": posts.len(),
                    "reels_saved": reels_saved,
                    "posts_saved": posts_saved,
                    "api_calls": api_calls_used,
                    "engagement_rate": (engagement_rate * 100.0).round() / 100.0,
                })),
            )
            .await;

        true
    }

    /// Record follower history, derive growth rates, and write the
    /// profile snapshot onto the creator row.
    async fn apply_profile(&self, creator_id: &str, username: &str, profile: &CreatorProfile) {
        let growth = self
            .track_follower_growth(creator_id, username, profile)
            .await;

        let external_url_type = profile
            .external_url
            .as_deref()
            .and_then(links::identify_external_url_type);

        let update = CreatorProfileUpdate {
            followers_count: Some(profile.follower_count),
            following_count: Some(profile.following_count),
            media_count: Some(profile.media_count),
            biography: profile.biography.clone(),
            full_name: profile.full_name.clone(),
            is_verified: Some(profile.is_verified),
            is_private: Some(profile.is_private),
            is_business_account: Some(profile.is_business_account),
            is_professional_account: Some(profile.is_professional_account),
            profile_pic_url: profile.profile_pic_url.clone(),
            external_url: profile.external_url.clone(),
            external_url_type: external_url_type.map(|t| t.to_string()),
            bio_links: if profile.bio_links.is_empty() {
                None
            } else {
                serde_json::to_value(&profile.bio_links).ok()
            },
            follower_growth_rate_daily: growth.daily,
            follower_growth_rate_weekly: growth.weekly,
            previous_followers_count: growth.previous_followers,
            followers_last_updated: Some(Utc::now()),
            last_scraped_at: Some(Utc::now()),
        };

        let result = with_retry("creator profile update", store_retry(), || {
            let update = update.clone();
            async move { self.store.update_creator_profile(creator_id, &update).await }
        })
        .await;

        match result {
            Ok(()) => {
                self.logger
                    .info(
                        format!("profile updated: {} followers", profile.follower_count),
                        None,
                    )
                    .await;
            }
            Err(e) => {
                self.logger
                    .error(
                        format!("failed to update profile for {}: {}", username, e),
                        None,
                    )
                    .await;
            }
        }
    }

    /// Append today's reading and compute 24h/7d growth against prior
    /// history rows.
    async fn track_follower_growth(
        &self,
        creator_id: &str,
        username: &str,
        profile: &CreatorProfile,
    ) -> GrowthRates {
        let current = profile.follower_count;
        let entry = FollowerHistoryRow {
            creator_id: creator_id.to_string(),
            username: username.to_string(),
            followers_count: current,
            following_count: Some(profile.following_count),
            media_count: Some(profile.media_count),
            recorded_at: Utc::now(),
        };
        if let Err(e) = self.store.insert_follower_history(&entry).await {
            warn!("failed to record follower history for {}: {}", creator_id, e);
            return GrowthRates::default();
        }

        let growth_vs = |prev: Option<i64>| {
            prev.filter(|p| *p > 0)
                .map(|p| round2((current - p) as f64 / p as f64 * 100.0))
        };

        let day_ago = Utc::now() - ChronoDuration::days(1);
        let daily = match self.store.follower_count_before(creator_id, day_ago).await {
            Ok(prev) => growth_vs(prev),
            Err(_) => None,
        };

        let week_ago = Utc::now() - ChronoDuration::days(7);
        let weekly = match self.store.follower_count_before(creator_id, week_ago).await {
            Ok(prev) => growth_vs(prev),
            Err(_) => None,
        };

        let previous_followers = self
            .store
            .latest_differing_follower_count(creator_id, current)
            .await
            .unwrap_or(None);

        GrowthRates {
            daily,
            weekly,
            previous_followers,
        }
    }

    /// Upsert reels, preserving any video URL already migrated to the
    /// media CDN.
    async fn store_reels(
        &self,
        creator_id: &str,
        username: &str,
        niche: Option<&str>,
        reels: &[MediaItem],
        followers: i64,
    ) -> usize {
        if reels.is_empty() {
            return 0;
        }

        let pks: Vec<String> = reels.iter().filter_map(|r| r.media_pk()).collect();
        let existing = self
            .store
            .existing_reel_video_urls(&pks)
            .await
            .unwrap_or_default();

        let rows: Vec<ReelRow> = reels
            .iter()
            .filter_map(|item| {
                let pk = item.media_pk()?;
                let video_url = match existing.get(&pk) {
                    Some(stored) if self.is_migrated_url(stored) => {
                        debug!("keeping migrated video URL for reel {}", pk);
                        Some(stored.clone())
                    }
                    _ => item.video_url(),
                };
                ReelRow::build(item, creator_id, username, niche, followers, video_url)
            })
            .collect();
        let new_count = rows
            .iter()
            .filter(|r| !existing.contains_key(&r.media_pk))
            .count();

        let result = with_retry("reels upsert", store_retry(), || {
            let rows = rows.clone();
            async move { self.store.upsert_reels(&rows).await }
        })
        .await;

        match result {
            Ok(()) => {
                self.logger
                    .info(
                        format!(
                            "saved {} reels for {} ({} new)",
                            rows.len(),
                            username,
                            new_count
                        ),
                        None,
                    )
                    .await;
                rows.len()
            }
            Err(e) => {
                self.logger
                    .error(format!("failed to store reels for {}: {}", username, e), None)
                    .await;
                0
            }
        }
    }

    /// Upsert posts, preserving carousel image URLs already migrated to
    /// the media CDN.
    async fn store_posts(
        &self,
        creator_id: &str,
        username: &str,
        niche: Option<&str>,
        posts: &[MediaItem],
        followers: i64,
    ) -> usize {
        if posts.is_empty() {
            return 0;
        }

        let pks: Vec<String> = posts.iter().filter_map(|p| p.media_pk()).collect();
        let existing = self
            .store
            .existing_post_image_urls(&pks)
            .await
            .unwrap_or_default();

        let rows: Vec<IgPostRow> = posts
            .iter()
            .filter_map(|item| {
                let pk = item.media_pk()?;
                let fresh_urls = {
                    let urls = crate::models::carousel_image_urls(item);
                    if urls.is_empty() {
                        None
                    } else {
                        Some(urls)
                    }
                };
                let image_urls = match existing.get(&pk) {
                    Some(stored)
                        if stored
                            .first()
                            .map(|u| self.is_migrated_url(u))
                            .unwrap_or(false) =>
                    {
                        debug!("keeping migrated image URLs for post {}", pk);
                        Some(stored.clone())
                    }
                    _ => fresh_urls,
                };
                IgPostRow::build(item, creator_id, username, niche, followers, image_urls)
            })
            .collect();

        let result = with_retry("posts upsert", store_retry(), || {
            let rows = rows.clone();
            async move { self.store.upsert_posts(&rows).await }
        })
        .await;

        match result {
            Ok(()) => {
                self.logger
                    .info(format!("saved {} posts for {}", rows.len(), username), None)
                    .await;
                rows.len()
            }
            Err(e) => {
                self.logger
                    .error(format!("failed to store posts for {}: {}", username, e), None)
                    .await;
                0
            }
        }
    }

    fn is_migrated_url(&self, url: &str) -> bool {
        url.contains(&self.config.media_cdn_marker)
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IgApiError;
    use crate::store::tests::MemoryStore;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Mutex;
    use system_logging::{NullSink, SystemLogger, SystemLoggerConfig};

    #[derive(Default)]
    struct FakeApi {
        profiles: Mutex<HashMap<String, CreatorProfile>>,
        reels: Mutex<HashMap<String, Vec<MediaItem>>>,
        posts: Mutex<HashMap<String, Vec<MediaItem>>>,
        reel_requests: Mutex<Vec<u32>>,
        calls: AtomicI64,
    }

    #[async_trait]
    impl InstagramApiClient for FakeApi {
        async fn fetch_profile(&self, username: &str) -> Result<Option<CreatorProfile>, IgApiError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            Ok(self.profiles.lock().unwrap().get(username).cloned())
        }

        async fn fetch_reels(&self, user_id: &str, count: u32) -> Vec<MediaItem> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            self.reel_requests.lock().unwrap().push(count);
            self.reels
                .lock()
                .unwrap()
                .get(user_id)
                .cloned()
                .unwrap_or_default()
        }

        async fn fetch_posts(&self, user_id: &str, _count: u32) -> Vec<MediaItem> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            self.posts
                .lock()
                .unwrap()
                .get(user_id)
                .cloned()
                .unwrap_or_default()
        }

        fn api_calls_made(&self) -> i64 {
            self.calls.load(Ordering::Relaxed)
        }
    }

    fn test_logger() -> SystemLogger {
        SystemLogger::new(
            "instagram_scraper",
            "instagram_scraper",
            Arc::new(NullSink),
            SystemLoggerConfig::default(),
        )
    }

    fn test_config() -> InstagramConfig {
        InstagramConfig {
            rapidapi_key: "test-key".into(),
            ..Default::default()
        }
    }

    fn scraper_with(
        store: Arc<MemoryStore>,
        api: FakeApi,
    ) -> Arc<InstagramScraper<MemoryStore, FakeApi>> {
        Arc::new(InstagramScraper::new(
            store,
            Arc::new(api),
            test_config(),
            test_logger(),
        ))
    }

    fn creator(id: &str, username: &str) -> CreatorRef {
        CreatorRef {
            ig_user_id: id.to_string(),
            username: username.to_string(),
            niche: None,
        }
    }

    fn reel_item(pk: &str, video_url: &str) -> MediaItem {
        MediaItem {
            pk: Some(serde_json::json!(pk)),
            like_count: Some(10),
            comment_count: Some(2),
            play_count: Some(500),
            video_versions: Some(vec![crate::models::VideoVersion {
                url: Some(video_url.to_string()),
            }]),
            ..Default::default()
        }
    }

    fn profile(followers: i64) -> CreatorProfile {
        CreatorProfile {
            follower_count: followers,
            following_count: 10,
            media_count: 5,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn new_creator_gets_deep_fetch() {
        let store = Arc::new(MemoryStore::default());
        store.seed_creator("c1", "fresh_face", None);

        let api = FakeApi::default();
        api.profiles
            .lock()
            .unwrap()
            .insert("fresh_face".into(), profile(1000));

        let scraper = scraper_with(store.clone(), api);
        let stop = StopFlag::new();
        assert!(scraper.process_creator(&creator("c1", "fresh_face"), &stop).await);

        let requests = scraper.api.reel_requests.lock().unwrap().clone();
        assert_eq!(requests, vec![90]);
    }

    #[tokio::test]
    async fn existing_creator_gets_incremental_fetch() {
        let store = Arc::new(MemoryStore::default());
        store.seed_creator("c1", "regular", None);
        // One stored reel makes the creator "existing"
        store.seed_reel(
            ReelRow::build(&reel_item("old", "https://x/old.mp4"), "c1", "regular", None, 0, None)
                .unwrap(),
        );

        let api = FakeApi::default();
        api.profiles
            .lock()
            .unwrap()
            .insert("regular".into(), profile(1000));

        let scraper = scraper_with(store.clone(), api);
        let stop = StopFlag::new();
        scraper.process_creator(&creator("c1", "regular"), &stop).await;

        let requests = scraper.api.reel_requests.lock().unwrap().clone();
        assert_eq!(requests, vec![30]);
    }

    #[tokio::test]
    async fn migrated_video_url_is_preserved() {
        let store = Arc::new(MemoryStore::default());
        store.seed_creator("c1", "creator", None);

        // media_pk 42 already migrated to our CDN
        let migrated = "https://media-cdn.example.com/42.mp4";
        store.seed_reel(
            ReelRow::build(
                &reel_item("42", "ignored"),
                "c1",
                "creator",
                None,
                0,
                Some(migrated.to_string()),
            )
            .unwrap(),
        );

        // The fresh fetch carries a new source URL for the same pk
        let api = FakeApi::default();
        api.profiles
            .lock()
            .unwrap()
            .insert("creator".into(), profile(1000));
        api.reels.lock().unwrap().insert(
            "c1".into(),
            vec![reel_item("42", "https://reels-source/xyz.mp4")],
        );

        let scraper = scraper_with(store.clone(), api);
        let stop = StopFlag::new();
        scraper.process_creator(&creator("c1", "creator"), &stop).await;

        let reels = store.reels.lock().unwrap();
        assert_eq!(reels.get("42").unwrap().video_url.as_deref(), Some(migrated));
    }

    #[tokio::test]
    async fn unmigrated_url_is_overwritten_by_fresh_fetch() {
        let store = Arc::new(MemoryStore::default());
        store.seed_creator("c1", "creator", None);
        store.seed_reel(
            ReelRow::build(
                &reel_item("7", "x"),
                "c1",
                "creator",
                None,
                0,
                Some("https://old-source/7.mp4".to_string()),
            )
            .unwrap(),
        );

        let api = FakeApi::default();
        api.reels
            .lock()
            .unwrap()
            .insert("c1".into(), vec![reel_item("7", "https://new-source/7.mp4")]);

        let scraper = scraper_with(store.clone(), api);
        let stop = StopFlag::new();
        scraper.process_creator(&creator("c1", "creator"), &stop).await;

        let reels = store.reels.lock().unwrap();
        assert_eq!(
            reels.get("7").unwrap().video_url.as_deref(),
            Some("https://new-source/7.mp4")
        );
    }

    #[tokio::test]
    async fn analytics_are_cached_on_the_creator() {
        let store = Arc::new(MemoryStore::default());
        store.seed_creator("c1", "creator", None);

        let api = FakeApi::default();
        api.profiles
            .lock()
            .unwrap()
            .insert("creator".into(), profile(1000));
        api.reels
            .lock()
            .unwrap()
            .insert("c1".into(), vec![reel_item("1", "https://s/1.mp4")]);

        let scraper = scraper_with(store.clone(), api);
        let stop = StopFlag::new();
        scraper.process_creator(&creator("c1", "creator"), &stop).await;

        let stored = store.creator("c1").unwrap();
        let analytics = stored.analytics.expect("analytics written");
        assert_eq!(analytics.reels_analyzed, 1);
        assert!(analytics.engagement_rate > 0.0);
        assert!(stored.total_api_calls >= 3);
    }

    #[tokio::test]
    async fn zero_content_creator_is_handled() {
        let store = Arc::new(MemoryStore::default());
        store.seed_creator("c1", "empty", None);

        let api = FakeApi::default();
        api.profiles
            .lock()
            .unwrap()
            .insert("empty".into(), profile(500));

        let scraper = scraper_with(store.clone(), api);
        let stop = StopFlag::new();
        assert!(scraper.process_creator(&creator("c1", "empty"), &stop).await);

        let analytics = store.creator("c1").unwrap().analytics.unwrap();
        assert_eq!(analytics.total_content_analyzed, 0);
        assert_eq!(analytics.engagement_rate, 0.0);
    }

    #[tokio::test]
    async fn follower_growth_uses_history_lookbacks() {
        let store = Arc::new(MemoryStore::default());
        store.seed_creator("c1", "growing", None);

        // A reading from two days ago at 1000 followers
        store
            .insert_follower_history(&FollowerHistoryRow {
                creator_id: "c1".into(),
                username: "growing".into(),
                followers_count: 1000,
                following_count: None,
                media_count: None,
                recorded_at: Utc::now() - ChronoDuration::days(2),
            })
            .await
            .unwrap();

        let api = FakeApi::default();
        api.profiles
            .lock()
            .unwrap()
            .insert("growing".into(), profile(1100));

        let scraper = scraper_with(store.clone(), api);
        let stop = StopFlag::new();
        scraper.process_creator(&creator("c1", "growing"), &stop).await;

        let stored = store.creator("c1").unwrap();
        let update = stored.profile_updates.last().unwrap();
        // (1100 - 1000) / 1000 * 100 = 10%
        assert_eq!(update.follower_growth_rate_daily, Some(10.0));
        assert_eq!(update.previous_followers_count, Some(1000));
        assert_eq!(update.followers_count, Some(1100));

        // A fresh history row was appended for this pass
        assert_eq!(store.history.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn stop_request_aborts_before_fetch() {
        let store = Arc::new(MemoryStore::default());
        store.seed_creator("c1", "creator", None);

        let scraper = scraper_with(store.clone(), FakeApi::default());
        let stop = StopFlag::new();
        stop.stop();

        assert!(!scraper.process_creator(&creator("c1", "creator"), &stop).await);
        assert!(store.history.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn cycle_processes_every_creator() {
        let store = Arc::new(MemoryStore::default());
        store.seed_creator("c1", "a", None);
        store.seed_creator("c2", "b", None);
        store.seed_creator("c3", "c", None);

        let api = FakeApi::default();
        for name in ["a", "b", "c"] {
            api.profiles
                .lock()
                .unwrap()
                .insert(name.into(), profile(100));
        }

        let scraper = scraper_with(store.clone(), api);
        let stop = StopFlag::new();
        scraper.run_cycle(1, &stop).await;

        for id in ["c1", "c2", "c3"] {
            assert!(store.creator(id).unwrap().analytics.is_some());
        }
    }
}
