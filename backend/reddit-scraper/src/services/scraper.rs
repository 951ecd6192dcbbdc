/// The Reddit crawl engine
///
/// One cycle: load and shuffle the Ok and No Seller target lists, walk Ok
/// subreddits in staggered concurrent batches (full pass: metrics, author
/// expansion, discovery), process the batch's discoveries in a second
/// staggered wave (metadata + posts only), then refresh No Seller
/// subreddits sequentially. Rows flow through the batched writer; the
/// cycle ends with a flush and an interruptible cool-down.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use control_plane::{Engine, StopFlag};
use futures::future::join_all;
use rand::seq::SliceRandom;
use rand::Rng;
use resilience::{with_retry, RetryConfig};
use system_logging::SystemLogger;
use tracing::{debug, warn};

use crate::api::{ApiErrorKind, RedditApiClient};
use crate::cache::{Caches, SkipCaches};
use crate::classifier;
use crate::config::RedditConfig;
use crate::error::ScraperError;
use crate::models::{PostData, PostRow, Review, SubredditMetadata, SubredditRow, UserStub};
use crate::proxy::ProxyPool;
use crate::services::writer::RedditBatchWriter;
use crate::store::RedditStore;

/// Aggregate budget for one subreddit's API fan-out
const FANOUT_TIMEOUT: Duration = Duration::from_secs(60);
/// Extra attempts when an author's post list comes back empty
const USER_FETCH_EXTRA_ATTEMPTS: u32 = 2;
/// Author usernames are persisted in chunks of this size
const USER_SAVE_CHUNK: usize = 100;
/// Sleep before re-checking when a cycle found no targets
const EMPTY_TARGETS_WAIT: Duration = Duration::from_secs(300);

/// Direct store writes retry transient failures, half a second apart
fn store_retry() -> RetryConfig {
    RetryConfig::fixed(3, Duration::from_millis(500))
}

pub struct RedditScraper<S: RedditStore, A: RedditApiClient> {
    store: Arc<S>,
    api: Arc<A>,
    proxies: Arc<ProxyPool<S>>,
    config: RedditConfig,
    logger: SystemLogger,
    caches: Caches,
    writer: Arc<RedditBatchWriter<S>>,
}

#[async_trait]
impl<S: RedditStore, A: RedditApiClient> Engine for RedditScraper<S, A> {
    fn script_name(&self) -> &'static str {
        "reddit_scraper"
    }

    fn log_source(&self) -> &'static str {
        "reddit_scraper"
    }

    async fn run(
        self: Arc<Self>,
        stop: StopFlag,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.logger.info("starting Reddit scraper", None).await;

        // Phase 1: proxy setup (one-time; a cycle cannot run blind)
        let loaded = self.proxies.load().await.map_err(ScraperError::Store)?;
        if loaded == 0 {
            self.logger
                .critical("no active proxies found in database", None)
                .await;
            return Err(ScraperError::NoProxies.into());
        }

        let working = self.proxies.test_all(&crate::api::UserAgents::new()).await;
        if working == 0 {
            self.logger
                .critical("no working proxies - scraper cannot start", None)
                .await;
            return Err(ScraperError::AllProxiesFailed.into());
        }
        self.logger
            .info(
                format!("{}/{} proxies working", working, loaded),
                Some(serde_json::json!({"working": working, "loaded": loaded})),
            )
            .await;

        let (flush_loop, retry_loop) = self
            .writer
            .spawn_background(
                stop.clone(),
                Duration::from_secs(self.config.writer_flush_interval_seconds),
            );

        let mut cycle_number: u64 = 1;
        while stop.should_continue() {
            self.run_cycle(cycle_number, &stop).await;

            // Persist everything the cycle produced before sleeping
            self.writer.flush_all().await;

            let cooldown = self
                .store
                .cycle_cooldown_secs()
                .await
                .ok()
                .flatten()
                .unwrap_or(self.config.cycle_cooldown_seconds);
            self.logger
                .info(
                    format!(
                        "cycle #{} complete, next cycle in {}s",
                        cycle_number, cooldown
                    ),
                    None,
                )
                .await;

            if stop.sleep(Duration::from_secs(cooldown)).await {
                break;
            }
            cycle_number += 1;
        }

        // Shutdown: drain buffers, then collect the background loops
        self.writer.flush_all().await;
        let _ = flush_loop.await;
        let _ = retry_loop.await;

        self.logger.info("Reddit scraper stopped", None).await;
        Ok(())
    }
}

impl<S: RedditStore, A: RedditApiClient> RedditScraper<S, A> {
    pub fn new(
        store: Arc<S>,
        api: Arc<A>,
        proxies: Arc<ProxyPool<S>>,
        config: RedditConfig,
        logger: SystemLogger,
    ) -> Self {
        let writer = Arc::new(RedditBatchWriter::new(
            store.clone(),
            config.writer_batch_size,
            config.writer_max_retry_attempts,
        ));
        Self {
            store,
            api,
            proxies,
            config,
            logger,
            caches: Caches::new(),
            writer,
        }
    }

    #[cfg(test)]
    pub fn writer(&self) -> &Arc<RedditBatchWriter<S>> {
        &self.writer
    }

    #[cfg(test)]
    pub fn caches(&self) -> &Caches {
        &self.caches
    }

    async fn run_cycle(self: &Arc<Self>, cycle_number: u64, stop: &StopFlag) {
        self.logger
            .info(format!("cycle #{} starting", cycle_number), None)
            .await;

        if let Err(e) = self.refresh_caches().await {
            self.logger
                .error(format!("failed to load caches: {}", e), None)
                .await;
            return;
        }

        // Target lists, shuffled to distribute load
        let (ok_targets, no_seller_targets) = match self.load_targets().await {
            Ok(targets) => targets,
            Err(e) => {
                self.logger
                    .error(format!("failed to fetch target subreddits: {}", e), None)
                    .await;
                return;
            }
        };

        if ok_targets.is_empty() && no_seller_targets.is_empty() {
            self.logger
                .warning("no target subreddits found - nothing to scrape", None)
                .await;
            stop.sleep(EMPTY_TARGETS_WAIT).await;
            return;
        }

        self.logger
            .info(
                format!(
                    "targets: {} Ok + {} No Seller",
                    ok_targets.len(),
                    no_seller_targets.len()
                ),
                None,
            )
            .await;

        // Pass A: Ok subreddits in staggered concurrent batches
        let mut processed = 0usize;
        for batch in ok_targets.chunks(self.config.ok_batch_size) {
            if stop.is_stopped() {
                break;
            }
            self.process_ok_batch(batch, stop).await;
            processed += batch.len();
        }

        // Pass B: No Seller metadata refresh, sequential
        if !no_seller_targets.is_empty() && stop.should_continue() {
            self.logger
                .info(
                    format!(
                        "processing {} No Seller subreddits sequentially",
                        no_seller_targets.len()
                    ),
                    None,
                )
                .await;

            for (idx, name) in no_seller_targets.iter().enumerate() {
                if stop.is_stopped() {
                    break;
                }
                self.process_subreddit(name, false, false, stop).await;
                processed += 1;

                if idx + 1 < no_seller_targets.len() {
                    let pause = rand::thread_rng().gen_range(0.3..0.9);
                    stop.sleep(Duration::from_secs_f64(pause)).await;
                }
            }
        }

        self.logger
            .log_activity(
                &format!("cycle #{} processed", cycle_number),
                processed as i64,
                None,
            )
            .await;
    }

    /// Refresh the skip caches (when stale) and the all-names cache
    /// (every cycle).
    async fn refresh_caches(&self) -> Result<(), ScraperError> {
        if !self.caches.skip_caches_fresh(self.config.cache_ttl()) {
            let skip = SkipCaches {
                non_related: self.load_name_set(Some(Review::NonRelated)).await?,
                user_feed: self.load_name_set(Some(Review::UserFeed)).await?,
                banned: self.load_name_set(Some(Review::Banned)).await?,
                ok: self.load_name_set(Some(Review::Ok)).await?,
                no_seller: self.load_name_set(Some(Review::NoSeller)).await?,
                null_review: self.load_name_set(None).await?,
            };
            self.caches.set_skip_caches(skip);
        }

        let all = self.store.all_subreddit_names().await?;
        self.caches.set_all_subreddits(all);
        debug!(
            "cached {} subreddit names for discovery filtering",
            self.caches.all_subreddits_len()
        );
        Ok(())
    }

    async fn load_name_set(
        &self,
        review: Option<Review>,
    ) -> Result<HashSet<String>, ScraperError> {
        Ok(self
            .store
            .subreddit_names_by_review(review)
            .await?
            .into_iter()
            .collect())
    }

    async fn load_targets(&self) -> Result<(Vec<String>, Vec<String>), ScraperError> {
        let mut ok_names = Vec::new();
        for target in self.store.subreddit_targets(Review::Ok).await? {
            self.caches.insert_metadata(&target.name, target.metadata);
            ok_names.push(target.name);
        }

        let mut no_seller_names = Vec::new();
        for target in self.store.subreddit_targets(Review::NoSeller).await? {
            self.caches.insert_metadata(&target.name, target.metadata);
            no_seller_names.push(target.name);
        }

        let mut rng = rand::thread_rng();
        ok_names.shuffle(&mut rng);
        no_seller_names.shuffle(&mut rng);

        Ok((ok_names, no_seller_names))
    }

    /// One batch of Ok subreddits: staggered concurrent full passes, then
    /// batched discovery handling.
    async fn process_ok_batch(self: &Arc<Self>, batch: &[String], stop: &StopFlag) {
        let tasks = batch.iter().enumerate().map(|(idx, name)| {
            let scraper = self.clone();
            let stop = stop.clone();
            let name = name.clone();
            let start_delay = idx as f64 * self.config.ok_stagger_seconds
                + rand::thread_rng().gen_range(-0.1..0.2);
            async move {
                if scraper.staggered_start(start_delay, &stop).await {
                    return HashSet::new();
                }
                scraper.process_subreddit(&name, true, true, &stop).await
            }
        });

        let results: Vec<HashSet<String>> = join_all(tasks).await;

        // Batched discovery handling: union, filter once, then claim the
        // whole set so no later batch re-schedules any of these names
        let mut all_discoveries: HashSet<String> = HashSet::new();
        for discovered in results {
            all_discoveries.extend(discovered);
        }
        if all_discoveries.is_empty() {
            return;
        }

        let filtered = self.caches.filter_discovered(all_discoveries.clone());
        self.caches.extend_session_processed(all_discoveries);
        if filtered.is_empty() {
            debug!("all discoveries already known");
            return;
        }

        self.logger
            .info(
                format!("{} new subreddits after filtering", filtered.len()),
                None,
            )
            .await;

        let (user_feeds, mut regular): (Vec<String>, Vec<String>) =
            filtered.into_iter().partition(|name| name.starts_with("u_"));

        // User feeds are recorded immediately, no API work. A duplicate
        // key means the row exists: still a success, still cached.
        if !user_feeds.is_empty() {
            let result = with_retry("user feed upsert", store_retry(), || {
                let names = user_feeds.clone();
                async move {
                    match self.store.upsert_user_feed_subreddits(&names).await {
                        Ok(()) | Err(crate::store::StoreError::DuplicateKey) => Ok(()),
                        Err(e) => Err(e),
                    }
                }
            })
            .await;

            match result {
                Ok(()) => {
                    for name in &user_feeds {
                        self.caches.insert_metadata(
                            name,
                            SubredditMetadata {
                                review: Some(Review::UserFeed),
                                ..Default::default()
                            },
                        );
                        self.caches.add_user_feed(name);
                    }
                    self.logger
                        .info(
                            format!("saved {} user feed subreddits", user_feeds.len()),
                            None,
                        )
                        .await;
                }
                Err(e) => {
                    self.logger
                        .error(format!("failed to save user feed subreddits: {}", e), None)
                        .await;
                }
            }
        }

        // Discovery wave: metadata + posts only, no author expansion
        if regular.is_empty() {
            return;
        }
        regular.shuffle(&mut rand::thread_rng());

        self.logger
            .info(
                format!("processing {} discovered subreddits", regular.len()),
                None,
            )
            .await;

        let discovery_tasks = regular.iter().enumerate().map(|(idx, name)| {
            let scraper = self.clone();
            let stop = stop.clone();
            let name = name.clone();
            let (min, max) = (
                self.config.discovery_stagger_min_seconds,
                self.config.discovery_stagger_max_seconds,
            );
            let start_delay =
                idx as f64 * rand::thread_rng().gen_range(min..max)
                    + rand::thread_rng().gen_range(-0.05..0.1);
            async move {
                if scraper.staggered_start(start_delay, &stop).await {
                    return;
                }
                // New discovery awaiting full analysis: NULL review unless
                // already known
                scraper
                    .caches
                    .insert_metadata_if_absent(&name, SubredditMetadata::default());
                scraper.process_subreddit(&name, false, false, &stop).await;
                scraper.caches.add_known_subreddit(&name);
            }
        });
        join_all(discovery_tasks).await;
    }

    /// Process one subreddit. Returns the set of subreddits discovered
    /// through its top-weekly authors (empty unless both `process_users`
    /// and `allow_discovery`).
    pub async fn process_subreddit(
        self: &Arc<Self>,
        name: &str,
        process_users: bool,
        allow_discovery: bool,
        stop: &StopFlag,
    ) -> HashSet<String> {
        if stop.is_stopped() {
            return HashSet::new();
        }

        let Some(proxy) = self.proxies.next() else {
            self.logger.error("proxy rotator is empty", None).await;
            return HashSet::new();
        };

        self.logger
            .info(format!("processing r/{} via {}", name, proxy.label()), None)
            .await;

        // Reinforce preservation even on a metadata-cache miss
        if let Ok(Some(meta)) = self.store.subreddit_metadata(name).await {
            self.caches.insert_metadata(name, meta);
        }

        // Parallel API fan-out under one aggregate budget
        let fanout = tokio::time::timeout(FANOUT_TIMEOUT, async {
            tokio::join!(
                self.api.subreddit_info(name, &proxy),
                self.api.subreddit_rules(name, &proxy),
                self.api
                    .subreddit_top_posts(name, "week", self.config.top_posts_limit, &proxy),
            )
        });
        let (info_result, rules_result, posts_result) = match fanout.await {
            Ok(results) => results,
            Err(_) => {
                self.logger
                    .error(
                        format!("API timeout ({:?}) for r/{} - skipping", FANOUT_TIMEOUT, name),
                        None,
                    )
                    .await;
                return HashSet::new();
            }
        };

        // Error gate: a banned/forbidden/missing subreddit becomes a
        // Banned record and ends the pass
        let info = match self.resolve_info(name, info_result, stop).await {
            Some(info) => info,
            None => return HashSet::new(),
        };

        let rules = match rules_result {
            Ok(rules) => rules,
            Err(_) => self.retry_rules(name, stop).await,
        };
        let top_weekly = match posts_result {
            Ok(posts) => posts,
            Err(_) => self.retry_top_posts(name, stop).await,
        };

        // Auto-classification fires only for NULL-review subreddits
        let preserved = self.caches.metadata(name).unwrap_or_default();
        let description = info.description.clone().unwrap_or_default();
        let auto_review = if preserved.review.is_none() {
            classifier::classify(&classifier::combine_rules(&rules), &description)
        } else {
            None
        };
        if auto_review == Some(Review::NonRelated) {
            self.caches.add_non_related(name);
        }

        let verification_required = classifier::detect_verification(&rules, &description);
        let row = SubredditRow::build(
            name,
            &info,
            &rules,
            &top_weekly,
            &preserved,
            auto_review,
            verification_required,
        );
        let subscribers = row.subscribers;
        let score = row.subreddit_score;
        self.writer.add_subreddit(row).await;
        self.caches.mark_session_processed(name);

        self.logger
            .info(
                format!(
                    "saved r/{} | subs={} | score={:.2}",
                    name, subscribers, score
                ),
                None,
            )
            .await;

        // Posts are unique by id; authors must land first for FK integrity
        let mut seen_posts = HashSet::new();
        let unique_posts: Vec<&PostData> = top_weekly
            .iter()
            .filter(|p| match &p.id {
                Some(id) => seen_posts.insert(id.clone()),
                None => false,
            })
            .collect();

        let mut discovered = HashSet::new();

        if process_users {
            let authors = extract_authors(&top_weekly);
            self.logger
                .info(
                    format!("found {} unique authors from top weekly posts", authors.len()),
                    None,
                )
                .await;

            if allow_discovery && !authors.is_empty() {
                discovered = self.discover_from_authors(name, &authors, stop).await;
            }

            // Minimal username rows in chunks, ahead of the posts
            let stubs: Vec<UserStub> = authors.iter().map(|a| UserStub::new(a)).collect();
            for chunk in stubs.chunks(USER_SAVE_CHUNK) {
                self.writer.add_user_stubs(chunk.to_vec()).await;
            }
        }

        let meta = self.caches.metadata(name).unwrap_or_default();
        let post_rows: Vec<PostRow> = unique_posts
            .iter()
            .filter_map(|p| PostRow::build(p, name, &meta))
            .collect();
        let post_count = post_rows.len();
        if post_count > 0 {
            self.writer.add_posts(post_rows).await;
        }

        self.logger
            .log_activity(&format!("r/{} complete", name), post_count as i64, None)
            .await;

        discovered
    }

    /// Resolve the required subreddit info: gate terminal errors into a
    /// Banned record, retry transient ones with fresh proxies.
    async fn resolve_info(
        &self,
        name: &str,
        first: Result<crate::models::SubredditInfo, ApiErrorKind>,
        stop: &StopFlag,
    ) -> Option<crate::models::SubredditInfo> {
        let mut last_error = match first {
            Ok(info) => return Some(info),
            Err(e) => e,
        };

        for attempt in 0..self.config.max_retries {
            if last_error.is_terminal() {
                self.logger
                    .warning(
                        format!("r/{} is {} - marking as Banned", name, last_error),
                        None,
                    )
                    .await;
                self.record_banned(name).await;
                return None;
            }

            if stop.is_stopped() {
                return None;
            }

            debug!(
                "retrying subreddit_info for r/{} (attempt {}/{})",
                name,
                attempt + 1,
                self.config.max_retries
            );
            let Some(proxy) = self.proxies.next() else {
                break;
            };
            match self.api.subreddit_info(name, &proxy).await {
                Ok(info) => return Some(info),
                Err(e) => last_error = e,
            }
        }

        if last_error.is_terminal() {
            self.logger
                .warning(
                    format!("r/{} is {} - marking as Banned", name, last_error),
                    None,
                )
                .await;
            self.record_banned(name).await;
            return None;
        }

        self.logger
            .error(
                format!(
                    "invalid subreddit_info for r/{} after {} retries: {}",
                    name, self.config.max_retries, last_error
                ),
                None,
            )
            .await;
        None
    }

    /// Persist the Banned verdict (with transient-failure retries) and
    /// update the skip cache so discovery filters the name from now on.
    async fn record_banned(&self, name: &str) {
        let result = with_retry("banned subreddit upsert", store_retry(), || async move {
            self.store.mark_banned(name).await
        })
        .await;

        match result {
            Ok(()) => self.caches.add_banned(name),
            Err(e) => {
                self.logger
                    .error(
                        format!("failed to save banned subreddit r/{}: {}", name, e),
                        None,
                    )
                    .await;
            }
        }
    }

    async fn retry_rules(&self, name: &str, stop: &StopFlag) -> Vec<crate::models::SubredditRule> {
        for _ in 0..self.config.max_retries {
            if stop.is_stopped() {
                break;
            }
            let Some(proxy) = self.proxies.next() else { break };
            if let Ok(rules) = self.api.subreddit_rules(name, &proxy).await {
                return rules;
            }
        }
        warn!("using empty rules for r/{} after retries", name);
        Vec::new()
    }

    async fn retry_top_posts(&self, name: &str, stop: &StopFlag) -> Vec<PostData> {
        for _ in 0..self.config.max_retries {
            if stop.is_stopped() {
                break;
            }
            let Some(proxy) = self.proxies.next() else { break };
            if let Ok(posts) = self
                .api
                .subreddit_top_posts(name, "week", self.config.top_posts_limit, &proxy)
                .await
            {
                return posts;
            }
        }
        warn!("using empty top-weekly for r/{} after retries", name);
        Vec::new()
    }

    /// Staggered concurrent author expansion: every new author's last
    /// posts are pulled and their subreddits aggregated.
    async fn discover_from_authors(
        self: &Arc<Self>,
        subreddit: &str,
        authors: &HashSet<String>,
        stop: &StopFlag,
    ) -> HashSet<String> {
        let mut new_users: Vec<String> = self
            .caches
            .filter_fetched_users(authors.clone())
            .into_iter()
            .collect();
        let cached = authors.len() - new_users.len();
        if cached > 0 {
            debug!("skipping {} already-fetched users", cached);
        }
        if new_users.is_empty() {
            return HashSet::new();
        }
        new_users.shuffle(&mut rand::thread_rng());

        self.logger
            .info(
                format!(
                    "fetching last {} posts from {} users",
                    self.config.user_posts_limit,
                    new_users.len()
                ),
                None,
            )
            .await;

        let tasks = new_users.iter().enumerate().map(|(idx, username)| {
            let scraper = self.clone();
            let stop = stop.clone();
            let username = username.clone();
            let (min, max) = (
                self.config.user_stagger_min_seconds,
                self.config.user_stagger_max_seconds,
            );
            let start_delay = idx as f64 * rand::thread_rng().gen_range(min..max)
                + rand::thread_rng().gen_range(-0.02..0.05);
            async move {
                if scraper.staggered_start(start_delay, &stop).await {
                    return Vec::new();
                }
                scraper.fetch_user_posts_with_retry(&username, &stop).await
            }
        });
        let results: Vec<Vec<PostData>> = join_all(tasks).await;

        let mut discovered: HashSet<String> = results
            .iter()
            .flatten()
            .filter_map(|p| p.subreddit.clone())
            .collect();
        discovered.remove(subreddit);

        if discovered.is_empty() {
            self.logger.info("discovered 0 new subreddits", None).await;
        } else {
            self.logger
                .info(
                    format!("extracted {} subreddits from user posts", discovered.len()),
                    None,
                )
                .await;
        }
        discovered
    }

    /// Fetch one author's recent posts, retrying empty responses with a
    /// short exponential backoff.
    async fn fetch_user_posts_with_retry(
        &self,
        username: &str,
        stop: &StopFlag,
    ) -> Vec<PostData> {
        for attempt in 0..=USER_FETCH_EXTRA_ATTEMPTS {
            if stop.is_stopped() {
                return Vec::new();
            }
            let Some(proxy) = self.proxies.next() else {
                return Vec::new();
            };

            match self
                .api
                .user_posts(username, self.config.user_posts_limit, &proxy)
                .await
            {
                Ok(posts) if !posts.is_empty() => {
                    self.caches.claim_user_fetch(username);
                    debug!("{}: {} posts", username, posts.len());
                    return posts;
                }
                Ok(_) => {
                    if attempt < USER_FETCH_EXTRA_ATTEMPTS {
                        let backoff = rand::thread_rng().gen_range(0.1..0.3)
                            * 1.5f64.powi(attempt as i32);
                        tokio::time::sleep(Duration::from_secs_f64(backoff)).await;
                    }
                }
                Err(e) => {
                    if attempt == USER_FETCH_EXTRA_ATTEMPTS {
                        debug!("{}: failed after retries: {}", username, e);
                    } else {
                        let pause = rand::thread_rng().gen_range(0.1..0.3);
                        tokio::time::sleep(Duration::from_secs_f64(pause)).await;
                    }
                }
            }
        }

        debug!(
            "{}: no posts after {} attempts",
            username,
            USER_FETCH_EXTRA_ATTEMPTS + 1
        );
        Vec::new()
    }

    /// Initial stagger delay for one fan-out task. Returns true when a
    /// stop arrived during the wait.
    async fn staggered_start(&self, delay_secs: f64, stop: &StopFlag) -> bool {
        if delay_secs > 0.0 {
            if stop.sleep(Duration::from_secs_f64(delay_secs)).await {
                return true;
            }
        }
        stop.is_stopped()
    }
}

/// Unique post authors, excluding deleted accounts and AutoModerator
fn extract_authors(posts: &[PostData]) -> HashSet<String> {
    posts
        .iter()
        .filter_map(|p| p.author.as_deref())
        .filter(|a| *a != "[deleted]" && *a != "AutoModerator")
        .map(|a| a.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{SubredditInfo, SubredditRule};
    use crate::store::tests::{MemoryStore, StoredSubreddit};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use system_logging::{NullSink, SystemLogger, SystemLoggerConfig};

    /// Scripted API responses per subreddit / username
    #[derive(Default)]
    struct FakeApi {
        infos: Mutex<HashMap<String, Result<SubredditInfo, ApiErrorKind>>>,
        rules: Mutex<HashMap<String, Vec<SubredditRule>>>,
        top_posts: Mutex<HashMap<String, Vec<PostData>>>,
        user_posts: Mutex<HashMap<String, Vec<PostData>>>,
    }

    impl FakeApi {
        fn with_subreddit(
            self,
            name: &str,
            info: Result<SubredditInfo, ApiErrorKind>,
            rules: Vec<SubredditRule>,
            posts: Vec<PostData>,
        ) -> Self {
            self.infos.lock().unwrap().insert(name.to_string(), info);
            self.rules.lock().unwrap().insert(name.to_string(), rules);
            self.top_posts.lock().unwrap().insert(name.to_string(), posts);
            self
        }

        fn with_user_posts(self, username: &str, posts: Vec<PostData>) -> Self {
            self.user_posts
                .lock()
                .unwrap()
                .insert(username.to_string(), posts);
            self
        }
    }

    #[async_trait]
    impl RedditApiClient for FakeApi {
        async fn subreddit_info(
            &self,
            name: &str,
            _proxy: &crate::proxy::Proxy,
        ) -> Result<SubredditInfo, ApiErrorKind> {
            self.infos
                .lock()
                .unwrap()
                .get(name)
                .cloned()
                .unwrap_or(Err(ApiErrorKind::NotFound))
        }

        async fn subreddit_rules(
            &self,
            name: &str,
            _proxy: &crate::proxy::Proxy,
        ) -> Result<Vec<SubredditRule>, ApiErrorKind> {
            Ok(self
                .rules
                .lock()
                .unwrap()
                .get(name)
                .cloned()
                .unwrap_or_default())
        }

        async fn subreddit_hot_posts(
            &self,
            _name: &str,
            _limit: u32,
            _proxy: &crate::proxy::Proxy,
        ) -> Result<Vec<PostData>, ApiErrorKind> {
            Ok(Vec::new())
        }

        async fn subreddit_top_posts(
            &self,
            name: &str,
            _time_filter: &str,
            _limit: u32,
            _proxy: &crate::proxy::Proxy,
        ) -> Result<Vec<PostData>, ApiErrorKind> {
            Ok(self
                .top_posts
                .lock()
                .unwrap()
                .get(name)
                .cloned()
                .unwrap_or_default())
        }

        async fn user_info(
            &self,
            _username: &str,
            _proxy: &crate::proxy::Proxy,
        ) -> Result<crate::models::UserInfo, ApiErrorKind> {
            Err(ApiErrorKind::NotFound)
        }

        async fn user_posts(
            &self,
            username: &str,
            _limit: u32,
            _proxy: &crate::proxy::Proxy,
        ) -> Result<Vec<PostData>, ApiErrorKind> {
            Ok(self
                .user_posts
                .lock()
                .unwrap()
                .get(username)
                .cloned()
                .unwrap_or_default())
        }
    }

    fn proxy(id: i64) -> crate::proxy::Proxy {
        crate::proxy::Proxy {
            id,
            service_name: None,
            proxy_url: format!("proxy-{}.example.com:8080", id),
            proxy_username: None,
            proxy_password: None,
            display_name: Some(format!("proxy-{}", id)),
            priority: 100,
            max_threads: 5,
        }
    }

    fn fast_config() -> RedditConfig {
        RedditConfig {
            ok_stagger_seconds: 0.0,
            discovery_stagger_min_seconds: 0.001,
            discovery_stagger_max_seconds: 0.002,
            user_stagger_min_seconds: 0.001,
            user_stagger_max_seconds: 0.002,
            ..Default::default()
        }
    }

    fn test_logger() -> SystemLogger {
        SystemLogger::new(
            "reddit_scraper",
            "reddit_scraper",
            Arc::new(NullSink),
            SystemLoggerConfig::default(),
        )
    }

    async fn scraper_with(
        store: Arc<MemoryStore>,
        api: FakeApi,
    ) -> Arc<RedditScraper<MemoryStore, FakeApi>> {
        store.seed_proxies(vec![proxy(1), proxy(2)]);
        let pool = Arc::new(ProxyPool::new(store.clone()));
        pool.load().await.unwrap();
        Arc::new(RedditScraper::new(
            store,
            Arc::new(api),
            pool,
            fast_config(),
            test_logger(),
        ))
    }

    fn weekly_post(id: &str, author: &str, score: i64, comments: i64) -> PostData {
        PostData {
            id: Some(id.to_string()),
            author: Some(author.to_string()),
            score: Some(score),
            num_comments: Some(comments),
            created_utc: Some(1_700_000_000.0),
            is_self: Some(true),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn ok_subreddit_happy_path() {
        let store = Arc::new(MemoryStore::default());
        store.seed_subreddit(
            "foo",
            StoredSubreddit {
                review: Some("Ok".into()),
                ..Default::default()
            },
        );

        let api = FakeApi::default().with_subreddit(
            "foo",
            Ok(SubredditInfo {
                subscribers: Some(1000),
                description: Some("welcome".into()),
                ..Default::default()
            }),
            vec![],
            vec![weekly_post("p1", "alice", 10, 2)],
        );

        let scraper = scraper_with(store.clone(), api).await;
        let stop = StopFlag::new();
        scraper.process_subreddit("foo", true, true, &stop).await;
        scraper.writer().flush_all().await;

        let sub = store.subreddit("foo").unwrap();
        assert_eq!(sub.subscribers, 1000);
        assert_eq!(sub.avg_upvotes_per_post, 10.0);
        assert_eq!(sub.engagement, 0.2);
        assert!((sub.subreddit_score - 44.72).abs() < 0.01);
        assert_eq!(sub.review.as_deref(), Some("Ok"));

        assert!(store.users.lock().unwrap().contains("alice"));

        let posts = store.posts.lock().unwrap();
        let p1 = posts.get("p1").unwrap();
        assert_eq!(p1.content_type, "text");
        assert!(p1.sub_primary_category.is_none());
    }

    #[tokio::test]
    async fn discovered_subreddit_gets_auto_classified() {
        let store = Arc::new(MemoryStore::default());
        let api = FakeApi::default().with_subreddit(
            "new",
            Ok(SubredditInfo::default()),
            vec![SubredditRule {
                short_name: None,
                description: Some("hentai only".into()),
            }],
            vec![],
        );

        let scraper = scraper_with(store.clone(), api).await;
        let stop = StopFlag::new();
        // Discovery flow: no user processing, no further discovery
        scraper.process_subreddit("new", false, false, &stop).await;
        scraper.writer().flush_all().await;

        let sub = store.subreddit("new").unwrap();
        assert_eq!(sub.review.as_deref(), Some("Non Related"));

        // Future discoveries of the same name are filtered from the cache
        let filtered = scraper
            .caches()
            .filter_discovered(["new".to_string()].into_iter().collect());
        assert!(filtered.is_empty());
    }

    #[tokio::test]
    async fn manual_curation_is_never_overwritten() {
        let store = Arc::new(MemoryStore::default());
        store.seed_subreddit(
            "bar",
            StoredSubreddit {
                review: Some("Ok".into()),
                primary_category: Some("fitness".into()),
                tags: vec!["foo".into()],
                ..Default::default()
            },
        );

        // Rules would trigger the classifier if the review were NULL
        let api = FakeApi::default().with_subreddit(
            "bar",
            Ok(SubredditInfo::default()),
            vec![SubredditRule {
                short_name: None,
                description: Some("hentai content welcome".into()),
            }],
            vec![],
        );

        let scraper = scraper_with(store.clone(), api).await;
        let stop = StopFlag::new();
        scraper.process_subreddit("bar", true, true, &stop).await;
        scraper.writer().flush_all().await;

        let sub = store.subreddit("bar").unwrap();
        assert_eq!(sub.review.as_deref(), Some("Ok"));
        assert_eq!(sub.primary_category.as_deref(), Some("fitness"));
        assert_eq!(sub.tags, vec!["foo".to_string()]);
    }

    #[tokio::test]
    async fn banned_subreddit_is_gated() {
        let store = Arc::new(MemoryStore::default());
        let api = FakeApi::default().with_subreddit(
            "baz",
            Err(ApiErrorKind::Banned),
            vec![],
            vec![],
        );

        let scraper = scraper_with(store.clone(), api).await;
        let stop = StopFlag::new();
        let discovered = scraper.process_subreddit("baz", true, true, &stop).await;
        scraper.writer().flush_all().await;

        assert!(discovered.is_empty());
        let sub = store.subreddit("baz").unwrap();
        assert_eq!(sub.review.as_deref(), Some("Banned"));
        assert!(store.posts.lock().unwrap().is_empty());
        assert!(store.users.lock().unwrap().is_empty());

        // Banned cache picks it up for discovery filtering
        let filtered = scraper
            .caches()
            .filter_discovered(["baz".to_string()].into_iter().collect());
        assert!(filtered.is_empty());
    }

    #[tokio::test]
    async fn authors_feed_discovery() {
        let store = Arc::new(MemoryStore::default());
        store.seed_subreddit(
            "foo",
            StoredSubreddit {
                review: Some("Ok".into()),
                ..Default::default()
            },
        );

        let api = FakeApi::default()
            .with_subreddit(
                "foo",
                Ok(SubredditInfo::default()),
                vec![],
                vec![
                    weekly_post("p1", "alice", 10, 2),
                    weekly_post("p2", "[deleted]", 5, 1),
                    weekly_post("p3", "AutoModerator", 3, 0),
                ],
            )
            .with_user_posts("alice", {
                let mut post = weekly_post("q1", "alice", 2, 0);
                post.subreddit = Some("hiddengem".into());
                vec![post]
            });

        let scraper = scraper_with(store.clone(), api).await;
        let stop = StopFlag::new();
        let discovered = scraper.process_subreddit("foo", true, true, &stop).await;

        // [deleted] and AutoModerator never count as authors
        assert_eq!(discovered, ["hiddengem".to_string()].into_iter().collect());
    }

    #[tokio::test]
    async fn full_cycle_processes_discoveries_and_user_feeds() {
        let store = Arc::new(MemoryStore::default());
        store.seed_subreddit(
            "foo",
            StoredSubreddit {
                review: Some("Ok".into()),
                ..Default::default()
            },
        );

        let mut alice_post = weekly_post("q1", "alice", 2, 0);
        alice_post.subreddit = Some("hiddengem".into());
        let mut alice_feed_post = weekly_post("q2", "alice", 1, 0);
        alice_feed_post.subreddit = Some("u_alice".into());

        let api = FakeApi::default()
            .with_subreddit(
                "foo",
                Ok(SubredditInfo {
                    subscribers: Some(50),
                    ..Default::default()
                }),
                vec![],
                vec![weekly_post("p1", "alice", 10, 2)],
            )
            .with_subreddit(
                "hiddengem",
                Ok(SubredditInfo {
                    subscribers: Some(5),
                    ..Default::default()
                }),
                vec![],
                vec![weekly_post("h1", "bob", 4, 1)],
            )
            .with_user_posts("alice", vec![alice_post, alice_feed_post]);

        let scraper = scraper_with(store.clone(), api).await;
        let stop = StopFlag::new();
        scraper.run_cycle(1, &stop).await;
        scraper.writer().flush_all().await;

        // The discovery went through the second wave as a NULL-review record
        let gem = store.subreddit("hiddengem").unwrap();
        assert_eq!(gem.review, None);
        assert_eq!(gem.subscribers, 5);
        assert!(store.posts.lock().unwrap().contains_key("h1"));

        // The u_ name was bulk-saved as a User Feed with no processing
        let feed = store.subreddit("u_alice").unwrap();
        assert_eq!(feed.review.as_deref(), Some("User Feed"));
        assert!(feed.last_scraped_at.is_none());
    }

    #[tokio::test]
    async fn no_intra_cycle_repeat() {
        let store = Arc::new(MemoryStore::default());
        store.seed_subreddit(
            "foo",
            StoredSubreddit {
                review: Some("Ok".into()),
                ..Default::default()
            },
        );

        let mut repeat_post = weekly_post("q1", "alice", 2, 0);
        repeat_post.subreddit = Some("hiddengem".into());

        let api = FakeApi::default()
            .with_subreddit(
                "foo",
                Ok(SubredditInfo::default()),
                vec![],
                vec![weekly_post("p1", "alice", 10, 2)],
            )
            .with_subreddit("hiddengem", Ok(SubredditInfo::default()), vec![], vec![])
            .with_user_posts("alice", vec![repeat_post]);

        let scraper = scraper_with(store.clone(), api).await;
        let stop = StopFlag::new();
        scraper.run_cycle(1, &stop).await;
        scraper.writer().flush_all().await;

        // After the batch, every discovery is in the session cache
        let filtered = scraper
            .caches()
            .filter_discovered(["hiddengem".to_string()].into_iter().collect());
        assert!(filtered.is_empty());

        let gem = store.subreddit("hiddengem").unwrap();
        assert_eq!(gem.upserts, 1);
    }

    #[tokio::test]
    async fn stop_flag_halts_processing() {
        let store = Arc::new(MemoryStore::default());
        let api = FakeApi::default().with_subreddit(
            "foo",
            Ok(SubredditInfo::default()),
            vec![],
            vec![],
        );

        let scraper = scraper_with(store.clone(), api).await;
        let stop = StopFlag::new();
        stop.stop();

        let discovered = scraper.process_subreddit("foo", true, true, &stop).await;
        assert!(discovered.is_empty());
        // Nothing was enqueued
        assert_eq!(scraper.writer().pending().await, 0);
    }
}
