/// Persistence layer for the Reddit harvester
///
/// The engine talks to the [`RedditStore`] trait; production wires in
/// [`PgRedditStore`]. Upserts key on the table's natural conflict column
/// (`name` / `username` / `reddit_id`), and the subreddit upsert defends
/// the curation invariant in SQL: a NULL review/category/tags never
/// clobbers a stored human verdict.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use sqlx::{PgPool, Row};

use crate::models::{
    PostRow, Review, SubredditMetadata, SubredditRow, SubredditStub, UserRow, UserStub,
};
use crate::proxy::Proxy;

/// Hard upper bound per page for range selects
const PAGE_BOUND: i64 = 10_000;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Recoverable: the row exists, proceed
    #[error("duplicate key")]
    DuplicateKey,
    #[error("database error: {0}")]
    Database(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &e {
            if db.code().as_deref() == Some("23505") {
                return StoreError::DuplicateKey;
            }
        }
        StoreError::Database(e.to_string())
    }
}

/// One crawl target with its preserved metadata
#[derive(Debug, Clone)]
pub struct SubredditTarget {
    pub name: String,
    pub metadata: SubredditMetadata,
}

#[async_trait]
pub trait RedditStore: Send + Sync + 'static {
    // Proxies
    async fn load_active_proxies(&self) -> Result<Vec<Proxy>, StoreError>;
    async fn bump_proxy_stat(&self, proxy_id: i64, success: bool) -> Result<(), StoreError>;

    // Subreddit reads
    async fn subreddit_targets(&self, review: Review) -> Result<Vec<SubredditTarget>, StoreError>;
    /// Names only; `None` selects the NULL-review scan
    async fn subreddit_names_by_review(
        &self,
        review: Option<Review>,
    ) -> Result<Vec<String>, StoreError>;
    async fn all_subreddit_names(&self) -> Result<Vec<String>, StoreError>;
    async fn subreddit_metadata(&self, name: &str)
        -> Result<Option<SubredditMetadata>, StoreError>;
    /// Which of `names` are absent from the store, or were last scraped
    /// longer than `staleness` ago (a stub with no `last_scraped_at`
    /// always counts)
    async fn stale_or_missing(
        &self,
        names: &[String],
        staleness: Duration,
    ) -> Result<Vec<String>, StoreError>;

    // Subreddit writes
    async fn upsert_subreddits(&self, rows: &[SubredditRow]) -> Result<(), StoreError>;
    async fn upsert_subreddit(&self, row: &SubredditRow) -> Result<(), StoreError> {
        self.upsert_subreddits(std::slice::from_ref(row)).await
    }
    /// Minimal record with review='Banned' and a fresh scrape stamp
    async fn mark_banned(&self, name: &str) -> Result<(), StoreError>;
    async fn upsert_user_feed_subreddits(&self, names: &[String]) -> Result<(), StoreError>;
    /// Stub rows (no `last_scraped_at`) satisfying post FKs
    async fn ensure_subreddit_stubs(&self, stubs: &[SubredditStub]) -> Result<(), StoreError>;

    // User writes
    async fn upsert_user_stubs(&self, stubs: &[UserStub]) -> Result<(), StoreError>;
    async fn upsert_user_stub(&self, stub: &UserStub) -> Result<(), StoreError> {
        self.upsert_user_stubs(std::slice::from_ref(stub)).await
    }
    async fn upsert_user(&self, row: &UserRow) -> Result<(), StoreError>;

    // Post writes
    async fn upsert_posts(&self, rows: &[PostRow]) -> Result<(), StoreError>;
    async fn upsert_post(&self, row: &PostRow) -> Result<(), StoreError> {
        self.upsert_posts(std::slice::from_ref(row)).await
    }

    // Control
    async fn cycle_cooldown_secs(&self) -> Result<Option<u64>, StoreError>;
}

/// Postgres-backed store
pub struct PgRedditStore {
    pool: PgPool,
}

impl PgRedditStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Paged read of one column. Page size is discovered from the first
    /// response and a short page terminates the scan.
    async fn fetch_names_paged(&self, where_clause: &str) -> Result<Vec<String>, StoreError> {
        let mut all = Vec::new();
        let mut offset: i64 = 0;
        let mut page_size: Option<usize> = None;

        loop {
            let sql = format!(
                "SELECT name FROM reddit_subreddits {} ORDER BY name LIMIT {} OFFSET {}",
                where_clause, PAGE_BOUND, offset
            );
            let rows: Vec<String> = sqlx::query_scalar(&sql).fetch_all(&self.pool).await?;

            if rows.is_empty() {
                break;
            }

            let size = *page_size.get_or_insert(rows.len());
            let returned = rows.len();
            offset += returned as i64;
            all.extend(rows);

            if returned < size {
                break;
            }
        }

        Ok(all)
    }
}

fn metadata_from_parts(
    review: Option<String>,
    primary_category: Option<String>,
    tags: Option<Vec<String>>,
    over18: Option<bool>,
) -> SubredditMetadata {
    SubredditMetadata {
        review: review.as_deref().and_then(Review::parse),
        primary_category,
        tags: tags.unwrap_or_default(),
        over18,
    }
}

#[async_trait]
impl RedditStore for PgRedditStore {
    async fn load_active_proxies(&self) -> Result<Vec<Proxy>, StoreError> {
        let proxies = sqlx::query_as::<_, Proxy>(
            "SELECT id, service_name, proxy_url, proxy_username, proxy_password, \
                    display_name, priority, max_threads \
             FROM reddit_proxies WHERE is_active = TRUE ORDER BY priority DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(proxies)
    }

    async fn bump_proxy_stat(&self, proxy_id: i64, success: bool) -> Result<(), StoreError> {
        let sql = if success {
            "UPDATE reddit_proxies SET success_count = COALESCE(success_count, 0) + 1 WHERE id = $1"
        } else {
            "UPDATE reddit_proxies SET error_count = COALESCE(error_count, 0) + 1 WHERE id = $1"
        };
        sqlx::query(sql).bind(proxy_id).execute(&self.pool).await?;
        Ok(())
    }

    async fn subreddit_targets(&self, review: Review) -> Result<Vec<SubredditTarget>, StoreError> {
        let mut all = Vec::new();
        let mut offset: i64 = 0;
        let mut page_size: Option<usize> = None;

        loop {
            let rows = sqlx::query(
                "SELECT name, review, primary_category, tags, over18 \
                 FROM reddit_subreddits WHERE review = $1 \
                 ORDER BY name LIMIT $2 OFFSET $3",
            )
            .bind(review.as_str())
            .bind(PAGE_BOUND)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;

            if rows.is_empty() {
                break;
            }

            let size = *page_size.get_or_insert(rows.len());
            let returned = rows.len();
            offset += returned as i64;

            for row in rows {
                all.push(SubredditTarget {
                    name: row.get("name"),
                    metadata: metadata_from_parts(
                        row.get("review"),
                        row.get("primary_category"),
                        row.get("tags"),
                        row.get("over18"),
                    ),
                });
            }

            if returned < size {
                break;
            }
        }

        Ok(all)
    }

    async fn subreddit_names_by_review(
        &self,
        review: Option<Review>,
    ) -> Result<Vec<String>, StoreError> {
        match review {
            Some(review) => {
                let clause = format!("WHERE review = '{}'", review.as_str());
                self.fetch_names_paged(&clause).await
            }
            None => self.fetch_names_paged("WHERE review IS NULL").await,
        }
    }

    async fn all_subreddit_names(&self) -> Result<Vec<String>, StoreError> {
        self.fetch_names_paged("").await
    }

    async fn subreddit_metadata(
        &self,
        name: &str,
    ) -> Result<Option<SubredditMetadata>, StoreError> {
        let row = sqlx::query(
            "SELECT review, primary_category, tags, over18 \
             FROM reddit_subreddits WHERE name = $1",
        )
        .bind(name.to_lowercase())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| {
            metadata_from_parts(
                row.get("review"),
                row.get("primary_category"),
                row.get("tags"),
                row.get("over18"),
            )
        }))
    }

    async fn stale_or_missing(
        &self,
        names: &[String],
        staleness: Duration,
    ) -> Result<Vec<String>, StoreError> {
        if names.is_empty() {
            return Ok(Vec::new());
        }

        let threshold = Utc::now() - staleness;
        let fresh: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM reddit_subreddits \
             WHERE name = ANY($1) AND last_scraped_at IS NOT NULL AND last_scraped_at >= $2",
        )
        .bind(names)
        .bind(threshold)
        .fetch_all(&self.pool)
        .await?;

        let fresh: std::collections::HashSet<String> = fresh.into_iter().collect();
        Ok(names
            .iter()
            .filter(|n| !fresh.contains(*n))
            .cloned()
            .collect())
    }

    async fn upsert_subreddits(&self, rows: &[SubredditRow]) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }

        let mut builder = sqlx::QueryBuilder::new(
            "INSERT INTO reddit_subreddits \
             (name, title, description, public_description, subscribers, over18, created_utc, \
              allow_images, allow_videos, allow_polls, spoilers_enabled, verification_required, \
              rules_data, engagement, subreddit_score, avg_upvotes_per_post, icon_img, banner_img, \
              community_icon, header_img, banner_background_color, primary_color, key_color, \
              display_name_prefixed, is_quarantined, lang, link_flair_enabled, link_flair_position, \
              mobile_banner_image, submission_type, submit_text, subreddit_type, url, \
              user_flair_enabled_in_sr, user_flair_position, wiki_enabled, review, \
              primary_category, tags, last_scraped_at) ",
        );

        builder.push_values(rows, |mut b, row| {
            b.push_bind(&row.name)
                .push_bind(&row.title)
                .push_bind(&row.description)
                .push_bind(&row.public_description)
                .push_bind(row.subscribers)
                .push_bind(row.over18)
                .push_bind(row.created_utc)
                .push_bind(row.allow_images)
                .push_bind(row.allow_videos)
                .push_bind(row.allow_polls)
                .push_bind(row.spoilers_enabled)
                .push_bind(row.verification_required)
                .push_bind(&row.rules_data)
                .push_bind(row.engagement)
                .push_bind(row.subreddit_score)
                .push_bind(row.avg_upvotes_per_post)
                .push_bind(&row.icon_img)
                .push_bind(&row.banner_img)
                .push_bind(&row.community_icon)
                .push_bind(&row.header_img)
                .push_bind(&row.banner_background_color)
                .push_bind(&row.primary_color)
                .push_bind(&row.key_color)
                .push_bind(&row.display_name_prefixed)
                .push_bind(row.is_quarantined)
                .push_bind(&row.lang)
                .push_bind(row.link_flair_enabled)
                .push_bind(&row.link_flair_position)
                .push_bind(&row.mobile_banner_image)
                .push_bind(&row.submission_type)
                .push_bind(&row.submit_text)
                .push_bind(&row.subreddit_type)
                .push_bind(&row.url)
                .push_bind(row.user_flair_enabled_in_sr)
                .push_bind(&row.user_flair_position)
                .push_bind(row.wiki_enabled)
                .push_bind(&row.review)
                .push_bind(&row.primary_category)
                .push_bind(&row.tags)
                .push_bind(row.last_scraped_at);
        });

        // COALESCE keeps the stored human verdict when the incoming row
        // carries no review/category; tags fall back the same way.
        builder.push(
            " ON CONFLICT (name) DO UPDATE SET \
             title = EXCLUDED.title, \
             description = EXCLUDED.description, \
             public_description = EXCLUDED.public_description, \
             subscribers = EXCLUDED.subscribers, \
             over18 = EXCLUDED.over18, \
             created_utc = EXCLUDED.created_utc, \
             allow_images = EXCLUDED.allow_images, \
             allow_videos = EXCLUDED.allow_videos, \
             allow_polls = EXCLUDED.allow_polls, \
             spoilers_enabled = EXCLUDED.spoilers_enabled, \
             verification_required = EXCLUDED.verification_required, \
             rules_data = EXCLUDED.rules_data, \
             engagement = EXCLUDED.engagement, \
             subreddit_score = EXCLUDED.subreddit_score, \
             avg_upvotes_per_post = EXCLUDED.avg_upvotes_per_post, \
             icon_img = EXCLUDED.icon_img, \
             banner_img = EXCLUDED.banner_img, \
             community_icon = EXCLUDED.community_icon, \
             header_img = EXCLUDED.header_img, \
             banner_background_color = EXCLUDED.banner_background_color, \
             primary_color = EXCLUDED.primary_color, \
             key_color = EXCLUDED.key_color, \
             display_name_prefixed = EXCLUDED.display_name_prefixed, \
             is_quarantined = EXCLUDED.is_quarantined, \
             lang = EXCLUDED.lang, \
             link_flair_enabled = EXCLUDED.link_flair_enabled, \
             link_flair_position = EXCLUDED.link_flair_position, \
             mobile_banner_image = EXCLUDED.mobile_banner_image, \
             submission_type = EXCLUDED.submission_type, \
             submit_text = EXCLUDED.submit_text, \
             subreddit_type = EXCLUDED.subreddit_type, \
             url = EXCLUDED.url, \
             user_flair_enabled_in_sr = EXCLUDED.user_flair_enabled_in_sr, \
             user_flair_position = EXCLUDED.user_flair_position, \
             wiki_enabled = EXCLUDED.wiki_enabled, \
             review = COALESCE(EXCLUDED.review, reddit_subreddits.review), \
             primary_category = COALESCE(EXCLUDED.primary_category, reddit_subreddits.primary_category), \
             tags = CASE WHEN cardinality(EXCLUDED.tags) > 0 THEN EXCLUDED.tags \
                         ELSE reddit_subreddits.tags END, \
             last_scraped_at = EXCLUDED.last_scraped_at",
        );

        builder.build().execute(&self.pool).await?;
        Ok(())
    }

    async fn mark_banned(&self, name: &str) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO reddit_subreddits (name, review, last_scraped_at) \
             VALUES ($1, 'Banned', NOW()) \
             ON CONFLICT (name) DO UPDATE SET review = 'Banned', last_scraped_at = NOW()",
        )
        .bind(name.to_lowercase())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_user_feed_subreddits(&self, names: &[String]) -> Result<(), StoreError> {
        if names.is_empty() {
            return Ok(());
        }

        let mut builder =
            sqlx::QueryBuilder::new("INSERT INTO reddit_subreddits (name, review) ");
        builder.push_values(names, |mut b, name| {
            b.push_bind(name.to_lowercase()).push_bind("User Feed");
        });
        builder.push(
            " ON CONFLICT (name) DO UPDATE \
             SET review = COALESCE(reddit_subreddits.review, EXCLUDED.review)",
        );
        builder.build().execute(&self.pool).await?;
        Ok(())
    }

    async fn ensure_subreddit_stubs(&self, stubs: &[SubredditStub]) -> Result<(), StoreError> {
        if stubs.is_empty() {
            return Ok(());
        }

        // No last_scraped_at: a later cycle must see the stub as unscraped
        let mut builder =
            sqlx::QueryBuilder::new("INSERT INTO reddit_subreddits (name, review) ");
        builder.push_values(stubs, |mut b, stub| {
            b.push_bind(&stub.name)
                .push_bind(stub.review.map(|r| r.as_str()));
        });
        builder.push(" ON CONFLICT (name) DO NOTHING");
        builder.build().execute(&self.pool).await?;
        Ok(())
    }

    async fn upsert_user_stubs(&self, stubs: &[UserStub]) -> Result<(), StoreError> {
        if stubs.is_empty() {
            return Ok(());
        }

        let mut builder =
            sqlx::QueryBuilder::new("INSERT INTO reddit_users (username, last_scraped_at) ");
        builder.push_values(stubs, |mut b, stub| {
            b.push_bind(&stub.username).push_bind(stub.last_scraped_at);
        });
        builder.push(
            " ON CONFLICT (username) DO UPDATE SET last_scraped_at = EXCLUDED.last_scraped_at",
        );
        builder.build().execute(&self.pool).await?;
        Ok(())
    }

    async fn upsert_user(&self, row: &UserRow) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO reddit_users \
             (username, reddit_id, created_utc, account_age_days, comment_karma, link_karma, \
              total_karma, awardee_karma, awarder_karma, is_employee, is_mod, is_gold, verified, \
              has_verified_email, is_suspended, icon_img, accept_followers, hide_from_robots, \
              subreddit_banner_img, subreddit_display_name, subreddit_over_18, \
              subreddit_subscribers, subreddit_title, last_scraped_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, \
                     $18, $19, $20, $21, $22, $23, $24) \
             ON CONFLICT (username) DO UPDATE SET \
             reddit_id = EXCLUDED.reddit_id, created_utc = EXCLUDED.created_utc, \
             account_age_days = EXCLUDED.account_age_days, comment_karma = EXCLUDED.comment_karma, \
             link_karma = EXCLUDED.link_karma, total_karma = EXCLUDED.total_karma, \
             awardee_karma = EXCLUDED.awardee_karma, awarder_karma = EXCLUDED.awarder_karma, \
             is_employee = EXCLUDED.is_employee, is_mod = EXCLUDED.is_mod, \
             is_gold = EXCLUDED.is_gold, verified = EXCLUDED.verified, \
             has_verified_email = EXCLUDED.has_verified_email, \
             is_suspended = EXCLUDED.is_suspended, icon_img = EXCLUDED.icon_img, \
             accept_followers = EXCLUDED.accept_followers, \
             hide_from_robots = EXCLUDED.hide_from_robots, \
             subreddit_banner_img = EXCLUDED.subreddit_banner_img, \
             subreddit_display_name = EXCLUDED.subreddit_display_name, \
             subreddit_over_18 = EXCLUDED.subreddit_over_18, \
             subreddit_subscribers = EXCLUDED.subreddit_subscribers, \
             subreddit_title = EXCLUDED.subreddit_title, \
             last_scraped_at = EXCLUDED.last_scraped_at",
        )
        .bind(&row.username)
        .bind(&row.reddit_id)
        .bind(row.created_utc)
        .bind(row.account_age_days)
        .bind(row.comment_karma)
        .bind(row.link_karma)
        .bind(row.total_karma)
        .bind(row.awardee_karma)
        .bind(row.awarder_karma)
        .bind(row.is_employee)
        .bind(row.is_mod)
        .bind(row.is_gold)
        .bind(row.verified)
        .bind(row.has_verified_email)
        .bind(row.is_suspended)
        .bind(&row.icon_img)
        .bind(row.accept_followers)
        .bind(row.hide_from_robots)
        .bind(&row.subreddit_banner_img)
        .bind(&row.subreddit_display_name)
        .bind(row.subreddit_over_18)
        .bind(row.subreddit_subscribers)
        .bind(&row.subreddit_title)
        .bind(row.last_scraped_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_posts(&self, rows: &[PostRow]) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }

        let mut builder = sqlx::QueryBuilder::new(
            "INSERT INTO reddit_posts \
             (reddit_id, title, author_username, subreddit_name, created_utc, score, num_comments, \
              upvote_ratio, over_18, spoiler, stickied, locked, is_self, is_video, content_type, \
              archived, edited, selftext, url, domain, link_flair_text, author_flair_text, \
              thumbnail, distinguished, gilded, total_awards_received, post_length, \
              posting_day_of_week, posting_hour, has_thumbnail, is_crosspost, \
              comment_to_upvote_ratio, sub_primary_category, sub_tags, sub_over18, scraped_at) ",
        );

        builder.push_values(rows, |mut b, row| {
            b.push_bind(&row.reddit_id)
                .push_bind(&row.title)
                .push_bind(&row.author_username)
                .push_bind(&row.subreddit_name)
                .push_bind(row.created_utc)
                .push_bind(row.score)
                .push_bind(row.num_comments)
                .push_bind(row.upvote_ratio)
                .push_bind(row.over_18)
                .push_bind(row.spoiler)
                .push_bind(row.stickied)
                .push_bind(row.locked)
                .push_bind(row.is_self)
                .push_bind(row.is_video)
                .push_bind(&row.content_type)
                .push_bind(row.archived)
                .push_bind(row.edited)
                .push_bind(&row.selftext)
                .push_bind(&row.url)
                .push_bind(&row.domain)
                .push_bind(&row.link_flair_text)
                .push_bind(&row.author_flair_text)
                .push_bind(&row.thumbnail)
                .push_bind(&row.distinguished)
                .push_bind(row.gilded)
                .push_bind(row.total_awards_received)
                .push_bind(row.post_length)
                .push_bind(row.posting_day_of_week)
                .push_bind(row.posting_hour)
                .push_bind(row.has_thumbnail)
                .push_bind(row.is_crosspost)
                .push_bind(row.comment_to_upvote_ratio)
                .push_bind(&row.sub_primary_category)
                .push_bind(&row.sub_tags)
                .push_bind(row.sub_over18)
                .push_bind(row.scraped_at);
        });

        builder.push(
            " ON CONFLICT (reddit_id) DO UPDATE SET \
             title = EXCLUDED.title, author_username = EXCLUDED.author_username, \
             subreddit_name = EXCLUDED.subreddit_name, created_utc = EXCLUDED.created_utc, \
             score = EXCLUDED.score, num_comments = EXCLUDED.num_comments, \
             upvote_ratio = EXCLUDED.upvote_ratio, over_18 = EXCLUDED.over_18, \
             spoiler = EXCLUDED.spoiler, stickied = EXCLUDED.stickied, \
             locked = EXCLUDED.locked, is_self = EXCLUDED.is_self, \
             is_video = EXCLUDED.is_video, content_type = EXCLUDED.content_type, \
             archived = EXCLUDED.archived, edited = EXCLUDED.edited, \
             selftext = EXCLUDED.selftext, url = EXCLUDED.url, domain = EXCLUDED.domain, \
             link_flair_text = EXCLUDED.link_flair_text, \
             author_flair_text = EXCLUDED.author_flair_text, thumbnail = EXCLUDED.thumbnail, \
             distinguished = EXCLUDED.distinguished, gilded = EXCLUDED.gilded, \
             total_awards_received = EXCLUDED.total_awards_received, \
             post_length = EXCLUDED.post_length, \
             posting_day_of_week = EXCLUDED.posting_day_of_week, \
             posting_hour = EXCLUDED.posting_hour, has_thumbnail = EXCLUDED.has_thumbnail, \
             is_crosspost = EXCLUDED.is_crosspost, \
             comment_to_upvote_ratio = EXCLUDED.comment_to_upvote_ratio, \
             sub_primary_category = EXCLUDED.sub_primary_category, \
             sub_tags = EXCLUDED.sub_tags, sub_over18 = EXCLUDED.sub_over18, \
             scraped_at = EXCLUDED.scraped_at",
        );

        builder.build().execute(&self.pool).await?;
        Ok(())
    }

    async fn cycle_cooldown_secs(&self) -> Result<Option<u64>, StoreError> {
        let config: Option<serde_json::Value> = sqlx::query_scalar(
            "SELECT config FROM system_control WHERE script_name = 'reddit_scraper'",
        )
        .fetch_optional(&self.pool)
        .await?
        .flatten();

        Ok(config
            .as_ref()
            .and_then(|c| c.get("cycle_cooldown_seconds"))
            .and_then(|v| v.as_u64()))
    }
}

#[cfg(test)]
pub mod tests {
    //! In-memory store fake mirroring the Postgres semantics (COALESCE
    //! preservation, FK enforcement on posts, duplicate-key signaling).

    use super::*;
    use chrono::DateTime;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    #[derive(Debug, Clone, Default)]
    pub struct StoredSubreddit {
        pub review: Option<String>,
        pub primary_category: Option<String>,
        pub tags: Vec<String>,
        pub over18: bool,
        pub last_scraped_at: Option<DateTime<Utc>>,
        pub subscribers: i64,
        pub avg_upvotes_per_post: f64,
        pub engagement: f64,
        pub subreddit_score: f64,
        pub upserts: u32,
    }

    #[derive(Default)]
    pub struct MemoryStore {
        pub proxies: Mutex<Vec<Proxy>>,
        pub proxy_stats: Mutex<HashMap<i64, (u32, u32)>>,
        pub subreddits: Mutex<HashMap<String, StoredSubreddit>>,
        pub users: Mutex<HashSet<String>>,
        pub posts: Mutex<HashMap<String, PostRow>>,
        /// Table names in store-call order, for FK-order assertions
        pub write_order: Mutex<Vec<&'static str>>,
        pub cooldown_override: Mutex<Option<u64>>,
        pub fail_post_batches: AtomicBool,
    }

    impl MemoryStore {
        pub fn seed_proxies(&self, mut proxies: Vec<Proxy>) {
            proxies.sort_by(|a, b| b.priority.cmp(&a.priority));
            *self.proxies.lock().unwrap() = proxies;
        }

        pub fn seed_subreddit(&self, name: &str, stored: StoredSubreddit) {
            self.subreddits
                .lock()
                .unwrap()
                .insert(name.to_lowercase(), stored);
        }

        pub fn subreddit(&self, name: &str) -> Option<StoredSubreddit> {
            self.subreddits.lock().unwrap().get(name).cloned()
        }

        fn apply_subreddit_row(&self, row: &SubredditRow) {
            let mut subs = self.subreddits.lock().unwrap();
            let entry = subs.entry(row.name.clone()).or_default();
            entry.upserts += 1;
            entry.subscribers = row.subscribers;
            entry.avg_upvotes_per_post = row.avg_upvotes_per_post;
            entry.engagement = row.engagement;
            entry.subreddit_score = row.subreddit_score;
            entry.over18 = row.over18;
            entry.last_scraped_at = row.last_scraped_at;
            // COALESCE(EXCLUDED.review, existing.review)
            if row.review.is_some() {
                entry.review = row.review.clone();
            }
            if row.primary_category.is_some() {
                entry.primary_category = row.primary_category.clone();
            }
            if !row.tags.is_empty() {
                entry.tags = row.tags.clone();
            }
        }
    }

    #[async_trait]
    impl RedditStore for MemoryStore {
        async fn load_active_proxies(&self) -> Result<Vec<Proxy>, StoreError> {
            Ok(self.proxies.lock().unwrap().clone())
        }

        async fn bump_proxy_stat(&self, proxy_id: i64, success: bool) -> Result<(), StoreError> {
            let mut stats = self.proxy_stats.lock().unwrap();
            let entry = stats.entry(proxy_id).or_default();
            if success {
                entry.0 += 1;
            } else {
                entry.1 += 1;
            }
            Ok(())
        }

        async fn subreddit_targets(
            &self,
            review: Review,
        ) -> Result<Vec<SubredditTarget>, StoreError> {
            Ok(self
                .subreddits
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, s)| s.review.as_deref() == Some(review.as_str()))
                .map(|(name, s)| SubredditTarget {
                    name: name.clone(),
                    metadata: SubredditMetadata {
                        review: s.review.as_deref().and_then(Review::parse),
                        primary_category: s.primary_category.clone(),
                        tags: s.tags.clone(),
                        over18: Some(s.over18),
                    },
                })
                .collect())
        }

        async fn subreddit_names_by_review(
            &self,
            review: Option<Review>,
        ) -> Result<Vec<String>, StoreError> {
            let wanted = review.map(|r| r.as_str().to_string());
            Ok(self
                .subreddits
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, s)| s.review == wanted)
                .map(|(name, _)| name.clone())
                .collect())
        }

        async fn all_subreddit_names(&self) -> Result<Vec<String>, StoreError> {
            Ok(self.subreddits.lock().unwrap().keys().cloned().collect())
        }

        async fn subreddit_metadata(
            &self,
            name: &str,
        ) -> Result<Option<SubredditMetadata>, StoreError> {
            Ok(self.subreddits.lock().unwrap().get(name).map(|s| {
                SubredditMetadata {
                    review: s.review.as_deref().and_then(Review::parse),
                    primary_category: s.primary_category.clone(),
                    tags: s.tags.clone(),
                    over18: Some(s.over18),
                }
            }))
        }

        async fn stale_or_missing(
            &self,
            names: &[String],
            staleness: Duration,
        ) -> Result<Vec<String>, StoreError> {
            let threshold = Utc::now() - staleness;
            let subs = self.subreddits.lock().unwrap();
            Ok(names
                .iter()
                .filter(|name| match subs.get(*name) {
                    Some(s) => s
                        .last_scraped_at
                        .map(|at| at < threshold)
                        .unwrap_or(true),
                    None => true,
                })
                .cloned()
                .collect())
        }

        async fn upsert_subreddits(&self, rows: &[SubredditRow]) -> Result<(), StoreError> {
            self.write_order.lock().unwrap().push("reddit_subreddits");
            for row in rows {
                self.apply_subreddit_row(row);
            }
            Ok(())
        }

        async fn mark_banned(&self, name: &str) -> Result<(), StoreError> {
            let mut subs = self.subreddits.lock().unwrap();
            let entry = subs.entry(name.to_lowercase()).or_default();
            entry.review = Some("Banned".to_string());
            entry.last_scraped_at = Some(Utc::now());
            Ok(())
        }

        async fn upsert_user_feed_subreddits(&self, names: &[String]) -> Result<(), StoreError> {
            let mut subs = self.subreddits.lock().unwrap();
            for name in names {
                let entry = subs.entry(name.to_lowercase()).or_default();
                if entry.review.is_none() {
                    entry.review = Some("User Feed".to_string());
                }
            }
            Ok(())
        }

        async fn ensure_subreddit_stubs(&self, stubs: &[SubredditStub]) -> Result<(), StoreError> {
            let mut subs = self.subreddits.lock().unwrap();
            for stub in stubs {
                subs.entry(stub.name.clone()).or_insert_with(|| StoredSubreddit {
                    review: stub.review.map(|r| r.as_str().to_string()),
                    ..Default::default()
                });
            }
            Ok(())
        }

        async fn upsert_user_stubs(&self, stubs: &[UserStub]) -> Result<(), StoreError> {
            self.write_order.lock().unwrap().push("reddit_users");
            let mut users = self.users.lock().unwrap();
            for stub in stubs {
                users.insert(stub.username.clone());
            }
            Ok(())
        }

        async fn upsert_user(&self, row: &UserRow) -> Result<(), StoreError> {
            self.users.lock().unwrap().insert(row.username.clone());
            Ok(())
        }

        async fn upsert_posts(&self, rows: &[PostRow]) -> Result<(), StoreError> {
            if self.fail_post_batches.load(Ordering::SeqCst) && rows.len() > 1 {
                return Err(StoreError::Database("batch rejected".into()));
            }

            self.write_order.lock().unwrap().push("reddit_posts");

            // Enforce the FKs the way Postgres would
            {
                let subs = self.subreddits.lock().unwrap();
                let users = self.users.lock().unwrap();
                for row in rows {
                    if !subs.contains_key(&row.subreddit_name) {
                        return Err(StoreError::Database(format!(
                            "foreign key violation: subreddit {} missing",
                            row.subreddit_name
                        )));
                    }
                    if let Some(author) = &row.author_username {
                        if !users.contains(&author.to_lowercase()) {
                            return Err(StoreError::Database(format!(
                                "foreign key violation: user {} missing",
                                author
                            )));
                        }
                    }
                }
            }

            let mut posts = self.posts.lock().unwrap();
            for row in rows {
                posts.insert(row.reddit_id.clone(), row.clone());
            }
            Ok(())
        }

        async fn cycle_cooldown_secs(&self) -> Result<Option<u64>, StoreError> {
            Ok(*self.cooldown_override.lock().unwrap())
        }
    }

    #[test]
    fn duplicate_key_mapping() {
        // 23505 maps to DuplicateKey; anything else stays a database error
        let err = StoreError::from(sqlx::Error::RowNotFound);
        assert!(matches!(err, StoreError::Database(_)));
    }

    #[tokio::test]
    async fn memory_store_preserves_curation_like_postgres() {
        let store = MemoryStore::default();
        store.seed_subreddit(
            "bar",
            StoredSubreddit {
                review: Some("Ok".into()),
                primary_category: Some("fitness".into()),
                tags: vec!["foo".into()],
                ..Default::default()
            },
        );

        // A row with no curated fields (as a NULL-review scrape produces)
        let row = SubredditRow::build(
            "bar",
            &crate::models::SubredditInfo::default(),
            &[],
            &[],
            &SubredditMetadata::default(),
            None,
            false,
        );
        store.upsert_subreddits(&[row]).await.unwrap();

        let stored = store.subreddit("bar").unwrap();
        assert_eq!(stored.review.as_deref(), Some("Ok"));
        assert_eq!(stored.primary_category.as_deref(), Some("fitness"));
        assert_eq!(stored.tags, vec!["foo".to_string()]);
    }

    #[tokio::test]
    async fn memory_store_enforces_post_fks() {
        let store = MemoryStore::default();
        let row = PostRow::build(
            &crate::models::PostData {
                id: Some("p1".into()),
                author: Some("alice".into()),
                ..Default::default()
            },
            "nowhere",
            &SubredditMetadata::default(),
        )
        .unwrap();

        assert!(store.upsert_posts(&[row.clone()]).await.is_err());

        store
            .ensure_subreddit_stubs(&[SubredditStub::for_name("nowhere")])
            .await
            .unwrap();
        store.upsert_user_stubs(&[UserStub::new("alice")]).await.unwrap();
        store.upsert_posts(&[row]).await.unwrap();
    }

    #[tokio::test]
    async fn stale_or_missing_honors_staleness_window() {
        let store = MemoryStore::default();
        store.seed_subreddit(
            "fresh",
            StoredSubreddit {
                last_scraped_at: Some(Utc::now()),
                ..Default::default()
            },
        );
        store.seed_subreddit(
            "stale",
            StoredSubreddit {
                last_scraped_at: Some(Utc::now() - Duration::hours(48)),
                ..Default::default()
            },
        );
        store.seed_subreddit("stub", StoredSubreddit::default());

        let names: Vec<String> = ["fresh", "stale", "stub", "missing"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let need = store
            .stale_or_missing(&names, Duration::hours(24))
            .await
            .unwrap();

        assert!(!need.contains(&"fresh".to_string()));
        assert!(need.contains(&"stale".to_string()));
        assert!(need.contains(&"stub".to_string()));
        assert!(need.contains(&"missing".to_string()));
    }
}
