/// Persistence layer for the Instagram harvester
///
/// Media upserts key on `media_pk`. URLs already migrated to our media
/// CDN are detected by the caller and carried forward, so a re-scrape
/// never downgrades a stored row back to a source URL.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::models::{CreatorProfileUpdate, CreatorRef, FollowerHistoryRow, IgPostRow, ReelRow};
use crate::services::analytics::CreatorAnalytics;

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

#[async_trait]
pub trait InstagramStore: Send + Sync + 'static {
    /// Creators with review_status='ok' and a known ig_user_id
    async fn approved_creators(&self) -> Result<Vec<CreatorRef>, StoreError>;

    /// (reels, posts) currently stored for a creator
    async fn content_counts(&self, creator_id: &str) -> Result<(i64, i64), StoreError>;

    // Follower history
    async fn insert_follower_history(&self, row: &FollowerHistoryRow) -> Result<(), StoreError>;
    /// Most recent follower reading at or before `before`
    async fn follower_count_before(
        &self,
        creator_id: &str,
        before: DateTime<Utc>,
    ) -> Result<Option<i64>, StoreError>;
    /// Most recent reading that differs from `current`
    async fn latest_differing_follower_count(
        &self,
        creator_id: &str,
        current: i64,
    ) -> Result<Option<i64>, StoreError>;

    // Creator row
    async fn update_creator_profile(
        &self,
        creator_id: &str,
        update: &CreatorProfileUpdate,
    ) -> Result<(), StoreError>;
    /// Cached analytics, written atomically at the end of a successful
    /// pass; `api_calls` accumulates onto the lifetime counter
    async fn update_creator_analytics(
        &self,
        creator_id: &str,
        analytics: &CreatorAnalytics,
        api_calls: i64,
    ) -> Result<(), StoreError>;

    // Media rows
    /// Stored `video_url` per media_pk, for CDN-migration dedup
    async fn existing_reel_video_urls(
        &self,
        media_pks: &[String],
    ) -> Result<HashMap<String, String>, StoreError>;
    /// Stored `image_urls` per media_pk
    async fn existing_post_image_urls(
        &self,
        media_pks: &[String],
    ) -> Result<HashMap<String, Vec<String>>, StoreError>;
    async fn upsert_reels(&self, rows: &[ReelRow]) -> Result<(), StoreError>;
    async fn upsert_posts(&self, rows: &[IgPostRow]) -> Result<(), StoreError>;
}

pub struct PgInstagramStore {
    pool: PgPool,
}

impl PgInstagramStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl InstagramStore for PgInstagramStore {
    async fn approved_creators(&self) -> Result<Vec<CreatorRef>, StoreError> {
        let creators = sqlx::query_as::<_, CreatorRef>(
            "SELECT ig_user_id, username, niche FROM instagram_creators \
             WHERE review_status = 'ok' AND ig_user_id IS NOT NULL",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(creators)
    }

    async fn content_counts(&self, creator_id: &str) -> Result<(i64, i64), StoreError> {
        let reels: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM instagram_reels WHERE creator_id = $1")
                .bind(creator_id)
                .fetch_one(&self.pool)
                .await?;
        let posts: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM instagram_posts WHERE creator_id = $1")
                .bind(creator_id)
                .fetch_one(&self.pool)
                .await?;
        Ok((reels, posts))
    }

    async fn insert_follower_history(&self, row: &FollowerHistoryRow) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO instagram_follower_history \
             (creator_id, username, followers_count, following_count, media_count, recorded_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&row.creator_id)
        .bind(&row.username)
        .bind(row.followers_count)
        .bind(row.following_count)
        .bind(row.media_count)
        .bind(row.recorded_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn follower_count_before(
        &self,
        creator_id: &str,
        before: DateTime<Utc>,
    ) -> Result<Option<i64>, StoreError> {
        let count: Option<i64> = sqlx::query_scalar(
            "SELECT followers_count FROM instagram_follower_history \
             WHERE creator_id = $1 AND recorded_at <= $2 \
             ORDER BY recorded_at DESC LIMIT 1",
        )
        .bind(creator_id)
        .bind(before)
        .fetch_optional(&self.pool)
        .await?;
        Ok(count)
    }

    async fn latest_differing_follower_count(
        &self,
        creator_id: &str,
        current: i64,
    ) -> Result<Option<i64>, StoreError> {
        let count: Option<i64> = sqlx::query_scalar(
            "SELECT followers_count FROM instagram_follower_history \
             WHERE creator_id = $1 AND followers_count <> $2 \
             ORDER BY recorded_at DESC LIMIT 1",
        )
        .bind(creator_id)
        .bind(current)
        .fetch_optional(&self.pool)
        .await?;
        Ok(count)
    }

    async fn update_creator_profile(
        &self,
        creator_id: &str,
        update: &CreatorProfileUpdate,
    ) -> Result<(), StoreError> {
        if update.last_scraped_at.is_none() && update.followers_last_updated.is_none() {
            return Ok(());
        }

        // Only present fields are written; the separator keeps the SET
        // list valid whatever subset is populated
        let mut qb = sqlx::QueryBuilder::new("UPDATE instagram_creators SET ");
        let mut set = qb.separated(", ");

        macro_rules! push_field {
            ($name:literal, $value:expr) => {
                if let Some(value) = &$value {
                    set.push(concat!($name, " = "));
                    set.push_bind_unseparated(value.clone());
                }
            };
        }

        push_field!("followers_count", update.followers_count);
        push_field!("following_count", update.following_count);
        push_field!("media_count", update.media_count);
        push_field!("biography", update.biography);
        push_field!("full_name", update.full_name);
        push_field!("is_verified", update.is_verified);
        push_field!("is_private", update.is_private);
        push_field!("is_business_account", update.is_business_account);
        push_field!("is_professional_account", update.is_professional_account);
        push_field!("profile_pic_url", update.profile_pic_url);
        push_field!("external_url", update.external_url);
        push_field!("external_url_type", update.external_url_type);
        push_field!("bio_links", update.bio_links);
        push_field!("follower_growth_rate_daily", update.follower_growth_rate_daily);
        push_field!("follower_growth_rate_weekly", update.follower_growth_rate_weekly);
        push_field!("previous_followers_count", update.previous_followers_count);
        push_field!("followers_last_updated", update.followers_last_updated);
        push_field!("last_scraped_at", update.last_scraped_at);

        qb.push(" WHERE ig_user_id = ");
        qb.push_bind(creator_id);

        qb.build().execute(&self.pool).await?;
        Ok(())
    }

    async fn update_creator_analytics(
        &self,
        creator_id: &str,
        analytics: &CreatorAnalytics,
        api_calls: i64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE instagram_creators SET \
             avg_views_per_reel_cached = $2, \
             avg_likes_per_reel_cached = $3, \
             avg_comments_per_reel_cached = $4, \
             avg_saves_per_reel_cached = $5, \
             avg_shares_per_reel_cached = $6, \
             avg_likes_per_post_cached = $7, \
             avg_comments_per_post_cached = $8, \
             avg_saves_per_post_cached = $9, \
             avg_shares_per_post_cached = $10, \
             avg_engagement_rate = $11, \
             engagement_rate_cached = $11, \
             save_to_like_ratio = $12, \
             best_content_type = COALESCE($13, best_content_type), \
             viral_content_count_cached = $14, \
             viral_threshold_multiplier = $15, \
             posting_frequency_per_week = $16, \
             posting_consistency_score = $17, \
             last_post_days_ago = $18, \
             total_api_calls = COALESCE(total_api_calls, 0) + $19, \
             last_scraped_at = NOW() \
             WHERE ig_user_id = $1",
        )
        .bind(creator_id)
        .bind(analytics.avg_reel_views)
        .bind(analytics.avg_reel_likes)
        .bind(analytics.avg_reel_comments)
        .bind(analytics.avg_reel_saves)
        .bind(analytics.avg_reel_shares)
        .bind(analytics.avg_post_likes)
        .bind(analytics.avg_post_comments)
        .bind(analytics.avg_post_saves)
        .bind(analytics.avg_post_shares)
        .bind(analytics.engagement_rate)
        .bind(analytics.save_to_like_ratio)
        .bind(analytics.best_content_type)
        .bind(analytics.viral_content_count)
        .bind(analytics.viral_threshold_multiplier)
        .bind(analytics.posting_frequency_per_week)
        .bind(analytics.posting_consistency_score)
        .bind(analytics.days_since_last_post)
        .bind(api_calls)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn existing_reel_video_urls(
        &self,
        media_pks: &[String],
    ) -> Result<HashMap<String, String>, StoreError> {
        if media_pks.is_empty() {
            return Ok(HashMap::new());
        }
        let rows: Vec<(String, Option<String>)> = sqlx::query_as(
            "SELECT media_pk, video_url FROM instagram_reels WHERE media_pk = ANY($1)",
        )
        .bind(media_pks)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .filter_map(|(pk, url)| url.map(|u| (pk, u)))
            .collect())
    }

    async fn existing_post_image_urls(
        &self,
        media_pks: &[String],
    ) -> Result<HashMap<String, Vec<String>>, StoreError> {
        if media_pks.is_empty() {
            return Ok(HashMap::new());
        }
        let rows: Vec<(String, Option<Vec<String>>)> = sqlx::query_as(
            "SELECT media_pk, image_urls FROM instagram_posts WHERE media_pk = ANY($1)",
        )
        .bind(media_pks)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .filter_map(|(pk, urls)| urls.map(|u| (pk, u)))
            .collect())
    }

    async fn upsert_reels(&self, rows: &[ReelRow]) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }

        let mut builder = sqlx::QueryBuilder::new(
            "INSERT INTO instagram_reels \
             (media_pk, media_id, shortcode, creator_id, creator_username, creator_niche, \
              product_type, media_type, taken_at, caption_text, hashtags, hashtag_count, \
              mention_count, play_count, ig_play_count, like_count, comment_count, save_count, \
              share_count, engagement_count, engagement_rate, has_audio, video_duration, \
              video_url, thumbnail_url, is_paid_partnership, raw_media_json, scraped_at) ",
        );
        builder.push_values(rows, |mut b, row| {
            b.push_bind(&row.media_pk)
                .push_bind(&row.media_id)
                .push_bind(&row.shortcode)
                .push_bind(&row.creator_id)
                .push_bind(&row.creator_username)
                .push_bind(&row.creator_niche)
                .push_bind(&row.product_type)
                .push_bind(row.media_type)
                .push_bind(row.taken_at)
                .push_bind(&row.caption_text)
                .push_bind(&row.hashtags)
                .push_bind(row.hashtag_count)
                .push_bind(row.mention_count)
                .push_bind(row.play_count)
                .push_bind(row.ig_play_count)
                .push_bind(row.like_count)
                .push_bind(row.comment_count)
                .push_bind(row.save_count)
                .push_bind(row.share_count)
                .push_bind(row.engagement_count)
                .push_bind(row.engagement_rate)
                .push_bind(row.has_audio)
                .push_bind(row.video_duration)
                .push_bind(&row.video_url)
                .push_bind(&row.thumbnail_url)
                .push_bind(row.is_paid_partnership)
                .push_bind(&row.raw_media_json)
                .push_bind(row.scraped_at);
        });
        builder.push(
            " ON CONFLICT (media_pk) DO UPDATE SET \
             play_count = EXCLUDED.play_count, ig_play_count = EXCLUDED.ig_play_count, \
             like_count = EXCLUDED.like_count, comment_count = EXCLUDED.comment_count, \
             save_count = EXCLUDED.save_count, share_count = EXCLUDED.share_count, \
             engagement_count = EXCLUDED.engagement_count, \
             engagement_rate = EXCLUDED.engagement_rate, \
             caption_text = EXCLUDED.caption_text, hashtags = EXCLUDED.hashtags, \
             hashtag_count = EXCLUDED.hashtag_count, mention_count = EXCLUDED.mention_count, \
             video_url = EXCLUDED.video_url, thumbnail_url = EXCLUDED.thumbnail_url, \
             creator_niche = EXCLUDED.creator_niche, \
             raw_media_json = EXCLUDED.raw_media_json, scraped_at = EXCLUDED.scraped_at",
        );
        builder.build().execute(&self.pool).await?;
        Ok(())
    }

    async fn upsert_posts(&self, rows: &[IgPostRow]) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }

        let mut builder = sqlx::QueryBuilder::new(
            "INSERT INTO instagram_posts \
             (media_pk, media_id, shortcode, creator_id, creator_username, creator_niche, \
              product_type, media_type, post_type, carousel_media_count, taken_at, caption_text, \
              hashtags, hashtag_count, mention_count, like_count, comment_count, save_count, \
              share_count, engagement_count, engagement_rate, is_paid_partnership, \
              comments_disabled, original_width, original_height, accessibility_caption, \
              thumbnail_url, image_urls, video_duration, view_count, raw_media_json, scraped_at) ",
        );
        builder.push_values(rows, |mut b, row| {
            b.push_bind(&row.media_pk)
                .push_bind(&row.media_id)
                .push_bind(&row.shortcode)
                .push_bind(&row.creator_id)
                .push_bind(&row.creator_username)
                .push_bind(&row.creator_niche)
                .push_bind(&row.product_type)
                .push_bind(row.media_type)
                .push_bind(&row.post_type)
                .push_bind(row.carousel_media_count)
                .push_bind(row.taken_at)
                .push_bind(&row.caption_text)
                .push_bind(&row.hashtags)
                .push_bind(row.hashtag_count)
                .push_bind(row.mention_count)
                .push_bind(row.like_count)
                .push_bind(row.comment_count)
                .push_bind(row.save_count)
                .push_bind(row.share_count)
                .push_bind(row.engagement_count)
                .push_bind(row.engagement_rate)
                .push_bind(row.is_paid_partnership)
                .push_bind(row.comments_disabled)
                .push_bind(row.original_width)
                .push_bind(row.original_height)
                .push_bind(&row.accessibility_caption)
                .push_bind(&row.thumbnail_url)
                .push_bind(&row.image_urls)
                .push_bind(row.video_duration)
                .push_bind(row.view_count)
                .push_bind(&row.raw_media_json)
                .push_bind(row.scraped_at);
        });
        builder.push(
            " ON CONFLICT (media_pk) DO UPDATE SET \
             like_count = EXCLUDED.like_count, comment_count = EXCLUDED.comment_count, \
             save_count = EXCLUDED.save_count, share_count = EXCLUDED.share_count, \
             engagement_count = EXCLUDED.engagement_count, \
             engagement_rate = EXCLUDED.engagement_rate, \
             caption_text = EXCLUDED.caption_text, hashtags = EXCLUDED.hashtags, \
             hashtag_count = EXCLUDED.hashtag_count, mention_count = EXCLUDED.mention_count, \
             post_type = EXCLUDED.post_type, \
             carousel_media_count = EXCLUDED.carousel_media_count, \
             thumbnail_url = EXCLUDED.thumbnail_url, image_urls = EXCLUDED.image_urls, \
             view_count = EXCLUDED.view_count, creator_niche = EXCLUDED.creator_niche, \
             raw_media_json = EXCLUDED.raw_media_json, scraped_at = EXCLUDED.scraped_at",
        );
        builder.build().execute(&self.pool).await?;
        Ok(())
    }
}
