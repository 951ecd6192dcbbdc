/// Wire payloads and store row types for the Reddit harvester
///
/// Wire structs decode the public Reddit JSON API tolerantly: missing and
/// null fields become None and default at row-build time, so a sparse
/// upstream payload never aborts a subreddit.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

// ========================================
// Review status
// ========================================

/// The human curation field on a subreddit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Review {
    /// Active crawl target
    Ok,
    /// Metadata-only refresh
    NoSeller,
    /// Filtered out of discovery
    NonRelated,
    /// Pseudo-subreddit for a user profile
    UserFeed,
    /// Dead subreddit
    Banned,
}

impl Review {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "Ok",
            Self::NoSeller => "No Seller",
            Self::NonRelated => "Non Related",
            Self::UserFeed => "User Feed",
            Self::Banned => "Banned",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Ok" => Some(Self::Ok),
            "No Seller" => Some(Self::NoSeller),
            "Non Related" => Some(Self::NonRelated),
            "User Feed" => Some(Self::UserFeed),
            "Banned" => Some(Self::Banned),
            _ => None,
        }
    }
}

// ========================================
// Wire payloads
// ========================================

/// `/r/{name}/about.json` payload (`data` envelope already unwrapped)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubredditInfo {
    pub title: Option<String>,
    pub description: Option<String>,
    pub public_description: Option<String>,
    pub subscribers: Option<i64>,
    pub over18: Option<bool>,
    pub created_utc: Option<f64>,
    pub allow_images: Option<bool>,
    pub allow_videos: Option<bool>,
    pub allow_polls: Option<bool>,
    pub spoilers_enabled: Option<bool>,
    pub icon_img: Option<String>,
    pub banner_img: Option<String>,
    pub community_icon: Option<String>,
    pub header_img: Option<String>,
    pub banner_background_color: Option<String>,
    pub primary_color: Option<String>,
    pub key_color: Option<String>,
    pub display_name_prefixed: Option<String>,
    #[serde(rename = "quarantine")]
    pub is_quarantined: Option<bool>,
    pub lang: Option<String>,
    pub link_flair_enabled: Option<bool>,
    pub link_flair_position: Option<String>,
    pub mobile_banner_image: Option<String>,
    pub submission_type: Option<String>,
    pub submit_text: Option<String>,
    pub subreddit_type: Option<String>,
    pub url: Option<String>,
    pub user_flair_enabled_in_sr: Option<bool>,
    pub user_flair_position: Option<String>,
    pub wiki_enabled: Option<bool>,
}

/// One entry of `/r/{name}/about/rules.json`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubredditRule {
    pub short_name: Option<String>,
    pub description: Option<String>,
}

/// One post from a listing endpoint (`data` envelope already unwrapped)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PostData {
    pub id: Option<String>,
    pub title: Option<String>,
    pub author: Option<String>,
    pub subreddit: Option<String>,
    pub created_utc: Option<f64>,
    pub score: Option<i64>,
    pub num_comments: Option<i64>,
    pub upvote_ratio: Option<f64>,
    pub over_18: Option<bool>,
    pub spoiler: Option<bool>,
    pub stickied: Option<bool>,
    pub locked: Option<bool>,
    pub is_self: Option<bool>,
    pub is_video: Option<bool>,
    pub is_gallery: Option<bool>,
    pub archived: Option<bool>,
    /// Reddit sends an edit timestamp, or `false`
    pub edited: Option<serde_json::Value>,
    pub selftext: Option<String>,
    pub url: Option<String>,
    pub domain: Option<String>,
    pub link_flair_text: Option<String>,
    pub author_flair_text: Option<String>,
    pub thumbnail: Option<String>,
    pub distinguished: Option<String>,
    pub gilded: Option<i64>,
    pub total_awards_received: Option<i64>,
    pub crosspost_parent: Option<String>,
    pub crosspost_parent_list: Option<serde_json::Value>,
}

/// `/user/{name}/about.json` payload
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserInfo {
    pub name: Option<String>,
    pub id: Option<String>,
    pub created_utc: Option<f64>,
    pub comment_karma: Option<i64>,
    pub link_karma: Option<i64>,
    pub total_karma: Option<i64>,
    pub awardee_karma: Option<i64>,
    pub awarder_karma: Option<i64>,
    pub is_employee: Option<bool>,
    pub is_mod: Option<bool>,
    pub is_gold: Option<bool>,
    pub verified: Option<bool>,
    pub has_verified_email: Option<bool>,
    pub is_suspended: Option<bool>,
    pub icon_img: Option<String>,
    pub accept_followers: Option<bool>,
    pub hide_from_robots: Option<bool>,
    pub subreddit: Option<UserSubreddit>,
}

/// The profile pseudo-subreddit embedded in a user payload
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserSubreddit {
    pub banner_img: Option<String>,
    pub display_name: Option<String>,
    pub over_18: Option<bool>,
    pub subscribers: Option<i64>,
    pub title: Option<String>,
}

// ========================================
// Preserved metadata
// ========================================

/// Manually curated subreddit fields that survive every upsert
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubredditMetadata {
    pub review: Option<Review>,
    pub primary_category: Option<String>,
    pub tags: Vec<String>,
    pub over18: Option<bool>,
}

// ========================================
// Store rows
// ========================================

/// Computed weekly metrics for a subreddit
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SubredditMetrics {
    pub avg_upvotes_per_post: f64,
    pub engagement: f64,
    pub subreddit_score: f64,
}

impl SubredditMetrics {
    /// Metrics over the top-10-weekly sample.
    ///
    /// avg_upvotes = total score / post count; engagement = total comments
    /// / total score; subreddit_score = sqrt(engagement * avg_upvotes *
    /// 1000). All zero-safe: an empty week produces all-zero metrics.
    pub fn compute(top_weekly: &[PostData]) -> Self {
        let count = top_weekly.len() as f64;
        if count == 0.0 {
            return Self::default();
        }

        let total_score: i64 = top_weekly.iter().filter_map(|p| p.score).sum();
        let total_comments: i64 = top_weekly.iter().filter_map(|p| p.num_comments).sum();

        let avg_upvotes = round2(total_score as f64 / count);
        let engagement = if total_score > 0 {
            round6(total_comments as f64 / total_score as f64)
        } else {
            0.0
        };
        let subreddit_score = if engagement > 0.0 && avg_upvotes > 0.0 {
            round2((engagement * avg_upvotes * 1000.0).sqrt())
        } else {
            0.0
        };

        Self {
            avg_upvotes_per_post: avg_upvotes,
            engagement,
            subreddit_score,
        }
    }
}

/// A full `reddit_subreddits` row ready to upsert
#[derive(Debug, Clone, Serialize)]
pub struct SubredditRow {
    pub name: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub public_description: Option<String>,
    pub subscribers: i64,
    pub over18: bool,
    pub created_utc: Option<DateTime<Utc>>,
    pub allow_images: bool,
    pub allow_videos: bool,
    pub allow_polls: bool,
    pub spoilers_enabled: bool,
    pub verification_required: bool,
    pub rules_data: Option<serde_json::Value>,
    pub engagement: f64,
    pub subreddit_score: f64,
    pub avg_upvotes_per_post: f64,
    pub icon_img: Option<String>,
    pub banner_img: Option<String>,
    pub community_icon: Option<String>,
    pub header_img: Option<String>,
    pub banner_background_color: Option<String>,
    pub primary_color: Option<String>,
    pub key_color: Option<String>,
    pub display_name_prefixed: Option<String>,
    pub is_quarantined: bool,
    pub lang: Option<String>,
    pub link_flair_enabled: bool,
    pub link_flair_position: Option<String>,
    pub mobile_banner_image: Option<String>,
    pub submission_type: Option<String>,
    pub submit_text: Option<String>,
    pub subreddit_type: Option<String>,
    pub url: Option<String>,
    pub user_flair_enabled_in_sr: bool,
    pub user_flair_position: Option<String>,
    pub wiki_enabled: bool,
    pub review: Option<String>,
    pub primary_category: Option<String>,
    pub tags: Vec<String>,
    pub last_scraped_at: Option<DateTime<Utc>>,
}

impl SubredditRow {
    /// Assemble an upsert row from a scrape, merging the preserved curated
    /// fields.
    ///
    /// `auto_review` only applies when the cached review is NULL; an
    /// existing human verdict is never overwritten.
    pub fn build(
        name: &str,
        info: &SubredditInfo,
        rules: &[SubredditRule],
        top_weekly: &[PostData],
        preserved: &SubredditMetadata,
        auto_review: Option<Review>,
        verification_required: bool,
    ) -> Self {
        let metrics = SubredditMetrics::compute(top_weekly);

        let review = match preserved.review {
            Some(review) => Some(review),
            None => auto_review,
        };

        let rules_data = if rules.is_empty() {
            None
        } else {
            serde_json::to_value(rules).ok()
        };

        Self {
            name: name.to_lowercase(),
            title: info.title.clone(),
            description: info.description.clone(),
            public_description: info.public_description.clone(),
            subscribers: info.subscribers.unwrap_or(0),
            over18: preserved.over18.or(info.over18).unwrap_or(false),
            created_utc: info.created_utc.and_then(from_epoch),
            allow_images: info.allow_images.unwrap_or(false),
            allow_videos: info.allow_videos.unwrap_or(false),
            allow_polls: info.allow_polls.unwrap_or(false),
            spoilers_enabled: info.spoilers_enabled.unwrap_or(false),
            verification_required,
            rules_data,
            engagement: metrics.engagement,
            subreddit_score: metrics.subreddit_score,
            avg_upvotes_per_post: metrics.avg_upvotes_per_post,
            icon_img: info.icon_img.clone(),
            banner_img: info.banner_img.clone(),
            community_icon: info.community_icon.clone(),
            header_img: info.header_img.clone(),
            banner_background_color: info.banner_background_color.clone(),
            primary_color: info.primary_color.clone(),
            key_color: info.key_color.clone(),
            display_name_prefixed: info.display_name_prefixed.clone(),
            is_quarantined: info.is_quarantined.unwrap_or(false),
            lang: info.lang.clone(),
            link_flair_enabled: info.link_flair_enabled.unwrap_or(false),
            link_flair_position: info.link_flair_position.clone(),
            mobile_banner_image: info.mobile_banner_image.clone(),
            submission_type: info.submission_type.clone(),
            submit_text: info.submit_text.clone(),
            subreddit_type: info.subreddit_type.clone(),
            url: info.url.clone(),
            user_flair_enabled_in_sr: info.user_flair_enabled_in_sr.unwrap_or(false),
            user_flair_position: info.user_flair_position.clone(),
            wiki_enabled: info.wiki_enabled.unwrap_or(false),
            review: review.map(|r| r.as_str().to_string()),
            primary_category: preserved.primary_category.clone(),
            tags: preserved.tags.clone(),
            last_scraped_at: Some(Utc::now()),
        }
    }
}

/// A `reddit_posts` row ready to upsert
#[derive(Debug, Clone, Serialize)]
pub struct PostRow {
    pub reddit_id: String,
    pub title: Option<String>,
    pub author_username: Option<String>,
    pub subreddit_name: String,
    pub created_utc: Option<DateTime<Utc>>,
    pub score: i64,
    pub num_comments: i64,
    pub upvote_ratio: f64,
    pub over_18: bool,
    pub spoiler: bool,
    pub stickied: bool,
    pub locked: bool,
    pub is_self: bool,
    pub is_video: bool,
    pub content_type: String,
    pub archived: bool,
    pub edited: bool,
    pub selftext: Option<String>,
    pub url: Option<String>,
    pub domain: Option<String>,
    pub link_flair_text: Option<String>,
    pub author_flair_text: Option<String>,
    pub thumbnail: Option<String>,
    pub distinguished: Option<String>,
    pub gilded: i64,
    pub total_awards_received: i64,
    pub post_length: i32,
    pub posting_day_of_week: Option<i16>,
    pub posting_hour: Option<i16>,
    pub has_thumbnail: bool,
    pub is_crosspost: bool,
    pub comment_to_upvote_ratio: f64,
    pub sub_primary_category: Option<String>,
    pub sub_tags: Vec<String>,
    pub sub_over18: bool,
    pub scraped_at: DateTime<Utc>,
}

impl PostRow {
    /// Map one API post into a row, denormalizing the subreddit's curated
    /// fields. Returns None when the post has no id.
    pub fn build(post: &PostData, subreddit_name: &str, meta: &SubredditMetadata) -> Option<Self> {
        let reddit_id = post.id.clone()?;

        let created = post.created_utc.and_then(from_epoch);
        let score = post.score.unwrap_or(0);
        let num_comments = post.num_comments.unwrap_or(0);

        let selftext = post.selftext.clone();
        let post_length = selftext.as_deref().map(|s| s.len() as i32).unwrap_or(0);

        let thumbnail = post.thumbnail.clone();
        let has_thumbnail = thumbnail
            .as_deref()
            .map(|t| !matches!(t, "self" | "default" | "nsfw" | "spoiler" | "image" | ""))
            .unwrap_or(false);

        let is_crosspost = post.crosspost_parent.is_some() || post.crosspost_parent_list.is_some();

        let comment_to_upvote_ratio = if score > 0 {
            round4(num_comments as f64 / score as f64)
        } else {
            0.0
        };

        // Reddit sends an edit timestamp when edited, literal false when not
        let edited = match &post.edited {
            Some(serde_json::Value::Bool(b)) => *b,
            Some(serde_json::Value::Number(_)) => true,
            _ => false,
        };

        Some(Self {
            reddit_id,
            title: post.title.clone(),
            author_username: post.author.clone(),
            subreddit_name: subreddit_name.to_lowercase(),
            created_utc: created,
            score,
            num_comments,
            upvote_ratio: post.upvote_ratio.unwrap_or(0.0),
            over_18: post.over_18.unwrap_or(false),
            spoiler: post.spoiler.unwrap_or(false),
            stickied: post.stickied.unwrap_or(false),
            locked: post.locked.unwrap_or(false),
            is_self: post.is_self.unwrap_or(false),
            is_video: post.is_video.unwrap_or(false),
            content_type: content_type(post).to_string(),
            archived: post.archived.unwrap_or(false),
            edited,
            selftext,
            url: post.url.clone(),
            domain: post.domain.clone(),
            link_flair_text: post.link_flair_text.clone(),
            author_flair_text: post.author_flair_text.clone(),
            thumbnail,
            distinguished: post.distinguished.clone(),
            gilded: post.gilded.unwrap_or(0),
            total_awards_received: post.total_awards_received.unwrap_or(0),
            post_length,
            posting_day_of_week: created.map(|dt| {
                use chrono::Datelike;
                dt.weekday().num_days_from_monday() as i16
            }),
            posting_hour: created.map(|dt| {
                use chrono::Timelike;
                dt.hour() as i16
            }),
            has_thumbnail,
            is_crosspost,
            comment_to_upvote_ratio,
            sub_primary_category: meta.primary_category.clone(),
            sub_tags: meta.tags.clone(),
            sub_over18: meta.over18.unwrap_or(false),
            scraped_at: Utc::now(),
        })
    }
}

/// Derivation order: gallery → video → text → image-by-extension → link
pub fn content_type(post: &PostData) -> &'static str {
    if post.is_gallery.unwrap_or(false) {
        "gallery"
    } else if post.is_video.unwrap_or(false) {
        "video"
    } else if post.is_self.unwrap_or(false) {
        "text"
    } else if let Some(url) = post.url.as_deref() {
        let url = url.to_lowercase();
        const IMAGE_EXTENSIONS: [&str; 5] = [".jpg", ".jpeg", ".png", ".gif", ".webp"];
        if IMAGE_EXTENSIONS.iter().any(|ext| url.ends_with(ext)) {
            "image"
        } else {
            "link"
        }
    } else {
        "text"
    }
}

/// Minimal `reddit_users` row satisfying the post author FK
#[derive(Debug, Clone, Serialize)]
pub struct UserStub {
    pub username: String,
    pub last_scraped_at: DateTime<Utc>,
}

impl UserStub {
    pub fn new(username: &str) -> Self {
        Self {
            username: username.to_lowercase(),
            last_scraped_at: Utc::now(),
        }
    }
}

/// A full `reddit_users` row from a profile fetch
#[derive(Debug, Clone, Serialize)]
pub struct UserRow {
    pub username: String,
    pub reddit_id: Option<String>,
    pub created_utc: Option<DateTime<Utc>>,
    pub account_age_days: Option<i64>,
    pub comment_karma: i64,
    pub link_karma: i64,
    pub total_karma: i64,
    pub awardee_karma: i64,
    pub awarder_karma: i64,
    pub is_employee: bool,
    pub is_mod: bool,
    pub is_gold: bool,
    pub verified: bool,
    pub has_verified_email: bool,
    pub is_suspended: bool,
    pub icon_img: Option<String>,
    pub accept_followers: bool,
    pub hide_from_robots: bool,
    pub subreddit_banner_img: Option<String>,
    pub subreddit_display_name: Option<String>,
    pub subreddit_over_18: bool,
    pub subreddit_subscribers: i64,
    pub subreddit_title: Option<String>,
    pub last_scraped_at: DateTime<Utc>,
}

impl UserRow {
    /// Returns None when the payload has no username.
    pub fn build(info: &UserInfo) -> Option<Self> {
        let username = info.name.clone()?;
        let created = info.created_utc.and_then(from_epoch);
        let account_age_days = info
            .created_utc
            .map(|c| ((Utc::now().timestamp() as f64 - c) / 86_400.0) as i64);
        let profile = info.subreddit.clone().unwrap_or_default();

        Some(Self {
            username: username.to_lowercase(),
            reddit_id: info.id.clone(),
            created_utc: created,
            account_age_days,
            comment_karma: info.comment_karma.unwrap_or(0),
            link_karma: info.link_karma.unwrap_or(0),
            total_karma: info.total_karma.unwrap_or(0),
            awardee_karma: info.awardee_karma.unwrap_or(0),
            awarder_karma: info.awarder_karma.unwrap_or(0),
            is_employee: info.is_employee.unwrap_or(false),
            is_mod: info.is_mod.unwrap_or(false),
            is_gold: info.is_gold.unwrap_or(false),
            verified: info.verified.unwrap_or(false),
            has_verified_email: info.has_verified_email.unwrap_or(false),
            is_suspended: info.is_suspended.unwrap_or(false),
            icon_img: info.icon_img.clone(),
            accept_followers: info.accept_followers.unwrap_or(true),
            hide_from_robots: info.hide_from_robots.unwrap_or(false),
            subreddit_banner_img: profile.banner_img,
            subreddit_display_name: profile.display_name,
            subreddit_over_18: profile.over_18.unwrap_or(false),
            subreddit_subscribers: profile.subscribers.unwrap_or(0),
            subreddit_title: profile.title,
            last_scraped_at: Utc::now(),
        })
    }
}

/// A stub `reddit_subreddits` row inserted to satisfy a post FK.
///
/// Carries no `last_scraped_at`, so a later cycle sees it as needing a
/// full scrape.
#[derive(Debug, Clone)]
pub struct SubredditStub {
    pub name: String,
    pub review: Option<Review>,
}

impl SubredditStub {
    pub fn for_name(name: &str) -> Self {
        let review = if name.starts_with("u_") {
            Some(Review::UserFeed)
        } else {
            None
        };
        Self {
            name: name.to_lowercase(),
            review,
        }
    }
}

fn from_epoch(secs: f64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(secs as i64, 0).single()
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}

fn round6(v: f64) -> f64 {
    (v * 1_000_000.0).round() / 1_000_000.0
}
