/// Wire payloads and store row types for the Instagram harvester

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::services::links;

// ========================================
// Wire payloads
// ========================================

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EdgeCount {
    pub count: Option<i64>,
}

/// Raw profile payload from the proxy API
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawProfile {
    pub status: Option<bool>,
    pub id: Option<String>,
    pub full_name: Option<String>,
    pub biography: Option<String>,
    pub edge_followed_by: Option<EdgeCount>,
    pub edge_follow: Option<EdgeCount>,
    pub edge_owner_to_timeline_media: Option<EdgeCount>,
    pub is_verified: Option<bool>,
    pub is_private: Option<bool>,
    pub is_business_account: Option<bool>,
    pub is_professional_account: Option<bool>,
    pub profile_pic_url: Option<String>,
    pub profile_pic_url_hd: Option<String>,
    pub external_url: Option<String>,
    pub bio_links: Option<Vec<RawBioLink>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawBioLink {
    pub url: Option<String>,
    pub title: Option<String>,
}

/// A parsed bio link with its classified type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BioLink {
    pub url: String,
    pub title: String,
    #[serde(rename = "type")]
    pub link_type: Option<String>,
}

/// Profile snapshot mapped into domain shape
#[derive(Debug, Clone, Default)]
pub struct CreatorProfile {
    pub ig_user_id: Option<String>,
    pub full_name: Option<String>,
    pub biography: Option<String>,
    pub follower_count: i64,
    pub following_count: i64,
    pub media_count: i64,
    pub is_verified: bool,
    pub is_private: bool,
    pub is_business_account: bool,
    pub is_professional_account: bool,
    pub profile_pic_url: Option<String>,
    pub external_url: Option<String>,
    pub bio_links: Vec<BioLink>,
}

impl CreatorProfile {
    pub fn from_raw(raw: &RawProfile) -> Self {
        Self {
            ig_user_id: raw.id.clone(),
            full_name: raw.full_name.clone(),
            biography: raw.biography.clone(),
            follower_count: raw
                .edge_followed_by
                .as_ref()
                .and_then(|e| e.count)
                .unwrap_or(0),
            following_count: raw.edge_follow.as_ref().and_then(|e| e.count).unwrap_or(0),
            media_count: raw
                .edge_owner_to_timeline_media
                .as_ref()
                .and_then(|e| e.count)
                .unwrap_or(0),
            is_verified: raw.is_verified.unwrap_or(false),
            is_private: raw.is_private.unwrap_or(false),
            is_business_account: raw.is_business_account.unwrap_or(false),
            is_professional_account: raw.is_professional_account.unwrap_or(false),
            profile_pic_url: raw
                .profile_pic_url_hd
                .clone()
                .or_else(|| raw.profile_pic_url.clone()),
            external_url: raw.external_url.clone(),
            bio_links: links::extract_bio_links(raw.bio_links.as_deref().unwrap_or_default()),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VideoVersion {
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageCandidate {
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageVersions {
    #[serde(default = "Vec::new")]
    pub candidates: Vec<ImageCandidate>,
}

/// One media item from the reels or posts endpoints.
///
/// `pk` arrives as either a number or a string depending on the endpoint;
/// captions as either a string or `{text: ...}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MediaItem {
    pub pk: Option<serde_json::Value>,
    pub id: Option<String>,
    pub code: Option<String>,
    pub product_type: Option<String>,
    pub media_type: Option<i32>,
    pub taken_at: Option<i64>,
    pub device_timestamp: Option<i64>,
    pub caption: Option<serde_json::Value>,
    pub play_count: Option<i64>,
    pub ig_play_count: Option<i64>,
    pub like_count: Option<i64>,
    pub comment_count: Option<i64>,
    pub save_count: Option<i64>,
    pub share_count: Option<i64>,
    pub view_count: Option<i64>,
    pub has_audio: Option<bool>,
    pub video_duration: Option<f64>,
    pub media_duration: Option<f64>,
    pub video_versions: Option<Vec<VideoVersion>>,
    pub image_versions2: Option<ImageVersions>,
    pub carousel_media: Option<Vec<MediaItem>>,
    pub is_paid_partnership: Option<bool>,
    pub comments_disabled: Option<bool>,
    pub original_width: Option<i32>,
    pub original_height: Option<i32>,
    pub accessibility_caption: Option<String>,
}

impl MediaItem {
    pub fn media_pk(&self) -> Option<String> {
        match &self.pk {
            Some(serde_json::Value::String(s)) => Some(s.clone()),
            Some(serde_json::Value::Number(n)) => Some(n.to_string()),
            _ => None,
        }
    }

    pub fn caption_text(&self) -> String {
        match &self.caption {
            Some(serde_json::Value::Object(map)) => map
                .get("text")
                .and_then(|t| t.as_str())
                .unwrap_or_default()
                .to_string(),
            Some(serde_json::Value::String(s)) => s.clone(),
            _ => String::new(),
        }
    }

    pub fn timestamp(&self) -> Option<i64> {
        self.taken_at.or(self.device_timestamp)
    }

    pub fn taken_at_utc(&self) -> Option<DateTime<Utc>> {
        self.timestamp().and_then(|t| Utc.timestamp_opt(t, 0).single())
    }

    /// Highest quality video URL
    pub fn video_url(&self) -> Option<String> {
        self.video_versions
            .as_ref()
            .and_then(|v| v.first())
            .and_then(|v| v.url.clone())
    }

    /// First image candidate (thumbnail)
    pub fn thumbnail_url(&self) -> Option<String> {
        self.image_versions2
            .as_ref()
            .and_then(|v| v.candidates.first())
            .and_then(|c| c.url.clone())
    }

    pub fn engagement(&self) -> i64 {
        self.like_count.unwrap_or(0) + self.comment_count.unwrap_or(0)
    }
}

// ========================================
// Store rows
// ========================================

/// One creator to process this cycle
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CreatorRef {
    pub ig_user_id: String,
    pub username: String,
    pub niche: Option<String>,
}

/// Append-only follower history entry
#[derive(Debug, Clone)]
pub struct FollowerHistoryRow {
    pub creator_id: String,
    pub username: String,
    pub followers_count: i64,
    pub following_count: Option<i64>,
    pub media_count: Option<i64>,
    pub recorded_at: DateTime<Utc>,
}

/// Profile fields written after a successful profile fetch.
///
/// None fields are omitted from the UPDATE so a sparse payload never
/// nulls a stored value.
#[derive(Debug, Clone, Default)]
pub struct CreatorProfileUpdate {
    pub followers_count: Option<i64>,
    pub following_count: Option<i64>,
    pub media_count: Option<i64>,
    pub biography: Option<String>,
    pub full_name: Option<String>,
    pub is_verified: Option<bool>,
    pub is_private: Option<bool>,
    pub is_business_account: Option<bool>,
    pub is_professional_account: Option<bool>,
    pub profile_pic_url: Option<String>,
    pub external_url: Option<String>,
    pub external_url_type: Option<String>,
    pub bio_links: Option<serde_json::Value>,
    pub follower_growth_rate_daily: Option<f64>,
    pub follower_growth_rate_weekly: Option<f64>,
    pub previous_followers_count: Option<i64>,
    pub followers_last_updated: Option<DateTime<Utc>>,
    pub last_scraped_at: Option<DateTime<Utc>>,
}

/// An `instagram_reels` row ready to upsert
#[derive(Debug, Clone)]
pub struct ReelRow {
    pub media_pk: String,
    pub media_id: Option<String>,
    pub shortcode: Option<String>,
    pub creator_id: String,
    pub creator_username: String,
    pub creator_niche: Option<String>,
    pub product_type: Option<String>,
    pub media_type: Option<i32>,
    pub taken_at: Option<DateTime<Utc>>,
    pub caption_text: Option<String>,
    pub hashtags: Vec<String>,
    pub hashtag_count: i32,
    pub mention_count: i32,
    pub play_count: i64,
    pub ig_play_count: Option<i64>,
    pub like_count: i64,
    pub comment_count: i64,
    pub save_count: Option<i64>,
    pub share_count: Option<i64>,
    pub engagement_count: i64,
    pub engagement_rate: f64,
    pub has_audio: Option<bool>,
    pub video_duration: Option<f64>,
    pub video_url: Option<String>,
    pub thumbnail_url: Option<String>,
    pub is_paid_partnership: bool,
    pub raw_media_json: serde_json::Value,
    pub scraped_at: DateTime<Utc>,
}

impl ReelRow {
    /// Map one media item; `video_url` may be substituted with an
    /// already-migrated CDN URL by the caller. Returns None without a pk.
    pub fn build(
        item: &MediaItem,
        creator_id: &str,
        username: &str,
        niche: Option<&str>,
        followers: i64,
        video_url: Option<String>,
    ) -> Option<Self> {
        let media_pk = item.media_pk()?;
        let caption = item.caption_text();
        let hashtags = links::extract_hashtags(&caption);
        let mentions = links::extract_mentions(&caption);
        let engagement = item.engagement();
        let engagement_rate = if followers > 0 {
            round2(engagement as f64 / followers as f64 * 100.0)
        } else {
            0.0
        };

        Some(Self {
            media_pk,
            media_id: item.id.clone(),
            shortcode: item.code.clone(),
            creator_id: creator_id.to_string(),
            creator_username: username.to_string(),
            creator_niche: niche.map(|n| n.to_string()),
            product_type: item.product_type.clone(),
            media_type: item.media_type,
            taken_at: item.taken_at_utc(),
            caption_text: truncate_caption(&caption),
            hashtag_count: hashtags.len() as i32,
            mention_count: mentions.len() as i32,
            hashtags,
            play_count: item.play_count.unwrap_or(0),
            ig_play_count: item.ig_play_count,
            like_count: item.like_count.unwrap_or(0),
            comment_count: item.comment_count.unwrap_or(0),
            save_count: item.save_count,
            share_count: item.share_count,
            engagement_count: engagement,
            engagement_rate,
            has_audio: item.has_audio,
            video_duration: item.video_duration.or(item.media_duration),
            video_url,
            thumbnail_url: item.thumbnail_url(),
            is_paid_partnership: item.is_paid_partnership.unwrap_or(false),
            raw_media_json: serde_json::to_value(item).unwrap_or(serde_json::Value::Null),
            scraped_at: Utc::now(),
        })
    }
}

/// An `instagram_posts` row ready to upsert
#[derive(Debug, Clone)]
pub struct IgPostRow {
    pub media_pk: String,
    pub media_id: Option<String>,
    pub shortcode: Option<String>,
    pub creator_id: String,
    pub creator_username: String,
    pub creator_niche: Option<String>,
    pub product_type: Option<String>,
    pub media_type: Option<i32>,
    pub post_type: String,
    pub carousel_media_count: i32,
    pub taken_at: Option<DateTime<Utc>>,
    pub caption_text: Option<String>,
    pub hashtags: Vec<String>,
    pub hashtag_count: i32,
    pub mention_count: i32,
    pub like_count: i64,
    pub comment_count: i64,
    pub save_count: Option<i64>,
    pub share_count: Option<i64>,
    pub engagement_count: i64,
    pub engagement_rate: f64,
    pub is_paid_partnership: bool,
    pub comments_disabled: bool,
    pub original_width: Option<i32>,
    pub original_height: Option<i32>,
    pub accessibility_caption: Option<String>,
    pub thumbnail_url: Option<String>,
    pub image_urls: Option<Vec<String>>,
    pub video_duration: Option<f64>,
    pub view_count: Option<i64>,
    pub raw_media_json: serde_json::Value,
    pub scraped_at: DateTime<Utc>,
}

impl IgPostRow {
    /// Map one feed item; `image_urls` may be substituted with
    /// already-migrated CDN URLs by the caller.
    pub fn build(
        item: &MediaItem,
        creator_id: &str,
        username: &str,
        niche: Option<&str>,
        followers: i64,
        image_urls: Option<Vec<String>>,
    ) -> Option<Self> {
        let media_pk = item.media_pk()?;
        let caption = item.caption_text();
        let hashtags = links::extract_hashtags(&caption);
        let mentions = links::extract_mentions(&caption);
        let engagement = item.engagement();
        let engagement_rate = if followers > 0 {
            round2(engagement as f64 / followers as f64 * 100.0)
        } else {
            0.0
        };

        let post_type = post_type_of(item);
        let carousel_media_count = item
            .carousel_media
            .as_ref()
            .map(|c| c.len() as i32)
            .unwrap_or(0);

        Some(Self {
            media_pk,
            media_id: item.id.clone(),
            shortcode: item.code.clone(),
            creator_id: creator_id.to_string(),
            creator_username: username.to_string(),
            creator_niche: niche.map(|n| n.to_string()),
            product_type: item.product_type.clone().or(Some("feed".into())),
            media_type: item.media_type,
            post_type: post_type.to_string(),
            carousel_media_count,
            taken_at: item.taken_at_utc(),
            caption_text: truncate_caption(&caption),
            hashtag_count: hashtags.len() as i32,
            mention_count: mentions.len() as i32,
            hashtags,
            like_count: item.like_count.unwrap_or(0),
            comment_count: item.comment_count.unwrap_or(0),
            save_count: item.save_count,
            share_count: item.share_count,
            engagement_count: engagement,
            engagement_rate,
            is_paid_partnership: item.is_paid_partnership.unwrap_or(false),
            comments_disabled: item.comments_disabled.unwrap_or(false),
            original_width: item.original_width,
            original_height: item.original_height,
            accessibility_caption: item.accessibility_caption.clone(),
            thumbnail_url: item.thumbnail_url(),
            image_urls,
            video_duration: if post_type == "video" {
                item.video_duration
            } else {
                None
            },
            view_count: item.view_count.or(item.play_count),
            raw_media_json: serde_json::to_value(item).unwrap_or(serde_json::Value::Null),
            scraped_at: Utc::now(),
        })
    }
}

/// carousel → video (clips or media_type 2) → image
pub fn post_type_of(item: &MediaItem) -> &'static str {
    if item
        .carousel_media
        .as_ref()
        .map(|c| !c.is_empty())
        .unwrap_or(false)
    {
        "carousel"
    } else if item.media_type == Some(2) || item.product_type.as_deref() == Some("clips") {
        "video"
    } else {
        "image"
    }
}

/// Every carousel frame's best candidate URL (videos contribute their
/// thumbnail)
pub fn carousel_image_urls(item: &MediaItem) -> Vec<String> {
    item.carousel_media
        .as_deref()
        .unwrap_or_default()
        .iter()
        .filter_map(|frame| frame.thumbnail_url())
        .collect()
}

fn truncate_caption(caption: &str) -> Option<String> {
    if caption.is_empty() {
        return None;
    }
    Some(caption.chars().take(2000).collect())
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn media(pk: &str) -> MediaItem {
        MediaItem {
            pk: Some(serde_json::json!(pk)),
            ..Default::default()
        }
    }

    #[test]
    fn media_pk_accepts_number_or_string() {
        let mut item = media("42");
        assert_eq!(item.media_pk().as_deref(), Some("42"));

        item.pk = Some(serde_json::json!(42));
        assert_eq!(item.media_pk().as_deref(), Some("42"));

        item.pk = None;
        assert_eq!(item.media_pk(), None);
    }

    #[test]
    fn caption_text_handles_both_shapes() {
        let mut item = media("1");
        item.caption = Some(serde_json::json!({"text": "hello #world"}));
        assert_eq!(item.caption_text(), "hello #world");

        item.caption = Some(serde_json::json!("plain caption"));
        assert_eq!(item.caption_text(), "plain caption");

        item.caption = None;
        assert_eq!(item.caption_text(), "");
    }

    #[test]
    fn profile_maps_edge_counts() {
        let raw = RawProfile {
            id: Some("123".into()),
            edge_followed_by: Some(EdgeCount { count: Some(5000) }),
            edge_follow: Some(EdgeCount { count: Some(100) }),
            external_url: Some("https://onlyfans.com/someone".into()),
            ..Default::default()
        };
        let profile = CreatorProfile::from_raw(&raw);
        assert_eq!(profile.follower_count, 5000);
        assert_eq!(profile.following_count, 100);
        assert_eq!(profile.media_count, 0);
    }

    #[test]
    fn reel_row_computes_engagement() {
        let mut item = media("7");
        item.like_count = Some(90);
        item.comment_count = Some(10);
        item.caption = Some(serde_json::json!({"text": "check #fit #gym @pal"}));

        let row = ReelRow::build(&item, "c1", "creator", None, 1000, None).unwrap();
        assert_eq!(row.engagement_count, 100);
        assert_eq!(row.engagement_rate, 10.0);
        assert_eq!(row.hashtag_count, 2);
        assert_eq!(row.mention_count, 1);
    }

    #[test]
    fn reel_row_zero_followers_is_zero_safe() {
        let mut item = media("7");
        item.like_count = Some(90);
        let row = ReelRow::build(&item, "c1", "creator", None, 0, None).unwrap();
        assert_eq!(row.engagement_rate, 0.0);
    }

    #[test]
    fn post_type_derivation() {
        let mut item = media("1");
        assert_eq!(post_type_of(&item), "image");

        item.media_type = Some(2);
        assert_eq!(post_type_of(&item), "video");

        item.media_type = None;
        item.product_type = Some("clips".into());
        assert_eq!(post_type_of(&item), "video");

        item.carousel_media = Some(vec![media("2")]);
        assert_eq!(post_type_of(&item), "carousel");
    }

    #[test]
    fn carousel_urls_use_best_candidates() {
        let mut frame1 = media("f1");
        frame1.image_versions2 = Some(ImageVersions {
            candidates: vec![ImageCandidate {
                url: Some("https://cdn.ig/f1.jpg".into()),
            }],
        });
        let frame2 = media("f2"); // no candidates

        let mut item = media("1");
        item.carousel_media = Some(vec![frame1, frame2]);

        assert_eq!(carousel_image_urls(&item), vec!["https://cdn.ig/f1.jpg"]);
    }

    #[test]
    fn captions_are_truncated() {
        let mut item = media("1");
        item.caption = Some(serde_json::json!("x".repeat(5000)));
        let row = IgPostRow::build(&item, "c1", "u", None, 0, None).unwrap();
        assert_eq!(row.caption_text.unwrap().len(), 2000);
    }

    #[test]
    fn rows_require_a_pk() {
        let item = MediaItem::default();
        assert!(ReelRow::build(&item, "c", "u", None, 0, None).is_none());
        assert!(IgPostRow::build(&item, "c", "u", None, 0, None).is_none());
    }
}
