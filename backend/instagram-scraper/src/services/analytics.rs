/// Creator analytics computation
///
/// Pure function over the fetched reels, posts, and profile snapshot.
/// No I/O; deterministic given its inputs.

use std::collections::HashMap;

use chrono::{TimeZone, Timelike, Utc};

use crate::models::{CreatorProfile, MediaItem};
use crate::services::links;

/// Viral thresholds, lifted from the engine configuration
#[derive(Debug, Clone, Copy)]
pub struct ViralThresholds {
    /// Absolute view floor
    pub min_views: u64,
    /// Required multiple of the average
    pub multiplier: f64,
}

impl Default for ViralThresholds {
    fn default() -> Self {
        Self {
            min_views: 50_000,
            multiplier: 5.0,
        }
    }
}

/// Everything the engine caches back onto the creator row
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CreatorAnalytics {
    // Reel averages
    pub avg_reel_views: f64,
    pub avg_reel_likes: f64,
    pub avg_reel_comments: f64,
    pub avg_reel_saves: f64,
    pub avg_reel_shares: f64,
    // Post averages
    pub avg_post_likes: f64,
    pub avg_post_comments: f64,
    pub avg_post_saves: f64,
    pub avg_post_shares: f64,
    pub avg_post_engagement: f64,
    // Aggregates
    pub total_views: i64,
    pub total_likes: i64,
    pub total_comments: i64,
    pub total_saves: i64,
    pub total_shares: i64,
    pub total_engagement: i64,
    // Derived rates
    pub engagement_rate: f64,
    pub avg_engagement_per_content: f64,
    pub reel_engagement_rate: f64,
    pub post_engagement_rate: f64,
    pub content_reach_rate: f64,
    pub comment_to_like_ratio: f64,
    pub save_to_like_ratio: f64,
    pub reels_vs_posts_performance: f64,
    // Viral detection
    pub viral_content_count: i64,
    pub viral_content_rate: f64,
    pub viral_threshold_multiplier: f64,
    // Content analysis
    pub reels_analyzed: usize,
    pub posts_analyzed: usize,
    pub total_content_analyzed: usize,
    pub best_content_type: Option<&'static str>,
    pub avg_caption_length: f64,
    pub uses_hashtags: bool,
    pub avg_hashtag_count: f64,
    // Posting cadence
    pub posting_frequency_per_week: f64,
    pub posting_consistency_score: f64,
    pub most_active_day: Option<String>,
    pub most_active_hour: Option<u32>,
    pub days_since_last_post: Option<f64>,
}

/// Compute the full metric set for one creator pass.
pub fn compute_analytics(
    reels: &[MediaItem],
    posts: &[MediaItem],
    profile: Option<&CreatorProfile>,
    thresholds: ViralThresholds,
) -> CreatorAnalytics {
    let mut analytics = CreatorAnalytics {
        reels_analyzed: reels.len(),
        posts_analyzed: posts.len(),
        total_content_analyzed: reels.len() + posts.len(),
        viral_threshold_multiplier: thresholds.multiplier,
        ..Default::default()
    };

    let followers = profile.map(|p| p.follower_count).unwrap_or(0);

    reel_metrics(reels, &mut analytics, followers, thresholds);
    post_metrics(posts, &mut analytics, followers, thresholds);
    combined_metrics(&mut analytics, followers);
    posting_patterns(reels, posts, &mut analytics);

    analytics
}

fn avg(values: &[i64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<i64>() as f64 / values.len() as f64
    }
}

fn reel_metrics(
    reels: &[MediaItem],
    analytics: &mut CreatorAnalytics,
    followers: i64,
    thresholds: ViralThresholds,
) {
    if reels.is_empty() {
        return;
    }

    let views: Vec<i64> = reels.iter().filter_map(|r| r.play_count).collect();
    let likes: Vec<i64> = reels.iter().filter_map(|r| r.like_count).collect();
    let comments: Vec<i64> = reels.iter().filter_map(|r| r.comment_count).collect();
    let saves: Vec<i64> = reels.iter().filter_map(|r| r.save_count).collect();
    let shares: Vec<i64> = reels.iter().filter_map(|r| r.share_count).collect();

    analytics.avg_reel_views = avg(&views);
    analytics.avg_reel_likes = avg(&likes);
    analytics.avg_reel_comments = avg(&comments);
    analytics.avg_reel_saves = avg(&saves);
    analytics.avg_reel_shares = avg(&shares);

    analytics.total_views = views.iter().sum();
    analytics.total_likes += likes.iter().sum::<i64>();
    analytics.total_comments += comments.iter().sum::<i64>();
    analytics.total_saves += saves.iter().sum::<i64>();
    analytics.total_shares += shares.iter().sum::<i64>();

    if followers > 0 && analytics.avg_reel_views > 0.0 {
        analytics.content_reach_rate = analytics.avg_reel_views / followers as f64 * 100.0;
    }

    if followers > 0 && !likes.is_empty() {
        let engagement: i64 = likes.iter().sum::<i64>() + comments.iter().sum::<i64>();
        analytics.reel_engagement_rate =
            engagement as f64 / reels.len() as f64 / followers as f64 * 100.0;
    }

    // A reel is viral when it crosses both the absolute floor and the
    // multiple-of-average threshold
    if !views.is_empty() {
        let viral = views
            .iter()
            .filter(|&&v| {
                v >= thresholds.min_views as i64
                    && v as f64 >= analytics.avg_reel_views * thresholds.multiplier
            })
            .count() as i64;
        analytics.viral_content_count = viral;
        analytics.viral_content_rate = viral as f64 / views.len() as f64 * 100.0;
    }
}

fn post_metrics(
    posts: &[MediaItem],
    analytics: &mut CreatorAnalytics,
    followers: i64,
    thresholds: ViralThresholds,
) {
    if posts.is_empty() {
        return;
    }

    let likes: Vec<i64> = posts.iter().filter_map(|p| p.like_count).collect();
    let comments: Vec<i64> = posts.iter().filter_map(|p| p.comment_count).collect();
    let saves: Vec<i64> = posts.iter().filter_map(|p| p.save_count).collect();
    let shares: Vec<i64> = posts.iter().filter_map(|p| p.share_count).collect();
    let engagements: Vec<i64> = posts
        .iter()
        .map(|p| p.engagement())
        .filter(|e| *e > 0)
        .collect();

    analytics.avg_post_likes = avg(&likes);
    analytics.avg_post_comments = avg(&comments);
    analytics.avg_post_saves = avg(&saves);
    analytics.avg_post_shares = avg(&shares);
    analytics.avg_post_engagement = avg(&engagements);

    analytics.total_likes += likes.iter().sum::<i64>();
    analytics.total_comments += comments.iter().sum::<i64>();
    analytics.total_saves += saves.iter().sum::<i64>();
    analytics.total_shares += shares.iter().sum::<i64>();

    if followers > 0 && !engagements.is_empty() {
        analytics.post_engagement_rate = engagements.iter().sum::<i64>() as f64
            / posts.len() as f64
            / followers as f64
            * 100.0;
    }

    // A post is viral on engagement alone (no view counts on stills)
    if analytics.avg_post_engagement > 0.0 {
        let viral = engagements
            .iter()
            .filter(|&&e| e as f64 >= analytics.avg_post_engagement * thresholds.multiplier)
            .count() as i64;
        analytics.viral_content_count += viral;
    }

    // Caption analysis
    let captions: Vec<String> = posts
        .iter()
        .map(|p| p.caption_text())
        .filter(|c| !c.is_empty())
        .collect();
    if !captions.is_empty() {
        analytics.avg_caption_length =
            captions.iter().map(|c| c.len()).sum::<usize>() as f64 / captions.len() as f64;
        let hashtag_counts: Vec<usize> = captions
            .iter()
            .map(|c| links::extract_hashtags(c).len())
            .collect();
        analytics.uses_hashtags = hashtag_counts.iter().any(|&n| n > 0);
        analytics.avg_hashtag_count =
            hashtag_counts.iter().sum::<usize>() as f64 / hashtag_counts.len() as f64;
    }
}

fn combined_metrics(analytics: &mut CreatorAnalytics, followers: i64) {
    analytics.total_engagement = analytics.total_likes + analytics.total_comments;

    if followers > 0 && analytics.total_content_analyzed > 0 {
        let avg_engagement =
            analytics.total_engagement as f64 / analytics.total_content_analyzed as f64;
        analytics.engagement_rate = avg_engagement / followers as f64 * 100.0;
        analytics.avg_engagement_per_content = avg_engagement;
    }

    if analytics.total_likes > 0 {
        analytics.comment_to_like_ratio =
            analytics.total_comments as f64 / analytics.total_likes as f64;
        if analytics.total_saves > 0 {
            analytics.save_to_like_ratio =
                analytics.total_saves as f64 / analytics.total_likes as f64;
        }
    }

    if analytics.avg_reel_views > 0.0 && analytics.avg_post_engagement > 0.0 {
        analytics.reels_vs_posts_performance =
            analytics.avg_reel_views / analytics.avg_post_engagement;
    }

    // Best content type by the 1.5x dominance rule, with a raw-volume
    // fallback when only one side has an engagement rate
    let reel_score = analytics.reel_engagement_rate.max(0.0);
    let post_score = analytics.post_engagement_rate.max(0.0);

    analytics.best_content_type = if reel_score > post_score * 1.5 && reel_score > 0.0 {
        Some("reels")
    } else if post_score > reel_score * 1.5 && post_score > 0.0 {
        Some("posts")
    } else if reel_score > 0.0 && post_score > 0.0 {
        Some("mixed")
    } else if analytics.avg_reel_views > analytics.avg_post_engagement {
        Some("reels")
    } else if analytics.avg_post_engagement > 0.0 {
        Some("posts")
    } else {
        None
    };
}

fn posting_patterns(reels: &[MediaItem], posts: &[MediaItem], analytics: &mut CreatorAnalytics) {
    let mut timestamps: Vec<i64> = reels
        .iter()
        .chain(posts.iter())
        .filter_map(|item| item.timestamp())
        .collect();
    if timestamps.is_empty() {
        return;
    }
    timestamps.sort_unstable();

    let now = Utc::now().timestamp();
    let last = *timestamps.last().expect("non-empty");
    analytics.days_since_last_post = Some((now - last) as f64 / 86_400.0);

    if timestamps.len() > 1 {
        let span_weeks = (last - timestamps[0]) as f64 / (7.0 * 86_400.0);
        if span_weeks > 0.0 {
            analytics.posting_frequency_per_week = timestamps.len() as f64 / span_weeks;
        }

        // Consistency: 100 minus the coefficient of variation of the
        // inter-post intervals, clamped to [0, 100]
        let intervals: Vec<f64> = timestamps
            .windows(2)
            .map(|w| (w[1] - w[0]) as f64)
            .collect();
        let avg_interval = intervals.iter().sum::<f64>() / intervals.len() as f64;
        if avg_interval > 0.0 {
            let variance = intervals
                .iter()
                .map(|i| (i - avg_interval).powi(2))
                .sum::<f64>()
                / intervals.len() as f64;
            let std_dev = variance.sqrt();
            let consistency = 100.0 - std_dev / avg_interval * 100.0;
            analytics.posting_consistency_score = consistency.clamp(0.0, 100.0);
        }
    }

    // Histogram modes for day-of-week and hour
    let mut day_counts: HashMap<String, usize> = HashMap::new();
    let mut hour_counts: HashMap<u32, usize> = HashMap::new();
    for ts in &timestamps {
        if let Some(dt) = Utc.timestamp_opt(*ts, 0).single() {
            *day_counts.entry(dt.format("%A").to_string()).or_default() += 1;
            *hour_counts.entry(dt.hour()).or_default() += 1;
        }
    }
    analytics.most_active_day = day_counts
        .into_iter()
        .max_by_key(|(_, count)| *count)
        .map(|(day, _)| day);
    analytics.most_active_hour = hour_counts
        .into_iter()
        .max_by_key(|(_, count)| *count)
        .map(|(hour, _)| hour);
}
