/// In-memory caches for the scraper engine
///
/// One lock guards all cache state; hot-path filtering is pure set math
/// against snapshots taken under that lock, so no database queries happen
/// while a batch is being processed.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::models::{Review, SubredditMetadata};

/// Names loaded per review status during a skip-cache refresh
#[derive(Debug, Default)]
pub struct SkipCaches {
    pub non_related: HashSet<String>,
    pub user_feed: HashSet<String>,
    pub banned: HashSet<String>,
    pub ok: HashSet<String>,
    pub no_seller: HashSet<String>,
    pub null_review: HashSet<String>,
}

#[derive(Default)]
struct CacheState {
    skip: SkipCaches,
    skip_loaded_at: Option<Instant>,
    /// Every subreddit name currently in the store (refreshed each cycle)
    all_subreddits: HashSet<String>,
    /// Subreddits handled this session; a name added here is never
    /// re-scheduled by discovery
    session_processed: HashSet<String>,
    /// Users whose posts were already pulled this session
    session_fetched_users: HashSet<String>,
    /// Preserved curated fields, keyed by subreddit name
    metadata: HashMap<String, SubredditMetadata>,
}

#[derive(Default)]
pub struct Caches {
    state: Mutex<CacheState>,
}

impl Caches {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when the skip caches are younger than `ttl`
    pub fn skip_caches_fresh(&self, ttl: Duration) -> bool {
        let state = self.state.lock().unwrap();
        state
            .skip_loaded_at
            .map(|at| at.elapsed() < ttl)
            .unwrap_or(false)
    }

    pub fn set_skip_caches(&self, skip: SkipCaches) {
        let mut state = self.state.lock().unwrap();
        state.skip = skip;
        state.skip_loaded_at = Some(Instant::now());
    }

    pub fn set_all_subreddits(&self, names: impl IntoIterator<Item = String>) {
        let mut state = self.state.lock().unwrap();
        state.all_subreddits = names.into_iter().collect();
    }

    pub fn all_subreddits_len(&self) -> usize {
        self.state.lock().unwrap().all_subreddits.len()
    }

    pub fn add_known_subreddit(&self, name: &str) {
        self.state
            .lock()
            .unwrap()
            .all_subreddits
            .insert(name.to_string());
    }

    pub fn add_banned(&self, name: &str) {
        let mut state = self.state.lock().unwrap();
        state.skip.banned.insert(name.to_string());
        state.all_subreddits.insert(name.to_string());
    }

    pub fn add_non_related(&self, name: &str) {
        let mut state = self.state.lock().unwrap();
        state.skip.non_related.insert(name.to_string());
        state.all_subreddits.insert(name.to_string());
    }

    pub fn add_user_feed(&self, name: &str) {
        let mut state = self.state.lock().unwrap();
        state.skip.user_feed.insert(name.to_string());
        state.all_subreddits.insert(name.to_string());
    }

    pub fn insert_metadata(&self, name: &str, metadata: SubredditMetadata) {
        self.state
            .lock()
            .unwrap()
            .metadata
            .insert(name.to_string(), metadata);
    }

    /// Insert only when absent (discovery marks new names NULL-review
    /// without clobbering a loaded verdict)
    pub fn insert_metadata_if_absent(&self, name: &str, metadata: SubredditMetadata) {
        self.state
            .lock()
            .unwrap()
            .metadata
            .entry(name.to_string())
            .or_insert(metadata);
    }

    pub fn metadata(&self, name: &str) -> Option<SubredditMetadata> {
        self.state.lock().unwrap().metadata.get(name).cloned()
    }

    pub fn cached_review(&self, name: &str) -> Option<Review> {
        self.state
            .lock()
            .unwrap()
            .metadata
            .get(name)
            .and_then(|m| m.review)
    }

    pub fn mark_session_processed(&self, name: &str) {
        self.state
            .lock()
            .unwrap()
            .session_processed
            .insert(name.to_string());
    }

    pub fn extend_session_processed(&self, names: impl IntoIterator<Item = String>) {
        self.state.lock().unwrap().session_processed.extend(names);
    }

    /// Claim a user for this session's post fetches. Returns false when
    /// another task already fetched them.
    pub fn claim_user_fetch(&self, username: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .session_fetched_users
            .insert(username.to_string())
    }

    pub fn unclaim_user_fetch(&self, username: &str) {
        self.state
            .lock()
            .unwrap()
            .session_fetched_users
            .remove(username);
    }

    pub fn filter_fetched_users(&self, users: HashSet<String>) -> HashSet<String> {
        let state = self.state.lock().unwrap();
        users
            .into_iter()
            .filter(|u| !state.session_fetched_users.contains(u))
            .collect()
    }

    /// Pure in-memory discovery filter: drop names already in the store,
    /// already processed this session, or in any skip category. Zero
    /// database calls.
    pub fn filter_discovered(&self, discovered: HashSet<String>) -> HashSet<String> {
        let state = self.state.lock().unwrap();
        discovered
            .into_iter()
            .filter(|name| {
                !state.all_subreddits.contains(name)
                    && !state.session_processed.contains(name)
                    && !state.skip.non_related.contains(name)
                    && !state.skip.user_feed.contains(name)
                    && !state.skip.banned.contains(name)
                    && !state.skip.ok.contains(name)
                    && !state.skip.no_seller.contains(name)
                    && !state.skip.null_review.contains(name)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> HashSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn skip_cache_ttl() {
        let caches = Caches::new();
        assert!(!caches.skip_caches_fresh(Duration::from_secs(60)));

        caches.set_skip_caches(SkipCaches::default());
        assert!(caches.skip_caches_fresh(Duration::from_secs(60)));
        assert!(!caches.skip_caches_fresh(Duration::ZERO));
    }

    #[test]
    fn filter_drops_known_and_processed_names() {
        let caches = Caches::new();
        caches.set_all_subreddits(names(&["known"]));
        caches.set_skip_caches(SkipCaches {
            banned: names(&["deadsub"]),
            non_related: names(&["offtopic"]),
            ..Default::default()
        });
        caches.mark_session_processed("donethiscycle");

        let filtered = caches.filter_discovered(names(&[
            "known",
            "deadsub",
            "offtopic",
            "donethiscycle",
            "fresh",
        ]));
        assert_eq!(filtered, names(&["fresh"]));
    }

    #[test]
    fn session_processed_is_monotonic() {
        let caches = Caches::new();
        caches.extend_session_processed(names(&["a", "b"]));
        caches.mark_session_processed("c");

        // Once added, a name is never returned by the filter again
        let filtered = caches.filter_discovered(names(&["a", "b", "c", "d"]));
        assert_eq!(filtered, names(&["d"]));
    }

    #[test]
    fn user_fetch_claims_are_exclusive() {
        let caches = Caches::new();
        assert!(caches.claim_user_fetch("alice"));
        assert!(!caches.claim_user_fetch("alice"));

        caches.unclaim_user_fetch("alice");
        assert!(caches.claim_user_fetch("alice"));
    }

    #[test]
    fn metadata_if_absent_preserves_loaded_verdict() {
        let caches = Caches::new();
        caches.insert_metadata(
            "bar",
            SubredditMetadata {
                review: Some(Review::Ok),
                ..Default::default()
            },
        );
        caches.insert_metadata_if_absent("bar", SubredditMetadata::default());
        assert_eq!(caches.cached_review("bar"), Some(Review::Ok));

        caches.insert_metadata_if_absent("new", SubredditMetadata::default());
        assert_eq!(caches.cached_review("new"), None);
    }
}
