/// Batched writer composition for the Reddit tables
///
/// Three table buffers share one store. `flush_all` drains them in
/// foreign-key order (subreddits → users → posts) so no post can land
/// before its parent rows; a single-table flush stays safe because the
/// posts sink creates any missing user and subreddit stubs before the
/// posts upsert.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use batch_writer::{RowSink, SinkError, TableBuffer, TableStats};
use control_plane::StopFlag;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::models::{PostRow, SubredditRow, SubredditStub, UserStub};
use crate::store::{RedditStore, StoreError};

/// Cadence of the failed-records retry scan
const RETRY_CHECK_INTERVAL: Duration = Duration::from_secs(30);

fn to_sink_error(e: StoreError) -> SinkError {
    match e {
        StoreError::DuplicateKey => SinkError::DuplicateKey,
        StoreError::Database(msg) => SinkError::Other(msg),
    }
}

pub struct SubredditSink<S> {
    store: Arc<S>,
}

#[async_trait]
impl<S: RedditStore> RowSink for SubredditSink<S> {
    type Row = SubredditRow;

    fn table(&self) -> &'static str {
        "reddit_subreddits"
    }

    async fn write_batch(&self, rows: &[SubredditRow]) -> Result<(), SinkError> {
        self.store.upsert_subreddits(rows).await.map_err(to_sink_error)
    }

    async fn write_row(&self, row: &SubredditRow) -> Result<(), SinkError> {
        self.store.upsert_subreddit(row).await.map_err(to_sink_error)
    }
}

pub struct UserSink<S> {
    store: Arc<S>,
}

#[async_trait]
impl<S: RedditStore> RowSink for UserSink<S> {
    type Row = UserStub;

    fn table(&self) -> &'static str {
        "reddit_users"
    }

    async fn write_batch(&self, rows: &[UserStub]) -> Result<(), SinkError> {
        self.store.upsert_user_stubs(rows).await.map_err(to_sink_error)
    }

    async fn write_row(&self, row: &UserStub) -> Result<(), SinkError> {
        self.store.upsert_user_stub(row).await.map_err(to_sink_error)
    }
}

pub struct PostSink<S> {
    store: Arc<S>,
}

impl<S: RedditStore> PostSink<S> {
    /// Create any missing parent rows so a posts-only flush cannot break
    /// the FK invariant.
    async fn ensure_parents(&self, rows: &[PostRow]) -> Result<(), SinkError> {
        let mut authors: Vec<UserStub> = Vec::new();
        let mut seen_authors = std::collections::HashSet::new();
        let mut stubs: Vec<SubredditStub> = Vec::new();
        let mut seen_subs = std::collections::HashSet::new();

        for row in rows {
            if let Some(author) = &row.author_username {
                if seen_authors.insert(author.to_lowercase()) {
                    authors.push(UserStub::new(author));
                }
            }
            if seen_subs.insert(row.subreddit_name.clone()) {
                stubs.push(SubredditStub::for_name(&row.subreddit_name));
            }
        }

        self.store
            .ensure_subreddit_stubs(&stubs)
            .await
            .map_err(to_sink_error)?;
        self.store
            .upsert_user_stubs(&authors)
            .await
            .map_err(to_sink_error)?;
        Ok(())
    }
}

#[async_trait]
impl<S: RedditStore> RowSink for PostSink<S> {
    type Row = PostRow;

    fn table(&self) -> &'static str {
        "reddit_posts"
    }

    async fn write_batch(&self, rows: &[PostRow]) -> Result<(), SinkError> {
        self.ensure_parents(rows).await?;
        self.store.upsert_posts(rows).await.map_err(to_sink_error)
    }

    async fn write_row(&self, row: &PostRow) -> Result<(), SinkError> {
        self.ensure_parents(std::slice::from_ref(row)).await?;
        self.store.upsert_post(row).await.map_err(to_sink_error)
    }
}

/// Aggregated statistics for one log line
#[derive(Debug, Clone)]
pub struct WriterStats {
    pub subreddits: TableStats,
    pub users: TableStats,
    pub posts: TableStats,
}

pub struct RedditBatchWriter<S: RedditStore> {
    subreddits: TableBuffer<SubredditSink<S>>,
    users: TableBuffer<UserSink<S>>,
    posts: TableBuffer<PostSink<S>>,
    flush_all_in_progress: AtomicBool,
}

impl<S: RedditStore> RedditBatchWriter<S> {
    pub fn new(store: Arc<S>, batch_size: usize, max_retry_attempts: u32) -> Self {
        Self {
            subreddits: TableBuffer::new(
                SubredditSink {
                    store: store.clone(),
                },
                batch_size,
                max_retry_attempts,
            ),
            users: TableBuffer::new(
                UserSink {
                    store: store.clone(),
                },
                batch_size,
                max_retry_attempts,
            ),
            posts: TableBuffer::new(PostSink { store }, batch_size, max_retry_attempts),
            flush_all_in_progress: AtomicBool::new(false),
        }
    }

    pub async fn add_subreddit(&self, row: SubredditRow) {
        if self.subreddits.add(row).await {
            debug!("subreddit buffer full, flushing");
            let _ = self.subreddits.flush().await;
        }
    }

    pub async fn add_user_stubs(&self, stubs: Vec<UserStub>) {
        if self.users.add_all(stubs).await {
            debug!("user buffer full, flushing");
            let _ = self.users.flush().await;
        }
    }

    pub async fn add_posts(&self, rows: Vec<PostRow>) {
        if self.posts.add_all(rows).await {
            debug!("post buffer full, flushing");
            let _ = self.posts.flush().await;
        }
    }

    /// Flush every table in FK-safe order: subreddits → users → posts.
    ///
    /// Per-table failures are logged and aggregated; one failing table
    /// does not abort the others. Concurrent callers return immediately.
    pub async fn flush_all(&self) {
        if self
            .flush_all_in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("flush_all already in progress, skipping");
            return;
        }

        let mut errors: Vec<(&'static str, SinkError)> = Vec::new();

        if let Err(e) = self.subreddits.flush().await {
            errors.push((self.subreddits.table(), e));
        }
        if let Err(e) = self.users.flush().await {
            errors.push((self.users.table(), e));
        }
        if let Err(e) = self.posts.flush().await {
            errors.push((self.posts.table(), e));
        }

        if errors.is_empty() {
            debug!("flush_all completed");
        } else {
            for (table, e) in &errors {
                error!(table, "flush failed: {}", e);
            }
            error!("flush_all completed with {} table errors", errors.len());
        }

        self.flush_all_in_progress.store(false, Ordering::SeqCst);
    }

    /// One retry pass over every table's failed records
    pub async fn retry_failed(&self) {
        self.subreddits.retry_failed().await;
        self.users.retry_failed().await;
        self.posts.retry_failed().await;
    }

    pub async fn pending(&self) -> usize {
        self.subreddits.buffered().await + self.users.buffered().await + self.posts.buffered().await
    }

    pub async fn stats(&self) -> WriterStats {
        WriterStats {
            subreddits: self.subreddits.stats().await,
            users: self.users.stats().await,
            posts: self.posts.stats().await,
        }
    }

    /// Background flush and retry loops; both exit on stop after a final
    /// drain.
    pub fn spawn_background(
        self: &Arc<Self>,
        stop: StopFlag,
        flush_interval: Duration,
    ) -> (JoinHandle<()>, JoinHandle<()>) {
        let writer = self.clone();
        let flush_stop = stop.clone();
        let flush_loop = tokio::spawn(async move {
            info!("writer flush loop started (interval: {:?})", flush_interval);
            loop {
                if flush_stop.sleep(flush_interval).await {
                    break;
                }
                writer.flush_all().await;
            }
            // Final drain so a stop never strands buffered rows
            writer.flush_all().await;
            info!("writer flush loop stopped");
        });

        let writer = self.clone();
        let retry_loop = tokio::spawn(async move {
            info!("writer retry loop started");
            loop {
                if stop.sleep(RETRY_CHECK_INTERVAL).await {
                    break;
                }
                writer.retry_failed().await;
            }
            info!("writer retry loop stopped");
        });

        (flush_loop, retry_loop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PostData, SubredditInfo, SubredditMetadata};
    use crate::store::tests::MemoryStore;

    fn subreddit_row(name: &str) -> SubredditRow {
        SubredditRow::build(
            name,
            &SubredditInfo::default(),
            &[],
            &[],
            &SubredditMetadata::default(),
            None,
            false,
        )
    }

    fn post_row(id: &str, subreddit: &str, author: &str) -> PostRow {
        PostRow::build(
            &PostData {
                id: Some(id.to_string()),
                author: Some(author.to_string()),
                ..Default::default()
            },
            subreddit,
            &SubredditMetadata::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn flush_all_writes_tables_in_fk_order() {
        let store = Arc::new(MemoryStore::default());
        let writer = RedditBatchWriter::new(store.clone(), 100, 3);

        // Enqueue out of order: posts first, then users, then subreddits
        writer.add_posts(vec![post_row("p1", "foo", "alice")]).await;
        writer.add_user_stubs(vec![UserStub::new("alice")]).await;
        writer.add_subreddit(subreddit_row("foo")).await;

        writer.flush_all().await;

        let order = store.write_order.lock().unwrap().clone();
        let first = |table: &str| order.iter().position(|t| *t == table).unwrap();
        assert!(first("reddit_subreddits") < first("reddit_posts"));
        assert!(first("reddit_users") < first("reddit_posts"));

        assert_eq!(store.posts.lock().unwrap().len(), 1);
        assert_eq!(writer.pending().await, 0);
    }

    #[tokio::test]
    async fn size_triggered_post_flush_keeps_fk_safety() {
        let store = Arc::new(MemoryStore::default());
        // batch_size 2: the second post triggers an immediate posts-only flush
        let writer = RedditBatchWriter::new(store.clone(), 2, 3);

        writer
            .add_posts(vec![
                post_row("p1", "unknownsub", "bob"),
                post_row("p2", "unknownsub", "bob"),
            ])
            .await;

        // The posts sink created the parent stubs before writing posts
        assert_eq!(store.posts.lock().unwrap().len(), 2);
        let stub = store.subreddit("unknownsub").unwrap();
        assert!(stub.last_scraped_at.is_none());
        assert!(store.users.lock().unwrap().contains("bob"));
    }

    #[tokio::test]
    async fn user_feed_stub_review_applied_by_posts_sink() {
        let store = Arc::new(MemoryStore::default());
        let writer = RedditBatchWriter::new(store.clone(), 1, 3);

        writer.add_posts(vec![post_row("p1", "u_alice", "alice")]).await;

        let stub = store.subreddit("u_alice").unwrap();
        assert_eq!(stub.review.as_deref(), Some("User Feed"));
    }

    #[tokio::test]
    async fn failed_posts_fall_back_to_row_writes() {
        let store = Arc::new(MemoryStore::default());
        store
            .fail_post_batches
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let writer = RedditBatchWriter::new(store.clone(), 100, 3);

        writer
            .add_posts(vec![post_row("p1", "foo", "alice"), post_row("p2", "foo", "alice")])
            .await;
        writer.flush_all().await;

        // Batch write rejected, per-row fallback succeeded
        assert_eq!(store.posts.lock().unwrap().len(), 2);
        let stats = writer.stats().await;
        assert_eq!(stats.posts.successful_writes, 2);
    }

    #[tokio::test]
    async fn stats_track_per_table_writes() {
        let store = Arc::new(MemoryStore::default());
        let writer = RedditBatchWriter::new(store.clone(), 100, 3);

        writer.add_subreddit(subreddit_row("a")).await;
        writer.add_subreddit(subreddit_row("b")).await;
        writer.add_user_stubs(vec![UserStub::new("alice")]).await;
        writer.flush_all().await;

        let stats = writer.stats().await;
        assert_eq!(stats.subreddits.total_records, 2);
        assert_eq!(stats.subreddits.successful_writes, 2);
        assert_eq!(stats.users.successful_writes, 1);
        assert_eq!(stats.posts.total_records, 0);
    }
}
