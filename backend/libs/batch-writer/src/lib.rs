//! Buffered batch writing with per-row fallback and delayed retry
//!
//! Each table gets a [`TableBuffer`] over a [`RowSink`]. Producers enqueue
//! rows without blocking; when a buffer reaches `batch_size` the caller is
//! told to flush. A failed batch write is retried row by row; rows that
//! still fail land in a bounded failed-records queue that a periodic retry
//! pass drains with exponential backoff, dropping the queue after
//! `max_retry_attempts`.
//!
//! Flush ordering across tables (foreign-key safety) is the composing
//! service's responsibility; this crate only guarantees per-table behavior.

use std::collections::VecDeque;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Failed rows retained per table; oldest are evicted beyond this
pub const FAILED_RECORDS_CAP: usize = 500;

/// Base delay for the failed-records retry ladder (10s, 20s, 40s, ... capped)
const RETRY_BASE_SECS: u64 = 10;
const RETRY_MAX_SECS: u64 = 60;

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// The row already exists; treated as success by the buffer
    #[error("duplicate key")]
    DuplicateKey,
    #[error("{0}")]
    Other(String),
}

/// Destination for one table's rows
#[async_trait]
pub trait RowSink: Send + Sync + 'static {
    type Row: Clone + Send + Sync + 'static;

    fn table(&self) -> &'static str;

    /// Upsert a batch of rows in one store call
    async fn write_batch(&self, rows: &[Self::Row]) -> Result<(), SinkError>;

    /// Upsert a single row (fallback path)
    async fn write_row(&self, row: &Self::Row) -> Result<(), SinkError>;
}

/// Per-table write statistics
#[derive(Debug, Clone, Default)]
pub struct TableStats {
    pub total_records: u64,
    pub total_batches: u64,
    pub successful_writes: u64,
    pub failed_writes: u64,
    pub last_flush: Option<DateTime<Utc>>,
}

/// Outcome of one retry pass over a table's failed records
#[derive(Debug, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Nothing queued
    Idle,
    /// All queued rows recovered
    Recovered(usize),
    /// Some rows recovered, some still failing
    Partial { recovered: usize, failing: usize },
    /// Max attempts reached; the queue was dropped
    Dropped(usize),
}

struct Inner<R> {
    buffer: Vec<R>,
    failed: VecDeque<R>,
    retry_attempts: u32,
    stats: TableStats,
    flush_in_progress: bool,
}

/// One table's buffer, sink, failure queue, and statistics
pub struct TableBuffer<S: RowSink> {
    sink: S,
    batch_size: usize,
    max_retry_attempts: u32,
    inner: tokio::sync::Mutex<Inner<S::Row>>,
}

impl<S: RowSink> TableBuffer<S> {
    pub fn new(sink: S, batch_size: usize, max_retry_attempts: u32) -> Self {
        Self {
            sink,
            batch_size,
            max_retry_attempts,
            inner: tokio::sync::Mutex::new(Inner {
                buffer: Vec::new(),
                failed: VecDeque::new(),
                retry_attempts: 0,
                stats: TableStats::default(),
                flush_in_progress: false,
            }),
        }
    }

    pub fn table(&self) -> &'static str {
        self.sink.table()
    }

    /// Enqueue one row. Returns true when the buffer reached `batch_size`
    /// and the caller should flush this table (outside any of its own
    /// locks).
    pub async fn add(&self, row: S::Row) -> bool {
        let mut inner = self.inner.lock().await;
        inner.buffer.push(row);
        inner.buffer.len() >= self.batch_size
    }

    /// Enqueue many rows at once. Returns true when a flush is due.
    pub async fn add_all(&self, rows: impl IntoIterator<Item = S::Row>) -> bool {
        let mut inner = self.inner.lock().await;
        inner.buffer.extend(rows);
        inner.buffer.len() >= self.batch_size
    }

    pub async fn buffered(&self) -> usize {
        self.inner.lock().await.buffer.len()
    }

    pub async fn failed(&self) -> usize {
        self.inner.lock().await.failed.len()
    }

    pub async fn stats(&self) -> TableStats {
        self.inner.lock().await.stats.clone()
    }

    /// Drain the buffer and write it in chunks of `batch_size`.
    ///
    /// The store work happens outside the lock; concurrent flushes of the
    /// same table return immediately instead of double-writing.
    pub async fn flush(&self) -> Result<(), SinkError> {
        let records = {
            let mut inner = self.inner.lock().await;
            if inner.flush_in_progress {
                debug!(table = self.table(), "flush already in progress, skipping");
                return Ok(());
            }
            if inner.buffer.is_empty() {
                return Ok(());
            }
            inner.flush_in_progress = true;
            std::mem::take(&mut inner.buffer)
        };

        debug!(
            table = self.table(),
            records = records.len(),
            "flushing buffer"
        );

        let mut successful = 0u64;
        let mut newly_failed: Vec<S::Row> = Vec::new();
        let mut batches = 0u64;
        let mut first_error: Option<SinkError> = None;

        for chunk in records.chunks(self.batch_size) {
            batches += 1;
            let WriteResult {
                succeeded,
                failed,
                error,
            } = self.write_with_fallback(chunk).await;
            successful += succeeded as u64;
            newly_failed.extend(failed);
            if first_error.is_none() {
                first_error = error;
            }
        }

        let total = records.len();
        let failed_count = newly_failed.len();

        {
            let mut inner = self.inner.lock().await;
            inner.stats.total_records += total as u64;
            inner.stats.total_batches += batches;
            inner.stats.successful_writes += successful;
            inner.stats.last_flush = Some(Utc::now());
            self.enqueue_failed(&mut inner, newly_failed);
            inner.flush_in_progress = false;
        }

        if failed_count > 0 {
            error!(
                table = self.table(),
                failed = failed_count,
                "flush left records in the retry queue"
            );
        } else {
            info!(
                table = self.table(),
                records = total,
                batches,
                "flushed buffer"
            );
        }

        match first_error {
            Some(e) if failed_count > 0 => Err(e),
            _ => Ok(()),
        }
    }

    /// One pass over the failed-records queue with exponential backoff.
    pub async fn retry_failed(&self) -> RetryOutcome {
        let (records, attempt) = {
            let mut inner = self.inner.lock().await;
            if inner.failed.is_empty() {
                return RetryOutcome::Idle;
            }
            let attempt = inner.retry_attempts;
            if attempt >= self.max_retry_attempts {
                let dropped = inner.failed.len();
                warn!(
                    table = self.table(),
                    dropped,
                    "max retry attempts ({}) reached, dropping failed records",
                    self.max_retry_attempts
                );
                inner.stats.failed_writes += dropped as u64;
                inner.failed.clear();
                inner.retry_attempts = 0;
                return RetryOutcome::Dropped(dropped);
            }
            (inner.failed.drain(..).collect::<Vec<_>>(), attempt)
        };

        let backoff = Duration::from_secs((RETRY_BASE_SECS * 2u64.pow(attempt)).min(RETRY_MAX_SECS));
        info!(
            table = self.table(),
            records = records.len(),
            attempt = attempt + 1,
            max = self.max_retry_attempts,
            "retrying failed records in {:?}",
            backoff
        );
        tokio::time::sleep(backoff).await;

        let WriteResult {
            succeeded,
            failed,
            error: _,
        } = self.write_with_fallback(&records).await;

        let mut inner = self.inner.lock().await;
        inner.stats.successful_writes += succeeded as u64;

        if failed.is_empty() {
            inner.retry_attempts = 0;
            info!(
                table = self.table(),
                recovered = succeeded,
                "all failed records recovered"
            );
            RetryOutcome::Recovered(succeeded)
        } else {
            inner.retry_attempts = attempt + 1;
            let failing = failed.len();
            self.enqueue_failed(&mut inner, failed);
            warn!(
                table = self.table(),
                recovered = succeeded,
                failing,
                "records still failing after retry"
            );
            RetryOutcome::Partial {
                recovered: succeeded,
                failing,
            }
        }
    }

    /// Batch write; on failure fall back to individual rows. Duplicate-key
    /// results count as success (the row exists).
    async fn write_with_fallback(&self, rows: &[S::Row]) -> WriteResult<S::Row> {
        match self.sink.write_batch(rows).await {
            Ok(()) | Err(SinkError::DuplicateKey) => WriteResult {
                succeeded: rows.len(),
                failed: Vec::new(),
                error: None,
            },
            Err(batch_error) => {
                warn!(
                    table = self.table(),
                    rows = rows.len(),
                    "batch write failed ({}), retrying rows individually",
                    batch_error
                );

                let mut succeeded = 0;
                let mut failed = Vec::new();
                for row in rows {
                    match self.sink.write_row(row).await {
                        Ok(()) | Err(SinkError::DuplicateKey) => succeeded += 1,
                        Err(e) => {
                            debug!(table = self.table(), "row write failed: {}", e);
                            failed.push(row.clone());
                        }
                    }
                }
                WriteResult {
                    succeeded,
                    failed,
                    error: Some(batch_error),
                }
            }
        }
    }

    fn enqueue_failed(&self, inner: &mut Inner<S::Row>, rows: Vec<S::Row>) {
        inner.failed.extend(rows);
        while inner.failed.len() > FAILED_RECORDS_CAP {
            inner.failed.pop_front();
            // Evicted rows are terminally lost
            inner.stats.failed_writes += 1;
        }
    }
}

struct WriteResult<R> {
    succeeded: usize,
    failed: Vec<R>,
    error: Option<SinkError>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Sink that can be told to reject batches and/or specific rows
    #[derive(Default)]
    struct TestSink {
        written: Mutex<Vec<i64>>,
        fail_batches: AtomicBool,
        fail_rows_over: AtomicUsize,
        batch_calls: AtomicUsize,
    }

    impl TestSink {
        fn rejecting_batches() -> Self {
            let sink = Self {
                fail_rows_over: AtomicUsize::new(usize::MAX),
                ..Default::default()
            };
            sink.fail_batches.store(true, Ordering::SeqCst);
            sink
        }

        fn accepting() -> Self {
            Self {
                fail_rows_over: AtomicUsize::new(usize::MAX),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl RowSink for &'static TestSink {
        type Row = i64;

        fn table(&self) -> &'static str {
            "test_rows"
        }

        async fn write_batch(&self, rows: &[i64]) -> Result<(), SinkError> {
            self.batch_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_batches.load(Ordering::SeqCst) {
                return Err(SinkError::Other("batch rejected".into()));
            }
            self.written.lock().unwrap().extend_from_slice(rows);
            Ok(())
        }

        async fn write_row(&self, row: &i64) -> Result<(), SinkError> {
            if *row as usize > self.fail_rows_over.load(Ordering::SeqCst) {
                return Err(SinkError::Other(format!("row {} rejected", row)));
            }
            self.written.lock().unwrap().push(*row);
            Ok(())
        }
    }

    fn leak(sink: TestSink) -> &'static TestSink {
        Box::leak(Box::new(sink))
    }

    #[tokio::test]
    async fn add_signals_flush_at_batch_size() {
        let sink = leak(TestSink::accepting());
        let buffer = TableBuffer::new(sink, 3, 3);

        assert!(!buffer.add(1).await);
        assert!(!buffer.add(2).await);
        assert!(buffer.add(3).await);
    }

    #[tokio::test]
    async fn flush_writes_all_buffered_rows() {
        let sink = leak(TestSink::accepting());
        let buffer = TableBuffer::new(sink, 2, 3);

        buffer.add_all(vec![1, 2, 3, 4, 5]).await;
        buffer.flush().await.unwrap();

        assert_eq!(sink.written.lock().unwrap().len(), 5);
        // 5 rows at batch_size 2 → 3 chunks
        assert_eq!(sink.batch_calls.load(Ordering::SeqCst), 3);
        assert_eq!(buffer.buffered().await, 0);

        let stats = buffer.stats().await;
        assert_eq!(stats.total_records, 5);
        assert_eq!(stats.successful_writes, 5);
        assert!(stats.last_flush.is_some());
    }

    #[tokio::test]
    async fn batch_failure_falls_back_to_rows() {
        let sink = leak(TestSink::rejecting_batches());
        let buffer = TableBuffer::new(sink, 10, 3);

        buffer.add_all(vec![1, 2, 3]).await;
        let result = buffer.flush().await;

        // Rows were recovered individually, so the flush succeeds overall
        assert!(result.is_ok());
        assert_eq!(sink.written.lock().unwrap().len(), 3);
        assert_eq!(buffer.failed().await, 0);
    }

    #[tokio::test]
    async fn failing_rows_land_in_the_retry_queue() {
        let sink = leak(TestSink::rejecting_batches());
        sink.fail_rows_over.store(2, Ordering::SeqCst);
        let buffer = TableBuffer::new(sink, 10, 3);

        buffer.add_all(vec![1, 2, 3, 4]).await;
        let result = buffer.flush().await;

        assert!(result.is_err());
        assert_eq!(buffer.failed().await, 2); // rows 3 and 4

        // Row conservation: enqueued = written + failed + buffered
        let written = sink.written.lock().unwrap().len();
        assert_eq!(written + buffer.failed().await + buffer.buffered().await, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_recovers_failed_records() {
        let sink = leak(TestSink::rejecting_batches());
        sink.fail_rows_over.store(0, Ordering::SeqCst);
        let buffer = TableBuffer::new(sink, 10, 3);

        buffer.add_all(vec![5, 6]).await;
        let _ = buffer.flush().await;
        assert_eq!(buffer.failed().await, 2);

        // Let both paths succeed and retry
        sink.fail_batches.store(false, Ordering::SeqCst);
        sink.fail_rows_over.store(usize::MAX, Ordering::SeqCst);

        let outcome = buffer.retry_failed().await;
        assert_eq!(outcome, RetryOutcome::Recovered(2));
        assert_eq!(buffer.failed().await, 0);
        assert_eq!(sink.written.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_drops_queue_after_max_attempts() {
        let sink = leak(TestSink::rejecting_batches());
        sink.fail_rows_over.store(0, Ordering::SeqCst);
        let buffer = TableBuffer::new(sink, 10, 2);

        buffer.add_all(vec![7]).await;
        let _ = buffer.flush().await;

        assert!(matches!(
            buffer.retry_failed().await,
            RetryOutcome::Partial { failing: 1, .. }
        ));
        assert!(matches!(
            buffer.retry_failed().await,
            RetryOutcome::Partial { failing: 1, .. }
        ));
        // Third pass hits max_retry_attempts and drops the queue
        assert_eq!(buffer.retry_failed().await, RetryOutcome::Dropped(1));
        assert_eq!(buffer.failed().await, 0);
        assert_eq!(buffer.stats().await.failed_writes, 1);
    }

    #[tokio::test]
    async fn failed_queue_is_bounded() {
        let sink = leak(TestSink::rejecting_batches());
        sink.fail_rows_over.store(0, Ordering::SeqCst);
        let buffer = TableBuffer::new(sink, 1000, 3);

        let rows: Vec<i64> = (1..=(FAILED_RECORDS_CAP as i64 + 50)).collect();
        buffer.add_all(rows).await;
        let _ = buffer.flush().await;

        assert_eq!(buffer.failed().await, FAILED_RECORDS_CAP);
        // The 50 evicted rows are terminal failures
        assert_eq!(buffer.stats().await.failed_writes, 50);
    }

    #[tokio::test]
    async fn duplicate_key_counts_as_success() {
        struct DupSink;

        #[async_trait]
        impl RowSink for DupSink {
            type Row = i64;
            fn table(&self) -> &'static str {
                "dup_rows"
            }
            async fn write_batch(&self, _rows: &[i64]) -> Result<(), SinkError> {
                Err(SinkError::DuplicateKey)
            }
            async fn write_row(&self, _row: &i64) -> Result<(), SinkError> {
                Err(SinkError::DuplicateKey)
            }
        }

        let buffer = TableBuffer::new(DupSink, 10, 3);
        buffer.add_all(vec![1, 2]).await;
        buffer.flush().await.unwrap();

        assert_eq!(buffer.failed().await, 0);
        assert_eq!(buffer.stats().await.successful_writes, 2);
    }
}
