use async_trait::async_trait;
use sqlx::PgPool;

use crate::entry::LogEntry;

#[derive(Debug, thiserror::Error)]
#[error("log sink error: {0}")]
pub struct SinkError(pub String);

/// Destination for persisted log rows.
///
/// The production sink writes to `system_logs`; tests swap in an in-memory
/// implementation.
#[async_trait]
pub trait LogSink: Send + Sync + 'static {
    async fn insert_batch(&self, entries: &[LogEntry]) -> Result<(), SinkError>;

    async fn insert_one(&self, entry: &LogEntry) -> Result<(), SinkError> {
        self.insert_batch(std::slice::from_ref(entry)).await
    }
}

/// Sink that discards every entry; stdout mirroring still happens.
///
/// Used when a service runs without a database-backed log table (and by
/// tests that only care about engine behavior).
pub struct NullSink;

#[async_trait]
impl LogSink for NullSink {
    async fn insert_batch(&self, _entries: &[LogEntry]) -> Result<(), SinkError> {
        Ok(())
    }
}

/// `system_logs` sink backed by the shared Postgres pool
pub struct PgLogSink {
    pool: PgPool,
}

impl PgLogSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LogSink for PgLogSink {
    async fn insert_batch(&self, entries: &[LogEntry]) -> Result<(), SinkError> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut builder = sqlx::QueryBuilder::new(
            "INSERT INTO system_logs \
             (timestamp, source, script_name, level, message, context, user_id, duration_ms, items_processed) ",
        );
        builder.push_values(entries, |mut b, entry| {
            b.push_bind(entry.timestamp)
                .push_bind(&entry.source)
                .push_bind(&entry.script_name)
                .push_bind(entry.level.as_str())
                .push_bind(&entry.message)
                .push_bind(&entry.context)
                .push_bind(&entry.user_id)
                .push_bind(entry.duration_ms)
                .push_bind(entry.items_processed);
        });

        builder
            .build()
            .execute(&self.pool)
            .await
            .map_err(|e| SinkError(e.to_string()))?;
        Ok(())
    }
}
