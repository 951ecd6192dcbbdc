use async_trait::async_trait;
use sqlx::PgPool;

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("control store error: {0}")]
    Store(String),
}

impl From<sqlx::Error> for ControlError {
    fn from(e: sqlx::Error) -> Self {
        ControlError::Store(e.to_string())
    }
}

/// Access to the `system_control` row and the watchdog's view of
/// `system_logs`.
#[async_trait]
pub trait ControlStore: Send + Sync + 'static {
    /// The `enabled` flag for a script; a missing row reads as disabled.
    async fn is_enabled(&self, script_name: &str) -> Result<bool, ControlError>;

    async fn mark_started(&self, script_name: &str, pid: i32) -> Result<(), ControlError>;

    async fn update_heartbeat(
        &self,
        script_name: &str,
        pid: i32,
        status: &str,
    ) -> Result<(), ControlError>;

    async fn mark_error(&self, script_name: &str, error: &str) -> Result<(), ControlError>;

    async fn mark_stopped(&self, script_name: &str) -> Result<(), ControlError>;

    /// Optional `cycle_cooldown_seconds` override from the row's config map
    async fn cycle_cooldown_secs(&self, script_name: &str) -> Result<Option<u64>, ControlError>;

    /// Age in seconds of the freshest `system_logs` row for a source;
    /// None when the source has never logged.
    async fn seconds_since_last_log(&self, source: &str) -> Result<Option<i64>, ControlError>;
}

/// `system_control` access backed by the shared Postgres pool
pub struct PgControlStore {
    pool: PgPool,
}

impl PgControlStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ControlStore for PgControlStore {
    async fn is_enabled(&self, script_name: &str) -> Result<bool, ControlError> {
        let enabled: Option<bool> =
            sqlx::query_scalar("SELECT enabled FROM system_control WHERE script_name = $1")
                .bind(script_name)
                .fetch_optional(&self.pool)
                .await?;
        Ok(enabled.unwrap_or(false))
    }

    async fn mark_started(&self, script_name: &str, pid: i32) -> Result<(), ControlError> {
        sqlx::query(
            "UPDATE system_control \
             SET status = 'running', pid = $2, started_at = NOW(), last_error = NULL \
             WHERE script_name = $1",
        )
        .bind(script_name)
        .bind(pid)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_heartbeat(
        &self,
        script_name: &str,
        pid: i32,
        status: &str,
    ) -> Result<(), ControlError> {
        sqlx::query(
            "UPDATE system_control \
             SET last_heartbeat = NOW(), pid = $2, status = $3 \
             WHERE script_name = $1",
        )
        .bind(script_name)
        .bind(pid)
        .bind(status)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_error(&self, script_name: &str, error: &str) -> Result<(), ControlError> {
        sqlx::query(
            "UPDATE system_control \
             SET status = 'error', last_error = LEFT($2, 500), stopped_at = NOW() \
             WHERE script_name = $1",
        )
        .bind(script_name)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_stopped(&self, script_name: &str) -> Result<(), ControlError> {
        sqlx::query(
            "UPDATE system_control \
             SET status = 'stopped', pid = NULL, stopped_at = NOW() \
             WHERE script_name = $1",
        )
        .bind(script_name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn cycle_cooldown_secs(&self, script_name: &str) -> Result<Option<u64>, ControlError> {
        let config: Option<serde_json::Value> =
            sqlx::query_scalar("SELECT config FROM system_control WHERE script_name = $1")
                .bind(script_name)
                .fetch_optional(&self.pool)
                .await?
                .flatten();

        Ok(config
            .as_ref()
            .and_then(|c| c.get("cycle_cooldown_seconds"))
            .and_then(|v| v.as_u64()))
    }

    async fn seconds_since_last_log(&self, source: &str) -> Result<Option<i64>, ControlError> {
        let age: Option<i64> = sqlx::query_scalar(
            "SELECT EXTRACT(EPOCH FROM (NOW() - MAX(timestamp)))::BIGINT \
             FROM system_logs WHERE source = $1",
        )
        .bind(source)
        .fetch_one(&self.pool)
        .await?;
        Ok(age)
    }
}
