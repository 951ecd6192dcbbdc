use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::entry::{LogEntry, LogLevel};
use crate::sink::LogSink;

/// Buffering knobs for the table sink
#[derive(Debug, Clone)]
pub struct SystemLoggerConfig {
    /// Entries per batch insert
    pub batch_size: usize,
    /// Maximum time an entry waits in the buffer
    pub batch_interval: Duration,
    /// Bounded queue capacity; overflow falls back to synchronous inserts
    pub queue_capacity: usize,
}

impl Default for SystemLoggerConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            batch_interval: Duration::from_secs(5),
            queue_capacity: 1000,
        }
    }
}

struct Shared {
    source: String,
    script_name: String,
    sink: Arc<dyn LogSink>,
    // Dropped on shutdown to close the channel and let the worker drain
    tx: Mutex<Option<mpsc::Sender<LogEntry>>>,
    stopping: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Dual-sink logger: stdout via `tracing`, persistence via a buffered
/// background worker writing `system_logs` rows.
#[derive(Clone)]
pub struct SystemLogger {
    shared: Arc<Shared>,
}

impl SystemLogger {
    pub fn new(
        source: &str,
        script_name: &str,
        sink: Arc<dyn LogSink>,
        config: SystemLoggerConfig,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity);

        let shared = Arc::new(Shared {
            source: source.to_string(),
            script_name: script_name.to_string(),
            sink: sink.clone(),
            tx: Mutex::new(Some(tx)),
            stopping: AtomicBool::new(false),
            worker: Mutex::new(None),
        });

        let handle = tokio::spawn(worker_loop(
            rx,
            sink,
            config.batch_size,
            config.batch_interval,
        ));
        *shared.worker.lock().unwrap() = Some(handle);

        Self { shared }
    }

    pub fn source(&self) -> &str {
        &self.shared.source
    }

    /// Log one entry to both sinks.
    ///
    /// `sync` entries skip the buffer and insert immediately; so does any
    /// entry that finds the queue full.
    pub async fn log(
        &self,
        level: LogLevel,
        message: impl Into<String>,
        context: Option<serde_json::Value>,
        sync: bool,
    ) {
        let mut entry = LogEntry::new(&self.shared.source, &self.shared.script_name, level, message);
        if let Some(context) = context {
            entry = entry.with_context(context);
        }
        self.emit(entry, sync).await;
    }

    pub async fn emit(&self, entry: LogEntry, sync: bool) {
        mirror_to_tracing(&entry);

        if sync || self.shared.stopping.load(Ordering::SeqCst) {
            if let Err(e) = self.shared.sink.insert_one(&entry).await {
                error!("failed to insert sync log: {}", e);
            }
            return;
        }

        let tx = self.shared.tx.lock().unwrap().clone();
        let pending = match tx {
            Some(tx) => match tx.try_send(entry) {
                Ok(()) => None,
                // Never drop an entry: a full queue degrades to a direct insert.
                Err(mpsc::error::TrySendError::Full(entry))
                | Err(mpsc::error::TrySendError::Closed(entry)) => Some(entry),
            },
            None => Some(entry),
        };

        if let Some(entry) = pending {
            if let Err(e) = self.shared.sink.insert_one(&entry).await {
                error!("failed to insert overflow log: {}", e);
            }
        }
    }

    pub async fn debug(&self, message: impl Into<String>, context: Option<serde_json::Value>) {
        self.log(LogLevel::Debug, message, context, false).await;
    }

    pub async fn info(&self, message: impl Into<String>, context: Option<serde_json::Value>) {
        self.log(LogLevel::Info, message, context, false).await;
    }

    pub async fn warning(&self, message: impl Into<String>, context: Option<serde_json::Value>) {
        self.log(LogLevel::Warning, message, context, false).await;
    }

    pub async fn error(&self, message: impl Into<String>, context: Option<serde_json::Value>) {
        self.log(LogLevel::Error, message, context, true).await;
    }

    pub async fn critical(&self, message: impl Into<String>, context: Option<serde_json::Value>) {
        self.log(LogLevel::Critical, message, context, true).await;
    }

    /// Structured entry for one upstream API call
    pub async fn log_api_call(&self, endpoint: &str, status: u16, response_time_ms: i64) {
        let level = if status >= 400 {
            LogLevel::Error
        } else {
            LogLevel::Info
        };
        let entry = LogEntry::new(
            &self.shared.source,
            &self.shared.script_name,
            level,
            format!("API GET {} - {}", endpoint, status),
        )
        .with_context(serde_json::json!({
            "endpoint": endpoint,
            "status_code": status,
            "response_time_ms": response_time_ms,
        }))
        .with_duration_ms(response_time_ms);
        self.emit(entry, false).await;
    }

    /// Structured entry for one unit of scraper work
    pub async fn log_activity(
        &self,
        activity: &str,
        items_processed: i64,
        context: Option<serde_json::Value>,
    ) {
        let mut entry = LogEntry::new(
            &self.shared.source,
            &self.shared.script_name,
            LogLevel::Info,
            format!("{} - processed: {}", activity, items_processed),
        )
        .with_items_processed(items_processed);
        if let Some(context) = context {
            entry = entry.with_context(context);
        }
        self.emit(entry, false).await;
    }

    /// Drain the queue and stop the worker. Entries logged after shutdown
    /// fall through to synchronous inserts.
    pub async fn shutdown(&self) {
        self.shared.stopping.store(true, Ordering::SeqCst);

        // Dropping the sender closes the channel; the worker drains every
        // buffered entry before exiting.
        self.shared.tx.lock().unwrap().take();

        let handle = self.shared.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            if tokio::time::timeout(Duration::from_secs(5), handle).await.is_err() {
                warn!("log worker did not drain within 5s");
            }
        }
        debug!("system logger shut down");
    }
}

fn mirror_to_tracing(entry: &LogEntry) {
    let tag = format!("[{}:{}]", entry.source, entry.script_name);
    match entry.level {
        LogLevel::Debug => debug!("{} {}", tag, entry.message),
        LogLevel::Info => info!("{} {}", tag, entry.message),
        LogLevel::Warning => warn!("{} {}", tag, entry.message),
        LogLevel::Error | LogLevel::Critical => error!("{} {}", tag, entry.message),
    }
}

async fn worker_loop(
    mut rx: mpsc::Receiver<LogEntry>,
    sink: Arc<dyn LogSink>,
    batch_size: usize,
    batch_interval: Duration,
) {
    let mut batch: Vec<LogEntry> = Vec::with_capacity(batch_size);
    let mut last_insert = Instant::now();

    loop {
        let wait = batch_interval
            .checked_sub(last_insert.elapsed())
            .unwrap_or(Duration::from_millis(100))
            .max(Duration::from_millis(100));

        match tokio::time::timeout(wait, rx.recv()).await {
            Ok(Some(entry)) => batch.push(entry),
            Ok(None) => {
                // Channel closed: final drain
                flush_batch(&sink, &mut batch).await;
                break;
            }
            Err(_) => {}
        }

        let interval_elapsed = last_insert.elapsed() >= batch_interval;
        if batch.len() >= batch_size || (!batch.is_empty() && interval_elapsed) {
            flush_batch(&sink, &mut batch).await;
            last_insert = Instant::now();
        }
    }
}

async fn flush_batch(sink: &Arc<dyn LogSink>, batch: &mut Vec<LogEntry>) {
    if batch.is_empty() {
        return;
    }
    if let Err(e) = sink.insert_batch(batch).await {
        error!("failed to insert log batch: {}", e);
        // Fall back to individual inserts so one bad row cannot sink the batch
        for entry in batch.iter() {
            if let Err(e) = sink.insert_one(entry).await {
                error!("failed to insert individual log: {}", e);
            }
        }
    }
    batch.clear();
}
