use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Standard log levels for `system_logs` rows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

/// One `system_logs` row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub script_name: String,
    pub level: LogLevel,
    pub message: String,
    pub context: serde_json::Value,
    pub user_id: Option<String>,
    pub duration_ms: Option<i64>,
    pub items_processed: Option<i64>,
}

impl LogEntry {
    pub fn new(source: &str, script_name: &str, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            source: source.to_string(),
            script_name: script_name.to_string(),
            level,
            message: message.into(),
            context: serde_json::Value::Object(Default::default()),
            user_id: None,
            duration_ms: None,
            items_processed: None,
        }
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: i64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_items_processed(mut self, items: i64) -> Self {
        self.items_processed = Some(items);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_round_trip() {
        assert_eq!(LogLevel::Warning.as_str(), "warning");
        let parsed: LogLevel = serde_json::from_str("\"critical\"").unwrap();
        assert_eq!(parsed, LogLevel::Critical);
    }

    #[test]
    fn builder_sets_optional_fields() {
        let entry = LogEntry::new("reddit_scraper", "reddit_scraper", LogLevel::Info, "cycle done")
            .with_duration_ms(1200)
            .with_items_processed(42);
        assert_eq!(entry.duration_ms, Some(1200));
        assert_eq!(entry.items_processed, Some(42));
        assert!(entry.context.is_object());
    }
}
