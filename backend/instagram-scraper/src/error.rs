/// Error types for the Instagram harvester

use crate::store::StoreError;

pub type Result<T> = std::result::Result<T, IgScraperError>;

#[derive(Debug, thiserror::Error)]
pub enum IgScraperError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Upstream API failure classification
#[derive(Debug, Clone, thiserror::Error)]
pub enum IgApiError {
    #[error("rate limit exceeded")]
    RateLimited,
    #[error("request timed out")]
    Timeout,
    #[error("request failed: {0}")]
    Network(String),
    #[error("failed to parse response: {0}")]
    Decode(String),
}
