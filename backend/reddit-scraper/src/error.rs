/// Error types for the Reddit harvester

use crate::store::StoreError;

pub type Result<T> = std::result::Result<T, ScraperError>;

#[derive(Debug, thiserror::Error)]
pub enum ScraperError {
    /// No active proxies configured in the store
    #[error("cannot start scraper: no active proxies configured")]
    NoProxies,

    /// Every configured proxy failed the connectivity test
    #[error("cannot start scraper: all proxies failed connectivity test")]
    AllProxiesFailed,

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("configuration error: {0}")]
    Config(String),
}
