/// Reddit Harvester
///
/// Database-controlled Reddit crawler. One cycle walks every "Ok"
/// subreddit (full pass with author expansion and discovery) and every
/// "No Seller" subreddit (metadata refresh only), routing rows through
/// the batched writer into the shared Postgres store.
///
/// # Modules
///
/// - `api`: public Reddit JSON endpoints (client, facade, user agents)
/// - `proxy`: proxy pool loading, testing, and rotation
/// - `cache`: session and cross-cycle in-memory caches
/// - `classifier`: rule-based review auto-classification
/// - `models`: wire payloads and store row types
/// - `store`: persistence layer over Postgres
/// - `services`: the scraper engine and the batched writer composition
/// - `error`: error types
/// - `config`: environment-driven configuration
pub mod api;
pub mod cache;
pub mod classifier;
pub mod config;
pub mod error;
pub mod models;
pub mod proxy;
pub mod services;
pub mod store;

pub use config::RedditConfig;
pub use error::ScraperError;
