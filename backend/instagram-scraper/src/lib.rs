/// Instagram Harvester
///
/// Database-controlled Instagram crawler. One cycle walks every approved
/// creator: profile snapshot with follower-growth tracking, paginated
/// reels and posts, analytics computation, and media-CDN-aware upserts
/// into the shared Postgres store.
///
/// # Modules
///
/// - `api`: the Instagram proxy HTTP API (profile/reels/posts, RPS gate)
/// - `models`: wire payloads and store row types
/// - `store`: persistence layer over Postgres
/// - `services`: the creator engine, analytics computer, link classifier
/// - `error`: error types
/// - `config`: environment-driven configuration
pub mod api;
pub mod config;
pub mod error;
pub mod models;
pub mod services;
pub mod store;

pub use config::InstagramConfig;
pub use error::IgScraperError;
