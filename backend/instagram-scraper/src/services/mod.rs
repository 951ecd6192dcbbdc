pub mod analytics;
pub mod links;
pub mod scraper;

pub use scraper::InstagramScraper;
