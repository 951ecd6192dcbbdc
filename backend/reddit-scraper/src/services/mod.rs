pub mod scraper;
pub mod writer;

pub use scraper::RedditScraper;
pub use writer::RedditBatchWriter;
