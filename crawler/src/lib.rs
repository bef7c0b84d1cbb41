pub mod charset;
pub mod config;
pub mod crawler;
pub mod db;
pub mod error;
pub mod extractor;
pub mod fetcher;
pub mod frontier;
pub mod local_path;
pub mod models;
pub mod scope;

// Re-export important types
pub use config::Config;
pub use crawler::{CrawlHandle, Crawler, Outcome};
pub use db::{Database, RecordStore};
pub use error::CrawlError;
pub use fetcher::{FetchResponse, Fetcher, HttpFetcher};
pub use frontier::{shared_store, Frontier, SharedStore};
pub use models::{StatusCounts, TaskStatus, UrlTask, UrlType};
