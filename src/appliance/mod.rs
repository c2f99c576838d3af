pub mod fetcher;
pub mod pages;
pub mod scraper;

pub use fetcher::{FetchError, HttpFetcher, PageFetcher};
pub use scraper::{ApplianceScraper, ScrapeError};
