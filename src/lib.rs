//! garimpo - Scraping fabric for Brazilian B2B company profiling
//!
//! Given minimal company identifiers, garimpo locates the official
//! website, scrapes the landing page and a curated set of internal
//! subpages through a rotating proxy pool, and delivers per-page text
//! with a precise failure taxonomy to the downstream extraction
//! pipeline.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`config`] - Configuration bundle, loaded once and immutable
//! - [`scraper`] - The fabric: proxy pool, concurrency gate, rate
//!   limiter, circuit breaker, fetcher, prober, analyzer, orchestrator
//!   and batch processor
//! - [`parser`] - Bounded HTML text extraction and link selection
//! - [`metrics`] - Counters, latency reservoir and status snapshots
//! - [`models`] - Core data structures and enums
//! - [`error`] - Unified error type and the closed failure taxonomy
//!
//! # Example
//!
//! ```no_run
//! use garimpo::config::FabricConfig;
//! use garimpo::scraper::{orchestrator, ScrapeContext};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let ctx = ScrapeContext::new(FabricConfig::default());
//!     let result = orchestrator::scrape_company(&ctx, "https://example.com.br").await;
//!     println!("{} pages", result.pages.len());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod metrics;
pub mod models;
pub mod parser;
pub mod scraper;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::FabricConfig;
    pub use crate::error::{Error, FailReason, Result};
    pub use crate::models::{
        CompanyInput, FetchOutcome, Protection, ScrapeResult, ScrapedPage, SiteKind, SiteProfile,
        Strategy,
    };
    pub use crate::scraper::batch::{BatchProcessor, StatusSnapshot};
    pub use crate::scraper::ScrapeContext;
}

// Direct re-exports for convenience
pub use error::{Error, FailReason, Result};
pub use models::{CompanyInput, ScrapeResult, ScrapedPage};
