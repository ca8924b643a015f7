//! Crawler module for fetching and processing result pages
//!
//! This module contains the core crawling logic, including:
//! - HTTP fetching with transient/permanent failure classification
//! - A reusable retry primitive with capped exponential backoff
//! - Result page parsing and listing extraction
//! - Randomized pauses between pages
//! - The resumable crawl engine

mod delay;
mod engine;
mod extractor;
mod fetcher;
mod parser;
mod retry;

pub use delay::PageDelay;
pub use engine::{classify_fetch_error, CrawlEngine, RunOutcome, RunSummary};
pub use extractor::{present, ArgenpropExtractor, ListingExtractor, RawListing, MISSING_VALUE};
pub use fetcher::{build_http_client, classify_status, HttpPageFetcher, PageFetcher};
pub use parser::{parse_page, resolve_link, ParsedPage, SiteLayout};
pub use retry::{retry_with_backoff, ErrorClass, RetryError, RetryPolicy};

use crate::archive::FsArchiver;
use crate::checkpoint::CheckpointStore;
use crate::config::{Config, QueryEntry};
use crate::storage::{open_storage, NewQuery, QueryRecord, Storage};
use crate::{PropscanError, Result};
use std::path::Path;

/// Per-run knobs that come from the command line rather than the config file
#[derive(Debug, Clone, Default)]
pub struct CrawlOptions {
    /// Query to crawl; defaults to the first configured one
    pub query: Option<String>,

    /// Overrides `[crawler] max-pages`
    pub max_pages: Option<u32>,

    /// Discard any checkpoint before starting
    pub fresh: bool,
}

/// Returns the stored query for a configured entry, registering it on first use
///
/// An existing query keeps its stored URL and metadata; use
/// [`sync_queries`] to push config changes to stored queries.
pub fn ensure_query<S: Storage>(
    storage: &mut S,
    entry: &QueryEntry,
    config: &Config,
) -> Result<QueryRecord> {
    if let Some(existing) = storage.get_query_by_name(&entry.name)? {
        tracing::info!(
            "Found existing query '{}' with ID {} (query_number: {:?})",
            existing.name,
            existing.id,
            existing.query_number
        );
        return Ok(existing);
    }

    let id = storage.add_query(&NewQuery {
        name: entry.name.clone(),
        url: entry.source_url(&config.site),
        neighborhoods: Some(entry.neighborhoods.clone()),
        bedrooms: Some(entry.bedrooms.clone()),
        query_number: entry.query_number,
        map_name: entry.map_name.clone(),
    })?;
    Ok(storage.get_query(id)?)
}

/// Copies `query-number` and `map-name` from the config onto stored queries
///
/// # Returns
///
/// The number of stored queries that changed
pub fn sync_queries<S: Storage>(storage: &mut S, config: &Config) -> Result<usize> {
    let mut changed = 0;

    for entry in &config.queries {
        let Some(stored) = storage.get_query_by_name(&entry.name)? else {
            tracing::warn!("Query '{}' not found in database", entry.name);
            continue;
        };

        if stored.query_number == entry.query_number && stored.map_name == entry.map_name {
            tracing::info!("Query '{}' already up to date", entry.name);
            continue;
        }

        tracing::info!(
            "Updating query '{}' (ID: {}): query_number {:?} -> {:?}, map_name {:?} -> {:?}",
            entry.name,
            stored.id,
            stored.query_number,
            entry.query_number,
            stored.map_name,
            entry.map_name
        );
        storage.update_query_metadata(stored.id, entry.query_number, entry.map_name.as_deref())?;
        changed += 1;
    }

    Ok(changed)
}

/// Builds an engine wired to HTTP, the site extractor, and the filesystem archiver
pub fn build_engine<S: Storage>(
    config: &Config,
    storage: S,
    max_pages: Option<u32>,
) -> Result<CrawlEngine<S>> {
    let layout = SiteLayout::from_config(&config.site)?;
    let fetcher = HttpPageFetcher::new(&config.fetcher)?;
    let extractor = ArgenpropExtractor::new(layout.base_url.clone())?;
    let archiver = FsArchiver::new(&config.storage.archive_dir, fetcher.client().clone());

    Ok(CrawlEngine::new(
        storage,
        Box::new(fetcher),
        Box::new(extractor),
        layout,
        CheckpointStore::new(&config.storage.checkpoint_path),
    )
    .with_archiver(Box::new(archiver))
    .with_retry_policy(RetryPolicy::from_config(&config.crawler))
    .with_page_delay(PageDelay::from_config(&config.crawler))
    .with_fetch_timeout(config.crawler.fetch_timeout())
    .with_max_pages(max_pages.or(config.crawler.max_pages))
    .with_website(config.site.name.clone()))
}

/// Runs a complete crawl for one configured query
///
/// This is the main entry point for starting a crawl. It will:
/// 1. Open the store
/// 2. Resolve or register the query
/// 3. Discard the checkpoint if a fresh start was requested
/// 4. Crawl until pagination ends, the page limit is hit, or a page fails
pub async fn crawl(config: &Config, options: &CrawlOptions) -> Result<RunSummary> {
    let entry = config
        .select_query(options.query.as_deref())
        .ok_or_else(|| PropscanError::UnknownQuery(options.query.clone().unwrap_or_default()))?;
    tracing::info!("Using query: {}", entry.name);

    let mut storage =
        open_storage(Path::new(&config.storage.database_path))?.with_exchange_rates(config.pricing);
    let query = ensure_query(&mut storage, entry, config)?;

    if options.fresh {
        tracing::info!("Fresh start requested; discarding checkpoint");
        CheckpointStore::new(&config.storage.checkpoint_path).clear()?;
    }

    let mut engine = build_engine(config, storage, options.max_pages)?;
    engine.run(&query).await
}
