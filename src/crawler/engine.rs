//! Crawl engine - page-by-page traversal of one query's results
//!
//! The engine walks the result pages of a query strictly in order:
//! - Resumes from a checkpoint written by the same query, if any
//! - Fetches each page through the retrying fetch primitive
//! - Extracts and upserts every listing, archiving first sightings
//! - Saves the next page as the checkpoint before moving on
//! - Clears the checkpoint once the site stops offering a next page

use crate::archive::{ArchiveRequest, Archiver};
use crate::checkpoint::CheckpointStore;
use crate::crawler::delay::PageDelay;
use crate::crawler::extractor::ListingExtractor;
use crate::crawler::fetcher::PageFetcher;
use crate::crawler::parser::{parse_page, SiteLayout};
use crate::crawler::retry::{retry_with_backoff, ErrorClass, RetryError, RetryPolicy};
use crate::state::CrawlPhase;
use crate::storage::{NewProperty, QueryRecord, Storage};
use crate::{FetchError, PropscanError, Result};
use chrono::Utc;
use std::time::Duration;

/// How a run that did not fail came to an end
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The last page had no next link; the checkpoint was cleared
    Completed,

    /// The page limit stopped the run; the checkpoint points at the next page
    MaxPagesReached,
}

/// Counters reported at the end of a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    /// Page number the run started from
    pub start_page: u32,

    /// Whether the start page came from a checkpoint
    pub resumed: bool,

    /// Pages processed in this run
    pub pages: u32,

    pub new: u64,
    pub updated: u64,

    /// Listings skipped because they could not be extracted or stored
    pub errors: u64,

    pub archived: u64,
    pub outcome: RunOutcome,
}

/// Per-page tallies folded into the run summary
#[derive(Debug, Default)]
struct PageTally {
    new: u64,
    updated: u64,
    errors: u64,
    archived: u64,
}

/// Fetch failures are retried only when transient
pub fn classify_fetch_error(error: &FetchError) -> ErrorClass {
    if error.is_transient() {
        ErrorClass::Transient
    } else {
        ErrorClass::Permanent
    }
}

fn advance(phase: &mut CrawlPhase, to: CrawlPhase) -> Result<()> {
    if !phase.can_transition_to(to) {
        return Err(PropscanError::InvalidTransition { from: *phase, to });
    }
    tracing::trace!("Crawl phase {} -> {}", phase, to);
    *phase = to;
    Ok(())
}

/// Drives a crawl for one query against a store
pub struct CrawlEngine<S: Storage> {
    storage: S,
    fetcher: Box<dyn PageFetcher>,
    extractor: Box<dyn ListingExtractor>,
    archiver: Option<Box<dyn Archiver>>,
    layout: SiteLayout,
    checkpoints: CheckpointStore,
    retry: RetryPolicy,
    delay: PageDelay,
    fetch_timeout: Duration,
    max_pages: Option<u32>,
    website: String,
    phase: CrawlPhase,
}

impl<S: Storage> CrawlEngine<S> {
    /// Creates an engine with default retry, delay and timeout settings
    ///
    /// # Arguments
    ///
    /// * `storage` - The property store
    /// * `fetcher` - Source of page documents
    /// * `extractor` - Maps listing fragments to attributes
    /// * `layout` - Selectors used to split pages
    /// * `checkpoints` - The resume slot
    pub fn new(
        storage: S,
        fetcher: Box<dyn PageFetcher>,
        extractor: Box<dyn ListingExtractor>,
        layout: SiteLayout,
        checkpoints: CheckpointStore,
    ) -> Self {
        let website = layout
            .base_url
            .host_str()
            .unwrap_or_default()
            .to_string();

        Self {
            storage,
            fetcher,
            extractor,
            archiver: None,
            layout,
            checkpoints,
            retry: RetryPolicy::new(3, Duration::from_secs(5), Duration::from_secs(60)),
            delay: PageDelay::new(Duration::from_secs(1), Duration::from_secs(3)),
            fetch_timeout: Duration::from_secs(30),
            max_pages: None,
            website,
            phase: CrawlPhase::Start,
        }
    }

    pub fn with_archiver(mut self, archiver: Box<dyn Archiver>) -> Self {
        self.archiver = Some(archiver);
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_page_delay(mut self, delay: PageDelay) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn with_max_pages(mut self, max_pages: Option<u32>) -> Self {
        self.max_pages = max_pages;
        self
    }

    /// Name recorded as each property's `website`
    pub fn with_website(mut self, website: impl Into<String>) -> Self {
        self.website = website.into();
        self
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }

    pub fn into_storage(self) -> S {
        self.storage
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    /// Phase the engine is in, or ended in
    pub fn phase(&self) -> CrawlPhase {
        self.phase
    }

    fn transition(&mut self, to: CrawlPhase) -> Result<()> {
        advance(&mut self.phase, to)
    }

    /// Crawls a query's result pages until pagination ends or the page limit is hit
    ///
    /// # Returns
    ///
    /// * `Ok(RunSummary)` - The run ended normally
    /// * `Err(PropscanError)` - A page failed; the checkpoint points at that page
    pub async fn run(&mut self, query: &QueryRecord) -> Result<RunSummary> {
        self.phase = CrawlPhase::Start;

        let (start_page, start_url, resumed) = match self.checkpoints.load(query.id)? {
            Some(checkpoint) => {
                tracing::info!(
                    "Resuming query '{}' from page {}: {}",
                    query.name,
                    checkpoint.last_page,
                    checkpoint.last_url
                );
                (checkpoint.last_page, checkpoint.last_url, true)
            }
            None => {
                tracing::info!("Starting fresh crawl of query '{}'", query.name);
                self.checkpoints.clear()?;
                (1, query.url.clone(), false)
            }
        };

        let mut summary = RunSummary {
            start_page,
            resumed,
            pages: 0,
            new: 0,
            updated: 0,
            errors: 0,
            archived: 0,
            outcome: RunOutcome::Completed,
        };
        let mut page = start_page;
        let mut url = start_url;

        loop {
            self.transition(CrawlPhase::Fetch)?;
            tracing::info!("Fetching page {}: {}", page, url);

            let document = match self.fetch_page(page, &url).await {
                Ok(document) => document,
                Err(err) => {
                    let attempts = err.attempts();
                    let source = err.into_source();
                    tracing::error!(
                        "Page {} failed after {} attempt(s): {}",
                        page,
                        attempts,
                        source
                    );
                    let error = PropscanError::PageFailed {
                        page,
                        url: url.clone(),
                        attempts,
                        source,
                    };
                    return Err(self.fail(query.id, page, &url, error));
                }
            };

            self.transition(CrawlPhase::Extract)?;
            let parsed = parse_page(&document, &self.layout);
            tracing::info!("Found {} listings on page {}", parsed.listings.len(), page);

            let properties = self.extract_listings(&parsed.listings, &url, &mut summary);

            self.transition(CrawlPhase::Persist)?;
            let tally = match self.persist(properties, query.id).await {
                Ok(tally) => tally,
                Err(error) => return Err(self.fail(query.id, page, &url, error)),
            };

            summary.pages += 1;
            summary.new += tally.new;
            summary.updated += tally.updated;
            summary.errors += tally.errors;
            summary.archived += tally.archived;
            tracing::info!(
                "Page {} complete. New: {}, Updated: {}, Errors: {}, Total new so far: {}",
                page,
                tally.new,
                tally.updated,
                tally.errors,
                summary.new
            );

            self.transition(CrawlPhase::Checkpoint)?;
            let Some(next_url) = parsed.next_page else {
                tracing::info!("No more pages found. Crawl of '{}' complete", query.name);
                if let Err(e) = self.checkpoints.clear() {
                    tracing::error!("Could not clear checkpoint: {}", e);
                    self.transition(CrawlPhase::Failed)?;
                    return Err(e.into());
                }
                self.transition(CrawlPhase::Done)?;
                summary.outcome = RunOutcome::Completed;
                break;
            };

            if let Err(e) = self.checkpoints.save(page + 1, &next_url, query.id) {
                return Err(self.fail(query.id, page, &url, e.into()));
            }

            if self.max_pages.is_some_and(|max| summary.pages >= max) {
                tracing::info!(
                    "Reached max pages limit ({}). Stopping; next run resumes at page {}",
                    summary.pages,
                    page + 1
                );
                self.transition(CrawlPhase::Done)?;
                summary.outcome = RunOutcome::MaxPagesReached;
                break;
            }

            let pause = self.delay.wait().await;
            tracing::debug!("Waited {:?} before next page", pause);

            page += 1;
            url = next_url;
        }

        tracing::info!(
            "Run finished ({:?}): {} pages, {} new, {} updated, {} errors, {} archived",
            summary.outcome,
            summary.pages,
            summary.new,
            summary.updated,
            summary.errors,
            summary.archived
        );
        Ok(summary)
    }

    async fn fetch_page(
        &mut self,
        page: u32,
        url: &str,
    ) -> std::result::Result<String, RetryError<FetchError>> {
        let fetcher = self.fetcher.as_ref();
        let timeout = self.fetch_timeout;
        let phase = &mut self.phase;

        retry_with_backoff(
            &self.retry,
            classify_fetch_error,
            |retry, delay, error| {
                tracing::warn!(
                    "Page {} attempt {} failed: {}. Retrying in {:?}",
                    page,
                    retry,
                    error,
                    delay
                );
                for next in [CrawlPhase::Retry, CrawlPhase::Fetch] {
                    if let Err(e) = advance(phase, next) {
                        tracing::error!("{}", e);
                    }
                }
            },
            |attempt| {
                tracing::debug!("GET {} (attempt {})", url, attempt);
                fetcher.fetch(url, timeout)
            },
        )
        .await
    }

    /// Extracts every fragment, skipping (and counting) the ones that fail
    fn extract_listings(
        &self,
        fragments: &[String],
        page_url: &str,
        summary: &mut RunSummary,
    ) -> Vec<NewProperty> {
        let scraped_at = Utc::now();
        let mut properties = Vec::with_capacity(fragments.len());

        for (index, fragment) in fragments.iter().enumerate() {
            let extracted = self
                .extractor
                .extract(fragment)
                .and_then(|raw| raw.into_property(&self.website, page_url, scraped_at));

            match extracted {
                Ok(property) => properties.push(property),
                Err(e) => {
                    tracing::warn!("Skipping listing {} on {}: {}", index + 1, page_url, e);
                    summary.errors += 1;
                }
            }
        }

        properties
    }

    /// Upserts a page's properties and archives first sightings
    ///
    /// Record-level store errors are counted and skipped; anything else aborts the page.
    async fn persist(&mut self, properties: Vec<NewProperty>, query_id: i64) -> Result<PageTally> {
        let mut tally = PageTally::default();

        for property in properties {
            let outcome = match self.storage.upsert_property(&property, query_id) {
                Ok(outcome) => outcome,
                Err(e) if e.is_record_error() => {
                    tracing::warn!("Skipping listing '{}': {}", property.address, e);
                    tally.errors += 1;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            if !outcome.is_new {
                tracing::debug!("Updated property {}: {}", outcome.id, property.address);
                tally.updated += 1;
                continue;
            }

            tracing::debug!("New property {}: {}", outcome.id, property.address);
            tally.new += 1;

            if self.archive(outcome.id, &property).await {
                tally.archived += 1;
            }
        }

        self.storage.touch_last_run(query_id)?;
        Ok(tally)
    }

    /// Archives a new property; failures are logged and never propagate
    async fn archive(&mut self, property_id: i64, property: &NewProperty) -> bool {
        let Some(archiver) = self.archiver.as_ref() else {
            return false;
        };

        let request = ArchiveRequest {
            property_id,
            address: &property.address,
            listing_url: property.listing_url.as_deref(),
            scraped_at: property.scraped_at.unwrap_or_else(Utc::now),
        };

        let path = match archiver.archive(&request).await {
            Ok(path) => path,
            Err(e) => {
                tracing::warn!("Failed to archive property {}: {}", property_id, e);
                return false;
            }
        };

        match self.storage.set_archived_path(property_id, &path) {
            Ok(()) => {
                tracing::info!("Archived property {} to {}", property_id, path);
                true
            }
            Err(e) => {
                tracing::warn!(
                    "Archived property {} but could not record the path: {}",
                    property_id,
                    e
                );
                false
            }
        }
    }

    /// Leaves a checkpoint at the failed page and marks the run failed
    fn fail(&mut self, query_id: i64, page: u32, url: &str, error: PropscanError) -> PropscanError {
        if let Err(e) = self.checkpoints.save(page, url, query_id) {
            tracing::error!("Could not save checkpoint for page {}: {}", page, e);
        } else {
            tracing::info!("Progress saved at page {} before exiting", page);
        }

        if let Err(e) = self.transition(CrawlPhase::Failed) {
            tracing::error!("{}", e);
        }
        error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::ArchiveError;
    use crate::config::SiteConfig;
    use crate::crawler::extractor::RawListing;
    use crate::storage::{NewQuery, SqliteStorage};
    use crate::ExtractionError;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    /// Serves fixed documents; unknown URLs fail permanently
    struct MapFetcher {
        pages: HashMap<String, String>,
        requests: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PageFetcher for MapFetcher {
        async fn fetch(
            &self,
            url: &str,
            _timeout: Duration,
        ) -> std::result::Result<String, FetchError> {
            self.requests.lock().unwrap().push(url.to_string());
            self.pages
                .get(url)
                .cloned()
                .ok_or_else(|| FetchError::permanent(url, "HTTP 404"))
        }
    }

    /// Treats each fragment's text as `address|bedrooms`
    struct PipeExtractor;

    impl ListingExtractor for PipeExtractor {
        fn extract(&self, fragment: &str) -> std::result::Result<RawListing, ExtractionError> {
            let text = scraper::Html::parse_fragment(fragment)
                .root_element()
                .text()
                .collect::<String>();
            let mut parts = text.split('|');
            Ok(RawListing {
                address: parts.next().map(str::to_string),
                bedrooms: parts.next().map(str::to_string),
                ..Default::default()
            })
        }
    }

    fn layout() -> SiteLayout {
        SiteLayout::from_config(&SiteConfig {
            name: "site".to_string(),
            base_url: "https://site.test".to_string(),
            listing_selector: "div.item".to_string(),
            next_page_selector: "a.next".to_string(),
        })
        .unwrap()
    }

    fn page(items: &[&str], next: Option<&str>) -> String {
        let mut html = String::from("<html><body>");
        for item in items {
            html.push_str(&format!("<div class=\"item\">{}</div>", item));
        }
        if let Some(next) = next {
            html.push_str(&format!("<a class=\"next\" href=\"{}\">next</a>", next));
        }
        html.push_str("</body></html>");
        html
    }

    fn engine(
        dir: &TempDir,
        pages: &[(&str, String)],
    ) -> (CrawlEngine<SqliteStorage>, QueryRecord) {
        let mut storage = SqliteStorage::new_in_memory().unwrap();
        let id = storage
            .add_query(&NewQuery {
                name: "q".to_string(),
                url: "https://site.test/list?pagina-1".to_string(),
                ..Default::default()
            })
            .unwrap();
        let query = storage.get_query(id).unwrap();

        let fetcher = MapFetcher {
            pages: pages
                .iter()
                .map(|(url, body)| (url.to_string(), body.clone()))
                .collect(),
            requests: Mutex::new(Vec::new()),
        };

        let engine = CrawlEngine::new(
            storage,
            Box::new(fetcher),
            Box::new(PipeExtractor),
            layout(),
            CheckpointStore::new(dir.path().join("checkpoint.json")),
        )
        .with_page_delay(PageDelay::none())
        .with_retry_policy(RetryPolicy::new(
            2,
            Duration::from_millis(1),
            Duration::from_millis(2),
        ));

        (engine, query)
    }

    #[tokio::test]
    async fn test_two_page_run_completes() {
        let dir = TempDir::new().unwrap();
        let (mut engine, query) = engine(
            &dir,
            &[
                (
                    "https://site.test/list?pagina-1",
                    page(&["Uno 1|2", "Dos 2|3"], Some("/list?pagina-2")),
                ),
                ("https://site.test/list?pagina-2", page(&["Tres 3|1"], None)),
            ],
        );

        let summary = engine.run(&query).await.unwrap();

        assert_eq!(summary.outcome, RunOutcome::Completed);
        assert_eq!(summary.pages, 2);
        assert_eq!(summary.new, 3);
        assert_eq!(summary.errors, 0);
        assert_eq!(engine.phase(), CrawlPhase::Done);
        assert!(!engine.checkpoints().exists());
        assert!(engine.storage().get_query(query.id).unwrap().last_run.is_some());

        let stored = engine.storage().get_by_address("Dos 2").unwrap().unwrap();
        assert_eq!(stored.bedrooms, Some(3));
        assert_eq!(stored.website.as_deref(), Some("site.test"));
        assert_eq!(
            stored.source_url.as_deref(),
            Some("https://site.test/list?pagina-1")
        );
    }

    #[tokio::test]
    async fn test_bad_listings_are_counted_not_fatal() {
        let dir = TempDir::new().unwrap();
        let (mut engine, query) = engine(
            &dir,
            &[(
                "https://site.test/list?pagina-1",
                page(&["Uno 1|dos", "|2", "Tres 3"], None),
            )],
        );

        let summary = engine.run(&query).await.unwrap();

        assert_eq!(summary.new, 1);
        assert_eq!(summary.errors, 2);
        assert_eq!(engine.storage().count_properties().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_permanent_failure_keeps_checkpoint_at_failed_page() {
        let dir = TempDir::new().unwrap();
        let (mut engine, query) = engine(
            &dir,
            &[(
                "https://site.test/list?pagina-1",
                page(&["Uno 1|2"], Some("/list?pagina-2")),
            )],
        );

        let err = engine.run(&query).await.unwrap_err();

        assert!(matches!(
            err,
            PropscanError::PageFailed {
                page: 2,
                attempts: 1,
                ..
            }
        ));
        assert_eq!(engine.phase(), CrawlPhase::Failed);
        let checkpoint = engine.checkpoints().load(query.id).unwrap().unwrap();
        assert_eq!(checkpoint.last_page, 2);
        assert_eq!(checkpoint.last_url, "https://site.test/list?pagina-2");
        assert_eq!(engine.storage().count_properties().unwrap(), 1);
    }

    /// Records every property it is asked for; fails when `fail` is set
    struct StubArchiver {
        calls: Arc<Mutex<Vec<i64>>>,
        fail: bool,
    }

    #[async_trait]
    impl Archiver for StubArchiver {
        async fn archive(
            &self,
            request: &ArchiveRequest<'_>,
        ) -> std::result::Result<String, ArchiveError> {
            self.calls.lock().unwrap().push(request.property_id);
            if self.fail {
                Err(ArchiveError::MissingUrl(request.property_id))
            } else {
                Ok(format!("archive/{}", request.property_id))
            }
        }
    }

    fn one_page(dir: &TempDir) -> (CrawlEngine<SqliteStorage>, QueryRecord) {
        engine(
            dir,
            &[(
                "https://site.test/list?pagina-1",
                page(&["Uno 1|2", "Dos 2|3"], None),
            )],
        )
    }

    #[tokio::test]
    async fn test_new_properties_are_archived_once() {
        let dir = TempDir::new().unwrap();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let (engine, query) = one_page(&dir);
        let mut engine = engine.with_archiver(Box::new(StubArchiver {
            calls: Arc::clone(&calls),
            fail: false,
        }));

        let first = engine.run(&query).await.unwrap();
        assert_eq!(first.new, 2);
        assert_eq!(first.archived, 2);

        let stored = engine.storage().get_by_address("Uno 1").unwrap().unwrap();
        assert_eq!(
            stored.archived_path,
            Some(format!("archive/{}", stored.id))
        );

        let second = engine.run(&query).await.unwrap();
        assert_eq!(second.new, 0);
        assert_eq!(second.updated, 2);
        assert_eq!(second.archived, 0);
        assert_eq!(calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_archive_failure_keeps_record_and_run() {
        let dir = TempDir::new().unwrap();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let (engine, query) = one_page(&dir);
        let mut engine = engine.with_archiver(Box::new(StubArchiver {
            calls: Arc::clone(&calls),
            fail: true,
        }));

        let summary = engine.run(&query).await.unwrap();

        assert_eq!(summary.outcome, RunOutcome::Completed);
        assert_eq!(summary.new, 2);
        assert_eq!(summary.archived, 0);
        assert_eq!(summary.errors, 0);
        assert_eq!(calls.lock().unwrap().len(), 2);
        assert_eq!(engine.phase(), CrawlPhase::Done);

        let stored = engine.storage().get_by_address("Dos 2").unwrap().unwrap();
        assert_eq!(stored.bedrooms, Some(3));
        assert_eq!(stored.archived_path, None);
    }

    /// Serves one final page and turns the checkpoint path into a directory
    struct CheckpointBlocker {
        checkpoint: std::path::PathBuf,
        body: String,
    }

    #[async_trait]
    impl PageFetcher for CheckpointBlocker {
        async fn fetch(
            &self,
            _url: &str,
            _timeout: Duration,
        ) -> std::result::Result<String, FetchError> {
            std::fs::create_dir_all(&self.checkpoint).unwrap();
            std::fs::write(self.checkpoint.join("keep"), "x").unwrap();
            Ok(self.body.clone())
        }
    }

    #[tokio::test]
    async fn test_checkpoint_clear_failure_ends_failed() {
        let dir = TempDir::new().unwrap();
        let checkpoint = dir.path().join("checkpoint.json");
        let mut storage = SqliteStorage::new_in_memory().unwrap();
        let id = storage
            .add_query(&NewQuery {
                name: "q".to_string(),
                url: "https://site.test/list?pagina-1".to_string(),
                ..Default::default()
            })
            .unwrap();
        let query = storage.get_query(id).unwrap();

        let mut engine = CrawlEngine::new(
            storage,
            Box::new(CheckpointBlocker {
                checkpoint: checkpoint.clone(),
                body: page(&["Uno 1|2"], None),
            }),
            Box::new(PipeExtractor),
            layout(),
            CheckpointStore::new(&checkpoint),
        )
        .with_page_delay(PageDelay::none());

        let err = engine.run(&query).await.unwrap_err();

        assert!(matches!(err, PropscanError::Checkpoint(_)));
        assert_eq!(engine.phase(), CrawlPhase::Failed);
        assert_eq!(engine.storage().count_properties().unwrap(), 1);
    }
}
