//! Integration tests for the crawler
//!
//! These tests drive the crawl engine against scripted in-memory fetchers,
//! the real site extractor, and an on-disk store to check the full
//! fetch -> extract -> persist -> checkpoint cycle.

use async_trait::async_trait;
use chrono::Utc;
use propscan::alerts::{AlertError, AlertSink};
use propscan::checkpoint::CheckpointStore;
use propscan::config::{parse_config, Config, SiteConfig};
use propscan::crawler::{
    ArgenpropExtractor, CrawlEngine, CrawlOptions, PageDelay, PageFetcher, RetryPolicy,
    RunOutcome, SiteLayout,
};
use propscan::pipeline::run_all;
use propscan::storage::{NewQuery, QueryRecord, SqliteStorage, Storage};
use propscan::{CrawlPhase, FetchError, PropscanError};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const BASE: &str = "https://www.argenprop.com";
const START: &str = "https://www.argenprop.com/departamentos/alquiler/palermo?pagina-1";

fn page_url(n: u32) -> String {
    format!("{}/departamentos/alquiler/palermo?pagina-{}", BASE, n)
}

/// One scripted response
#[derive(Clone)]
enum Reply {
    Page(String),
    Transient,
    Permanent,
}

/// Serves scripted replies per URL; the last reply for a URL repeats
#[derive(Default)]
struct ScriptedFetcher {
    replies: Mutex<HashMap<String, VecDeque<Reply>>>,
    requests: Arc<Mutex<Vec<String>>>,
}

impl ScriptedFetcher {
    fn serve(self, url: &str, replies: Vec<Reply>) -> Self {
        self.replies
            .lock()
            .unwrap()
            .insert(url.to_string(), replies.into());
        self
    }

    fn request_log(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.requests)
    }
}

#[async_trait]
impl PageFetcher for ScriptedFetcher {
    async fn fetch(&self, url: &str, _timeout: Duration) -> Result<String, FetchError> {
        self.requests.lock().unwrap().push(url.to_string());

        let mut replies = self.replies.lock().unwrap();
        let queue = replies
            .get_mut(url)
            .ok_or_else(|| FetchError::permanent(url, "HTTP 404"))?;
        let reply = if queue.len() > 1 {
            queue.pop_front().unwrap()
        } else {
            queue.front().cloned().unwrap()
        };

        match reply {
            Reply::Page(body) => Ok(body),
            Reply::Transient => Err(FetchError::transient(url, "HTTP 503")),
            Reply::Permanent => Err(FetchError::permanent(url, "HTTP 410")),
        }
    }
}

fn card(address: &str, price: &str, size: &str, bedrooms: &str) -> String {
    format!(
        r#"<div class="listing__item">
             <a href="/departamento-en-alquiler--{id}" class="card">
               <p class="card__price"><span class="card__currency">USD</span> {price}
                 <span class="card__expenses">+ $ 85.000 expensas</span></p>
               <h2 class="card__address">{address}</h2>
               <ul class="card__main-features">
                 <li><span>{size} m² cubie.</span></li>
                 <li><span>{bedrooms} dorm.</span></li>
               </ul>
               <p class="card__info">Departamento en {address}</p>
             </a>
           </div>"#,
        id = address.len(),
        price = price,
        address = address,
        size = size,
        bedrooms = bedrooms,
    )
}

fn results_page(cards: &[String], next: Option<u32>) -> String {
    let mut html = String::from("<html><body><div class=\"listing-container\">");
    for c in cards {
        html.push_str(c);
    }
    html.push_str("</div>");
    if let Some(n) = next {
        html.push_str(&format!(
            r#"<a aria-label="Siguiente" href="/departamentos/alquiler/palermo?pagina-{}">›</a>"#,
            n
        ));
    }
    html.push_str("</body></html>");
    html
}

/// A store on disk with one registered query
fn open_store(dir: &Path) -> (SqliteStorage, QueryRecord) {
    let mut storage = SqliteStorage::new(&dir.join("properties.db")).unwrap();
    let query = match storage.get_query_by_name("palermo-3").unwrap() {
        Some(query) => query,
        None => {
            let id = storage
                .add_query(&NewQuery {
                    name: "palermo-3".to_string(),
                    url: START.to_string(),
                    ..Default::default()
                })
                .unwrap();
            storage.get_query(id).unwrap()
        }
    };
    (storage, query)
}

fn checkpoint_store(dir: &Path) -> CheckpointStore {
    CheckpointStore::new(dir.join("checkpoint.json"))
}

fn build(
    dir: &Path,
    fetcher: ScriptedFetcher,
    max_attempts: u32,
    max_pages: Option<u32>,
) -> (CrawlEngine<SqliteStorage>, QueryRecord) {
    let (storage, query) = open_store(dir);
    let layout = SiteLayout::from_config(&SiteConfig {
        name: "argenprop".to_string(),
        base_url: BASE.to_string(),
        ..Default::default()
    })
    .unwrap();
    let extractor = ArgenpropExtractor::new(layout.base_url.clone()).unwrap();

    let engine = CrawlEngine::new(
        storage,
        Box::new(fetcher),
        Box::new(extractor),
        layout,
        checkpoint_store(dir),
    )
    .with_retry_policy(RetryPolicy::new(
        max_attempts,
        Duration::from_millis(1),
        Duration::from_millis(4),
    ))
    .with_page_delay(PageDelay::none())
    .with_max_pages(max_pages)
    .with_website("argenprop");

    (engine, query)
}

fn three_pages() -> ScriptedFetcher {
    ScriptedFetcher::default()
        .serve(
            START,
            vec![Reply::Page(results_page(
                &[
                    card("Guemes al 4500", "1.200", "95", "3"),
                    card("Soler 4100", "900", "70", "2"),
                ],
                Some(2),
            ))],
        )
        .serve(
            &page_url(2),
            vec![Reply::Page(results_page(
                &[card("Charcas 3800", "1.000", "110", "3")],
                Some(3),
            ))],
        )
        .serve(
            &page_url(3),
            vec![Reply::Page(results_page(
                &[card("Arenales 3000", "1.500", "120", "4")],
                None,
            ))],
        )
}

#[tokio::test]
async fn test_full_run_persists_listings_and_clears_checkpoint() {
    let dir = TempDir::new().unwrap();
    let (mut engine, query) = build(dir.path(), three_pages(), 3, None);

    let summary = engine.run(&query).await.unwrap();

    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(summary.pages, 3);
    assert_eq!(summary.new, 4);
    assert_eq!(summary.updated, 0);
    assert_eq!(summary.errors, 0);
    assert_eq!(engine.phase(), CrawlPhase::Done);
    assert!(!checkpoint_store(dir.path()).exists());

    let stored = engine
        .storage()
        .get_by_address("Guemes al 4500")
        .unwrap()
        .unwrap();
    assert_eq!(stored.currency.as_deref(), Some("USD"));
    assert_eq!(stored.price, Some(1200.0));
    assert_eq!(stored.price_dollars, Some(1200));
    assert_eq!(stored.expenses, Some(85_000.0));
    assert_eq!(stored.size, Some(95.0));
    assert_eq!(stored.bedrooms, Some(3));
    assert_eq!(stored.website.as_deref(), Some("argenprop"));
    assert_eq!(stored.source_url.as_deref(), Some(START));
    assert_eq!(
        stored.listing_url.as_deref(),
        Some("https://www.argenprop.com/departamento-en-alquiler--14")
    );
    assert_eq!(stored.query_id, Some(query.id));
}

#[tokio::test]
async fn test_rerun_updates_without_duplicating() {
    let dir = TempDir::new().unwrap();

    let (mut engine, query) = build(dir.path(), three_pages(), 3, None);
    engine.run(&query).await.unwrap();
    let first_seen = engine
        .storage()
        .get_by_address("Soler 4100")
        .unwrap()
        .unwrap()
        .timestamp;
    drop(engine);

    let (mut engine, query) = build(dir.path(), three_pages(), 3, None);
    let summary = engine.run(&query).await.unwrap();

    assert_eq!(summary.new, 0);
    assert_eq!(summary.updated, 4);
    assert_eq!(engine.storage().count_properties().unwrap(), 4);

    let again = engine
        .storage()
        .get_by_address("Soler 4100")
        .unwrap()
        .unwrap();
    assert_eq!(again.timestamp, first_seen);
    assert!(again.last_updated >= first_seen);
}

#[tokio::test]
async fn test_max_pages_keeps_checkpoint_and_next_run_resumes() {
    let dir = TempDir::new().unwrap();

    let (mut engine, query) = build(dir.path(), three_pages(), 3, Some(1));
    let summary = engine.run(&query).await.unwrap();

    assert_eq!(summary.outcome, RunOutcome::MaxPagesReached);
    assert_eq!(summary.pages, 1);
    let checkpoint = checkpoint_store(dir.path())
        .load(query.id)
        .unwrap()
        .unwrap();
    assert_eq!(checkpoint.last_page, 2);
    assert_eq!(checkpoint.last_url, page_url(2));
    drop(engine);

    let fetcher = three_pages();
    let requests = fetcher.request_log();
    let (mut engine, query) = build(dir.path(), fetcher, 3, None);
    let summary = engine.run(&query).await.unwrap();

    assert!(summary.resumed);
    assert_eq!(summary.start_page, 2);
    assert_eq!(summary.pages, 2);
    assert_eq!(summary.new, 2);
    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(*requests.lock().unwrap(), vec![page_url(2), page_url(3)]);
    assert_eq!(engine.storage().count_properties().unwrap(), 4);
    assert!(!checkpoint_store(dir.path()).exists());
}

#[tokio::test]
async fn test_checkpoint_for_other_query_is_ignored() {
    let dir = TempDir::new().unwrap();
    checkpoint_store(dir.path())
        .save(7, &page_url(7), 999)
        .unwrap();

    let fetcher = three_pages();
    let requests = fetcher.request_log();
    let (mut engine, query) = build(dir.path(), fetcher, 3, None);
    let summary = engine.run(&query).await.unwrap();

    assert!(!summary.resumed);
    assert_eq!(summary.start_page, 1);
    assert_eq!(requests.lock().unwrap()[0], START);
    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert!(!checkpoint_store(dir.path()).exists());
}

#[tokio::test]
async fn test_transient_failures_within_budget_recover() {
    let dir = TempDir::new().unwrap();
    let fetcher = three_pages().serve(
        &page_url(2),
        vec![
            Reply::Transient,
            Reply::Transient,
            Reply::Page(results_page(&[card("Charcas 3800", "1.000", "110", "3")], None)),
        ],
    );
    let requests = fetcher.request_log();

    let (mut engine, query) = build(dir.path(), fetcher, 3, None);
    let summary = engine.run(&query).await.unwrap();

    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(summary.pages, 2);
    let page_two_requests = requests
        .lock()
        .unwrap()
        .iter()
        .filter(|url| **url == page_url(2))
        .count();
    assert_eq!(page_two_requests, 3);
}

#[tokio::test]
async fn test_exhausted_retries_fail_and_checkpoint_failing_page() {
    let dir = TempDir::new().unwrap();
    let fetcher = three_pages().serve(&page_url(2), vec![Reply::Transient]);
    let requests = fetcher.request_log();

    let (mut engine, query) = build(dir.path(), fetcher, 3, None);
    let err = engine.run(&query).await.unwrap_err();

    match err {
        PropscanError::PageFailed {
            page,
            url,
            attempts,
            source,
        } => {
            assert_eq!(page, 2);
            assert_eq!(url, page_url(2));
            assert_eq!(attempts, 3);
            assert!(source.is_transient());
        }
        other => panic!("expected PageFailed, got {:?}", other),
    }
    assert_eq!(engine.phase(), CrawlPhase::Failed);
    assert_eq!(requests.lock().unwrap().len(), 4);

    // Page 1 listings were persisted before the failure
    assert_eq!(engine.storage().count_properties().unwrap(), 2);

    let checkpoint = checkpoint_store(dir.path())
        .load(query.id)
        .unwrap()
        .unwrap();
    assert_eq!(checkpoint.last_page, 2);
    assert_eq!(checkpoint.last_url, page_url(2));
}

#[tokio::test]
async fn test_permanent_failure_is_not_retried() {
    let dir = TempDir::new().unwrap();
    let fetcher = ScriptedFetcher::default().serve(START, vec![Reply::Permanent]);
    let requests = fetcher.request_log();

    let (mut engine, query) = build(dir.path(), fetcher, 5, None);
    let err = engine.run(&query).await.unwrap_err();

    assert!(matches!(
        err,
        PropscanError::PageFailed {
            page: 1,
            attempts: 1,
            ..
        }
    ));
    assert_eq!(requests.lock().unwrap().len(), 1);
    assert_eq!(
        checkpoint_store(dir.path())
            .load(query.id)
            .unwrap()
            .unwrap()
            .last_page,
        1
    );
}

#[tokio::test]
async fn test_partial_extraction_keeps_good_listings() {
    let dir = TempDir::new().unwrap();
    let broken = r#"<div class="listing__item">
                      <a href="/sin-direccion" class="card">
                        <p class="card__price"><span class="card__currency">USD</span> 700</p>
                      </a>
                    </div>"#
        .to_string();
    let fetcher = ScriptedFetcher::default().serve(
        START,
        vec![Reply::Page(results_page(
            &[
                card("Guemes al 4500", "1.200", "95", "3"),
                broken,
                card("Soler 4100", "Consultar", "70", "2"),
                card("Charcas 3800", "1.000", "N/A", "3"),
            ],
            None,
        ))],
    );

    let (mut engine, query) = build(dir.path(), fetcher, 3, None);
    let summary = engine.run(&query).await.unwrap();

    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(summary.new, 3);
    assert_eq!(summary.errors, 1);

    let store = engine.storage();
    assert!(store.get_by_address("Guemes al 4500").unwrap().is_some());

    let soler = store.get_by_address("Soler 4100").unwrap().unwrap();
    assert_eq!(soler.price, None);
    assert_eq!(soler.price_dollars, None);

    let charcas = store.get_by_address("Charcas 3800").unwrap().unwrap();
    assert_eq!(charcas.size, None);
    assert_eq!(charcas.bedrooms, Some(3));
}

#[derive(Default)]
struct RecordingSink {
    sent: Mutex<Vec<String>>,
}

#[async_trait]
impl AlertSink for RecordingSink {
    async fn send(&self, message: &str) -> Result<(), AlertError> {
        self.sent.lock().unwrap().push(message.to_string());
        Ok(())
    }
}

/// A config that crawls one query on `server` and keeps its files in `dir`
fn served_config(server: &MockServer, dir: &Path) -> Config {
    let toml = format!(
        r#"
[crawler]
max-attempts = 1
base-retry-delay-ms = 1
max-retry-delay-ms = 1
min-page-delay-ms = 0
max-page-delay-ms = 0

[site]
name = "argenprop"
base-url = "{base}"

[storage]
database-path = "{dir}/properties.db"
checkpoint-path = "{dir}/checkpoint.json"
archive-dir = "{dir}/buckets/links"
geocache-path = "{dir}/geocache.json"

[[query]]
name = "palermo-3"
neighborhoods = "palermo"
bedrooms = "3-dormitorios"
url = "{base}/departamentos/alquiler/palermo?pagina-1"
"#,
        base = server.uri(),
        dir = dir.display()
    );
    parse_config(&toml).unwrap()
}

#[tokio::test]
async fn test_run_all_crawls_filters_and_sends_digest() {
    let dir = TempDir::new().unwrap();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/departamentos/alquiler/palermo"))
        .respond_with(ResponseTemplate::new(200).set_body_string(results_page(
            &[
                card("Guemes al 4500", "1.000", "95", "3"),
                card("Soler 4100", "900", "70", "2"),
                card("Charcas 3800", "2.000", "110", "3"),
            ],
            None,
        )))
        .mount(&server)
        .await;

    let config = served_config(&server, dir.path());
    let sink = RecordingSink::default();

    let report = run_all(
        &config,
        &CrawlOptions::default(),
        &sink,
        Utc::now().date_naive(),
    )
    .await
    .unwrap();

    assert_eq!(report.crawl.outcome, RunOutcome::Completed);
    assert_eq!(report.crawl.new, 3);
    assert_eq!(report.filter.total, 3);
    assert_eq!(report.filter.passed, 1);
    assert_eq!(report.delivery.sent, 2);
    assert_eq!(report.delivery.failed, 0);

    let sent = sink.sent.lock().unwrap();
    assert_eq!(sent[0], "1 new property matched today");
    assert!(sent[1].contains("Guemes al 4500"));

    let storage = SqliteStorage::new(&dir.path().join("properties.db")).unwrap();
    assert!(storage.get_by_address("Guemes al 4500").unwrap().unwrap().is_filtered);
    assert!(!storage.get_by_address("Soler 4100").unwrap().unwrap().is_filtered);
}

#[tokio::test]
async fn test_run_all_stops_when_crawl_fails() {
    let dir = TempDir::new().unwrap();
    let server = MockServer::start().await;
    let config = served_config(&server, dir.path());
    let sink = RecordingSink::default();

    let err = run_all(
        &config,
        &CrawlOptions::default(),
        &sink,
        Utc::now().date_naive(),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, PropscanError::PageFailed { page: 1, .. }));
    assert!(sink.sent.lock().unwrap().is_empty());
    assert!(CheckpointStore::new(dir.path().join("checkpoint.json")).exists());
}
