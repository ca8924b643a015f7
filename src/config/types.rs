use crate::pricing::ExchangeRates;
use serde::Deserialize;
use std::time::Duration;

/// Main configuration structure for Propscan
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub crawler: CrawlerConfig,
    pub site: SiteConfig,
    #[serde(default)]
    pub fetcher: FetcherConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub pricing: ExchangeRates,
    #[serde(default)]
    pub filter: FilterConfig,
    #[serde(default)]
    pub alerts: AlertsConfig,
    #[serde(default)]
    pub geocoding: GeocodingConfig,
    #[serde(default, rename = "query")]
    pub queries: Vec<QueryEntry>,
}

impl Config {
    /// Finds a configured query by name, or the first one when no name is given
    pub fn select_query(&self, name: Option<&str>) -> Option<&QueryEntry> {
        match name {
            Some(name) => self.queries.iter().find(|q| q.name == name),
            None => self.queries.first(),
        }
    }
}

/// Crawler behavior configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CrawlerConfig {
    /// Total fetch attempts per page before the run fails
    #[serde(rename = "max-attempts", default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry (milliseconds), doubled on each further retry
    #[serde(rename = "base-retry-delay-ms", default = "default_base_retry_delay")]
    pub base_retry_delay_ms: u64,

    /// Upper bound for a single retry delay (milliseconds)
    #[serde(rename = "max-retry-delay-ms", default = "default_max_retry_delay")]
    pub max_retry_delay_ms: u64,

    /// Timeout for one page fetch (milliseconds)
    #[serde(rename = "fetch-timeout-ms", default = "default_fetch_timeout")]
    pub fetch_timeout_ms: u64,

    /// Lower bound of the randomized pause between pages (milliseconds)
    #[serde(rename = "min-page-delay-ms", default = "default_min_page_delay")]
    pub min_page_delay_ms: u64,

    /// Upper bound of the randomized pause between pages (milliseconds)
    #[serde(rename = "max-page-delay-ms", default = "default_max_page_delay")]
    pub max_page_delay_ms: u64,

    /// Stop after this many pages in one run, keeping the checkpoint
    #[serde(rename = "max-pages", default)]
    pub max_pages: Option<u32>,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_retry_delay() -> u64 {
    5_000
}

fn default_max_retry_delay() -> u64 {
    60_000
}

fn default_fetch_timeout() -> u64 {
    30_000
}

fn default_min_page_delay() -> u64 {
    1_000
}

fn default_max_page_delay() -> u64 {
    3_000
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_retry_delay_ms: default_base_retry_delay(),
            max_retry_delay_ms: default_max_retry_delay(),
            fetch_timeout_ms: default_fetch_timeout(),
            min_page_delay_ms: default_min_page_delay(),
            max_page_delay_ms: default_max_page_delay(),
            max_pages: None,
        }
    }
}

impl CrawlerConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}

/// Layout of the listing site being crawled
#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    /// Short site name recorded as each property's `website`
    pub name: String,

    /// Origin that relative listing and pagination links resolve against
    #[serde(rename = "base-url")]
    pub base_url: String,

    /// CSS selector matching one listing card
    #[serde(rename = "listing-selector", default = "default_listing_selector")]
    pub listing_selector: String,

    /// CSS selector matching the "next page" anchor
    #[serde(rename = "next-page-selector", default = "default_next_page_selector")]
    pub next_page_selector: String,
}

fn default_listing_selector() -> String {
    "div.listing__item".to_string()
}

fn default_next_page_selector() -> String {
    "a[aria-label='Siguiente']".to_string()
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            name: "argenprop".to_string(),
            base_url: "https://www.argenprop.com".to_string(),
            listing_selector: default_listing_selector(),
            next_page_selector: default_next_page_selector(),
        }
    }
}

/// HTTP fetcher configuration
#[derive(Debug, Clone, Deserialize)]
pub struct FetcherConfig {
    /// User agent sent with page and archive requests
    #[serde(rename = "user-agent", default = "default_user_agent")]
    pub user_agent: String,
}

fn default_user_agent() -> String {
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36".to_string()
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
        }
    }
}

/// Where persistent state lives
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Path to the SQLite database file
    #[serde(rename = "database-path")]
    pub database_path: String,

    /// Path to the JSON crawl checkpoint
    #[serde(rename = "checkpoint-path")]
    pub checkpoint_path: String,

    /// Directory that receives archived listing pages
    #[serde(rename = "archive-dir")]
    pub archive_dir: String,

    /// Path to the JSON geocode cache
    #[serde(rename = "geocache-path")]
    pub geocache_path: String,
}

/// Alert criteria applied by the filter pass
#[derive(Debug, Clone, Deserialize)]
pub struct FilterConfig {
    /// Pesos per dollar for the monthly total
    #[serde(rename = "exchange-rate", default = "default_filter_rate")]
    pub exchange_rate: f64,

    /// Minimum covered size in m²; listings without a size pass
    #[serde(rename = "min-size", default = "default_min_size")]
    pub min_size: f64,

    /// Lowest acceptable monthly total in dollars
    #[serde(rename = "min-price-usd", default = "default_min_price")]
    pub min_price_usd: f64,

    /// Highest acceptable monthly total in dollars
    #[serde(rename = "max-price-usd", default = "default_max_price")]
    pub max_price_usd: f64,
}

fn default_filter_rate() -> f64 {
    1200.0
}

fn default_min_size() -> f64 {
    90.0
}

fn default_min_price() -> f64 {
    300.0
}

fn default_max_price() -> f64 {
    1500.0
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            exchange_rate: default_filter_rate(),
            min_size: default_min_size(),
            min_price_usd: default_min_price(),
            max_price_usd: default_max_price(),
        }
    }
}

/// Alert delivery configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AlertsConfig {
    /// Number of property messages sent before the "+N more" notice
    #[serde(rename = "max-messages", default = "default_max_messages")]
    pub max_messages: usize,
}

fn default_max_messages() -> usize {
    20
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            max_messages: default_max_messages(),
        }
    }
}

/// Geocode repair configuration
#[derive(Debug, Clone, Deserialize)]
pub struct GeocodingConfig {
    /// Search endpoint of a Nominatim-compatible service
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Number of concurrent lookup workers
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Flush the cache to disk after this many successful repairs
    #[serde(rename = "save-every", default = "default_save_every")]
    pub save_every: usize,

    /// Appended to each cleaned address before lookup
    #[serde(rename = "region-suffix", default = "default_region_suffix")]
    pub region_suffix: String,

    /// Pause each worker takes between lookups (milliseconds)
    #[serde(rename = "min-delay-ms", default = "default_min_delay")]
    pub min_delay_ms: u64,

    /// Timeout for one lookup (milliseconds)
    #[serde(rename = "timeout-ms", default = "default_geocode_timeout")]
    pub timeout_ms: u64,
}

fn default_endpoint() -> String {
    "https://nominatim.openstreetmap.org/search".to_string()
}

fn default_workers() -> usize {
    4
}

fn default_save_every() -> usize {
    10
}

fn default_region_suffix() -> String {
    ", Buenos Aires, Argentina".to_string()
}

fn default_min_delay() -> u64 {
    1_500
}

fn default_geocode_timeout() -> u64 {
    10_000
}

impl Default for GeocodingConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            workers: default_workers(),
            save_every: default_save_every(),
            region_suffix: default_region_suffix(),
            min_delay_ms: default_min_delay(),
            timeout_ms: default_geocode_timeout(),
        }
    }
}

/// A named search on the listing site
#[derive(Debug, Clone, Deserialize)]
pub struct QueryEntry {
    /// Unique query name
    pub name: String,

    /// Neighborhood path segment (e.g. "belgrano-o-palermo")
    pub neighborhoods: String,

    /// Bedroom path segment (e.g. "3-dormitorios")
    pub bedrooms: String,

    #[serde(rename = "query-number", default)]
    pub query_number: Option<i64>,

    #[serde(rename = "map-name", default)]
    pub map_name: Option<String>,

    /// Explicit first-page URL overriding the built one
    #[serde(default)]
    pub url: Option<String>,
}

impl QueryEntry {
    /// Returns the URL of the first result page for this query
    pub fn source_url(&self, site: &SiteConfig) -> String {
        match &self.url {
            Some(url) => url.clone(),
            None => format!(
                "{}/inmuebles/alquiler/{}/{}?pagina-1",
                site.base_url.trim_end_matches('/'),
                self.neighborhoods,
                self.bedrooms
            ),
        }
    }
}
