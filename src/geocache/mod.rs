//! Geocode cache and the parallel repair job
//!
//! The cache is a JSON object mapping each address to its coordinates, with
//! null coordinates marking addresses that failed to geocode. The repair job
//! retries those failures after cleaning the address text, fanning lookups
//! out over a fixed number of workers that share one mutex-guarded cache.

use crate::config::GeocodingConfig;
use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while geocoding or persisting the cache
#[derive(Debug, Error)]
pub enum GeocodeError {
    #[error("Geocache IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Geocache JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Geocoding request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Geocoder returned unusable coordinates: {0}")]
    BadResponse(String),

    #[error("Invalid address pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("Repair worker failed: {0}")]
    Worker(String),
}

/// A resolved location
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

/// One cache entry; both fields are null for a failed lookup
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl CacheEntry {
    pub fn is_failed(&self) -> bool {
        self.latitude.is_none() || self.longitude.is_none()
    }
}

impl From<Coordinates> for CacheEntry {
    fn from(c: Coordinates) -> Self {
        Self {
            latitude: Some(c.latitude),
            longitude: Some(c.longitude),
        }
    }
}

/// Rewrites listing addresses into something a geocoder can resolve
#[derive(Debug, Clone)]
pub struct AddressCleaner {
    floor: Regex,
    street_number: Regex,
    floor_mark: Regex,
    between: Regex,
    and: Regex,
    avenue: Regex,
    spaces: Regex,
}

impl AddressCleaner {
    pub fn new() -> Result<Self, GeocodeError> {
        Ok(Self {
            floor: Regex::new(r",?\s*[Pp]iso\s+\w+")?,
            street_number: Regex::new(r"\s+al\s+(\d+)")?,
            floor_mark: Regex::new(r"\s+\d+°")?,
            between: Regex::new(r"(?i)e/")?,
            and: Regex::new(r"\s+[Yy]\s+")?,
            avenue: Regex::new(r"\b[Aa][Vv]\.?\s+")?,
            spaces: Regex::new(r"\s+")?,
        })
    }

    /// Cleans one address
    ///
    /// - drops floor details (`, Piso 3`, `8°`)
    /// - turns `Soler al 4100` into `Soler 4100`
    /// - keeps only the first street of `A e/ B` and `A y B`
    /// - expands `Av.` to `Avenida`
    /// - collapses whitespace
    pub fn clean_address(&self, address: &str) -> String {
        let address = self.floor.replace_all(address, "");
        let address = self.street_number.replace_all(&address, " $1");
        let address = self.floor_mark.replace_all(&address, "");

        let address = self
            .between
            .split(&address)
            .next()
            .unwrap_or_default()
            .to_string();
        let address = self.and.split(&address).next().unwrap_or_default().to_string();

        let address = self.avenue.replace_all(&address, "Avenida ");
        self.spaces.replace_all(&address, " ").trim().to_string()
    }
}

#[derive(Debug, Default)]
struct CacheState {
    entries: BTreeMap<String, CacheEntry>,
    fixed: usize,
    still_failed: usize,
}

/// Address -> coordinates cache shared between repair workers
///
/// Entries and the success/failure counters live behind a single mutex.
#[derive(Debug)]
pub struct GeoCache {
    path: PathBuf,
    state: Mutex<CacheState>,
}

impl GeoCache {
    /// Loads the cache file; a missing file gives an empty cache
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, GeocodeError> {
        let path = path.into();
        let entries = match std::fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents)?,
            Err(e) if e.kind() == ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => return Err(GeocodeError::Io { path, source }),
        };

        Ok(Self {
            path,
            state: Mutex::new(CacheState {
                entries,
                ..Default::default()
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, address: &str) -> Option<CacheEntry> {
        self.lock().entries.get(address).copied()
    }

    pub fn insert(&self, address: &str, entry: CacheEntry) {
        self.lock().entries.insert(address.to_string(), entry);
    }

    /// Addresses whose last lookup failed, in key order
    pub fn failed_addresses(&self) -> Vec<String> {
        self.lock()
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_failed())
            .map(|(address, _)| address.clone())
            .collect()
    }

    /// Stores a successful repair and returns the number of repairs so far
    pub fn record_success(&self, address: &str, coordinates: Coordinates) -> usize {
        let mut state = self.lock();
        state.entries.insert(address.to_string(), coordinates.into());
        state.fixed += 1;
        state.fixed
    }

    pub fn record_failure(&self) {
        self.lock().still_failed += 1;
    }

    /// Returns `(fixed, still_failed)`
    pub fn counts(&self) -> (usize, usize) {
        let state = self.lock();
        (state.fixed, state.still_failed)
    }

    /// Writes a snapshot of the entries to disk
    ///
    /// The state lock is held until the rename completes, so concurrent
    /// saves never share the temp file and a newer snapshot is never
    /// replaced by an older one.
    pub fn save(&self) -> Result<(), GeocodeError> {
        let state = self.lock();
        let json = serde_json::to_string_pretty(&state.entries)?;

        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, json).map_err(|source| GeocodeError::Io {
            path: tmp.clone(),
            source,
        })?;
        std::fs::rename(&tmp, &self.path).map_err(|source| GeocodeError::Io {
            path: self.path.clone(),
            source,
        })?;
        drop(state);
        Ok(())
    }
}

/// Resolves a free-text address to coordinates
#[async_trait]
pub trait Geocoder: Send + Sync {
    /// Returns `Ok(None)` when the service found nothing
    async fn geocode(&self, query: &str) -> Result<Option<Coordinates>, GeocodeError>;
}

#[derive(Debug, Deserialize)]
struct NominatimPlace {
    lat: String,
    lon: String,
}

/// Geocoder backed by a Nominatim-compatible search endpoint
#[derive(Debug, Clone)]
pub struct NominatimGeocoder {
    client: Client,
    endpoint: String,
    timeout: Duration,
}

impl NominatimGeocoder {
    pub fn new(client: Client, config: &GeocodingConfig) -> Self {
        Self {
            client,
            endpoint: config.endpoint.clone(),
            timeout: Duration::from_millis(config.timeout_ms),
        }
    }
}

#[async_trait]
impl Geocoder for NominatimGeocoder {
    async fn geocode(&self, query: &str) -> Result<Option<Coordinates>, GeocodeError> {
        let places: Vec<NominatimPlace> = self
            .client
            .get(&self.endpoint)
            .query(&[("q", query), ("format", "json"), ("limit", "1")])
            .timeout(self.timeout)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let Some(place) = places.into_iter().next() else {
            return Ok(None);
        };

        let parse = |value: &str| {
            value
                .parse::<f64>()
                .map_err(|_| GeocodeError::BadResponse(format!("'{}' for '{}'", value, query)))
        };
        Ok(Some(Coordinates {
            latitude: parse(&place.lat)?,
            longitude: parse(&place.lon)?,
        }))
    }
}

/// Knobs for the repair job
#[derive(Debug, Clone)]
pub struct RepairOptions {
    pub workers: usize,
    pub save_every: usize,
    pub region_suffix: String,
    pub min_delay: Duration,
}

impl RepairOptions {
    pub fn from_config(config: &GeocodingConfig) -> Self {
        Self {
            workers: config.workers,
            save_every: config.save_every,
            region_suffix: config.region_suffix.clone(),
            min_delay: Duration::from_millis(config.min_delay_ms),
        }
    }
}

/// Counts from one repair job
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepairReport {
    /// Failed addresses picked up by the job
    pub processed: usize,

    pub fixed: usize,

    /// Addresses still failing, including the skipped ones
    pub still_failed: usize,

    /// Addresses that cleaning left unchanged, so no lookup was made
    pub skipped: usize,
}

type WorkQueue = Arc<Mutex<VecDeque<String>>>;

fn next_address(queue: &WorkQueue) -> Option<String> {
    queue
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .pop_front()
}

async fn repair_worker(
    worker: usize,
    queue: WorkQueue,
    cache: Arc<GeoCache>,
    geocoder: Arc<dyn Geocoder>,
    cleaner: Arc<AddressCleaner>,
    options: Arc<RepairOptions>,
) -> Result<usize, GeocodeError> {
    let mut skipped = 0;

    while let Some(address) = next_address(&queue) {
        let cleaned = cleaner.clean_address(&address);
        if cleaned == address {
            tracing::debug!("[worker {}] Skipping (no change): {}", worker, address);
            cache.record_failure();
            skipped += 1;
            continue;
        }

        let query = format!("{}{}", cleaned, options.region_suffix);
        match geocoder.geocode(&query).await {
            Ok(Some(coordinates)) => {
                let fixed = cache.record_success(&address, coordinates);
                tracing::info!("[worker {}] Fixed '{}' as '{}'", worker, address, cleaned);

                if fixed % options.save_every.max(1) == 0 {
                    cache.save()?;
                    tracing::info!("Saved progress ({} fixed so far)", fixed);
                }
            }
            Ok(None) => {
                tracing::info!("[worker {}] Still failed: {}", worker, address);
                cache.record_failure();
            }
            Err(e) => {
                tracing::warn!("[worker {}] Error geocoding '{}': {}", worker, address, e);
                cache.record_failure();
            }
        }

        if !options.min_delay.is_zero() {
            tokio::time::sleep(options.min_delay).await;
        }
    }

    Ok(skipped)
}

/// Retries every failed address in the cache with a cleaned-up query
///
/// # Arguments
///
/// * `cache` - The shared cache; repaired entries are written back into it
/// * `geocoder` - The lookup service
/// * `options` - Worker count, save interval, query suffix and per-worker delay
///
/// # Returns
///
/// Counts of fixed and still-failing addresses. The cache is saved every
/// `save_every` successes and once more at the end.
pub async fn repair_failed(
    cache: Arc<GeoCache>,
    geocoder: Arc<dyn Geocoder>,
    options: RepairOptions,
) -> Result<RepairReport, GeocodeError> {
    let failed = cache.failed_addresses();
    tracing::info!(
        "Found {} failed addresses out of {} cached",
        failed.len(),
        cache.len()
    );

    let processed = failed.len();
    if processed == 0 {
        return Ok(RepairReport::default());
    }

    let workers = options.workers.clamp(1, processed);
    let queue: WorkQueue = Arc::new(Mutex::new(failed.into_iter().collect()));
    let cleaner = Arc::new(AddressCleaner::new()?);
    let options = Arc::new(options);

    let handles: Vec<_> = (0..workers)
        .map(|worker| {
            tokio::spawn(repair_worker(
                worker,
                Arc::clone(&queue),
                Arc::clone(&cache),
                Arc::clone(&geocoder),
                Arc::clone(&cleaner),
                Arc::clone(&options),
            ))
        })
        .collect();

    let mut skipped = 0;
    let mut first_error = None;
    for handle in handles {
        match handle.await {
            Ok(Ok(worker_skipped)) => skipped += worker_skipped,
            Ok(Err(e)) => {
                first_error.get_or_insert(e);
            }
            Err(e) => {
                first_error.get_or_insert(GeocodeError::Worker(e.to_string()));
            }
        }
    }

    cache.save()?;
    if let Some(e) = first_error {
        return Err(e);
    }

    let (fixed, still_failed) = cache.counts();
    tracing::info!(
        "Successfully fixed: {}, still failed: {}, total processed: {}",
        fixed,
        still_failed,
        processed
    );

    Ok(RepairReport {
        processed,
        fixed,
        still_failed,
        skipped,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use wiremock::matchers::{method, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_clean_address_rules() {
        let cleaner = AddressCleaner::new().unwrap();

        assert_eq!(cleaner.clean_address("Soler al 4100"), "Soler 4100");
        assert_eq!(
            cleaner.clean_address("Arenales 3000, Piso 4"),
            "Arenales 3000"
        );
        assert_eq!(cleaner.clean_address("Juncal 2000 8°"), "Juncal 2000");
        assert_eq!(
            cleaner.clean_address("Charcas e/ Scalabrini Ortiz y Thames"),
            "Charcas"
        );
        assert_eq!(cleaner.clean_address("Cabello Y Coronel Diaz"), "Cabello");
        assert_eq!(
            cleaner.clean_address("Av. Santa Fe al 3500"),
            "Avenida Santa Fe 3500"
        );
        assert_eq!(cleaner.clean_address("  Gorostiaga   1700 "), "Gorostiaga 1700");
        assert_eq!(cleaner.clean_address("Guemes 4500"), "Guemes 4500");
    }

    #[test]
    fn test_load_missing_and_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("geocache.json");

        let cache = GeoCache::load(&path).unwrap();
        assert!(cache.is_empty());

        cache.insert("Guemes 4500", CacheEntry::default());
        cache.record_success(
            "Soler al 4100",
            Coordinates {
                latitude: -34.58,
                longitude: -58.42,
            },
        );
        cache.save().unwrap();

        let reloaded = GeoCache::load(&path).unwrap();
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded.failed_addresses(), vec!["Guemes 4500".to_string()]);
        assert_eq!(reloaded.get("Soler al 4100").unwrap().latitude, Some(-34.58));

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"latitude\": null"));
    }

    /// Resolves queries containing "Soler" or "Juncal"; finds nothing otherwise
    struct FakeGeocoder;

    #[async_trait]
    impl Geocoder for FakeGeocoder {
        async fn geocode(&self, query: &str) -> Result<Option<Coordinates>, GeocodeError> {
            assert!(query.ends_with(", Buenos Aires, Argentina"));
            if query.contains("Soler") || query.contains("Juncal") {
                Ok(Some(Coordinates {
                    latitude: -34.6,
                    longitude: -58.4,
                }))
            } else {
                Ok(None)
            }
        }
    }

    #[tokio::test]
    async fn test_repair_failed_merges_results() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("geocache.json");
        let cache = GeoCache::load(&path).unwrap();
        cache.insert("Soler al 4100", CacheEntry::default());
        cache.insert("Juncal 2000, Piso 3", CacheEntry::default());
        cache.insert("Cabello al 3500", CacheEntry::default());
        cache.insert("Guemes 4500", CacheEntry::default());
        cache.insert(
            "Arenales 3000",
            CacheEntry {
                latitude: Some(-34.59),
                longitude: Some(-58.40),
            },
        );
        let cache = Arc::new(cache);

        let report = repair_failed(
            Arc::clone(&cache),
            Arc::new(FakeGeocoder),
            RepairOptions {
                workers: 3,
                save_every: 1,
                region_suffix: ", Buenos Aires, Argentina".to_string(),
                min_delay: Duration::ZERO,
            },
        )
        .await
        .unwrap();

        assert_eq!(
            report,
            RepairReport {
                processed: 4,
                fixed: 2,
                still_failed: 2,
                skipped: 1
            }
        );

        let reloaded = GeoCache::load(&path).unwrap();
        assert_eq!(
            reloaded.failed_addresses(),
            vec!["Cabello al 3500".to_string(), "Guemes 4500".to_string()]
        );
        assert!(!reloaded.get("Soler al 4100").unwrap().is_failed());
        assert!(!reloaded.get("Juncal 2000, Piso 3").unwrap().is_failed());
    }

    struct AlwaysFound;

    #[async_trait]
    impl Geocoder for AlwaysFound {
        async fn geocode(&self, _query: &str) -> Result<Option<Coordinates>, GeocodeError> {
            tokio::task::yield_now().await;
            Ok(Some(Coordinates {
                latitude: -34.6,
                longitude: -58.4,
            }))
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_repair_concurrent_saves() {
        for round in 0..5 {
            let dir = TempDir::new().unwrap();
            let path = dir.path().join("geocache.json");
            let cache = GeoCache::load(&path).unwrap();
            for n in 0..400 {
                cache.insert(&format!("Soler al {}", 1000 + n), CacheEntry::default());
            }
            let cache = Arc::new(cache);

            let report = repair_failed(
                Arc::clone(&cache),
                Arc::new(AlwaysFound),
                RepairOptions {
                    workers: 16,
                    save_every: 1,
                    region_suffix: String::new(),
                    min_delay: Duration::ZERO,
                },
            )
            .await
            .unwrap_or_else(|e| panic!("round {}: {}", round, e));

            assert_eq!(report.fixed, 400);
            assert_eq!(report.still_failed, 0);

            let reloaded = GeoCache::load(&path).unwrap();
            assert_eq!(reloaded.len(), 400);
            assert!(reloaded.failed_addresses().is_empty());
            assert!(!path.with_extension("tmp").exists());
        }
    }

    #[tokio::test]
    async fn test_repair_with_nothing_failed() {
        let dir = TempDir::new().unwrap();
        let cache = Arc::new(GeoCache::load(dir.path().join("geocache.json")).unwrap());

        let report = repair_failed(
            cache,
            Arc::new(FakeGeocoder),
            RepairOptions {
                workers: 4,
                save_every: 10,
                region_suffix: String::new(),
                min_delay: Duration::ZERO,
            },
        )
        .await
        .unwrap();
        assert_eq!(report, RepairReport::default());
    }

    #[tokio::test]
    async fn test_nominatim_geocoder() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("q", "Soler 4100, Buenos Aires, Argentina"))
            .and(query_param("format", "json"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"[{"lat": "-34.5889", "lon": "-58.4200", "display_name": "Soler 4100"}]"#,
            ))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(query_param("q", "Nowhere 1"))
            .respond_with(ResponseTemplate::new(200).set_body_string("[]"))
            .mount(&server)
            .await;

        let config = GeocodingConfig {
            endpoint: format!("{}/search", server.uri()),
            ..Default::default()
        };
        let geocoder = NominatimGeocoder::new(Client::new(), &config);

        let found = geocoder
            .geocode("Soler 4100, Buenos Aires, Argentina")
            .await
            .unwrap()
            .unwrap();
        assert!((found.latitude + 34.5889).abs() < 1e-9);
        assert!((found.longitude + 58.42).abs() < 1e-9);

        assert_eq!(geocoder.geocode("Nowhere 1").await.unwrap(), None);
    }
}
