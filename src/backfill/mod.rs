//! Import of historical listing exports
//!
//! Reads a CSV export with one listing per row, using the store's column
//! names (`address`, `currency`, `price`, `expenses`, `size`, `bedrooms`,
//! `bathrooms`, `listing_url`, `website`, `url`, `description`, `timestamp`),
//! and feeds every row through the same upsert a crawl uses, under a named
//! query. Rows that cannot be coerced or stored are counted and skipped.

use crate::config::Config;
use crate::crawler::{present, RawListing};
use crate::storage::{NewProperty, NewQuery, QueryRecord, Storage, StorageError};
use crate::ExtractionError;
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::Deserialize;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Query that imported rows are recorded under when none is named
pub const DEFAULT_QUERY_NAME: &str = "Historical Data";

/// Errors that abort an import
#[derive(Debug, Error)]
pub enum BackfillError {
    #[error("Failed to open {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Counts from one import
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackfillReport {
    pub new: u64,
    pub updated: u64,

    /// Rows skipped because they could not be read, coerced or stored
    pub errors: u64,
}

impl BackfillReport {
    pub fn processed(&self) -> u64 {
        self.new + self.updated
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CsvRow {
    address: Option<String>,
    currency: Option<String>,
    price: Option<String>,
    expenses: Option<String>,
    size: Option<String>,
    bedrooms: Option<String>,
    bathrooms: Option<String>,
    listing_url: Option<String>,
    website: Option<String>,
    url: Option<String>,
    description: Option<String>,
    timestamp: Option<String>,
}

/// Older exports wrote counts as floats ("3.0")
fn whole_number(value: Option<String>) -> Option<String> {
    value.map(|v| match v.trim().parse::<f64>() {
        Ok(n) if n >= 0.0 && n.fract() == 0.0 => format!("{}", n as u64),
        _ => v,
    })
}

fn parse_first_seen(value: Option<&str>) -> Result<Option<DateTime<Utc>>, ExtractionError> {
    let Some(value) = present(value) else {
        return Ok(None);
    };

    if let Ok(time) = DateTime::parse_from_rfc3339(value) {
        return Ok(Some(time.with_timezone(&Utc)));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(time) = NaiveDateTime::parse_from_str(value, format) {
            return Ok(Some(Utc.from_utc_datetime(&time)));
        }
    }
    if let Some(midnight) = NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
    {
        return Ok(Some(Utc.from_utc_datetime(&midnight)));
    }

    Err(ExtractionError::Malformed(format!(
        "unreadable timestamp '{}'",
        value
    )))
}

impl CsvRow {
    fn into_property(
        self,
        default_website: &str,
        default_source: &str,
    ) -> Result<NewProperty, ExtractionError> {
        let scraped_at = parse_first_seen(self.timestamp.as_deref())?.unwrap_or_else(Utc::now);
        let website = present(self.website.as_deref())
            .unwrap_or(default_website)
            .to_string();
        let source_url = present(self.url.as_deref())
            .unwrap_or(default_source)
            .to_string();

        RawListing {
            address: self.address,
            currency: self.currency,
            price: self.price,
            expenses: self.expenses,
            size: self.size,
            bedrooms: whole_number(self.bedrooms),
            bathrooms: whole_number(self.bathrooms),
            listing_url: self.listing_url,
            description: self.description,
        }
        .into_property(&website, &source_url, scraped_at)
    }
}

/// Returns the query imported rows belong to, registering it on first use
///
/// A name that matches a configured query gets that query's URL and path
/// segments; any other name is registered against the site's base URL.
pub fn backfill_query<S: Storage>(
    storage: &mut S,
    name: &str,
    config: &Config,
) -> Result<QueryRecord, BackfillError> {
    if let Some(existing) = storage.get_query_by_name(name)? {
        tracing::info!("Using existing query: {} (ID: {})", name, existing.id);
        return Ok(existing);
    }

    let query = match config.queries.iter().find(|entry| entry.name == name) {
        Some(entry) => NewQuery {
            name: name.to_string(),
            url: entry.source_url(&config.site),
            neighborhoods: Some(entry.neighborhoods.clone()),
            bedrooms: Some(entry.bedrooms.clone()),
            query_number: entry.query_number,
            map_name: entry.map_name.clone(),
        },
        None => NewQuery {
            name: name.to_string(),
            url: config.site.base_url.clone(),
            ..Default::default()
        },
    };

    let id = storage.add_query(&query)?;
    tracing::info!("Created new query: {} (ID: {})", name, id);
    Ok(storage.get_query(id)?)
}

/// Upserts every row of a CSV export under `query`
///
/// # Arguments
///
/// * `storage` - The property store
/// * `reader` - CSV text with a header row
/// * `query` - Query the rows are recorded under
/// * `website` - Site name for rows without a `website` column
pub fn backfill_reader<S: Storage, R: Read>(
    storage: &mut S,
    reader: R,
    query: &QueryRecord,
    website: &str,
) -> Result<BackfillReport, BackfillError> {
    let mut rows = csv::Reader::from_reader(reader);
    let mut report = BackfillReport::default();

    for (index, row) in rows.deserialize::<CsvRow>().enumerate() {
        let line = index + 2;

        let row = match row {
            Ok(row) => row,
            Err(e) if e.is_io_error() => return Err(e.into()),
            Err(e) => {
                tracing::warn!("Skipping row {}: {}", line, e);
                report.errors += 1;
                continue;
            }
        };

        let property = match row.into_property(website, &query.url) {
            Ok(property) => property,
            Err(e) => {
                tracing::warn!("Skipping row {}: {}", line, e);
                report.errors += 1;
                continue;
            }
        };

        match storage.upsert_property(&property, query.id) {
            Ok(outcome) if outcome.is_new => report.new += 1,
            Ok(_) => report.updated += 1,
            Err(e) if e.is_record_error() => {
                tracing::warn!("Skipping row {} ('{}'): {}", line, property.address, e);
                report.errors += 1;
                continue;
            }
            Err(e) => return Err(e.into()),
        }

        if report.processed() % 100 == 0 {
            tracing::info!("Processed {} rows...", report.processed());
        }
    }

    Ok(report)
}

/// Imports a CSV file into the store under the query named `query_name`
pub fn backfill_file<S: Storage>(
    storage: &mut S,
    path: &Path,
    query_name: &str,
    config: &Config,
) -> Result<BackfillReport, BackfillError> {
    let file = File::open(path).map_err(|source| BackfillError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    tracing::info!("Starting backfill from: {}", path.display());
    let query = backfill_query(storage, query_name, config)?;
    let report = backfill_reader(storage, file, &query, &config.site.name)?;

    tracing::info!(
        "Backfill complete. New: {}, Updated: {}, Errors: {}",
        report.new,
        report.updated,
        report.errors
    );
    Ok(report)
}
