//! Storage module for persisting listings
//!
//! This module handles all database operations, including:
//! - SQLite database initialization, schema management and migrations
//! - Named search queries and their last run time
//! - Property upserts keyed by address with first-seen tracking
//! - Filter status and archive path bookkeeping

mod schema;
mod sqlite;
mod traits;

pub use schema::{initialize_schema, migrate, SCHEMA_VERSION};
pub use sqlite::SqliteStorage;
pub use traits::{Storage, StorageError, StorageResult};

use crate::PropscanError;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};

use std::path::Path;

/// Initializes or opens a storage database
///
/// # Arguments
///
/// * `path` - Path to the SQLite database file
///
/// # Returns
///
/// * `Ok(SqliteStorage)` - Successfully initialized storage
/// * `Err(PropscanError)` - Failed to initialize storage
pub fn open_storage(path: &Path) -> Result<SqliteStorage, PropscanError> {
    SqliteStorage::new(path)
}

/// A named search as stored in the database
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRecord {
    pub id: i64,
    pub name: String,
    pub url: String,
    pub neighborhoods: Option<String>,
    pub bedrooms: Option<String>,
    pub query_number: Option<i64>,
    pub map_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_run: Option<DateTime<Utc>>,
}

/// Fields needed to register a new query
#[derive(Debug, Clone, Default)]
pub struct NewQuery {
    pub name: String,
    pub url: String,
    pub neighborhoods: Option<String>,
    pub bedrooms: Option<String>,
    pub query_number: Option<i64>,
    pub map_name: Option<String>,
}

/// A listing as stored in the database
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyRecord {
    pub id: i64,
    pub address: String,
    pub currency: Option<String>,
    pub price: Option<f64>,
    pub price_dollars: Option<i64>,
    pub expenses: Option<f64>,
    pub size: Option<f64>,
    pub bedrooms: Option<u32>,
    pub bathrooms: Option<u32>,
    pub listing_url: Option<String>,
    pub website: Option<String>,
    pub source_url: Option<String>,
    pub description: Option<String>,
    /// First time this address was seen; never overwritten
    pub timestamp: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub query_id: Option<i64>,
    pub price_total_usd: Option<f64>,
    pub is_filtered: bool,
    pub filtered_at: Option<DateTime<Utc>>,
    pub archived_path: Option<String>,
}

/// The mutable attributes of a listing, as produced by a crawl
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewProperty {
    pub address: String,
    pub currency: Option<String>,
    pub price: Option<f64>,
    pub expenses: Option<f64>,
    pub size: Option<f64>,
    pub bedrooms: Option<u32>,
    pub bathrooms: Option<u32>,
    pub listing_url: Option<String>,
    pub website: Option<String>,
    pub source_url: Option<String>,
    pub description: Option<String>,
    /// First-seen time to record if the address is new; defaults to now
    pub scraped_at: Option<DateTime<Utc>>,
}

/// Result of an upsert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub is_new: bool,
    pub id: i64,
}

/// Formats a timestamp the way it is stored: RFC 3339, UTC, second precision
pub fn format_timestamp(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Parses a stored timestamp
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(value).map(|t| t.with_timezone(&Utc))
}

/// Formats a calendar date the way stored timestamps begin
pub fn format_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}
