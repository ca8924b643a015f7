//! Storage traits and error types
//!
//! This module defines the trait interface for storage backends and
//! associated error types.

use crate::storage::{NewProperty, NewQuery, PropertyRecord, QueryRecord, UpsertOutcome};
use chrono::NaiveDate;
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Property not found: {0}")]
    PropertyNotFound(i64),

    #[error("Query not found: {0}")]
    QueryNotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl StorageError {
    /// Returns true for errors scoped to a single record rather than the store
    pub fn is_record_error(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::ConstraintViolation(_))
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Trait for storage backend implementations
///
/// Every write is atomic on its own; callers never need a transaction that
/// spans records.
pub trait Storage {
    // ===== Query Management =====

    /// Registers a new named query
    ///
    /// # Returns
    ///
    /// The ID of the new query, or `ConstraintViolation` if the name or
    /// query number is already taken
    fn add_query(&mut self, query: &NewQuery) -> StorageResult<i64>;

    /// Gets a query by ID
    fn get_query(&self, query_id: i64) -> StorageResult<QueryRecord>;

    /// Gets a query by its unique name
    fn get_query_by_name(&self, name: &str) -> StorageResult<Option<QueryRecord>>;

    /// Lists all queries ordered by query number, then ID
    fn list_queries(&self) -> StorageResult<Vec<QueryRecord>>;

    /// Sets `last_run` to now
    fn touch_last_run(&mut self, query_id: i64) -> StorageResult<()>;

    /// Replaces the query number and map name of a query
    fn update_query_metadata(
        &mut self,
        query_id: i64,
        query_number: Option<i64>,
        map_name: Option<&str>,
    ) -> StorageResult<()>;

    // ===== Property Management =====

    /// Inserts a property or updates the one with the same address
    ///
    /// A new address records `scraped_at` (or now) as its first-seen
    /// `timestamp`. An existing address has every mutable field replaced
    /// while its `timestamp` and filter status are preserved. `price_dollars`
    /// is recomputed on every write.
    ///
    /// # Arguments
    ///
    /// * `property` - The listing attributes
    /// * `query_id` - The query whose crawl produced this sighting
    ///
    /// # Returns
    ///
    /// Whether the address was new and the property ID, or `Validation`
    /// if the address is empty
    fn upsert_property(
        &mut self,
        property: &NewProperty,
        query_id: i64,
    ) -> StorageResult<UpsertOutcome>;

    /// Gets a property by ID
    fn get_property(&self, property_id: i64) -> StorageResult<PropertyRecord>;

    /// Gets a property by its exact address
    fn get_by_address(&self, address: &str) -> StorageResult<Option<PropertyRecord>>;

    /// Records where a property's listing page was archived
    fn set_archived_path(&mut self, property_id: i64, path: &str) -> StorageResult<()>;

    /// Records the outcome of the filter pass for one property
    ///
    /// `filtered_at` becomes now when the property passed and is cleared
    /// otherwise; `price_total_usd` is always written.
    fn set_filter_status(
        &mut self,
        property_id: i64,
        passed: bool,
        price_total_usd: Option<f64>,
    ) -> StorageResult<()>;

    /// Clears `is_filtered` and `filtered_at` on every property
    fn reset_filter_status(&mut self) -> StorageResult<()>;

    /// Lists properties, newest first-seen first
    fn list_all(&self, filtered_only: bool) -> StorageResult<Vec<PropertyRecord>>;

    /// Lists properties that passed the filter on the given UTC date
    fn list_filtered_on(&self, date: NaiveDate) -> StorageResult<Vec<PropertyRecord>>;

    /// Lists properties that passed the filter today
    fn list_filtered_today(&self) -> StorageResult<Vec<PropertyRecord>> {
        self.list_filtered_on(chrono::Utc::now().date_naive())
    }

    // ===== Statistics =====

    /// Gets total property count
    fn count_properties(&self) -> StorageResult<u64>;

    /// Counts properties currently marked as passing the filter
    fn count_filtered(&self) -> StorageResult<u64>;

    /// Counts properties that passed the filter on the given UTC date
    fn count_filtered_on(&self, date: NaiveDate) -> StorageResult<u64>;

    /// Counts properties with an archived listing page
    fn count_archived(&self) -> StorageResult<u64>;

    /// Gets total query count
    fn count_queries(&self) -> StorageResult<u64>;
}
