//! SQLite storage implementation
//!
//! This module provides a SQLite-based implementation of the Storage trait.

use crate::pricing::{self, ExchangeRates};
use crate::storage::schema::initialize_schema;
use crate::storage::traits::{Storage, StorageError, StorageResult};
use crate::storage::{
    format_date, format_timestamp, parse_timestamp, NewProperty, NewQuery, PropertyRecord,
    QueryRecord, UpsertOutcome,
};
use crate::PropscanError;
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use std::path::Path;

const PROPERTY_COLUMNS: &str = "id, address, currency, price, price_dollars, expenses, size,
     bedrooms, bathrooms, listing_url, website, source_url, description, timestamp,
     last_updated, query_id, price_total_usd, is_filtered, filtered_at, archived_path";

const QUERY_COLUMNS: &str =
    "id, name, url, neighborhoods, bedrooms, query_number, map_name, created_at, last_run";

/// SQLite storage backend
pub struct SqliteStorage {
    conn: Connection,
    rates: ExchangeRates,
}

impl SqliteStorage {
    /// Creates a new SqliteStorage instance
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the SQLite database file
    ///
    /// # Returns
    ///
    /// * `Ok(SqliteStorage)` - Successfully opened/created database
    /// * `Err(PropscanError)` - Failed to open database
    pub fn new(path: &Path) -> Result<Self, PropscanError> {
        let conn = Connection::open(path)?;

        // Configure SQLite for better performance
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            PRAGMA temp_store = MEMORY;
        ",
        )?;

        // Initialize schema
        initialize_schema(&conn)?;

        Ok(Self {
            conn,
            rates: ExchangeRates::default(),
        })
    }

    /// Creates an in-memory database (for testing)
    #[cfg(test)]
    pub fn new_in_memory() -> Result<Self, PropscanError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        initialize_schema(&conn)?;
        Ok(Self {
            conn,
            rates: ExchangeRates::default(),
        })
    }

    /// Uses the given rates when deriving `price_dollars`
    pub fn with_exchange_rates(mut self, rates: ExchangeRates) -> Self {
        self.rates = rates;
        self
    }

    fn query_properties(
        &self,
        sql_where: &str,
        params: impl rusqlite::Params,
    ) -> StorageResult<Vec<PropertyRecord>> {
        let sql = format!(
            "SELECT {} FROM properties {} ORDER BY timestamp DESC, id DESC",
            PROPERTY_COLUMNS, sql_where
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let properties = stmt
            .query_map(params, property_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(properties)
    }

    fn count(&self, sql: &str, params: impl rusqlite::Params) -> StorageResult<u64> {
        let count: i64 = self.conn.query_row(sql, params, |row| row.get(0))?;
        Ok(count as u64)
    }
}

fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let value: String = row.get(idx)?;
    parse_timestamp(&value)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn optional_timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let value: Option<String> = row.get(idx)?;
    value
        .map(|v| {
            parse_timestamp(&v).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
            })
        })
        .transpose()
}

fn property_from_row(row: &Row<'_>) -> rusqlite::Result<PropertyRecord> {
    Ok(PropertyRecord {
        id: row.get(0)?,
        address: row.get(1)?,
        currency: row.get(2)?,
        price: row.get(3)?,
        price_dollars: row.get(4)?,
        expenses: row.get(5)?,
        size: row.get(6)?,
        bedrooms: row.get(7)?,
        bathrooms: row.get(8)?,
        listing_url: row.get(9)?,
        website: row.get(10)?,
        source_url: row.get(11)?,
        description: row.get(12)?,
        timestamp: timestamp_column(row, 13)?,
        last_updated: timestamp_column(row, 14)?,
        query_id: row.get(15)?,
        price_total_usd: row.get(16)?,
        is_filtered: row.get(17)?,
        filtered_at: optional_timestamp_column(row, 18)?,
        archived_path: row.get(19)?,
    })
}

fn query_from_row(row: &Row<'_>) -> rusqlite::Result<QueryRecord> {
    Ok(QueryRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        url: row.get(2)?,
        neighborhoods: row.get(3)?,
        bedrooms: row.get(4)?,
        query_number: row.get(5)?,
        map_name: row.get(6)?,
        created_at: timestamp_column(row, 7)?,
        last_run: optional_timestamp_column(row, 8)?,
    })
}

/// Maps a UNIQUE violation to a record-level error, leaving other failures as-is
fn map_constraint(err: rusqlite::Error, context: impl FnOnce() -> String) -> StorageError {
    match err {
        rusqlite::Error::SqliteFailure(ref e, _) if e.code == ErrorCode::ConstraintViolation => {
            StorageError::ConstraintViolation(context())
        }
        other => StorageError::Sqlite(other),
    }
}

impl Storage for SqliteStorage {
    // ===== Query Management =====

    fn add_query(&mut self, query: &NewQuery) -> StorageResult<i64> {
        let now = format_timestamp(&Utc::now());
        self.conn
            .execute(
                "INSERT INTO queries (name, url, neighborhoods, bedrooms, query_number, map_name, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    query.name,
                    query.url,
                    query.neighborhoods,
                    query.bedrooms,
                    query.query_number,
                    query.map_name,
                    now
                ],
            )
            .map_err(|e| map_constraint(e, || format!("query '{}' already exists", query.name)))?;

        let id = self.conn.last_insert_rowid();
        tracing::info!("Added query '{}' with ID {}", query.name, id);
        Ok(id)
    }

    fn get_query(&self, query_id: i64) -> StorageResult<QueryRecord> {
        let sql = format!("SELECT {} FROM queries WHERE id = ?1", QUERY_COLUMNS);
        self.conn
            .query_row(&sql, params![query_id], query_from_row)
            .optional()?
            .ok_or_else(|| StorageError::QueryNotFound(format!("Query ID {}", query_id)))
    }

    fn get_query_by_name(&self, name: &str) -> StorageResult<Option<QueryRecord>> {
        let sql = format!("SELECT {} FROM queries WHERE name = ?1", QUERY_COLUMNS);
        let query = self
            .conn
            .query_row(&sql, params![name], query_from_row)
            .optional()?;
        Ok(query)
    }

    fn list_queries(&self) -> StorageResult<Vec<QueryRecord>> {
        let sql = format!(
            "SELECT {} FROM queries ORDER BY query_number IS NULL, query_number, id",
            QUERY_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let queries = stmt
            .query_map([], query_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(queries)
    }

    fn touch_last_run(&mut self, query_id: i64) -> StorageResult<()> {
        let now = format_timestamp(&Utc::now());
        let updated = self.conn.execute(
            "UPDATE queries SET last_run = ?1 WHERE id = ?2",
            params![now, query_id],
        )?;

        if updated == 0 {
            return Err(StorageError::QueryNotFound(format!("Query ID {}", query_id)));
        }
        Ok(())
    }

    fn update_query_metadata(
        &mut self,
        query_id: i64,
        query_number: Option<i64>,
        map_name: Option<&str>,
    ) -> StorageResult<()> {
        let updated = self
            .conn
            .execute(
                "UPDATE queries SET query_number = ?1, map_name = ?2 WHERE id = ?3",
                params![query_number, map_name, query_id],
            )
            .map_err(|e| {
                map_constraint(e, || format!("query_number {:?} is already taken", query_number))
            })?;

        if updated == 0 {
            return Err(StorageError::QueryNotFound(format!("Query ID {}", query_id)));
        }
        Ok(())
    }

    // ===== Property Management =====

    fn upsert_property(
        &mut self,
        property: &NewProperty,
        query_id: i64,
    ) -> StorageResult<UpsertOutcome> {
        if property.address.trim().is_empty() {
            return Err(StorageError::Validation(
                "property must have an address".to_string(),
            ));
        }

        let now = format_timestamp(&Utc::now());
        let price_dollars =
            pricing::price_dollars(property.currency.as_deref(), property.price, &self.rates);

        let tx = self.conn.transaction()?;

        let existing: Option<i64> = tx
            .query_row(
                "SELECT id FROM properties WHERE address = ?1",
                params![property.address],
                |row| row.get(0),
            )
            .optional()?;

        let outcome = match existing {
            Some(id) => {
                // timestamp and the filter columns stay as they are
                tx.execute(
                    "UPDATE properties SET
                        currency = ?1, price = ?2, price_dollars = ?3, expenses = ?4, size = ?5,
                        bedrooms = ?6, bathrooms = ?7, listing_url = ?8, website = ?9,
                        source_url = ?10, description = ?11, last_updated = ?12, query_id = ?13
                     WHERE id = ?14",
                    params![
                        property.currency,
                        property.price,
                        price_dollars,
                        property.expenses,
                        property.size,
                        property.bedrooms,
                        property.bathrooms,
                        property.listing_url,
                        property.website,
                        property.source_url,
                        property.description,
                        now,
                        query_id,
                        id
                    ],
                )?;
                UpsertOutcome { is_new: false, id }
            }
            None => {
                let first_seen = property
                    .scraped_at
                    .map(|t| format_timestamp(&t))
                    .unwrap_or_else(|| now.clone());

                tx.execute(
                    "INSERT INTO properties (
                        address, currency, price, price_dollars, expenses, size, bedrooms,
                        bathrooms, listing_url, website, source_url, description, timestamp,
                        last_updated, query_id
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                    params![
                        property.address,
                        property.currency,
                        property.price,
                        price_dollars,
                        property.expenses,
                        property.size,
                        property.bedrooms,
                        property.bathrooms,
                        property.listing_url,
                        property.website,
                        property.source_url,
                        property.description,
                        first_seen,
                        now,
                        query_id
                    ],
                )?;
                UpsertOutcome {
                    is_new: true,
                    id: tx.last_insert_rowid(),
                }
            }
        };

        tx.commit()?;
        Ok(outcome)
    }

    fn get_property(&self, property_id: i64) -> StorageResult<PropertyRecord> {
        let sql = format!("SELECT {} FROM properties WHERE id = ?1", PROPERTY_COLUMNS);
        self.conn
            .query_row(&sql, params![property_id], property_from_row)
            .optional()?
            .ok_or(StorageError::PropertyNotFound(property_id))
    }

    fn get_by_address(&self, address: &str) -> StorageResult<Option<PropertyRecord>> {
        let sql = format!("SELECT {} FROM properties WHERE address = ?1", PROPERTY_COLUMNS);
        let property = self
            .conn
            .query_row(&sql, params![address], property_from_row)
            .optional()?;
        Ok(property)
    }

    fn set_archived_path(&mut self, property_id: i64, path: &str) -> StorageResult<()> {
        let updated = self.conn.execute(
            "UPDATE properties SET archived_path = ?1 WHERE id = ?2",
            params![path, property_id],
        )?;

        if updated == 0 {
            return Err(StorageError::PropertyNotFound(property_id));
        }
        Ok(())
    }

    fn set_filter_status(
        &mut self,
        property_id: i64,
        passed: bool,
        price_total_usd: Option<f64>,
    ) -> StorageResult<()> {
        let filtered_at = passed.then(|| format_timestamp(&Utc::now()));
        let updated = self.conn.execute(
            "UPDATE properties SET is_filtered = ?1, filtered_at = ?2, price_total_usd = ?3
             WHERE id = ?4",
            params![passed, filtered_at, price_total_usd, property_id],
        )?;

        if updated == 0 {
            return Err(StorageError::PropertyNotFound(property_id));
        }
        Ok(())
    }

    fn reset_filter_status(&mut self) -> StorageResult<()> {
        let reset = self
            .conn
            .execute("UPDATE properties SET is_filtered = 0, filtered_at = NULL", [])?;
        tracing::info!("Reset filter status on {} properties", reset);
        Ok(())
    }

    fn list_all(&self, filtered_only: bool) -> StorageResult<Vec<PropertyRecord>> {
        if filtered_only {
            self.query_properties("WHERE is_filtered = 1", [])
        } else {
            self.query_properties("", [])
        }
    }

    fn list_filtered_on(&self, date: NaiveDate) -> StorageResult<Vec<PropertyRecord>> {
        self.query_properties(
            "WHERE is_filtered = 1 AND substr(filtered_at, 1, 10) = ?1",
            params![format_date(date)],
        )
    }

    // ===== Statistics =====

    fn count_properties(&self) -> StorageResult<u64> {
        self.count("SELECT COUNT(*) FROM properties", [])
    }

    fn count_filtered(&self) -> StorageResult<u64> {
        self.count("SELECT COUNT(*) FROM properties WHERE is_filtered = 1", [])
    }

    fn count_filtered_on(&self, date: NaiveDate) -> StorageResult<u64> {
        self.count(
            "SELECT COUNT(*) FROM properties
             WHERE is_filtered = 1 AND substr(filtered_at, 1, 10) = ?1",
            params![format_date(date)],
        )
    }

    fn count_archived(&self) -> StorageResult<u64> {
        self.count(
            "SELECT COUNT(*) FROM properties WHERE archived_path IS NOT NULL",
            [],
        )
    }

    fn count_queries(&self) -> StorageResult<u64> {
        self.count("SELECT COUNT(*) FROM queries", [])
    }
}
