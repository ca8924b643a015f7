//! Database schema definitions and migrations
//!
//! This module contains all SQL schema definitions for the Propscan database.

use rusqlite::Connection;

/// Current schema version, stored in `PRAGMA user_version`
pub const SCHEMA_VERSION: u32 = 2;

/// SQL schema for the database
pub const SCHEMA_SQL: &str = r#"
-- Named searches
CREATE TABLE IF NOT EXISTS queries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    url TEXT NOT NULL,
    neighborhoods TEXT,
    bedrooms TEXT,
    created_at TEXT NOT NULL,
    last_run TEXT
);

-- One row per address ever seen
CREATE TABLE IF NOT EXISTS properties (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    address TEXT UNIQUE NOT NULL,
    currency TEXT,
    price REAL,
    price_dollars INTEGER,
    expenses REAL,
    size REAL,
    bedrooms INTEGER,
    bathrooms INTEGER,
    listing_url TEXT,
    website TEXT,
    source_url TEXT,
    description TEXT,
    timestamp TEXT NOT NULL,
    last_updated TEXT NOT NULL,
    query_id INTEGER REFERENCES queries(id),
    price_total_usd REAL,
    is_filtered INTEGER NOT NULL DEFAULT 0,
    filtered_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_properties_address ON properties(address);
CREATE INDEX IF NOT EXISTS idx_properties_is_filtered ON properties(is_filtered);
CREATE INDEX IF NOT EXISTS idx_properties_filtered_at ON properties(filtered_at);
CREATE INDEX IF NOT EXISTS idx_properties_timestamp ON properties(timestamp);
"#;

/// Columns added after the first release, as (table, column, type)
const ADDED_COLUMNS: &[(&str, &str, &str)] = &[
    ("queries", "query_number", "INTEGER"),
    ("queries", "map_name", "TEXT"),
    ("properties", "archived_path", "TEXT"),
];

/// Initializes the database schema and brings older databases up to date
///
/// # Arguments
///
/// * `conn` - The database connection
///
/// # Returns
///
/// * `Ok(())` - Schema initialized successfully
/// * `Err(rusqlite::Error)` - Failed to initialize schema
pub fn initialize_schema(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(SCHEMA_SQL)?;
    migrate(conn)?;
    Ok(())
}

/// Adds any columns and indexes missing from a database created by an older version
///
/// Safe to run repeatedly.
pub fn migrate(conn: &Connection) -> Result<(), rusqlite::Error> {
    let version = schema_version(conn)?;
    if version >= SCHEMA_VERSION {
        return Ok(());
    }

    tracing::info!(
        "Migrating database schema from version {} to {}",
        version,
        SCHEMA_VERSION
    );

    for (table, column, sql_type) in ADDED_COLUMNS {
        if !has_column(conn, table, column)? {
            tracing::info!("Adding column {}.{}", table, column);
            conn.execute_batch(&format!(
                "ALTER TABLE {} ADD COLUMN {} {}",
                table, column, sql_type
            ))?;
        }
    }

    conn.execute_batch(
        "
        CREATE UNIQUE INDEX IF NOT EXISTS idx_queries_name ON queries(name);
        CREATE UNIQUE INDEX IF NOT EXISTS idx_queries_query_number ON queries(query_number);
        ",
    )?;

    conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    Ok(())
}

/// Gets the schema version recorded in the database
pub fn schema_version(conn: &Connection) -> Result<u32, rusqlite::Error> {
    conn.query_row("PRAGMA user_version", [], |row| row.get(0))
}

fn has_column(conn: &Connection, table: &str, column: &str) -> Result<bool, rusqlite::Error> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(names.iter().any(|name| name == column))
}
