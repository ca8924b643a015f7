//! Statistics generation from the property store
//!
//! This module provides functionality for extracting and displaying
//! store statistics from the storage layer.

use crate::storage::{Storage, StorageResult};
use chrono::NaiveDate;

/// Property store summary
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStatistics {
    /// Total number of stored properties
    pub total_properties: u64,

    /// Properties marked by the last filter pass
    pub filtered: u64,

    /// Properties that passed the filter on the reported date
    pub filtered_today: u64,

    /// Registered search queries
    pub queries: u64,

    /// Properties with a saved page snapshot
    pub archived: u64,
}

/// Loads statistics from storage
///
/// # Arguments
///
/// * `storage` - The storage backend to query
/// * `today` - The date used for the "filtered today" count
pub fn load_statistics<S: Storage + ?Sized>(
    storage: &S,
    today: NaiveDate,
) -> StorageResult<StoreStatistics> {
    Ok(StoreStatistics {
        total_properties: storage.count_properties()?,
        filtered: storage.count_filtered()?,
        filtered_today: storage.count_filtered_on(today)?,
        queries: storage.count_queries()?,
        archived: storage.count_archived()?,
    })
}

fn percentage(part: u64, total: u64) -> f64 {
    if total > 0 {
        (part as f64 / total as f64) * 100.0
    } else {
        0.0
    }
}

/// Prints statistics to stdout in a formatted manner
pub fn print_statistics(stats: &StoreStatistics) {
    println!("=== Property Store ===\n");

    println!("Overview:");
    println!("  Total properties: {}", stats.total_properties);
    println!("  Search queries: {}", stats.queries);
    println!();

    println!("Filter:");
    println!(
        "  Matching criteria: {} ({:.1}%)",
        stats.filtered,
        percentage(stats.filtered, stats.total_properties)
    );
    println!("  Matched today: {}", stats.filtered_today);
    println!();

    println!(
        "Archived snapshots: {} ({:.1}%)",
        stats.archived,
        percentage(stats.archived, stats.total_properties)
    );
}
