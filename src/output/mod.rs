//! Output module for reporting on the property store
//!
//! This module handles:
//! - Counting what the store holds
//! - Printing the counts after a crawl or on demand

pub mod stats;

pub use stats::{load_statistics, print_statistics, StoreStatistics};
