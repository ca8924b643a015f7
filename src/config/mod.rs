//! Configuration module for Propscan
//!
//! This module handles loading, parsing, and validating TOML configuration files.
//!
//! # Example
//!
//! ```no_run
//! use propscan::config::load_config;
//! use std::path::Path;
//!
//! let config = load_config(Path::new("propscan.toml")).unwrap();
//! println!("Crawling {} with up to {} attempts per page", config.site.name, config.crawler.max_attempts);
//! ```

mod parser;
mod types;
mod validation;

// Re-export types
pub use types::{
    AlertsConfig, Config, CrawlerConfig, FetcherConfig, FilterConfig, GeocodingConfig, QueryEntry,
    SiteConfig, StorageConfig,
};

// Re-export parser functions
pub use parser::{
    compute_config_hash, hash_config, load_config, load_config_with_hash, parse_config,
};
