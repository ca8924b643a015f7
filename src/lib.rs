//! Propscan: a resumable real-estate listing tracker
//!
//! This crate crawls a paginated listing site, extracts structured attributes
//! from every listing, and keeps them in a SQLite store keyed by address with
//! first-seen/last-updated tracking. Interrupted crawls resume from a persisted
//! checkpoint.

pub mod alerts;
pub mod archive;
pub mod backfill;
pub mod checkpoint;
pub mod config;
pub mod crawler;
pub mod filter;
pub mod geocache;
pub mod output;
pub mod pipeline;
pub mod pricing;
pub mod state;
pub mod storage;

use thiserror::Error;

/// Main error type for Propscan operations
#[derive(Debug, Error)]
pub enum PropscanError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Page {page} failed after {attempts} attempt(s) at {url}: {source}")]
    PageFailed {
        page: u32,
        url: String,
        attempts: u32,
        source: FetchError,
    },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] storage::StorageError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] checkpoint::CheckpointError),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] ::url::ParseError),

    #[error("HTTP client error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("Invalid crawl transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: state::CrawlPhase,
        to: state::CrawlPhase,
    },

    #[error("Unknown query: {0}")]
    UnknownQuery(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid URL in config: {0}")]
    InvalidUrl(String),

    #[error("Invalid CSS selector: {0}")]
    InvalidSelector(String),
}

/// Failure of a single page fetch
///
/// Transient failures (network, timeout, overloaded server) are retried with
/// backoff; permanent ones are not.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("transient failure fetching {url}: {message}")]
    Transient { url: String, message: String },

    #[error("permanent failure fetching {url}: {message}")]
    Permanent { url: String, message: String },
}

impl FetchError {
    pub fn transient(url: &str, message: impl Into<String>) -> Self {
        Self::Transient {
            url: url.to_string(),
            message: message.into(),
        }
    }

    pub fn permanent(url: &str, message: impl Into<String>) -> Self {
        Self::Permanent {
            url: url.to_string(),
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// Failure to turn one listing fragment into a record
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExtractionError {
    #[error("field '{field}' has unparsable value '{value}'")]
    InvalidNumber { field: &'static str, value: String },

    #[error("listing fragment could not be parsed: {0}")]
    Malformed(String),
}

/// Result type alias for Propscan operations
pub type Result<T> = std::result::Result<T, PropscanError>;

/// Result type alias for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

// Re-export commonly used types
pub use config::Config;
pub use crawler::{CrawlEngine, RunOutcome, RunSummary};
pub use state::CrawlPhase;
pub use storage::{SqliteStorage, Storage};
