use crate::config::types::{
    AlertsConfig, Config, CrawlerConfig, FilterConfig, GeocodingConfig, QueryEntry, SiteConfig,
    StorageConfig,
};
use crate::pricing::ExchangeRates;
use crate::ConfigError;
use scraper::Selector;
use std::collections::HashSet;
use url::Url;

/// Validates the entire configuration
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    validate_crawler_config(&config.crawler)?;
    validate_site_config(&config.site)?;
    validate_storage_config(&config.storage)?;
    validate_pricing(&config.pricing)?;
    validate_filter_config(&config.filter)?;
    validate_alerts_config(&config.alerts)?;
    validate_geocoding_config(&config.geocoding)?;
    validate_queries(&config.queries)?;
    Ok(())
}

/// Validates crawler configuration
fn validate_crawler_config(config: &CrawlerConfig) -> Result<(), ConfigError> {
    if config.max_attempts < 1 {
        return Err(ConfigError::Validation(format!(
            "max_attempts must be >= 1, got {}",
            config.max_attempts
        )));
    }

    if config.max_retry_delay_ms < config.base_retry_delay_ms {
        return Err(ConfigError::Validation(format!(
            "max_retry_delay_ms ({}) must be >= base_retry_delay_ms ({})",
            config.max_retry_delay_ms, config.base_retry_delay_ms
        )));
    }

    if config.fetch_timeout_ms == 0 {
        return Err(ConfigError::Validation(
            "fetch_timeout_ms must be > 0".to_string(),
        ));
    }

    if config.min_page_delay_ms > config.max_page_delay_ms {
        return Err(ConfigError::Validation(format!(
            "min_page_delay_ms ({}) must be <= max_page_delay_ms ({})",
            config.min_page_delay_ms, config.max_page_delay_ms
        )));
    }

    if config.max_pages == Some(0) {
        return Err(ConfigError::Validation(
            "max_pages must be >= 1 when set".to_string(),
        ));
    }

    Ok(())
}

/// Validates the site layout
fn validate_site_config(config: &SiteConfig) -> Result<(), ConfigError> {
    if config.name.trim().is_empty() {
        return Err(ConfigError::Validation(
            "site name cannot be empty".to_string(),
        ));
    }

    let base = Url::parse(&config.base_url)
        .map_err(|e| ConfigError::InvalidUrl(format!("Invalid base_url: {}", e)))?;

    if base.scheme() != "http" && base.scheme() != "https" {
        return Err(ConfigError::InvalidUrl(format!(
            "base_url '{}' must use http or https",
            config.base_url
        )));
    }

    validate_selector(&config.listing_selector)?;
    validate_selector(&config.next_page_selector)?;

    Ok(())
}

fn validate_selector(selector: &str) -> Result<(), ConfigError> {
    Selector::parse(selector)
        .map(|_| ())
        .map_err(|_| ConfigError::InvalidSelector(selector.to_string()))
}

/// Validates storage paths
fn validate_storage_config(config: &StorageConfig) -> Result<(), ConfigError> {
    for (name, value) in [
        ("database_path", &config.database_path),
        ("checkpoint_path", &config.checkpoint_path),
        ("archive_dir", &config.archive_dir),
        ("geocache_path", &config.geocache_path),
    ] {
        if value.is_empty() {
            return Err(ConfigError::Validation(format!("{} cannot be empty", name)));
        }
    }

    Ok(())
}

fn validate_pricing(rates: &ExchangeRates) -> Result<(), ConfigError> {
    if rates.peso_to_usd <= 0.0 {
        return Err(ConfigError::Validation(format!(
            "peso_to_usd must be > 0, got {}",
            rates.peso_to_usd
        )));
    }
    Ok(())
}

/// Validates filter criteria
fn validate_filter_config(config: &FilterConfig) -> Result<(), ConfigError> {
    if config.exchange_rate <= 0.0 {
        return Err(ConfigError::Validation(format!(
            "filter exchange_rate must be > 0, got {}",
            config.exchange_rate
        )));
    }

    if config.min_size < 0.0 {
        return Err(ConfigError::Validation(format!(
            "min_size must be >= 0, got {}",
            config.min_size
        )));
    }

    if config.min_price_usd > config.max_price_usd {
        return Err(ConfigError::Validation(format!(
            "min_price_usd ({}) must be <= max_price_usd ({})",
            config.min_price_usd, config.max_price_usd
        )));
    }

    Ok(())
}

fn validate_alerts_config(config: &AlertsConfig) -> Result<(), ConfigError> {
    if config.max_messages < 1 {
        return Err(ConfigError::Validation(
            "alerts max_messages must be >= 1".to_string(),
        ));
    }
    Ok(())
}

/// Validates geocode repair settings
fn validate_geocoding_config(config: &GeocodingConfig) -> Result<(), ConfigError> {
    Url::parse(&config.endpoint)
        .map_err(|e| ConfigError::InvalidUrl(format!("Invalid geocoding endpoint: {}", e)))?;

    if config.workers < 1 || config.workers > 32 {
        return Err(ConfigError::Validation(format!(
            "geocoding workers must be between 1 and 32, got {}",
            config.workers
        )));
    }

    if config.save_every < 1 {
        return Err(ConfigError::Validation(
            "geocoding save_every must be >= 1".to_string(),
        ));
    }

    if config.timeout_ms == 0 {
        return Err(ConfigError::Validation(
            "geocoding timeout_ms must be > 0".to_string(),
        ));
    }

    Ok(())
}

/// Validates query entries
fn validate_queries(queries: &[QueryEntry]) -> Result<(), ConfigError> {
    if queries.is_empty() {
        return Err(ConfigError::Validation(
            "at least one [[query]] must be configured".to_string(),
        ));
    }

    let mut names = HashSet::new();
    let mut numbers = HashSet::new();

    for query in queries {
        if query.name.trim().is_empty() {
            return Err(ConfigError::Validation(
                "query name cannot be empty".to_string(),
            ));
        }

        if !names.insert(query.name.as_str()) {
            return Err(ConfigError::Validation(format!(
                "duplicate query name '{}'",
                query.name
            )));
        }

        if let Some(number) = query.query_number {
            if !numbers.insert(number) {
                return Err(ConfigError::Validation(format!(
                    "duplicate query_number {} (query '{}')",
                    number, query.name
                )));
            }
        }

        match &query.url {
            Some(url) => {
                Url::parse(url).map_err(|e| {
                    ConfigError::InvalidUrl(format!("Invalid url for query '{}': {}", query.name, e))
                })?;
            }
            None => {
                if query.neighborhoods.is_empty() || query.bedrooms.is_empty() {
                    return Err(ConfigError::Validation(format!(
                        "query '{}' needs neighborhoods and bedrooms or an explicit url",
                        query.name
                    )));
                }
            }
        }
    }

    Ok(())
}
