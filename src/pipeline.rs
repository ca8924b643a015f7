//! The daily run: crawl, then a filter pass, then the digest
//!
//! Each stage starts only after the previous one succeeded; a failed crawl
//! leaves its checkpoint behind and nothing downstream runs.

use crate::alerts::{build_digest, deliver, AlertSink, DeliveryReport};
use crate::config::Config;
use crate::crawler::{crawl, CrawlOptions, RunSummary};
use crate::filter::{apply_filters, FilterReport};
use crate::storage::{open_storage, Storage};
use crate::Result;
use chrono::NaiveDate;
use std::path::Path;

/// What each stage of a full run reported
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineReport {
    pub crawl: RunSummary,
    pub filter: FilterReport,
    pub delivery: DeliveryReport,
}

/// Crawls the selected query, re-marks the store and sends the day's digest
///
/// # Arguments
///
/// * `config` - The loaded configuration
/// * `options` - Query selection and page limit for the crawl
/// * `sink` - Where the digest goes
/// * `today` - The UTC date used by the filter pass and the digest
pub async fn run_all(
    config: &Config,
    options: &CrawlOptions,
    sink: &dyn AlertSink,
    today: NaiveDate,
) -> Result<PipelineReport> {
    tracing::info!("Stage 1/3: crawl");
    let crawl_summary = crawl(config, options).await?;

    tracing::info!("Stage 2/3: filter pass");
    let mut storage = open_storage(Path::new(&config.storage.database_path))?
        .with_exchange_rates(config.pricing);
    let filter = apply_filters(&mut storage, &config.filter, today)?;

    tracing::info!("Stage 3/3: digest");
    let matches = storage.list_filtered_on(today)?;
    let digest = build_digest(&matches);
    let delivery = deliver(sink, &digest, config.alerts.max_messages).await;

    Ok(PipelineReport {
        crawl: crawl_summary,
        filter,
        delivery,
    })
}
