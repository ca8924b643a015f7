//! Propscan main entry point
//!
//! This is the command-line interface for the Propscan listing tracker.

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use propscan::alerts::{build_digest, deliver, ConsoleSink};
use propscan::backfill::{backfill_file, DEFAULT_QUERY_NAME};
use propscan::config::{load_config_with_hash, Config};
use propscan::crawler::{
    build_http_client, crawl, sync_queries, CrawlOptions, RunOutcome, RunSummary,
};
use propscan::filter::apply_filters;
use propscan::geocache::{repair_failed, GeoCache, NominatimGeocoder, RepairOptions};
use propscan::output::{load_statistics, print_statistics};
use propscan::pipeline::run_all;
use propscan::storage::{SqliteStorage, Storage};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Propscan: a resumable real-estate listing tracker
///
/// Propscan crawls paginated rental search results, stores every listing
/// keyed by address, and picks out the ones that match your criteria.
#[derive(Parser, Debug)]
#[command(name = "propscan")]
#[command(version)]
#[command(about = "A resumable real-estate listing tracker", long_about = None)]
struct Cli {
    /// Path to TOML configuration file
    #[arg(value_name = "CONFIG")]
    config: PathBuf,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Name of the configured query to crawl (defaults to the first one);
    /// with --backfill, the query imported rows are recorded under
    #[arg(long, value_name = "NAME")]
    query: Option<String>,

    /// Stop after this many pages in this run
    #[arg(long, value_name = "N")]
    max_pages: Option<u32>,

    /// Discard any saved checkpoint and start from page 1
    #[arg(long)]
    fresh: bool,

    /// Validate config and show what would be crawled without crawling
    #[arg(long, group = "mode")]
    dry_run: bool,

    /// Show statistics from the database and exit
    #[arg(long, group = "mode")]
    stats: bool,

    /// Mark properties that match the filter criteria and exit
    #[arg(long, group = "mode")]
    filter: bool,

    /// Send today's matching properties to the console
    #[arg(long, group = "mode")]
    digest: bool,

    /// Retry failed lookups in the geocode cache
    #[arg(long, group = "mode")]
    repair_geocache: bool,

    /// Copy query numbers and map names from the config to stored queries
    #[arg(long, group = "mode")]
    sync_queries: bool,

    /// Import a historical CSV export into the store and exit
    #[arg(long, group = "mode", value_name = "CSV")]
    backfill: Option<PathBuf>,

    /// Crawl, run the filter pass, then send today's matches to the console
    #[arg(long, group = "mode")]
    run_all: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose, cli.quiet);

    tracing::info!("Loading configuration from: {}", cli.config.display());
    let (config, config_hash) = load_config_with_hash(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    tracing::info!("Configuration loaded successfully (hash: {})", config_hash);

    if cli.dry_run {
        handle_dry_run(&config);
    } else if cli.stats {
        handle_stats(&config)?;
    } else if cli.filter {
        handle_filter(&config)?;
    } else if cli.digest {
        handle_digest(&config).await?;
    } else if cli.repair_geocache {
        handle_repair_geocache(&config).await?;
    } else if cli.sync_queries {
        handle_sync_queries(&config)?;
    } else if let Some(csv) = &cli.backfill {
        let query = cli.query.as_deref().unwrap_or(DEFAULT_QUERY_NAME);
        handle_backfill(&config, csv, query)?;
    } else {
        let options = CrawlOptions {
            query: cli.query,
            max_pages: cli.max_pages,
            fresh: cli.fresh,
        };
        if cli.run_all {
            handle_run_all(&config, &options).await?;
        } else {
            handle_crawl(&config, &options).await?;
        }
    }

    Ok(())
}

/// Sets up the logging/tracing subscriber based on verbosity level
fn setup_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("propscan=info,warn"),
            1 => EnvFilter::new("propscan=debug,info"),
            2 => EnvFilter::new("propscan=trace,debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .init();
}

fn open_store(config: &Config) -> anyhow::Result<SqliteStorage> {
    let path = Path::new(&config.storage.database_path);
    let storage = SqliteStorage::new(path)
        .with_context(|| format!("failed to open database {}", path.display()))?;
    Ok(storage.with_exchange_rates(config.pricing))
}

/// Handles the --dry-run mode: shows the resolved configuration
fn handle_dry_run(config: &Config) {
    println!("=== Propscan Dry Run ===\n");

    println!("Site:");
    println!("  Name: {}", config.site.name);
    println!("  Base URL: {}", config.site.base_url);
    println!("  Listing selector: {}", config.site.listing_selector);
    println!("  Next page selector: {}", config.site.next_page_selector);

    println!("\nCrawler:");
    println!("  Max attempts per page: {}", config.crawler.max_attempts);
    println!(
        "  Retry delay: {}ms doubling up to {}ms",
        config.crawler.base_retry_delay_ms, config.crawler.max_retry_delay_ms
    );
    println!("  Fetch timeout: {}ms", config.crawler.fetch_timeout_ms);
    println!(
        "  Page delay: {}-{}ms",
        config.crawler.min_page_delay_ms, config.crawler.max_page_delay_ms
    );
    match config.crawler.max_pages {
        Some(max) => println!("  Max pages: {}", max),
        None => println!("  Max pages: unlimited"),
    }

    println!("\nStorage:");
    println!("  Database: {}", config.storage.database_path);
    println!("  Checkpoint: {}", config.storage.checkpoint_path);
    println!("  Archive: {}", config.storage.archive_dir);
    println!("  Geocache: {}", config.storage.geocache_path);

    println!("\nFilter:");
    println!("  Minimum size: {}m²", config.filter.min_size);
    println!(
        "  Monthly total: ${} - ${} (at {} ARS/USD)",
        config.filter.min_price_usd, config.filter.max_price_usd, config.filter.exchange_rate
    );

    println!("\nQueries ({}):", config.queries.len());
    for entry in &config.queries {
        println!("  - {}: {}", entry.name, entry.source_url(&config.site));
    }

    println!("\n✓ Configuration is valid");
}

/// Handles the --stats mode: shows statistics from the database
fn handle_stats(config: &Config) -> anyhow::Result<()> {
    println!("Database: {}\n", config.storage.database_path);

    let storage = open_store(config)?;
    let stats = load_statistics(&storage, Utc::now().date_naive())?;
    print_statistics(&stats);

    Ok(())
}

/// Handles the --filter mode: runs a filter pass over the whole store
fn handle_filter(config: &Config) -> anyhow::Result<()> {
    let mut storage = open_store(config)?;
    let today = Utc::now().date_naive();

    let report = apply_filters(&mut storage, &config.filter, today)?;
    println!(
        "Filtered {} properties: {} first seen today, {} matching\n",
        report.total, report.seen_today, report.passed
    );

    print_statistics(&load_statistics(&storage, today)?);
    Ok(())
}

/// Handles the --digest mode: sends today's matches to the console
async fn handle_digest(config: &Config) -> anyhow::Result<()> {
    let storage = open_store(config)?;
    let properties = storage.list_filtered_today()?;

    let digest = build_digest(&properties);
    let report = deliver(&ConsoleSink, &digest, config.alerts.max_messages).await;

    if report.failed > 0 {
        anyhow::bail!("{} digest message(s) could not be delivered", report.failed);
    }
    Ok(())
}

/// Handles the --repair-geocache mode
async fn handle_repair_geocache(config: &Config) -> anyhow::Result<()> {
    let cache = GeoCache::load(&config.storage.geocache_path)
        .with_context(|| format!("failed to load {}", config.storage.geocache_path))?;
    let client = build_http_client(&config.fetcher)?;
    let geocoder = NominatimGeocoder::new(client, &config.geocoding);

    let report = repair_failed(
        Arc::new(cache),
        Arc::new(geocoder),
        RepairOptions::from_config(&config.geocoding),
    )
    .await?;

    println!("=== Geocode Repair ===\n");
    println!("  Processed: {}", report.processed);
    println!("  Fixed: {}", report.fixed);
    println!(
        "  Still failed: {} ({} unchanged by cleaning)",
        report.still_failed, report.skipped
    );
    Ok(())
}

/// Handles the --sync-queries mode
fn handle_sync_queries(config: &Config) -> anyhow::Result<()> {
    let mut storage = open_store(config)?;
    let changed = sync_queries(&mut storage, config)?;
    println!("Updated {} stored queries", changed);
    Ok(())
}

/// Handles the main crawl operation
async fn handle_crawl(config: &Config, options: &CrawlOptions) -> anyhow::Result<()> {
    if options.fresh {
        tracing::info!("Starting fresh crawl (ignoring checkpoint)");
    } else {
        tracing::info!("Starting crawl (will resume from checkpoint if present)");
    }

    let summary = match crawl(config, options).await {
        Ok(summary) => summary,
        Err(e) => {
            tracing::error!("Crawl failed: {}", e);
            return Err(e.into());
        }
    };

    print_run_summary(&summary);
    Ok(())
}

fn print_run_summary(summary: &RunSummary) {
    match summary.outcome {
        RunOutcome::Completed => tracing::info!("Crawl completed: no more pages"),
        RunOutcome::MaxPagesReached => {
            tracing::info!("Stopped at page limit; next run resumes from the checkpoint")
        }
    }
    println!(
        "Pages: {} (from page {}{}), new: {}, updated: {}, errors: {}, archived: {}",
        summary.pages,
        summary.start_page,
        if summary.resumed { ", resumed" } else { "" },
        summary.new,
        summary.updated,
        summary.errors,
        summary.archived
    );
}

/// Handles the --backfill mode: imports a CSV export through the upsert
fn handle_backfill(config: &Config, csv: &Path, query: &str) -> anyhow::Result<()> {
    let mut storage = open_store(config)?;
    let report = backfill_file(&mut storage, csv, query, config)
        .with_context(|| format!("failed to backfill from {}", csv.display()))?;

    println!("=== Backfill into '{}' ===\n", query);
    println!("  New properties: {}", report.new);
    println!("  Updated properties: {}", report.updated);
    println!("  Errors: {}", report.errors);
    println!(
        "\nDatabase now contains {} total properties",
        storage.count_properties()?
    );
    Ok(())
}

/// Handles the --run-all mode: crawl, filter pass, digest
async fn handle_run_all(config: &Config, options: &CrawlOptions) -> anyhow::Result<()> {
    let report = run_all(config, options, &ConsoleSink, Utc::now().date_naive())
        .await
        .context("daily run stopped")?;

    print_run_summary(&report.crawl);
    println!(
        "Filtered {} properties: {} first seen today, {} matching",
        report.filter.total, report.filter.seen_today, report.filter.passed
    );

    if report.delivery.failed > 0 {
        anyhow::bail!(
            "{} digest message(s) could not be delivered",
            report.delivery.failed
        );
    }
    Ok(())
}
