//! Filter pass over the property store
//!
//! Marks which stored properties currently satisfy the alert criteria. The
//! pass always starts from a clean slate, so running it twice over the same
//! data gives the same marks.

use crate::config::FilterConfig;
use crate::pricing::price_total_usd;
use crate::storage::{PropertyRecord, Storage, StorageResult};
use chrono::NaiveDate;

/// Outcome of evaluating one property
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilterDecision {
    pub price_total_usd: Option<f64>,
    pub passed: bool,
}

/// Counts from one filter pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FilterReport {
    /// Properties evaluated
    pub total: u64,

    /// Properties first seen on the pass date
    pub seen_today: u64,

    /// Properties that passed every criterion
    pub passed: u64,
}

/// Evaluates one property against the criteria
///
/// A property passes when its size is unknown or at least `min_size`, its
/// monthly total lies within `[min_price_usd, max_price_usd]`, and it was
/// first seen on `today`.
pub fn evaluate(
    property: &PropertyRecord,
    criteria: &FilterConfig,
    today: NaiveDate,
) -> FilterDecision {
    let total = price_total_usd(
        property.currency.as_deref(),
        property.price,
        property.expenses,
        criteria.exchange_rate,
    );

    let size_ok = property.size.map_or(true, |size| size >= criteria.min_size);
    let price_ok =
        total.is_some_and(|t| t >= criteria.min_price_usd && t <= criteria.max_price_usd);
    let date_ok = property.timestamp.date_naive() == today;

    FilterDecision {
        price_total_usd: total,
        passed: size_ok && price_ok && date_ok,
    }
}

/// Resets every filter mark, then evaluates and marks every property
///
/// # Arguments
///
/// * `store` - The property store
/// * `criteria` - Size and price bounds plus the rate for the monthly total
/// * `today` - The UTC date a property must have been first seen on
pub fn apply_filters<S: Storage>(
    store: &mut S,
    criteria: &FilterConfig,
    today: NaiveDate,
) -> StorageResult<FilterReport> {
    store.reset_filter_status()?;

    let properties = store.list_all(false)?;
    tracing::info!("Processing {} total properties", properties.len());

    let mut report = FilterReport {
        total: properties.len() as u64,
        ..Default::default()
    };

    for property in &properties {
        if property.timestamp.date_naive() == today {
            report.seen_today += 1;
        }

        let decision = evaluate(property, criteria, today);
        store.set_filter_status(property.id, decision.passed, decision.price_total_usd)?;

        if decision.passed {
            tracing::debug!("Property {} passed: {}", property.id, property.address);
            report.passed += 1;
        }
    }

    tracing::info!(
        "Found {} properties first seen today; {} match the criteria",
        report.seen_today,
        report.passed
    );
    Ok(report)
}
