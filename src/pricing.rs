//! Price normalization
//!
//! Listings are quoted either in pesos (`"$"`) or in dollars (`"USD"`, `"U$S"`).
//! Two different rates are in play: the nominal rate used to derive the stored
//! `price_dollars`, and the rate the filter pass uses for the monthly total.

use serde::Deserialize;

/// Currency symbol the site uses for pesos
pub const PESO_SYMBOL: &str = "$";

/// Nominal exchange rates used when normalizing prices
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct ExchangeRates {
    /// Pesos per dollar used for `price_dollars`
    #[serde(rename = "peso-to-usd", default = "default_peso_to_usd")]
    pub peso_to_usd: f64,
}

fn default_peso_to_usd() -> f64 {
    1500.0
}

impl Default for ExchangeRates {
    fn default() -> Self {
        Self {
            peso_to_usd: default_peso_to_usd(),
        }
    }
}

fn is_pesos(currency: Option<&str>) -> bool {
    currency.map(str::trim) == Some(PESO_SYMBOL)
}

/// Normalizes a listed price to whole dollars
///
/// Pesos are divided by the rate; any other currency passes through. The
/// result is rounded to the nearest integer. Absent or zero prices have no
/// dollar value.
pub fn price_dollars(
    currency: Option<&str>,
    price: Option<f64>,
    rates: &ExchangeRates,
) -> Option<i64> {
    let price = price.filter(|p| *p != 0.0)?;

    let dollars = if is_pesos(currency) {
        price / rates.peso_to_usd
    } else {
        price
    };

    Some(dollars.round() as i64)
}

/// Computes the monthly total in dollars including building expenses
///
/// Expenses are always quoted in pesos and are converted with `rate`;
/// missing expenses count as zero.
pub fn price_total_usd(
    currency: Option<&str>,
    price: Option<f64>,
    expenses: Option<f64>,
    rate: f64,
) -> Option<f64> {
    let price = price.filter(|p| *p != 0.0)?;
    let expenses = expenses.unwrap_or(0.0);

    if is_pesos(currency) {
        Some(price / rate + expenses / rate)
    } else {
        Some(price + expenses / rate)
    }
}
