//! Listing extraction and value coercion
//!
//! A `ListingExtractor` turns one listing card into a `RawListing` of
//! best-effort text fields. `RawListing::into_property` then resolves every
//! placeholder into a typed optional value exactly once, before anything
//! reaches the store.

use crate::crawler::parser::resolve_link;
use crate::storage::NewProperty;
use crate::{ConfigError, ExtractionError};
use chrono::{DateTime, Utc};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use url::Url;

/// Placeholder the site (and older exports) use for a missing value
pub const MISSING_VALUE: &str = "N/A";

/// Attributes of one listing as found on the page; every field is optional
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawListing {
    pub address: Option<String>,
    pub currency: Option<String>,
    pub price: Option<String>,
    pub expenses: Option<String>,
    pub size: Option<String>,
    pub bedrooms: Option<String>,
    pub bathrooms: Option<String>,
    pub listing_url: Option<String>,
    pub description: Option<String>,
}

/// Maps one listing fragment to a flat attribute record
pub trait ListingExtractor: Send + Sync {
    fn extract(&self, fragment: &str) -> Result<RawListing, ExtractionError>;
}

/// Returns the trimmed value, or `None` for empty text and the missing-value placeholder
pub fn present(value: Option<&str>) -> Option<&str> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty() && !v.eq_ignore_ascii_case(MISSING_VALUE))
}

fn parse_decimal(field: &'static str, value: Option<&str>) -> Result<Option<f64>, ExtractionError> {
    present(value)
        .map(|v| {
            v.parse::<f64>()
                .ok()
                .filter(|n| n.is_finite())
                .ok_or_else(|| ExtractionError::InvalidNumber {
                    field,
                    value: v.to_string(),
                })
        })
        .transpose()
}

fn parse_count(field: &'static str, value: Option<&str>) -> Result<Option<u32>, ExtractionError> {
    present(value)
        .map(|v| {
            v.parse::<u32>().map_err(|_| ExtractionError::InvalidNumber {
                field,
                value: v.to_string(),
            })
        })
        .transpose()
}

impl RawListing {
    /// Coerces the text fields into a store-ready property
    ///
    /// # Arguments
    ///
    /// * `website` - Site name recorded on the property
    /// * `source_url` - The result page the listing was found on
    /// * `scraped_at` - First-seen time to record if the address is new
    ///
    /// # Returns
    ///
    /// The typed property, or `InvalidNumber` naming the first field whose
    /// text is present but not a number. A missing address becomes an empty
    /// one, which the store rejects.
    pub fn into_property(
        self,
        website: &str,
        source_url: &str,
        scraped_at: DateTime<Utc>,
    ) -> Result<NewProperty, ExtractionError> {
        Ok(NewProperty {
            address: present(self.address.as_deref()).unwrap_or_default().to_string(),
            currency: present(self.currency.as_deref()).map(str::to_string),
            price: parse_decimal("price", self.price.as_deref())?,
            expenses: parse_decimal("expenses", self.expenses.as_deref())?,
            size: parse_decimal("size", self.size.as_deref())?,
            bedrooms: parse_count("bedrooms", self.bedrooms.as_deref())?,
            bathrooms: parse_count("bathrooms", self.bathrooms.as_deref())?,
            listing_url: present(self.listing_url.as_deref()).map(str::to_string),
            website: Some(website.to_string()),
            source_url: Some(source_url.to_string()),
            description: present(self.description.as_deref()).map(str::to_string),
            scraped_at: Some(scraped_at),
        })
    }
}

/// Extractor for argenprop.com listing cards
#[derive(Debug, Clone)]
pub struct ArgenpropExtractor {
    base_url: Url,
    address: Selector,
    currency: Selector,
    info: Selector,
    link: Selector,
    expenses: Regex,
    size: Regex,
    bedrooms: Regex,
    bathrooms: Regex,
}

impl ArgenpropExtractor {
    /// Creates an extractor resolving listing links against `base_url`
    pub fn new(base_url: Url) -> Result<Self, ConfigError> {
        Ok(Self {
            base_url,
            address: selector(".card__address")?,
            currency: selector("span.card__currency")?,
            info: selector("p.card__info")?,
            link: selector("a[href]")?,
            expenses: pattern(r"\+\s*\$\s*([\d\.]+)\s*expensas")?,
            size: pattern(r"(\d+)\s*m²\s*cubie")?,
            bedrooms: pattern(r"(\d+)\s*dorm")?,
            bathrooms: pattern(r"(\d+)\s*baños")?,
        })
    }

    fn capture(&self, regex: &Regex, html: &str) -> Option<String> {
        regex
            .captures(html)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().replace('.', ""))
    }
}

fn selector(css: &str) -> Result<Selector, ConfigError> {
    Selector::parse(css).map_err(|e| ConfigError::InvalidSelector(format!("'{}': {:?}", css, e)))
}

fn pattern(re: &str) -> Result<Regex, ConfigError> {
    Regex::new(re).map_err(|e| ConfigError::Validation(format!("invalid pattern '{}': {}", re, e)))
}

fn element_text(element: ElementRef<'_>) -> String {
    element.text().collect::<String>().trim().to_string()
}

impl ListingExtractor for ArgenpropExtractor {
    fn extract(&self, fragment: &str) -> Result<RawListing, ExtractionError> {
        let html = Html::parse_fragment(fragment);
        let root = html.root_element();

        let currency_span = root.select(&self.currency).next();

        // Price is the bare text node right after the currency span
        let price = currency_span.and_then(|span| {
            span.next_siblings()
                .find_map(|node| node.value().as_text().map(|t| t.to_string()))
                .map(|text| text.chars().filter(char::is_ascii_digit).collect::<String>())
                .filter(|digits| !digits.is_empty())
        });

        let listing_url = root
            .select(&self.link)
            .filter_map(|a| a.value().attr("href"))
            .find_map(|href| resolve_link(href, &self.base_url));

        Ok(RawListing {
            address: root.select(&self.address).next().map(element_text),
            currency: currency_span.map(element_text),
            price,
            expenses: self.capture(&self.expenses, fragment),
            size: self.capture(&self.size, fragment),
            bedrooms: self.capture(&self.bedrooms, fragment),
            bathrooms: self.capture(&self.bathrooms, fragment),
            listing_url,
            description: root.select(&self.info).next().map(element_text),
        })
    }
}
