//! HTML parser for splitting a result page
//!
//! This module handles parsing a fetched result page to extract:
//! - One HTML fragment per listing card
//! - The absolute URL of the next result page, if any

use crate::config::SiteConfig;
use crate::ConfigError;
use scraper::{Html, Selector};
use url::Url;

/// Extracted information from a result page
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedPage {
    /// Outer HTML of each listing card, in page order
    pub listings: Vec<String>,

    /// Absolute URL of the next page
    pub next_page: Option<String>,
}

/// Compiled selectors and base URL for one site
#[derive(Debug, Clone)]
pub struct SiteLayout {
    pub base_url: Url,
    listing: Selector,
    next_page: Selector,
}

impl SiteLayout {
    /// Compiles the site section of the configuration
    ///
    /// # Returns
    ///
    /// * `Ok(SiteLayout)` - Selectors compiled and base URL parsed
    /// * `Err(ConfigError)` - A selector or the base URL is invalid
    pub fn from_config(site: &SiteConfig) -> Result<Self, ConfigError> {
        let base_url = Url::parse(&site.base_url)
            .map_err(|e| ConfigError::InvalidUrl(format!("{}: {}", site.base_url, e)))?;

        Ok(Self {
            base_url,
            listing: compile(&site.listing_selector)?,
            next_page: compile(&site.next_page_selector)?,
        })
    }
}

fn compile(selector: &str) -> Result<Selector, ConfigError> {
    Selector::parse(selector)
        .map_err(|e| ConfigError::InvalidSelector(format!("'{}': {:?}", selector, e)))
}

/// Parses a result page into listing fragments and the next-page link
///
/// # Arguments
///
/// * `html` - The page document
/// * `layout` - Selectors and the base URL that relative links resolve against
///
/// # Example
///
/// ```
/// use propscan::config::SiteConfig;
/// use propscan::crawler::{parse_page, SiteLayout};
///
/// let layout = SiteLayout::from_config(&SiteConfig {
///     name: "argenprop".to_string(),
///     base_url: "https://www.argenprop.com".to_string(),
///     listing_selector: "div.listing__item".to_string(),
///     next_page_selector: "a[aria-label='Siguiente']".to_string(),
/// })
/// .unwrap();
///
/// let html = r#"<div class="listing__item">A</div><a aria-label="Siguiente" href="/x?pagina-2">›</a>"#;
/// let page = parse_page(html, &layout);
/// assert_eq!(page.listings.len(), 1);
/// assert_eq!(page.next_page.as_deref(), Some("https://www.argenprop.com/x?pagina-2"));
/// ```
pub fn parse_page(html: &str, layout: &SiteLayout) -> ParsedPage {
    let document = Html::parse_document(html);

    let listings = document
        .select(&layout.listing)
        .map(|element| element.html())
        .collect();

    let next_page = document
        .select(&layout.next_page)
        .filter_map(|element| element.value().attr("href"))
        .find_map(|href| resolve_link(href, &layout.base_url));

    ParsedPage {
        listings,
        next_page,
    }
}

/// Resolves a link href to an absolute URL and validates it
///
/// Returns None if the link should be excluded:
/// - javascript:, mailto:, tel: schemes
/// - data: URIs
/// - Fragment-only anchors
/// - Invalid URLs
/// - Non-HTTP(S) URLs after resolution
pub fn resolve_link(href: &str, base_url: &Url) -> Option<String> {
    let href = href.trim();

    // Skip empty hrefs
    if href.is_empty() {
        return None;
    }

    // Skip special schemes
    if href.starts_with("javascript:")
        || href.starts_with("mailto:")
        || href.starts_with("tel:")
        || href.starts_with("data:")
    {
        return None;
    }

    // Skip fragment-only links (same page anchors)
    if href.starts_with('#') {
        return None;
    }

    match base_url.join(href) {
        Ok(absolute_url) => {
            if absolute_url.scheme() == "http" || absolute_url.scheme() == "https" {
                Some(absolute_url.to_string())
            } else {
                None
            }
        }
        Err(_) => None,
    }
}
