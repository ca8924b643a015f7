//! Offline snapshots of listing pages
//!
//! When a property is seen for the first time its listing page is saved,
//! together with its images and stylesheets, into a directory named after the
//! property ID, the sanitized address, and the first-seen date. Archiving is
//! best-effort: callers log failures and carry on.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use scraper::{Html, Selector};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Name of the page file inside each snapshot directory
pub const INDEX_FILE: &str = "index.html";

/// Name of the asset subdirectory inside each snapshot directory
pub const ASSETS_DIR: &str = "assets";

const MAX_NAME_LEN: usize = 100;

/// Errors that can occur while archiving a listing page
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("Property {0} has no listing URL")]
    MissingUrl(i64),

    #[error("Invalid listing URL '{url}': {source}")]
    InvalidUrl {
        url: String,
        source: url::ParseError,
    },

    #[error("HTTP error fetching {url}: {source}")]
    Http { url: String, source: reqwest::Error },

    #[error("HTTP {status} fetching {url}")]
    Status { url: String, status: u16 },

    #[error("Archive IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// What to archive
#[derive(Debug, Clone, Copy)]
pub struct ArchiveRequest<'a> {
    pub property_id: i64,
    pub address: &'a str,
    pub listing_url: Option<&'a str>,
    pub scraped_at: DateTime<Utc>,
}

/// Produces a durable offline copy of a listing page
#[async_trait]
pub trait Archiver: Send + Sync {
    /// Archives the page and returns its path relative to the archive root's parent
    ///
    /// Asking again for an already archived property returns the existing
    /// path without fetching anything.
    async fn archive(&self, request: &ArchiveRequest<'_>) -> Result<String, ArchiveError>;
}

/// Makes a string safe to use as a single path component
///
/// Replaces `<>:"/\|?*` with `_`, trims surrounding dots and spaces, and
/// truncates to 100 characters.
pub fn sanitize_filename(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            other => other,
        })
        .collect();

    replaced
        .trim_matches(|c| c == '.' || c == ' ')
        .chars()
        .take(MAX_NAME_LEN)
        .collect()
}

/// Directory name for one snapshot: `{id}_{address}_{YYYYMMDD}`
pub fn snapshot_dir_name(property_id: i64, address: &str, scraped_at: &DateTime<Utc>) -> String {
    format!(
        "{}_{}_{}",
        property_id,
        sanitize_filename(address),
        scraped_at.format("%Y%m%d")
    )
}

/// Archives pages to a local directory tree
#[derive(Debug, Clone)]
pub struct FsArchiver {
    root: PathBuf,
    client: Client,
    timeout: Duration,
}

impl FsArchiver {
    /// Creates an archiver writing snapshots under `root`
    pub fn new(root: impl Into<PathBuf>, client: Client) -> Self {
        Self {
            root: root.into(),
            client,
            timeout: Duration::from_secs(15),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Returns the existing snapshot path for a property, if it was archived
    pub fn existing_path(&self, request: &ArchiveRequest<'_>) -> Option<String> {
        let dir_name =
            snapshot_dir_name(request.property_id, request.address, &request.scraped_at);
        self.root
            .join(&dir_name)
            .join(INDEX_FILE)
            .is_file()
            .then(|| self.relative_path(&dir_name))
    }

    fn relative_path(&self, dir_name: &str) -> String {
        match self.root.file_name() {
            Some(root_name) => format!(
                "{}/{}/{}",
                root_name.to_string_lossy(),
                dir_name,
                INDEX_FILE
            ),
            None => format!("{}/{}", dir_name, INDEX_FILE),
        }
    }

    async fn download(&self, url: &str) -> Result<reqwest::Response, ArchiveError> {
        let response = self
            .client
            .get(url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|source| ArchiveError::Http {
                url: url.to_string(),
                source,
            })?;

        if !response.status().is_success() {
            return Err(ArchiveError::Status {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }
        Ok(response)
    }

    /// Downloads each asset and returns original reference -> local reference
    async fn save_assets(
        &self,
        assets: Vec<AssetRef>,
        page_url: &Url,
        assets_dir: &Path,
    ) -> Result<BTreeMap<String, String>, ArchiveError> {
        let mut rewrites = BTreeMap::new();
        if assets.is_empty() {
            return Ok(rewrites);
        }

        create_dir(assets_dir).await?;

        for asset in assets {
            let Ok(asset_url) = page_url.join(&asset.reference) else {
                tracing::debug!("Skipping unresolvable asset '{}'", asset.reference);
                continue;
            };
            let file_name = asset_file_name(&asset_url, asset.kind);

            let bytes = match self.download(asset_url.as_str()).await {
                Ok(response) => match response.bytes().await {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        tracing::warn!("Failed to read asset {}: {}", asset_url, e);
                        continue;
                    }
                },
                Err(e) => {
                    tracing::warn!("Failed to download asset {}: {}", asset_url, e);
                    continue;
                }
            };

            let path = assets_dir.join(&file_name);
            tokio::fs::write(&path, &bytes)
                .await
                .map_err(|source| ArchiveError::Io { path, source })?;
            rewrites.insert(asset.reference, format!("{}/{}", ASSETS_DIR, file_name));
        }

        Ok(rewrites)
    }
}

#[async_trait]
impl Archiver for FsArchiver {
    async fn archive(&self, request: &ArchiveRequest<'_>) -> Result<String, ArchiveError> {
        if let Some(existing) = self.existing_path(request) {
            tracing::debug!(
                "Property {} already archived at {}",
                request.property_id,
                existing
            );
            return Ok(existing);
        }

        let listing_url = request
            .listing_url
            .ok_or(ArchiveError::MissingUrl(request.property_id))?;
        let page_url = Url::parse(listing_url).map_err(|source| ArchiveError::InvalidUrl {
            url: listing_url.to_string(),
            source,
        })?;

        let dir_name =
            snapshot_dir_name(request.property_id, request.address, &request.scraped_at);
        let snapshot_dir = self.root.join(&dir_name);

        tracing::info!(
            "Archiving property {} ({}) to {}",
            request.property_id,
            request.address,
            snapshot_dir.display()
        );

        let html = self
            .download(listing_url)
            .await?
            .text()
            .await
            .map_err(|source| ArchiveError::Http {
                url: listing_url.to_string(),
                source,
            })?;

        create_dir(&snapshot_dir).await?;

        let assets = find_assets(&html);
        let rewrites = self
            .save_assets(assets, &page_url, &snapshot_dir.join(ASSETS_DIR))
            .await?;

        let page = insert_metadata(&rewrite_references(&html, &rewrites), request, listing_url);
        let index = snapshot_dir.join(INDEX_FILE);
        tokio::fs::write(&index, page)
            .await
            .map_err(|source| ArchiveError::Io {
                path: index.clone(),
                source,
            })?;

        Ok(self.relative_path(&dir_name))
    }
}

async fn create_dir(path: &Path) -> Result<(), ArchiveError> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|source| ArchiveError::Io {
            path: path.to_path_buf(),
            source,
        })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AssetKind {
    Image,
    Stylesheet,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct AssetRef {
    reference: String,
    kind: AssetKind,
}

/// Collects image and stylesheet references, each once, in page order
fn find_assets(html: &str) -> Vec<AssetRef> {
    let document = Html::parse_document(html);
    let mut assets: Vec<AssetRef> = Vec::new();
    let mut push = |reference: &str, kind| {
        let reference = reference.trim();
        if reference.is_empty() || reference.starts_with("data:") {
            return;
        }
        if !assets.iter().any(|a| a.reference == reference) {
            assets.push(AssetRef {
                reference: reference.to_string(),
                kind,
            });
        }
    };

    if let Ok(img) = Selector::parse("img") {
        for element in document.select(&img) {
            let attrs = element.value();
            if let Some(src) = attrs.attr("src").or_else(|| attrs.attr("data-src")) {
                push(src, AssetKind::Image);
            }
        }
    }

    if let Ok(css) = Selector::parse("link[rel='stylesheet'][href]") {
        for element in document.select(&css) {
            if let Some(href) = element.value().attr("href") {
                push(href, AssetKind::Stylesheet);
            }
        }
    }

    assets
}

fn asset_file_name(url: &Url, kind: AssetKind) -> String {
    let base = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .map(sanitize_filename)
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "asset".to_string());

    match kind {
        AssetKind::Image if !base.contains('.') => format!("{}.jpg", base),
        AssetKind::Stylesheet if !base.ends_with(".css") => format!("{}.css", base),
        _ => base,
    }
}

/// Points every quoted attribute value that was downloaded at its local copy
fn rewrite_references(html: &str, rewrites: &BTreeMap<String, String>) -> String {
    let mut page = html.to_string();
    for (original, local) in rewrites {
        for form in [original.clone(), original.replace('&', "&amp;")] {
            page = page
                .replace(&format!("\"{}\"", form), &format!("\"{}\"", local))
                .replace(&format!("'{}'", form), &format!("'{}'", local));
        }
    }
    page
}

fn insert_metadata(html: &str, request: &ArchiveRequest<'_>, listing_url: &str) -> String {
    let comment = format!(
        "<!--\n  Archived Property Listing\n  Property ID: {}\n  Address: {}\n  Original URL: {}\n  Archived Date: {}\n-->",
        request.property_id,
        request.address.replace("--", "- -"),
        listing_url,
        request.scraped_at.format("%Y-%m-%d %H:%M:%S")
    );

    let lower = html.to_ascii_lowercase();
    let head_end = lower
        .find("<head")
        .and_then(|start| lower[start..].find('>').map(|end| start + end + 1));

    match head_end {
        Some(at) => format!("{}{}{}", &html[..at], comment, &html[at..]),
        None => format!("{}\n{}", comment, html),
    }
}
