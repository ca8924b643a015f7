/// Crawl phase definitions for tracking one crawl run
///
/// A run moves through `Start -> Fetch -> Extract -> Persist -> Checkpoint`
/// and loops back to `Fetch` while the site keeps offering a next page.
use std::fmt;

/// Represents the current phase of a crawl run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CrawlPhase {
    // ===== Active Phases =====
    /// Resume point not yet resolved
    Start,

    /// A page request is in flight
    Fetch,

    /// The previous attempt failed transiently and is waiting on backoff
    Retry,

    /// Splitting the page into listings and extracting attributes
    Extract,

    /// Upserting extracted listings into the store
    Persist,

    /// Saving the resume point for the next page
    Checkpoint,

    // ===== Terminal Phases =====
    /// Pagination ended or the page limit was reached
    Done,

    /// A page could not be fetched; the checkpoint was kept
    Failed,
}

impl CrawlPhase {
    /// Returns true if no further transitions are possible
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// Returns true if moving from `self` to `next` is a legal step
    pub fn can_transition_to(&self, next: CrawlPhase) -> bool {
        use CrawlPhase::*;

        matches!(
            (self, next),
            (Start, Fetch)
                | (Fetch, Retry)
                | (Fetch, Extract)
                | (Fetch, Failed)
                | (Retry, Fetch)
                | (Extract, Persist)
                | (Persist, Checkpoint)
                | (Persist, Failed)
                | (Checkpoint, Fetch)
                | (Checkpoint, Done)
                | (Checkpoint, Failed)
        )
    }

    /// Short lowercase name used in log lines
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Fetch => "fetch",
            Self::Retry => "retry",
            Self::Extract => "extract",
            Self::Persist => "persist",
            Self::Checkpoint => "checkpoint",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for CrawlPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
