//! State module for tracking crawl progress
//!
//! # Components
//!
//! - `CrawlPhase`: the phase a crawl run is in (fetch, extract, persist, checkpoint, ...)
//!   together with the legal transitions between phases

mod crawl_phase;

pub use crawl_phase::CrawlPhase;
