//! Daily digest of filtered properties
//!
//! Builds one summary line plus one message per property and hands them to
//! an `AlertSink`. Delivery keeps going past individual failures and caps
//! the number of property messages, ending with a "+N more" notice.

use crate::storage::PropertyRecord;
use async_trait::async_trait;
use thiserror::Error;

/// Errors raised by an alert sink
#[derive(Debug, Error)]
pub enum AlertError {
    #[error("Alert delivery failed: {0}")]
    Delivery(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Outbound channel for alert messages
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send(&self, message: &str) -> Result<(), AlertError>;
}

/// A summary line and one message per property, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Digest {
    pub summary: String,
    pub messages: Vec<String>,
}

/// What happened to a digest on its way out
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Messages accepted by the sink, including summary and notice
    pub sent: usize,

    /// Messages the sink rejected
    pub failed: usize,

    /// Property messages left out because of the cap
    pub omitted: usize,
}

/// Formats one property as an alert message
pub fn format_property(property: &PropertyRecord) -> String {
    let mut message = format!("📍 {}", property.address);

    match property.price_total_usd {
        Some(total) => message.push_str(&format!("\n💵 ${:.0}/month", total)),
        None => message.push_str("\n💵 price on request"),
    }

    let size = property
        .size
        .map(|s| format!("{:.0}m²", s))
        .unwrap_or_else(|| "?m²".to_string());
    let bedrooms = property
        .bedrooms
        .map(|b| b.to_string())
        .unwrap_or_else(|| "?".to_string());
    message.push_str(&format!("\n📏 {} | 🛏️ {} bed", size, bedrooms));

    if let Some(url) = &property.listing_url {
        message.push_str(&format!("\n🔗 {}", url));
    }
    message
}

/// Builds the digest for a list of properties
pub fn build_digest(properties: &[PropertyRecord]) -> Digest {
    let summary = match properties.len() {
        0 => "No new properties matched today".to_string(),
        1 => "1 new property matched today".to_string(),
        n => format!("{} new properties matched today", n),
    };

    Digest {
        summary,
        messages: properties.iter().map(format_property).collect(),
    }
}

/// Sends a digest, tolerating individual failures
///
/// Sends the summary, then the first `cap` property messages in order, then
/// a "+N more" notice if any were left out.
pub async fn deliver(sink: &dyn AlertSink, digest: &Digest, cap: usize) -> DeliveryReport {
    let mut report = DeliveryReport {
        omitted: digest.messages.len().saturating_sub(cap),
        ..Default::default()
    };

    let notice = (report.omitted > 0).then(|| format!("+{} more", report.omitted));
    let outgoing = std::iter::once(&digest.summary)
        .chain(digest.messages.iter().take(cap))
        .chain(notice.as_ref());

    for message in outgoing {
        match sink.send(message).await {
            Ok(()) => report.sent += 1,
            Err(e) => {
                tracing::warn!("Failed to send alert message: {}", e);
                report.failed += 1;
            }
        }
    }

    tracing::info!(
        "Delivered digest: {} sent, {} failed, {} omitted",
        report.sent,
        report.failed,
        report.omitted
    );
    report
}

/// Prints messages to stdout, separated by blank lines
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsoleSink;

#[async_trait]
impl AlertSink for ConsoleSink {
    async fn send(&self, message: &str) -> Result<(), AlertError> {
        println!("{}\n", message);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<String>>,
        fail_on: Option<String>,
    }

    #[async_trait]
    impl AlertSink for RecordingSink {
        async fn send(&self, message: &str) -> Result<(), AlertError> {
            if self.fail_on.as_deref().is_some_and(|f| message.contains(f)) {
                return Err(AlertError::Delivery("rejected".to_string()));
            }
            self.sent.lock().unwrap().push(message.to_string());
            Ok(())
        }
    }

    fn property(address: &str) -> PropertyRecord {
        let now = Utc::now();
        PropertyRecord {
            id: 1,
            address: address.to_string(),
            currency: Some("USD".to_string()),
            price: Some(700.0),
            price_dollars: Some(700),
            expenses: Some(120_000.0),
            size: Some(95.0),
            bedrooms: Some(3),
            bathrooms: Some(2),
            listing_url: Some(format!("https://site.test/{}", address.len())),
            website: Some("argenprop".to_string()),
            source_url: None,
            description: None,
            timestamp: now,
            last_updated: now,
            query_id: Some(1),
            price_total_usd: Some(800.0),
            is_filtered: true,
            filtered_at: Some(now),
            archived_path: None,
        }
    }

    #[test]
    fn test_format_property() {
        let message = format_property(&property("Guemes al 4500"));
        assert_eq!(
            message,
            "📍 Guemes al 4500\n💵 $800/month\n📏 95m² | 🛏️ 3 bed\n🔗 https://site.test/14"
        );
    }

    #[test]
    fn test_format_property_with_unknowns() {
        let mut p = property("Soler 4100");
        p.size = None;
        p.bedrooms = None;
        p.price_total_usd = None;
        p.listing_url = None;
        assert_eq!(
            format_property(&p),
            "📍 Soler 4100\n💵 price on request\n📏 ?m² | 🛏️ ? bed"
        );
    }

    #[test]
    fn test_digest_summary() {
        assert_eq!(build_digest(&[]).summary, "No new properties matched today");
        let digest = build_digest(&[property("A 1"), property("B 2")]);
        assert_eq!(digest.summary, "2 new properties matched today");
        assert_eq!(digest.messages.len(), 2);
    }

    #[tokio::test]
    async fn test_deliver_caps_and_adds_notice() {
        let properties: Vec<_> = (1..=5).map(|i| property(&format!("Calle {}", i))).collect();
        let digest = build_digest(&properties);
        let sink = RecordingSink::default();

        let report = deliver(&sink, &digest, 3).await;

        assert_eq!(
            report,
            DeliveryReport {
                sent: 5,
                failed: 0,
                omitted: 2
            }
        );
        let sent = sink.sent.lock().unwrap();
        assert_eq!(sent[0], "5 new properties matched today");
        assert!(sent[1].contains("Calle 1"));
        assert!(sent[3].contains("Calle 3"));
        assert_eq!(sent[4], "+2 more");
    }

    #[tokio::test]
    async fn test_deliver_continues_after_failure() {
        let properties: Vec<_> = (1..=3).map(|i| property(&format!("Calle {}", i))).collect();
        let digest = build_digest(&properties);
        let sink = RecordingSink {
            fail_on: Some("Calle 2".to_string()),
            ..Default::default()
        };

        let report = deliver(&sink, &digest, 10).await;

        assert_eq!(report.sent, 3);
        assert_eq!(report.failed, 1);
        assert_eq!(report.omitted, 0);
        let sent = sink.sent.lock().unwrap();
        assert!(sent.last().unwrap().contains("Calle 3"));
    }
}
