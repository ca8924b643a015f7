//! Randomized pause between result pages

use crate::config::CrawlerConfig;
use rand::Rng;
use std::time::Duration;

/// Uniformly random delay within `[min, max]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageDelay {
    min: Duration,
    max: Duration,
}

impl PageDelay {
    /// Creates a delay range; bounds given in the wrong order are swapped
    pub fn new(min: Duration, max: Duration) -> Self {
        if min <= max {
            Self { min, max }
        } else {
            Self { min: max, max: min }
        }
    }

    pub fn from_config(config: &CrawlerConfig) -> Self {
        Self::new(
            Duration::from_millis(config.min_page_delay_ms),
            Duration::from_millis(config.max_page_delay_ms),
        )
    }

    /// No pause at all
    pub fn none() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    /// Picks the next pause length
    pub fn sample(&self) -> Duration {
        if self.min == self.max {
            return self.min;
        }
        rand::thread_rng().gen_range(self.min..=self.max)
    }

    /// Sleeps for a freshly sampled duration and returns it
    pub async fn wait(&self) -> Duration {
        let pause = self.sample();
        if !pause.is_zero() {
            tokio::time::sleep(pause).await;
        }
        pause
    }
}
