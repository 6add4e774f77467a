use crate::config::FetchConfig;
use crate::types::{FetchError, Page};
use async_trait::async_trait;
use backoff::{backoff::Backoff, exponential::ExponentialBackoff};
use interfaces::defs::PageFetcher;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Wraps a [`PageFetcher`] and retries its transient failures with
/// exponential backoff. Permanent failures are returned at once.
pub struct RetryingFetcher {
    inner: Arc<dyn PageFetcher>,
    config: FetchConfig,
}

impl RetryingFetcher {
    pub fn new(inner: Arc<dyn PageFetcher>, config: FetchConfig) -> Self {
        Self { inner, config }
    }

    fn backoff(&self) -> ExponentialBackoff<backoff::SystemClock> {
        ExponentialBackoff {
            current_interval: self.config.retry_delay,
            initial_interval: self.config.retry_delay,
            max_interval: self.config.max_retry_delay,
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}

#[async_trait]
impl PageFetcher for RetryingFetcher {
    async fn fetch(&self, url: &str) -> Result<Page, FetchError> {
        let mut backoff = self.backoff();

        for attempt in 0..=self.config.max_retries {
            match self.inner.fetch(url).await {
                Ok(page) => {
                    debug!("Fetched {} ({} bytes, status {})", url, page.body.len(), page.status);
                    return Ok(page);
                }
                Err(e) if e.is_transient() && attempt < self.config.max_retries => {
                    if let Some(delay) = backoff.next_backoff() {
                        warn!("Attempt {} failed for {}, retrying in {:?}: {}", attempt + 1, url, delay, e);
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return Err(e);
                }
                Err(e) => {
                    if e.is_transient() {
                        error!("Failed to fetch {} after {} attempts", url, attempt + 1);
                    }
                    return Err(e);
                }
            }
        }

        Err(FetchError::Transient {
            url: url.to_string(),
            reason: "retries exhausted".to_string(),
        })
    }
}
