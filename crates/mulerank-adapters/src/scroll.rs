use std::time::Duration;

use async_trait::async_trait;
use mulerank_core::RawRecord;
use tracing::{debug, info};

use crate::ExtractionError;

/// Termination rules for the lazy-loading loop.
#[derive(Debug, Clone, Copy)]
pub struct ScrollPolicy {
    pub delay: Duration,
    pub max_attempts: usize,
    pub idle_threshold: usize,
    pub hard_timeout: Duration,
}

impl Default for ScrollPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(2),
            max_attempts: 50,
            idle_threshold: 3,
            hard_timeout: Duration::from_secs(300),
        }
    }
}

/// Something that reveals more of a listing each time it is advanced.
#[async_trait]
pub trait ListingPager: Send {
    /// Loads more content and returns every card visible so far, in page
    /// order.
    async fn advance(&mut self, attempt: usize) -> Result<Vec<RawRecord>, ExtractionError>;
}

/// Advances `pager` until `idle_threshold` consecutive loads show no new
/// cards or `max_attempts` is reached, and returns the final card list.
/// Exceeding `hard_timeout` fails with [`ExtractionError::Timeout`].
pub async fn collect_until_idle<P>(pager: &mut P, policy: ScrollPolicy) -> Result<Vec<RawRecord>, ExtractionError>
where
    P: ListingPager + ?Sized,
{
    match tokio::time::timeout(policy.hard_timeout, scroll_loop(pager, policy)).await {
        Ok(result) => result,
        Err(_) => Err(ExtractionError::Timeout {
            after_secs: policy.hard_timeout.as_secs(),
        }),
    }
}

async fn scroll_loop<P>(pager: &mut P, policy: ScrollPolicy) -> Result<Vec<RawRecord>, ExtractionError>
where
    P: ListingPager + ?Sized,
{
    let mut visible: Vec<RawRecord> = Vec::new();
    let mut idle = 0usize;

    for attempt in 0..policy.max_attempts {
        if attempt > 0 && !policy.delay.is_zero() {
            tokio::time::sleep(policy.delay).await;
        }
        let cards = pager.advance(attempt).await?;
        if cards.len() > visible.len() {
            debug!(attempt, cards = cards.len(), "new cards loaded");
            idle = 0;
        } else {
            idle += 1;
            debug!(attempt, idle, threshold = policy.idle_threshold, "no new cards");
        }
        visible = cards;

        if idle >= policy.idle_threshold {
            info!(attempts = attempt + 1, cards = visible.len(), "listing exhausted");
            return Ok(visible);
        }
    }

    info!(attempts = policy.max_attempts, cards = visible.len(), "scroll attempt limit reached");
    Ok(visible)
}
