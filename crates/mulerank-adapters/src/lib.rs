//! Listing sources: the extraction side of a run.
//!
//! A [`ListingSource`] turns the current state of the MuleRun listing into an
//! ordered sequence of [`RawRecord`]s, or fails with an [`ExtractionError`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mulerank_core::RawRecord;
use thiserror::Error;
use uuid::Uuid;

mod fixture;
mod listing;
mod mulerun;
mod scroll;

pub use fixture::{load_listing_fixture, FixtureListingSource, ListingFixture};
pub use listing::{normalize_price, parse_listing_html, CARD_SELECTOR};
pub use mulerun::{listing_url, MulerunListingSource, MulerunSourceConfig, MULERUN_SOURCE_ID};
pub use scroll::{collect_until_idle, ListingPager, ScrollPolicy};

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("extraction timed out after {after_secs}s")]
    Timeout { after_secs: u64 },
    #[error("navigation failed: {0}")]
    NavigationFailed(String),
    #[error("listing produced zero records")]
    ZeroResults,
    #[error("malformed listing: {0}")]
    Parse(String),
}

impl ExtractionError {
    /// Short machine-readable reason, used in reports and notifications.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "timeout",
            Self::NavigationFailed(_) => "navigation_failed",
            Self::ZeroResults => "zero_results",
            Self::Parse(_) => "parse",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtractionContext {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
}

impl ExtractionContext {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            started_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait ListingSource: Send + Sync {
    fn source_id(&self) -> &str;

    /// Records in rank order. An empty listing is reported as
    /// [`ExtractionError::ZeroResults`], never as `Ok(vec![])`.
    async fn extract(&self, ctx: &ExtractionContext) -> Result<Vec<RawRecord>, ExtractionError>;
}

pub(crate) fn non_empty(records: Vec<RawRecord>) -> Result<Vec<RawRecord>, ExtractionError> {
    if records.is_empty() {
        Err(ExtractionError::ZeroResults)
    } else {
        Ok(records)
    }
}
