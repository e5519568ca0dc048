use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mulerank_core::RawRecord;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{listing, non_empty, ExtractionContext, ExtractionError, ListingSource};

/// A captured listing: either the raw page (inline or next to the bundle)
/// or pre-parsed records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListingFixture {
    pub source_id: String,
    pub captured_from_url: String,
    pub fetched_at: DateTime<Utc>,
    #[serde(default)]
    pub raw_path: Option<String>,
    #[serde(default)]
    pub raw_html: Option<String>,
    #[serde(default)]
    pub records: Vec<RawRecord>,
}

impl ListingFixture {
    /// Records in rank order; raw markup wins over pre-parsed records.
    pub fn records(&self) -> Result<Vec<RawRecord>, ExtractionError> {
        match &self.raw_html {
            Some(html) => listing::parse_listing_html(html),
            None => Ok(self.records.clone()),
        }
    }
}

pub async fn load_listing_fixture(path: impl AsRef<Path>) -> Result<ListingFixture> {
    let path = path.as_ref();
    let data = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let mut fixture: ListingFixture =
        serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
    hydrate_raw_html(path, &mut fixture).await?;
    Ok(fixture)
}

async fn hydrate_raw_html(bundle_path: &Path, fixture: &mut ListingFixture) -> Result<()> {
    if fixture.raw_html.is_some() {
        return Ok(());
    }
    let Some(rel_path) = &fixture.raw_path else {
        return Ok(());
    };
    let raw_path = bundle_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(rel_path);
    if !tokio::fs::try_exists(&raw_path).await.unwrap_or(false) {
        return Ok(());
    }
    let raw = tokio::fs::read_to_string(&raw_path)
        .await
        .with_context(|| format!("reading fixture listing {}", raw_path.display()))?;
    fixture.raw_html = Some(raw);
    Ok(())
}

/// Replays a captured listing instead of hitting the network.
#[derive(Debug, Clone)]
pub struct FixtureListingSource {
    path: PathBuf,
}

impl FixtureListingSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ListingSource for FixtureListingSource {
    fn source_id(&self) -> &str {
        "fixture"
    }

    async fn extract(&self, ctx: &ExtractionContext) -> Result<Vec<RawRecord>, ExtractionError> {
        let fixture = load_listing_fixture(&self.path)
            .await
            .map_err(|e| ExtractionError::NavigationFailed(format!("{e:#}")))?;
        let records = fixture.records()?;
        info!(
            run_id = %ctx.run_id,
            fixture = %self.path.display(),
            captured_from = %fixture.captured_from_url,
            records = records.len(),
            "replaying listing fixture"
        );
        non_empty(records)
    }
}
