//! Run orchestration: extraction -> snapshot -> reconcile -> apply, plus the
//! daemon scheduler, run reports and notifications.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Utc;
use mulerank_adapters::{
    ExtractionContext, ExtractionError, FixtureListingSource, ListingSource, MulerunListingSource,
};
use mulerank_core::{reconcile, ReconciliationAnomaly, RunSummary};
use mulerank_storage::{connect_store, AgentStore, HttpFetcher, SnapshotStore, StoreError};
use thiserror::Error;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

mod config;
mod notify;
mod report;
mod scheduler;

pub use config::{ConfigError, SyncConfig, MAX_INTERVAL_HOURS};
pub use notify::{
    delisted_message, new_agents_message, summary_message, NoopNotifier, RunNotifier,
    WebhookNotifier, MAX_LISTED_AGENTS,
};
pub use report::{recent_run_reports, write_run_report, NewAgent, RunReport};
pub use scheduler::{shutdown_signal, Scheduler, SchedulerError, SchedulerState, SharedSchedulerState};

#[derive(Debug, Error)]
pub enum RunError {
    #[error("extraction failed: {0}")]
    Extraction(#[from] ExtractionError),
    #[error("run aborted: {0}")]
    Anomaly(ReconciliationAnomaly),
    #[error("store failure: {0}")]
    Store(#[from] StoreError),
    #[error("another run is already in progress")]
    AlreadyRunning,
}

impl RunError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Extraction(_) => "extraction",
            Self::Anomaly(_) => "anomaly",
            Self::Store(_) => "store",
            Self::AlreadyRunning => "already_running",
        }
    }
}

/// Sequences a single run. At most one run is in flight per pipeline.
pub struct SyncPipeline {
    config: SyncConfig,
    store: Arc<dyn AgentStore>,
    source: Arc<dyn ListingSource>,
    notifier: Arc<dyn RunNotifier>,
    running: AtomicBool,
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl SyncPipeline {
    pub fn new(config: SyncConfig, store: Arc<dyn AgentStore>, source: Arc<dyn ListingSource>) -> Self {
        Self {
            config,
            store,
            source,
            notifier: Arc::new(NoopNotifier),
            running: AtomicBool::new(false),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn RunNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn AgentStore> {
        Arc::clone(&self.store)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// One end-to-end run. Either the whole plan is committed and a summary
    /// returned, or the store is left untouched and the error surfaced.
    pub async fn run_once(&self) -> Result<RunSummary, RunError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(RunError::AlreadyRunning);
        }
        let _guard = RunningGuard(&self.running);
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id, source = self.source.source_id());
        self.execute(run_id).instrument(span).await
    }

    async fn execute(&self, run_id: Uuid) -> Result<RunSummary, RunError> {
        let clock = Instant::now();
        let ctx = ExtractionContext::new(run_id);
        info!("run started");

        let records = match self.source.extract(&ctx).await {
            Ok(records) => records,
            Err(err) => {
                error!(reason = err.reason(), error = %err, "extraction failed");
                return Err(err.into());
            }
        };

        let snapshot = self.store.snapshot().await?;
        let crawl_time = Utc::now();
        let plan = reconcile(&records, &snapshot, crawl_time, &self.config.reconcile_options());

        for anomaly in &plan.anomalies {
            warn!(anomaly = %anomaly, "reconciliation anomaly");
        }
        if let Some(anomaly) = plan.blocking_anomaly() {
            if self.config.abort_on_anomaly {
                error!(anomaly = %anomaly, "aborting run before apply");
                return Err(RunError::Anomaly(anomaly.clone()));
            }
        }

        self.store.apply(&plan).await?;
        let stats = self.store.get_stats().await?;

        let summary = RunSummary {
            run_id,
            started_at: ctx.started_at,
            finished_at: Utc::now(),
            crawl_time,
            scraped_count: records.len(),
            new_count: plan.new_count(),
            updated_count: plan.updated_count(),
            deactivated_count: plan.deactivated_count(),
            reactivated_count: plan.reactivated_count(),
            total_active: stats.active_agents,
            duration_ms: u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX),
            anomalies: plan.anomalies.clone(),
        };
        info!(
            scraped = summary.scraped_count,
            new = summary.new_count,
            updated = summary.updated_count,
            deactivated = summary.deactivated_count,
            reactivated = summary.reactivated_count,
            total_active = summary.total_active,
            duration_ms = summary.duration_ms,
            "run committed"
        );

        let report = RunReport::new(summary.clone(), stats, &plan);
        match write_run_report(&self.config.reports_dir, &report).await {
            Ok(path) => info!(path = %path.display(), "run report written"),
            Err(err) => warn!(error = %format!("{err:#}"), "could not write run report"),
        }
        if let Err(err) = self.notifier.notify(&report).await {
            warn!(error = %format!("{err:#}"), "run notification failed");
        }

        Ok(summary)
    }
}

/// Picks the listing source for `config`: the fixture when
/// `MULERANK_FIXTURE_PATH` is set, the live site otherwise.
pub fn listing_source_from_config(config: &SyncConfig) -> Result<Arc<dyn ListingSource>> {
    if let Some(path) = &config.fixture_path {
        info!(fixture = %path.display(), "using fixture listing source");
        return Ok(Arc::new(FixtureListingSource::new(path.clone())));
    }
    let fetcher = HttpFetcher::new(config.http_client_config())?;
    let source = MulerunListingSource::new(fetcher, config.source_config())
        .with_snapshots(SnapshotStore::new(config.artifacts_dir.clone()));
    Ok(Arc::new(source))
}

pub fn notifier_from_config(config: &SyncConfig) -> Result<Arc<dyn RunNotifier>> {
    match &config.webhook_url {
        Some(url) => Ok(Arc::new(WebhookNotifier::new(url.clone(), config.interval_hours)?)),
        None => Ok(Arc::new(NoopNotifier)),
    }
}

/// Connects the store, ensures the schema and wires source and notifier.
pub async fn build_pipeline(config: SyncConfig) -> Result<SyncPipeline> {
    let store = connect_store(&config.database_url, config.database_max_connections)
        .await
        .context("connecting to the agent store")?;
    store.init_schema().await.context("initializing schema")?;
    let source = listing_source_from_config(&config)?;
    let notifier = notifier_from_config(&config)?;
    Ok(SyncPipeline::new(config, store, source).with_notifier(notifier))
}
