use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use mulerank_core::RunSummary;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::config::{interval_from_hours, MAX_INTERVAL_HOURS};
use crate::{RunError, SyncPipeline};

/// Observable state of the daemon loop.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerState {
    pub enabled: bool,
    pub interval_hours: u64,
    pub is_running: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_summary: Option<RunSummary>,
    pub skipped_ticks: u64,
}

pub type SharedSchedulerState = Arc<RwLock<SchedulerState>>;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("interval must be between 1 and {max} hours, got {0}", max = MAX_INTERVAL_HOURS)]
    InvalidInterval(u64),
    #[error(transparent)]
    Job(#[from] anyhow::Error),
}

/// Triggers a run every `interval_hours`. A tick that finds a run in flight
/// is skipped, never queued. The repeating job can be started, stopped and
/// re-timed while the process runs.
#[derive(Clone)]
pub struct Scheduler {
    pipeline: Arc<SyncPipeline>,
    state: SharedSchedulerState,
    job: Arc<Mutex<Option<JobScheduler>>>,
}

impl Scheduler {
    pub fn new(pipeline: Arc<SyncPipeline>) -> Self {
        let state = SchedulerState {
            interval_hours: pipeline.config().interval_hours,
            ..SchedulerState::default()
        };
        Self {
            pipeline,
            state: Arc::new(RwLock::new(state)),
            job: Arc::new(Mutex::new(None)),
        }
    }

    pub fn state(&self) -> SharedSchedulerState {
        Arc::clone(&self.state)
    }

    fn next_after(from: DateTime<Utc>, interval_hours: u64) -> Option<DateTime<Utc>> {
        chrono::Duration::from_std(interval_from_hours(interval_hours))
            .ok()
            .and_then(|d| from.checked_add_signed(d))
    }

    /// Runs the pipeline once unless a run is already in flight. Failures
    /// are logged and recorded, never propagated.
    pub async fn tick(&self) -> Option<RunSummary> {
        let started = Utc::now();
        {
            let mut state = self.state.write().await;
            if state.is_running || self.pipeline.is_running() {
                state.skipped_ticks += 1;
                warn!(skipped_ticks = state.skipped_ticks, "previous run still in flight, skipping tick");
                return None;
            }
            state.is_running = true;
            if state.enabled {
                state.next_run_at = Self::next_after(started, state.interval_hours);
            }
        }

        let result = self.pipeline.run_once().await;

        let mut state = self.state.write().await;
        state.is_running = false;
        match result {
            Ok(summary) => {
                state.last_run_at = Some(summary.finished_at);
                state.last_error = None;
                state.last_summary = Some(summary.clone());
                Some(summary)
            }
            Err(RunError::AlreadyRunning) => {
                state.skipped_ticks += 1;
                warn!("run started elsewhere, skipping tick");
                None
            }
            Err(err) => {
                error!(kind = err.kind(), error = %err, "scheduled run failed");
                state.last_run_at = Some(Utc::now());
                state.last_error = Some(err.to_string());
                None
            }
        }
    }

    async fn spawn_job(&self, interval_hours: u64) -> Result<JobScheduler> {
        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let this = self.clone();
        let job = Job::new_repeated_async(interval_from_hours(interval_hours), move |_uuid, _l| {
            let this = this.clone();
            Box::pin(async move {
                let _ = this.tick().await;
            })
        })
        .context("creating crawl job")?;
        sched.add(job).await.context("adding crawl job")?;
        sched.start().await.context("starting scheduler")?;
        Ok(sched)
    }

    /// Registers the repeating job and starts it. With `run_immediately`
    /// the first run is kicked off right away instead of after one interval.
    /// Returns `false` when the job was already scheduled.
    pub async fn start(&self, run_immediately: bool) -> Result<bool> {
        let mut job = self.job.lock().await;
        if job.is_some() {
            return Ok(false);
        }
        let interval_hours = self.state.read().await.interval_hours;
        *job = Some(self.spawn_job(interval_hours).await?);

        {
            let mut state = self.state.write().await;
            state.enabled = true;
            state.next_run_at = Self::next_after(Utc::now(), interval_hours);
        }
        info!(interval_hours, run_immediately, "scheduler started");

        if run_immediately {
            let this = self.clone();
            tokio::spawn(async move {
                let _ = this.tick().await;
            });
        }
        Ok(true)
    }

    /// Removes the repeating job. A run already in flight finishes. Returns
    /// `false` when nothing was scheduled.
    pub async fn stop(&self) -> Result<bool> {
        let Some(mut sched) = self.job.lock().await.take() else {
            return Ok(false);
        };
        sched.shutdown().await.context("stopping scheduler")?;
        let mut state = self.state.write().await;
        state.enabled = false;
        state.next_run_at = None;
        info!("scheduler stopped");
        Ok(true)
    }

    /// Changes the run interval. A scheduled job is replaced so the new
    /// interval counts from now.
    pub async fn set_interval(&self, interval_hours: u64) -> Result<(), SchedulerError> {
        if !(1..=MAX_INTERVAL_HOURS).contains(&interval_hours) {
            return Err(SchedulerError::InvalidInterval(interval_hours));
        }
        let mut job = self.job.lock().await;
        if let Some(mut old) = job.take() {
            old.shutdown().await.context("stopping scheduler")?;
            *job = Some(self.spawn_job(interval_hours).await?);
        }

        let mut state = self.state.write().await;
        state.interval_hours = interval_hours;
        if job.is_some() {
            state.next_run_at = Self::next_after(Utc::now(), interval_hours);
        }
        info!(interval_hours, rescheduled = job.is_some(), "scheduler interval changed");
        Ok(())
    }

    /// Daemon mode: schedule runs until Ctrl+C or SIGTERM.
    pub async fn run_until_shutdown(&self, run_immediately: bool) -> Result<()> {
        self.start(run_immediately).await?;
        shutdown_signal().await;
        info!("shutdown requested, stopping scheduler");
        self.stop().await?;
        Ok(())
    }
}

/// Resolves on Ctrl+C, or SIGTERM on unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "could not listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                error!(error = %err, "could not listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SyncConfig;
    use mulerank_adapters::FixtureListingSource;
    use mulerank_storage::MemoryAgentStore;
    use std::path::{Path, PathBuf};
    use tempfile::tempdir;

    fn fixture_path() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/mulerun/sample/bundle.json")
    }

    fn scheduler(fixture: PathBuf, reports: &Path) -> Scheduler {
        let config = SyncConfig {
            reports_dir: reports.to_path_buf(),
            interval_hours: 6,
            ..SyncConfig::default()
        };
        let pipeline = SyncPipeline::new(
            config,
            Arc::new(MemoryAgentStore::new()),
            Arc::new(FixtureListingSource::new(fixture)),
        );
        Scheduler::new(Arc::new(pipeline))
    }

    #[tokio::test]
    async fn tick_records_successful_run() {
        let dir = tempdir().expect("tempdir");
        let scheduler = scheduler(fixture_path(), dir.path());

        let summary = scheduler.tick().await.expect("summary");
        assert_eq!(summary.new_count, 5);

        let state = scheduler.state().read().await.clone();
        assert!(!state.is_running);
        assert_eq!(state.interval_hours, 6);
        assert_eq!(state.last_run_at, Some(summary.finished_at));
        assert!(state.next_run_at.is_some());
        assert!(state.last_error.is_none());
    }

    #[tokio::test]
    async fn failed_run_is_recorded_not_propagated() {
        let dir = tempdir().expect("tempdir");
        let scheduler = scheduler(dir.path().join("missing.json"), dir.path());

        assert!(scheduler.tick().await.is_none());
        let state = scheduler.state().read().await.clone();
        assert!(!state.is_running);
        assert!(state.last_error.as_deref().unwrap_or_default().contains("navigation failed"));
        assert!(state.last_summary.is_none());
    }

    #[tokio::test]
    async fn tick_is_skipped_while_a_run_is_in_flight() {
        let dir = tempdir().expect("tempdir");
        let scheduler = scheduler(fixture_path(), dir.path());
        scheduler.state().write().await.is_running = true;

        assert!(scheduler.tick().await.is_none());
        let state = scheduler.state().read().await.clone();
        assert_eq!(state.skipped_ticks, 1);
        assert!(state.last_run_at.is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn start_stop_and_retime_the_job() {
        let dir = tempdir().expect("tempdir");
        let scheduler = scheduler(fixture_path(), dir.path());

        assert!(scheduler.start(false).await.expect("start"));
        assert!(!scheduler.start(false).await.expect("second start"));
        let state = scheduler.state().read().await.clone();
        assert!(state.enabled);
        let first_next = state.next_run_at.expect("next run");

        scheduler.set_interval(12).await.expect("retime");
        let state = scheduler.state().read().await.clone();
        assert_eq!(state.interval_hours, 12);
        assert!(state.enabled);
        assert!(state.next_run_at.expect("next run") > first_next);

        assert!(scheduler.stop().await.expect("stop"));
        assert!(!scheduler.stop().await.expect("second stop"));
        let state = scheduler.state().read().await.clone();
        assert!(!state.enabled);
        assert!(state.next_run_at.is_none());
        assert!(state.last_run_at.is_none());
    }

    #[tokio::test]
    async fn interval_outside_bounds_is_rejected() {
        let dir = tempdir().expect("tempdir");
        let scheduler = scheduler(fixture_path(), dir.path());

        assert!(matches!(
            scheduler.set_interval(0).await,
            Err(SchedulerError::InvalidInterval(0))
        ));
        assert!(scheduler.set_interval(MAX_INTERVAL_HOURS + 1).await.is_err());
        scheduler.set_interval(2).await.expect("idle retime");
        let state = scheduler.state().read().await.clone();
        assert_eq!(state.interval_hours, 2);
        assert!(!state.enabled);
        assert!(state.next_run_at.is_none());
    }
}
