use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use mulerank_adapters::FixtureListingSource;
use mulerank_core::{
    Agent, AgentStats, CurrentState, RankChange, RankHistoryEntry, ReconciliationAnomaly,
    ReconciliationPlan,
};
use mulerank_storage::{AgentStore, MemoryAgentStore, StoreError};
use mulerank_sync::{recent_run_reports, RunError, RunNotifier, RunReport, SyncConfig, SyncPipeline};
use tempfile::{tempdir, TempDir};

fn sample_fixture() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/mulerun/sample/bundle.json")
}

/// Writes a fixture listing the given links in rank order.
fn write_fixture(dir: &Path, name: &str, links: &[&str]) -> PathBuf {
    let records = links
        .iter()
        .map(|link| {
            serde_json::json!({
                "link": link,
                "name": link.trim_start_matches("/@"),
                "author": "tester",
                "price": "10/ run",
            })
        })
        .collect::<Vec<_>>();
    let bundle = serde_json::json!({
        "source_id": "mulerun",
        "captured_from_url": "https://mulerun.com/?sort=most_used",
        "fetched_at": "2026-03-02T08:00:00Z",
        "records": records,
    });
    let path = dir.join(name);
    std::fs::write(&path, serde_json::to_vec_pretty(&bundle).expect("json")).expect("write fixture");
    path
}

fn config(reports: &TempDir, abort_on_anomaly: bool) -> SyncConfig {
    SyncConfig {
        reports_dir: reports.path().to_path_buf(),
        abort_on_anomaly,
        ..SyncConfig::default()
    }
}

fn pipeline(store: Arc<dyn AgentStore>, fixture: PathBuf, config: SyncConfig) -> SyncPipeline {
    SyncPipeline::new(config, store, Arc::new(FixtureListingSource::new(fixture)))
}

#[derive(Default)]
struct RecordingNotifier {
    reports: Mutex<Vec<RunReport>>,
}

#[async_trait]
impl RunNotifier for RecordingNotifier {
    async fn notify(&self, report: &RunReport) -> anyhow::Result<()> {
        self.reports.lock().expect("lock").push(report.clone());
        Ok(())
    }
}

/// Reads through to a memory store but refuses every write.
struct ReadOnlyStore(MemoryAgentStore);

#[async_trait]
impl AgentStore for ReadOnlyStore {
    async fn init_schema(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn snapshot(&self) -> Result<CurrentState, StoreError> {
        self.0.snapshot().await
    }

    async fn apply(&self, _plan: &ReconciliationPlan) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("connection reset during commit".into()))
    }

    async fn get_agent(&self, link: &str) -> Result<Option<Agent>, StoreError> {
        self.0.get_agent(link).await
    }

    async fn list_agents(&self, active_only: bool, limit: Option<i64>) -> Result<Vec<Agent>, StoreError> {
        self.0.list_agents(active_only, limit).await
    }

    async fn get_history(&self, link: &str) -> Result<Vec<RankHistoryEntry>, StoreError> {
        self.0.get_history(link).await
    }

    async fn get_stats(&self) -> Result<AgentStats, StoreError> {
        self.0.get_stats().await
    }

    async fn rank_changes(&self, limit: i64) -> Result<Vec<RankChange>, StoreError> {
        self.0.rank_changes(limit).await
    }
}

#[tokio::test]
async fn consecutive_runs_track_ranks_delistings_and_reactivations() {
    let reports = tempdir().expect("tempdir");
    let fixtures = tempdir().expect("tempdir");
    let store = Arc::new(MemoryAgentStore::new());
    let notifier = Arc::new(RecordingNotifier::default());

    let first = pipeline(store.clone(), sample_fixture(), config(&reports, true))
        .with_notifier(notifier.clone())
        .run_once()
        .await
        .expect("first run");
    assert_eq!(first.new_count, 5);
    assert_eq!(first.total_active, 5);

    // Slides moves to the top, Logo Studio disappears.
    let second_fixture = write_fixture(
        fixtures.path(),
        "second.json",
        &[
            "/@deckhand/slides",
            "/@laughing_code/video-maker",
            "/@inkwell/resume",
            "/@quietfox/translate",
            "/@newcomer/notes",
        ],
    );
    let second = pipeline(store.clone(), second_fixture, config(&reports, true))
        .with_notifier(notifier.clone())
        .run_once()
        .await
        .expect("second run");
    assert_eq!(second.new_count, 1);
    assert_eq!(second.updated_count, 4);
    assert_eq!(second.deactivated_count, 1);
    assert_eq!(second.total_active, 5);

    let logo = store.get_agent("/@patchwork/logo").await.expect("get").expect("logo");
    assert!(!logo.is_active);
    assert_eq!(logo.rank, 4);

    let changes = store.rank_changes(10).await.expect("changes");
    assert_eq!(changes[0].link, "/@deckhand/slides");
    assert_eq!(changes[0].delta, 1);

    let third_fixture = write_fixture(
        fixtures.path(),
        "third.json",
        &[
            "/@patchwork/logo",
            "/@deckhand/slides",
            "/@laughing_code/video-maker",
            "/@inkwell/resume",
            "/@quietfox/translate",
            "/@newcomer/notes",
        ],
    );
    let third = pipeline(store.clone(), third_fixture, config(&reports, true))
        .run_once()
        .await
        .expect("third run");
    assert_eq!(third.reactivated_count, 1);
    assert_eq!(third.new_count, 0);

    let logo = store.get_agent("/@patchwork/logo").await.expect("get").expect("logo");
    assert!(logo.is_active);
    assert_eq!(logo.rank, 1);
    assert_eq!(logo.first_seen, first.crawl_time);

    let history = store.get_history("/@patchwork/logo").await.expect("history");
    assert_eq!(history.iter().map(|h| h.rank).collect::<Vec<_>>(), vec![4, 1]);

    let stats = store.get_stats().await.expect("stats");
    assert_eq!(stats.total_crawls, 3);
    assert_eq!(stats.active_agents, 6);

    let sent = notifier.reports.lock().expect("lock").clone();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[1].deactivated[0].link, "/@patchwork/logo");
    assert_eq!(sent[1].created[0].link, "/@newcomer/notes");

    let written = recent_run_reports(reports.path(), 10).await.expect("reports");
    assert_eq!(written.len(), 3);
}

#[tokio::test]
async fn mass_deactivation_aborts_without_touching_the_store() {
    let reports = tempdir().expect("tempdir");
    let fixtures = tempdir().expect("tempdir");
    let store = Arc::new(MemoryAgentStore::new());
    pipeline(store.clone(), sample_fixture(), config(&reports, true))
        .run_once()
        .await
        .expect("seed run");

    let collapsed = write_fixture(fixtures.path(), "collapsed.json", &["/@inkwell/resume"]);
    let err = pipeline(store.clone(), collapsed.clone(), config(&reports, true))
        .run_once()
        .await
        .unwrap_err();
    match err {
        RunError::Anomaly(ReconciliationAnomaly::MassDeactivation { deactivating, active, .. }) => {
            assert_eq!(deactivating, 4);
            assert_eq!(active, 5);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(store.list_agents(true, None).await.expect("list").len(), 5);
    assert_eq!(store.history_len().await, 5);

    // With aborting disabled the plan lands and the anomaly is reported.
    let summary = pipeline(store.clone(), collapsed, config(&reports, false))
        .run_once()
        .await
        .expect("warned run");
    assert_eq!(summary.deactivated_count, 4);
    assert!(summary.anomalies.iter().any(|a| a.is_mass_deactivation()));
    assert_eq!(store.list_agents(true, None).await.expect("list").len(), 1);
}

#[tokio::test]
async fn failed_apply_surfaces_store_error_and_keeps_state() {
    let reports = tempdir().expect("tempdir");
    let inner = MemoryAgentStore::new();
    let store = Arc::new(ReadOnlyStore(inner));

    let err = pipeline(store.clone(), sample_fixture(), config(&reports, true))
        .run_once()
        .await
        .unwrap_err();
    assert!(matches!(err, RunError::Store(StoreError::Unavailable(_))));
    assert!(store.list_agents(false, None).await.expect("list").is_empty());
    assert!(recent_run_reports(reports.path(), 10).await.expect("reports").is_empty());
}

#[tokio::test]
async fn identical_runs_only_grow_history() {
    let reports = tempdir().expect("tempdir");
    let store = Arc::new(MemoryAgentStore::new());
    for _ in 0..2 {
        pipeline(store.clone(), sample_fixture(), config(&reports, true))
            .run_once()
            .await
            .expect("run");
    }
    let again = pipeline(store.clone(), sample_fixture(), config(&reports, true))
        .run_once()
        .await
        .expect("run");
    assert_eq!(again.new_count, 0);
    assert_eq!(again.deactivated_count, 0);
    assert_eq!(again.updated_count, 5);
    assert_eq!(store.history_len().await, 15);
}
