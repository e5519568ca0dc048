use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use mulerank_core::{AgentStats, Deactivation, ReconciliationPlan, RunSummary};
use serde::{Deserialize, Serialize};
use tokio::fs;

/// Agent first seen in a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewAgent {
    pub link: String,
    pub name: String,
    pub author: Option<String>,
    pub rank: i32,
}

/// Everything a finished run produced, as written to `run.json` and handed
/// to notifiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub summary: RunSummary,
    pub stats: AgentStats,
    pub deactivated: Vec<Deactivation>,
    pub created: Vec<NewAgent>,
}

impl RunReport {
    pub fn new(summary: RunSummary, stats: AgentStats, plan: &ReconciliationPlan) -> Self {
        let created = plan
            .created_agents()
            .map(|a| NewAgent {
                link: a.link.clone(),
                name: a.name.clone(),
                author: a.author.clone(),
                rank: a.rank,
            })
            .collect();
        Self {
            summary,
            stats,
            deactivated: plan.deactivations.clone(),
            created,
        }
    }
}

pub async fn write_run_report(reports_root: &Path, report: &RunReport) -> Result<PathBuf> {
    let run_dir = reports_root.join(report.summary.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let path = run_dir.join("run.json");
    let bytes = serde_json::to_vec_pretty(report).context("serializing run report")?;
    fs::write(&path, bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

/// Most recent run reports, newest first.
pub async fn recent_run_reports(reports_root: &Path, limit: usize) -> Result<Vec<RunReport>> {
    let mut entries = match fs::read_dir(reports_root).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err).with_context(|| format!("reading {}", reports_root.display())),
    };

    let mut reports = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path().join("run.json");
        if !fs::try_exists(&path).await.unwrap_or(false) {
            continue;
        }
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let report: RunReport =
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        reports.push(report);
    }
    reports.sort_by(|a, b| b.summary.started_at.cmp(&a.summary.started_at));
    reports.truncate(limit);
    Ok(reports)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use mulerank_core::{reconcile, CurrentState, RawRecord, ReconcileOptions};
    use tempfile::tempdir;
    use uuid::Uuid;

    fn report_at(hour: u32) -> RunReport {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, hour, 0, 0).single().expect("ts");
        let records = vec![RawRecord {
            link: "/@a/one".into(),
            name: "One".into(),
            ..RawRecord::default()
        }];
        let plan = reconcile(&records, &CurrentState::new(), now, &ReconcileOptions::default());
        let summary = RunSummary {
            run_id: Uuid::new_v4(),
            started_at: now,
            finished_at: now,
            crawl_time: now,
            scraped_count: 1,
            new_count: plan.new_count(),
            updated_count: 0,
            deactivated_count: 0,
            reactivated_count: 0,
            total_active: 1,
            duration_ms: 10,
            anomalies: Vec::new(),
        };
        let stats = AgentStats {
            active_agents: 1,
            inactive_agents: 0,
            total_crawls: 1,
            latest_crawl: Some(now),
        };
        RunReport::new(summary, stats, &plan)
    }

    #[tokio::test]
    async fn reports_are_written_per_run_and_listed_newest_first() {
        let dir = tempdir().expect("tempdir");
        let early = report_at(6);
        let late = report_at(18);

        let path = write_run_report(dir.path(), &early).await.expect("write early");
        assert!(path.ends_with(format!("{}/run.json", early.summary.run_id)));
        write_run_report(dir.path(), &late).await.expect("write late");

        let reports = recent_run_reports(dir.path(), 10).await.expect("list");
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].summary.run_id, late.summary.run_id);
        assert_eq!(reports[1].created[0].link, "/@a/one");

        let newest = recent_run_reports(dir.path(), 1).await.expect("list one");
        assert_eq!(newest.len(), 1);
        assert_eq!(newest[0].summary.run_id, late.summary.run_id);
        assert!(recent_run_reports(dir.path(), 0).await.expect("list none").is_empty());
    }

    #[tokio::test]
    async fn missing_reports_dir_is_empty() {
        let dir = tempdir().expect("tempdir");
        let reports = recent_run_reports(&dir.path().join("nope"), 5).await.expect("list");
        assert!(reports.is_empty());
    }
}
