use std::fmt::Write;

use chrono::{DateTime, Utc};
use mulerank_core::{Agent, AgentStats, RankChange, RankMovement, RankObservation, RunSummary};
use mulerank_storage::StoredSnapshot;
use mulerank_sync::RunReport;
use uuid::Uuid;

const DESCRIPTION_WIDTH: usize = 80;
const NAME_WIDTH: usize = 28;

fn timestamp(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn or_dash(value: &Option<String>) -> &str {
    value.as_deref().unwrap_or("-")
}

fn truncated(text: &str, width: usize) -> String {
    if text.chars().count() > width {
        format!("{}...", text.chars().take(width).collect::<String>())
    } else {
        text.to_string()
    }
}

pub fn agent_list(agents: &[Agent], active_only: bool) -> String {
    let mut out = String::new();
    if active_only {
        let _ = writeln!(out, "Active agents ({}):\n", agents.len());
    } else {
        let active = agents.iter().filter(|a| a.is_active).count();
        let _ = writeln!(out, "All agents ({}, {active} active):\n", agents.len());
    }
    for agent in agents {
        let status = if agent.is_active { "✓" } else { "✗" };
        let _ = writeln!(out, "{status} [{:4}] {}", agent.rank, agent.name);
        let _ = writeln!(out, "     link:    {}", agent.link);
        let _ = writeln!(out, "     author:  {}", or_dash(&agent.author));
        let _ = writeln!(out, "     price:   {}", or_dash(&agent.price));
        if let Some(description) = agent.description.as_deref().filter(|d| !d.is_empty()) {
            let _ = writeln!(out, "     about:   {}", truncated(description, DESCRIPTION_WIDTH));
        }
        let _ = writeln!(out, "     updated: {}\n", timestamp(&agent.last_updated));
    }
    out
}

pub fn history_table(agent: &Agent, observations: &[RankObservation]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Agent:  {}", agent.name);
    let _ = writeln!(out, "Author: {}", or_dash(&agent.author));
    let _ = writeln!(out, "Link:   {}\n", agent.link);
    if observations.is_empty() {
        let _ = writeln!(out, "No rank history recorded.");
        return out;
    }
    let _ = writeln!(out, "{:<20} {:<10} {:<10}", "crawl time", "rank", "change");
    let _ = writeln!(out, "{}", "-".repeat(50));
    for obs in observations {
        let _ = writeln!(
            out,
            "{:<20} {:<10} {:<10}",
            timestamp(&obs.crawl_time),
            obs.rank,
            obs.movement.arrow()
        );
    }
    out
}

pub fn stats_report(stats: &AgentStats, changes: Option<&[RankChange]>) -> String {
    let rule = "=".repeat(50);
    let latest = stats
        .latest_crawl
        .as_ref()
        .map(timestamp)
        .unwrap_or_else(|| "never".to_string());

    let mut out = String::new();
    let _ = writeln!(out, "{rule}");
    let _ = writeln!(out, "Active agents:   {}", stats.active_agents);
    let _ = writeln!(out, "Delisted agents: {}", stats.inactive_agents);
    let _ = writeln!(out, "Total crawls:    {}", stats.total_crawls);
    let _ = writeln!(out, "Latest crawl:    {latest}");
    let _ = writeln!(out, "{rule}");

    let Some(changes) = changes else {
        return out;
    };
    let _ = writeln!(out, "\nLargest rank changes (last two crawls):");
    if changes.is_empty() {
        let _ = writeln!(out, "no data yet");
        return out;
    }
    let _ = writeln!(out, "{:<30} {:<10} {:<10} {:<10}", "name", "latest", "previous", "change");
    let _ = writeln!(out, "{}", "-".repeat(60));
    for change in changes {
        let movement = RankMovement::between(change.previous_rank, change.latest_rank);
        let _ = writeln!(
            out,
            "{:<30} {:<10} {:<10} {:<10}",
            truncated(&change.name, NAME_WIDTH),
            change.latest_rank,
            change.previous_rank,
            movement.arrow()
        );
    }
    out
}

pub fn run_summary(summary: &RunSummary) -> String {
    format!(
        "run complete: run_id={} scraped={} new={} updated={} deactivated={} reactivated={} active={} duration_ms={}",
        summary.run_id,
        summary.scraped_count,
        summary.new_count,
        summary.updated_count,
        summary.deactivated_count,
        summary.reactivated_count,
        summary.total_active,
        summary.duration_ms,
    )
}

pub fn report_list(reports: &[RunReport]) -> String {
    if reports.is_empty() {
        return "No run reports yet.\n".to_string();
    }
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<20} {:<8} {:<6} {:<10} {:<8} {:<36}",
        "crawl time", "scraped", "new", "delisted", "active", "run id"
    );
    let _ = writeln!(out, "{}", "-".repeat(92));
    for report in reports {
        let summary = &report.summary;
        let _ = writeln!(
            out,
            "{:<20} {:<8} {:<6} {:<10} {:<8} {:<36}",
            timestamp(&summary.crawl_time),
            summary.scraped_count,
            summary.new_count,
            summary.deactivated_count,
            summary.total_active,
            summary.run_id,
        );
    }
    out
}

pub fn snapshot_list(run_id: Uuid, pages: &[StoredSnapshot]) -> String {
    if pages.is_empty() {
        return format!("No snapshots kept for run {run_id}.\n");
    }
    let mut out = String::new();
    let _ = writeln!(out, "Snapshots for run {run_id}:\n");
    for page in pages {
        let _ = writeln!(
            out,
            "page {:>3}  {:>9} bytes  {}  {}",
            page.page,
            page.byte_size,
            &page.sha256[..12.min(page.sha256.len())],
            page.path.display()
        );
    }
    out
}
