//! Core domain model for mulerank: scraped listing records, the persisted
//! agent projection, the append-only rank history and run summaries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod reconcile;

pub use reconcile::{
    reconcile, AgentUpsert, CurrentState, Deactivation, ReconcileOptions,
    ReconciliationAnomaly, ReconciliationPlan, UpsertKind,
};

/// One agent card as extracted from the listing page. Rank is not carried
/// here: it is the 1-based position of the record in the extracted sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRecord {
    pub link: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub price: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
}

/// Latest known state of an agent, keyed by `link`.
///
/// `rank` keeps the last observed position after the agent is delisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agent {
    pub link: String,
    pub name: String,
    pub description: Option<String>,
    pub avatar_url: Option<String>,
    pub price: Option<String>,
    pub author: Option<String>,
    pub rank: i32,
    pub is_active: bool,
    pub first_seen: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl Agent {
    /// Builds a freshly observed agent from a scraped record.
    pub fn from_record(record: &RawRecord, rank: i32, now: DateTime<Utc>) -> Self {
        Self {
            link: record.link.clone(),
            name: record.name.clone(),
            description: record.description.clone(),
            avatar_url: record.avatar_url.clone(),
            price: record.price.clone(),
            author: record.author.clone(),
            rank,
            is_active: true,
            first_seen: now,
            last_updated: now,
        }
    }

    /// Returns the state after observing `record` again at `rank`. Identity
    /// (`link`) and `first_seen` are preserved.
    pub fn observed(&self, record: &RawRecord, rank: i32, now: DateTime<Utc>) -> Self {
        Self {
            link: self.link.clone(),
            name: record.name.clone(),
            description: record.description.clone(),
            avatar_url: record.avatar_url.clone(),
            price: record.price.clone(),
            author: record.author.clone(),
            rank,
            is_active: true,
            first_seen: self.first_seen,
            last_updated: now,
        }
    }
}

/// Append-only rank observation, one per (agent, run).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankHistoryEntry {
    pub agent_link: String,
    pub rank: i32,
    pub crawl_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "direction", content = "by", rename_all = "snake_case")]
pub enum RankMovement {
    First,
    Up(i32),
    Down(i32),
    Unchanged,
}

impl RankMovement {
    pub fn between(previous: i32, current: i32) -> Self {
        let diff = previous - current;
        if diff > 0 {
            Self::Up(diff)
        } else if diff < 0 {
            Self::Down(-diff)
        } else {
            Self::Unchanged
        }
    }

    pub fn arrow(&self) -> String {
        match self {
            Self::First => String::new(),
            Self::Up(n) => format!("↑{n}"),
            Self::Down(n) => format!("↓{n}"),
            Self::Unchanged => "→".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankObservation {
    pub rank: i32,
    pub crawl_time: DateTime<Utc>,
    pub movement: RankMovement,
}

/// Annotates a time-ordered history with the movement from the previous row.
pub fn history_with_movements(history: &[RankHistoryEntry]) -> Vec<RankObservation> {
    let mut previous: Option<i32> = None;
    history
        .iter()
        .map(|entry| {
            let movement = match previous {
                Some(prev) => RankMovement::between(prev, entry.rank),
                None => RankMovement::First,
            };
            previous = Some(entry.rank);
            RankObservation {
                rank: entry.rank,
                crawl_time: entry.crawl_time,
                movement,
            }
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentStats {
    pub active_agents: i64,
    pub inactive_agents: i64,
    pub total_crawls: i64,
    pub latest_crawl: Option<DateTime<Utc>>,
}

/// Rank delta of one agent between the two most recent crawls.
/// Positive `delta` means the agent moved up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankChange {
    pub link: String,
    pub name: String,
    pub latest_rank: i32,
    pub previous_rank: i32,
    pub delta: i32,
}

/// Computes the largest rank movements between the two most recent distinct
/// crawl times in `history`, for agents observed in both crawls.
pub fn rank_changes_between_latest_crawls(
    history: &[RankHistoryEntry],
    agents: &[Agent],
    limit: usize,
) -> Vec<RankChange> {
    let mut crawl_times: Vec<DateTime<Utc>> = history.iter().map(|h| h.crawl_time).collect();
    crawl_times.sort_unstable();
    crawl_times.dedup();
    let [.., previous_crawl, latest_crawl] = crawl_times.as_slice() else {
        return Vec::new();
    };

    let rank_at = |link: &str, at: &DateTime<Utc>| {
        history
            .iter()
            .filter(|h| h.agent_link == link && h.crawl_time == *at)
            .map(|h| h.rank)
            .last()
    };

    let mut changes = agents
        .iter()
        .filter_map(|agent| {
            let latest_rank = rank_at(&agent.link, latest_crawl)?;
            let previous_rank = rank_at(&agent.link, previous_crawl)?;
            Some(RankChange {
                link: agent.link.clone(),
                name: agent.name.clone(),
                latest_rank,
                previous_rank,
                delta: previous_rank - latest_rank,
            })
        })
        .collect::<Vec<_>>();

    changes.sort_by(|a, b| {
        b.delta
            .abs()
            .cmp(&a.delta.abs())
            .then_with(|| a.link.cmp(&b.link))
    });
    changes.truncate(limit);
    changes
}

/// Per-run outcome reported by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub crawl_time: DateTime<Utc>,
    pub scraped_count: usize,
    pub new_count: usize,
    pub updated_count: usize,
    pub deactivated_count: usize,
    pub reactivated_count: usize,
    pub total_active: i64,
    pub duration_ms: u64,
    #[serde(default)]
    pub anomalies: Vec<ReconciliationAnomaly>,
}
