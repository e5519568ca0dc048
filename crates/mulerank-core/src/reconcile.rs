//! Pure reconciliation of one run's extraction against the persisted snapshot.
//!
//! `reconcile` never touches storage: it turns an ordered list of scraped
//! records plus a snapshot of the current agents into a
//! [`ReconciliationPlan`] that a store applies atomically.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{Agent, RankHistoryEntry, RawRecord};

/// Snapshot of persisted agents keyed by link, taken once per run.
pub type CurrentState = BTreeMap<String, Agent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UpsertKind {
    Created,
    Reactivated { previous_rank: i32 },
    Refreshed { previous_rank: i32 },
}

/// Full target state for one observed agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentUpsert {
    pub kind: UpsertKind,
    pub agent: Agent,
}

/// A previously active agent missing from this run. `rank` is the frozen
/// last known position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deactivation {
    pub link: String,
    pub name: String,
    pub author: Option<String>,
    pub rank: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[serde(tag = "anomaly", rename_all = "snake_case")]
pub enum ReconciliationAnomaly {
    #[error("run would deactivate {deactivating} of {active} active agents (threshold {threshold:.2})")]
    MassDeactivation {
        deactivating: usize,
        active: usize,
        threshold: f64,
    },
    #[error("duplicate links in extraction batch: {}", links.join(", "))]
    DuplicateLinks { links: Vec<String> },
}

impl ReconciliationAnomaly {
    /// Whether the anomaly indicates a probable extraction failure.
    pub fn is_mass_deactivation(&self) -> bool {
        matches!(self, Self::MassDeactivation { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconcileOptions {
    /// Fraction of active agents above which a deactivation set is flagged.
    pub max_deactivation_ratio: f64,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            max_deactivation_ratio: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationPlan {
    pub crawl_time: DateTime<Utc>,
    pub upserts: Vec<AgentUpsert>,
    pub history_inserts: Vec<RankHistoryEntry>,
    pub deactivations: Vec<Deactivation>,
    pub anomalies: Vec<ReconciliationAnomaly>,
}

impl ReconciliationPlan {
    pub fn new_count(&self) -> usize {
        self.count_kind(|k| matches!(k, UpsertKind::Created))
    }

    pub fn reactivated_count(&self) -> usize {
        self.count_kind(|k| matches!(k, UpsertKind::Reactivated { .. }))
    }

    pub fn updated_count(&self) -> usize {
        self.count_kind(|k| matches!(k, UpsertKind::Refreshed { .. }))
    }

    pub fn deactivated_count(&self) -> usize {
        self.deactivations.len()
    }

    pub fn created_agents(&self) -> impl Iterator<Item = &Agent> {
        self.upserts
            .iter()
            .filter(|u| matches!(u.kind, UpsertKind::Created))
            .map(|u| &u.agent)
    }

    /// First anomaly that should stop the plan from being applied.
    pub fn blocking_anomaly(&self) -> Option<&ReconciliationAnomaly> {
        self.anomalies.iter().find(|a| a.is_mass_deactivation())
    }

    fn count_kind(&self, pred: impl Fn(&UpsertKind) -> bool) -> usize {
        self.upserts.iter().filter(|u| pred(&u.kind)).count()
    }
}

/// Builds the plan for one run. `new_records` is in rank order; the same
/// inputs always produce the same plan.
pub fn reconcile(
    new_records: &[RawRecord],
    current_state: &CurrentState,
    now: DateTime<Utc>,
    options: &ReconcileOptions,
) -> ReconciliationPlan {
    let mut anomalies = Vec::new();

    // last occurrence wins
    let mut winning_index: HashMap<&str, usize> = HashMap::with_capacity(new_records.len());
    let mut duplicates: Vec<String> = Vec::new();
    for (idx, record) in new_records.iter().enumerate() {
        if winning_index.insert(record.link.as_str(), idx).is_some()
            && !duplicates.contains(&record.link)
        {
            duplicates.push(record.link.clone());
        }
    }
    if !duplicates.is_empty() {
        anomalies.push(ReconciliationAnomaly::DuplicateLinks { links: duplicates });
    }

    let mut upserts = Vec::with_capacity(winning_index.len());
    let mut history_inserts = Vec::with_capacity(winning_index.len());
    for (idx, record) in new_records.iter().enumerate() {
        if winning_index.get(record.link.as_str()) != Some(&idx) {
            continue;
        }
        let rank = i32::try_from(idx + 1).unwrap_or(i32::MAX);
        let upsert = match current_state.get(&record.link) {
            None => AgentUpsert {
                kind: UpsertKind::Created,
                agent: Agent::from_record(record, rank, now),
            },
            Some(existing) if !existing.is_active => AgentUpsert {
                kind: UpsertKind::Reactivated {
                    previous_rank: existing.rank,
                },
                agent: existing.observed(record, rank, now),
            },
            Some(existing) => AgentUpsert {
                kind: UpsertKind::Refreshed {
                    previous_rank: existing.rank,
                },
                agent: existing.observed(record, rank, now),
            },
        };
        history_inserts.push(RankHistoryEntry {
            agent_link: record.link.clone(),
            rank,
            crawl_time: now,
        });
        upserts.push(upsert);
    }

    let observed: HashSet<&str> = winning_index.keys().copied().collect();
    let active = current_state.values().filter(|a| a.is_active).count();
    let mut deactivations = current_state
        .values()
        .filter(|a| a.is_active && !observed.contains(a.link.as_str()))
        .map(|a| Deactivation {
            link: a.link.clone(),
            name: a.name.clone(),
            author: a.author.clone(),
            rank: a.rank,
        })
        .collect::<Vec<_>>();
    deactivations.sort_by(|a, b| a.rank.cmp(&b.rank).then_with(|| a.link.cmp(&b.link)));

    if active > 0 && !deactivations.is_empty() {
        let ratio = deactivations.len() as f64 / active as f64;
        if deactivations.len() == active || ratio > options.max_deactivation_ratio {
            anomalies.push(ReconciliationAnomaly::MassDeactivation {
                deactivating: deactivations.len(),
                active,
                threshold: options.max_deactivation_ratio,
            });
        }
    }

    ReconciliationPlan {
        crawl_time: now,
        upserts,
        history_inserts,
        deactivations,
        anomalies,
    }
}
