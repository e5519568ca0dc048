//! Persistence for mulerank: the agent store (Postgres + in-memory), raw
//! listing snapshots, and the retrying HTTP fetcher used by extraction.

use async_trait::async_trait;
use mulerank_core::{Agent, AgentStats, CurrentState, RankChange, RankHistoryEntry, ReconciliationPlan};
use thiserror::Error;

mod artifacts;
mod http;
mod memory;
mod postgres;

pub use artifacts::{SnapshotStore, StoredSnapshot};
pub use http::{FetchError, FetchedPage, HttpClientConfig, HttpFetcher, RetryPolicy};
pub use memory::MemoryAgentStore;
pub use postgres::PgAgentStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("schema migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Durable agent table plus the append-only rank history.
///
/// `apply` is all-or-nothing: either every upsert, history row and
/// deactivation of the plan lands, or none does.
#[async_trait]
pub trait AgentStore: Send + Sync {
    /// Creates tables and indexes. Safe to call on every startup.
    async fn init_schema(&self) -> Result<(), StoreError>;

    /// Every persisted agent, active or not, keyed by link.
    async fn snapshot(&self) -> Result<CurrentState, StoreError>;

    async fn apply(&self, plan: &ReconciliationPlan) -> Result<(), StoreError>;

    async fn get_agent(&self, link: &str) -> Result<Option<Agent>, StoreError>;

    /// Agents ordered by rank, then link.
    async fn list_agents(&self, active_only: bool, limit: Option<i64>) -> Result<Vec<Agent>, StoreError>;

    /// Observations for one agent, oldest first.
    async fn get_history(&self, link: &str) -> Result<Vec<RankHistoryEntry>, StoreError>;

    async fn get_stats(&self) -> Result<AgentStats, StoreError>;

    /// Largest rank movements between the two most recent crawls.
    async fn rank_changes(&self, limit: i64) -> Result<Vec<RankChange>, StoreError>;
}

/// Opens the store named by `database_url`; `memory://` selects the
/// in-process store.
pub async fn connect_store(
    database_url: &str,
    max_connections: u32,
) -> Result<std::sync::Arc<dyn AgentStore>, StoreError> {
    if database_url.starts_with("memory://") {
        return Ok(std::sync::Arc::new(MemoryAgentStore::new()));
    }
    let store = PgAgentStore::connect(database_url, max_connections).await?;
    Ok(std::sync::Arc::new(store))
}
