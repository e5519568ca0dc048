use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mulerank_core::{Agent, AgentStats, CurrentState, RankChange, RankHistoryEntry, ReconciliationPlan};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{debug, info};

use crate::{AgentStore, StoreError};

/// Advisory lock key serializing `apply` across processes.
const APPLY_LOCK_KEY: i64 = 0x6d75_6c65_7261_6e6b;

#[derive(Debug, sqlx::FromRow)]
struct AgentRow {
    link: String,
    name: String,
    description: Option<String>,
    avatar_url: Option<String>,
    price: Option<String>,
    author: Option<String>,
    rank: i32,
    is_active: bool,
    first_seen: DateTime<Utc>,
    last_updated: DateTime<Utc>,
}

impl From<AgentRow> for Agent {
    fn from(row: AgentRow) -> Self {
        Self {
            link: row.link,
            name: row.name,
            description: row.description,
            avatar_url: row.avatar_url,
            price: row.price,
            author: row.author,
            rank: row.rank,
            is_active: row.is_active,
            first_seen: row.first_seen,
            last_updated: row.last_updated,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct HistoryRow {
    agent_link: String,
    rank: i32,
    crawl_time: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
struct RankChangeRow {
    link: String,
    name: String,
    latest_rank: i32,
    previous_rank: i32,
    delta: i32,
}

const AGENT_COLUMNS: &str =
    "link, name, description, avatar_url, price, author, rank, is_active, first_seen, last_updated";

#[derive(Debug, Clone)]
pub struct PgAgentStore {
    pool: PgPool,
}

impl PgAgentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await?;
        info!(max_connections, "database pool established");
        Ok(Self::new(pool))
    }
}

#[async_trait]
impl AgentStore for PgAgentStore {
    async fn init_schema(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("database schema ready");
        Ok(())
    }

    async fn snapshot(&self) -> Result<CurrentState, StoreError> {
        let rows = sqlx::query_as::<_, AgentRow>(&format!("SELECT {AGENT_COLUMNS} FROM agents"))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.link.clone(), Agent::from(row)))
            .collect())
    }

    async fn apply(&self, plan: &ReconciliationPlan) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(APPLY_LOCK_KEY)
            .execute(&mut *tx)
            .await?;

        if !plan.deactivations.is_empty() {
            let links = plan
                .deactivations
                .iter()
                .map(|d| d.link.clone())
                .collect::<Vec<_>>();
            let result = sqlx::query(
                r#"
                UPDATE agents
                   SET is_active = FALSE,
                       last_updated = $2
                 WHERE link = ANY($1)
                   AND is_active = TRUE
                "#,
            )
            .bind(&links)
            .bind(plan.crawl_time)
            .execute(&mut *tx)
            .await?;
            debug!(rows = result.rows_affected(), "deactivated agents");
        }

        for upsert in &plan.upserts {
            let agent = &upsert.agent;
            sqlx::query(
                r#"
                INSERT INTO agents (
                    link, name, description, avatar_url, price, author, rank,
                    is_active, first_seen, last_updated
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, TRUE, $8, $9)
                ON CONFLICT (link) DO UPDATE SET
                    name = EXCLUDED.name,
                    description = EXCLUDED.description,
                    avatar_url = EXCLUDED.avatar_url,
                    price = EXCLUDED.price,
                    author = EXCLUDED.author,
                    rank = EXCLUDED.rank,
                    is_active = TRUE,
                    last_updated = EXCLUDED.last_updated
                "#,
            )
            .bind(&agent.link)
            .bind(&agent.name)
            .bind(&agent.description)
            .bind(&agent.avatar_url)
            .bind(&agent.price)
            .bind(&agent.author)
            .bind(agent.rank)
            .bind(agent.first_seen)
            .bind(agent.last_updated)
            .execute(&mut *tx)
            .await?;
        }

        if !plan.history_inserts.is_empty() {
            let links = plan
                .history_inserts
                .iter()
                .map(|h| h.agent_link.clone())
                .collect::<Vec<_>>();
            let ranks = plan.history_inserts.iter().map(|h| h.rank).collect::<Vec<_>>();
            sqlx::query(
                r#"
                INSERT INTO rank_history (agent_link, rank, crawl_time)
                SELECT link, rank, $3
                  FROM UNNEST($1::text[], $2::int4[]) AS t(link, rank)
                "#,
            )
            .bind(&links)
            .bind(&ranks)
            .bind(plan.crawl_time)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        info!(
            upserts = plan.upserts.len(),
            history = plan.history_inserts.len(),
            deactivations = plan.deactivations.len(),
            "plan committed"
        );
        Ok(())
    }

    async fn get_agent(&self, link: &str) -> Result<Option<Agent>, StoreError> {
        let row = sqlx::query_as::<_, AgentRow>(&format!(
            "SELECT {AGENT_COLUMNS} FROM agents WHERE link = $1"
        ))
        .bind(link)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Agent::from))
    }

    async fn list_agents(&self, active_only: bool, limit: Option<i64>) -> Result<Vec<Agent>, StoreError> {
        let rows = sqlx::query_as::<_, AgentRow>(&format!(
            r#"
            SELECT {AGENT_COLUMNS}
              FROM agents
             WHERE ($1 = FALSE OR is_active = TRUE)
             ORDER BY rank ASC, link ASC
             LIMIT $2
            "#
        ))
        .bind(active_only)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Agent::from).collect())
    }

    async fn get_history(&self, link: &str) -> Result<Vec<RankHistoryEntry>, StoreError> {
        let rows = sqlx::query_as::<_, HistoryRow>(
            r#"
            SELECT agent_link, rank, crawl_time
              FROM rank_history
             WHERE agent_link = $1
             ORDER BY crawl_time ASC, id ASC
            "#,
        )
        .bind(link)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| RankHistoryEntry {
                agent_link: row.agent_link,
                rank: row.rank,
                crawl_time: row.crawl_time,
            })
            .collect())
    }

    async fn get_stats(&self) -> Result<AgentStats, StoreError> {
        let (active_agents, inactive_agents): (i64, i64) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FILTER (WHERE is_active),
                   COUNT(*) FILTER (WHERE NOT is_active)
              FROM agents
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let (total_crawls, latest_crawl): (i64, Option<DateTime<Utc>>) =
            sqlx::query_as("SELECT COUNT(DISTINCT crawl_time), MAX(crawl_time) FROM rank_history")
                .fetch_one(&self.pool)
                .await?;

        Ok(AgentStats {
            active_agents,
            inactive_agents,
            total_crawls,
            latest_crawl,
        })
    }

    async fn rank_changes(&self, limit: i64) -> Result<Vec<RankChange>, StoreError> {
        let rows = sqlx::query_as::<_, RankChangeRow>(
            r#"
            WITH latest_two AS (
                SELECT DISTINCT crawl_time
                  FROM rank_history
                 ORDER BY crawl_time DESC
                 LIMIT 2
            ),
            bounds AS (
                SELECT MAX(crawl_time) AS latest,
                       MIN(crawl_time) AS previous,
                       COUNT(*) AS crawls
                  FROM latest_two
            )
            SELECT a.link,
                   a.name,
                   cur.rank AS latest_rank,
                   prev.rank AS previous_rank,
                   prev.rank - cur.rank AS delta
              FROM bounds b
              JOIN rank_history cur ON cur.crawl_time = b.latest
              JOIN rank_history prev ON prev.crawl_time = b.previous
                                    AND prev.agent_link = cur.agent_link
              JOIN agents a ON a.link = cur.agent_link
             WHERE b.crawls = 2
             ORDER BY ABS(prev.rank - cur.rank) DESC, a.link ASC
             LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| RankChange {
                link: row.link,
                name: row.name,
                latest_rank: row.latest_rank,
                previous_rank: row.previous_rank,
                delta: row.delta,
            })
            .collect())
    }
}
