use async_trait::async_trait;
use mulerank_core::{
    rank_changes_between_latest_crawls, Agent, AgentStats, CurrentState, RankChange,
    RankHistoryEntry, ReconciliationPlan,
};
use tokio::sync::Mutex;

use crate::{AgentStore, StoreError};

#[derive(Debug, Default, Clone)]
struct MemoryState {
    agents: CurrentState,
    history: Vec<RankHistoryEntry>,
}

/// Process-local store. Plans are applied to a copy of the state which
/// replaces the live state only once the whole plan has been written.
#[derive(Debug, Default)]
pub struct MemoryAgentStore {
    state: Mutex<MemoryState>,
}

impl MemoryAgentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn history_len(&self) -> usize {
        self.state.lock().await.history.len()
    }
}

#[async_trait]
impl AgentStore for MemoryAgentStore {
    async fn init_schema(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn snapshot(&self) -> Result<CurrentState, StoreError> {
        Ok(self.state.lock().await.agents.clone())
    }

    async fn apply(&self, plan: &ReconciliationPlan) -> Result<(), StoreError> {
        let mut guard = self.state.lock().await;
        let mut next = guard.clone();

        for deactivation in &plan.deactivations {
            if let Some(agent) = next.agents.get_mut(&deactivation.link) {
                agent.is_active = false;
                agent.last_updated = plan.crawl_time;
            }
        }
        for upsert in &plan.upserts {
            let first_seen = next
                .agents
                .get(&upsert.agent.link)
                .map(|existing| existing.first_seen)
                .unwrap_or(upsert.agent.first_seen);
            next.agents.insert(
                upsert.agent.link.clone(),
                Agent {
                    first_seen,
                    ..upsert.agent.clone()
                },
            );
        }
        next.history.extend(plan.history_inserts.iter().cloned());

        *guard = next;
        Ok(())
    }

    async fn get_agent(&self, link: &str) -> Result<Option<Agent>, StoreError> {
        Ok(self.state.lock().await.agents.get(link).cloned())
    }

    async fn list_agents(&self, active_only: bool, limit: Option<i64>) -> Result<Vec<Agent>, StoreError> {
        let state = self.state.lock().await;
        let mut agents = state
            .agents
            .values()
            .filter(|a| !active_only || a.is_active)
            .cloned()
            .collect::<Vec<_>>();
        agents.sort_by(|a, b| a.rank.cmp(&b.rank).then_with(|| a.link.cmp(&b.link)));
        if let Some(limit) = limit {
            agents.truncate(limit.max(0) as usize);
        }
        Ok(agents)
    }

    async fn get_history(&self, link: &str) -> Result<Vec<RankHistoryEntry>, StoreError> {
        let state = self.state.lock().await;
        let mut history = state
            .history
            .iter()
            .filter(|h| h.agent_link == link)
            .cloned()
            .collect::<Vec<_>>();
        history.sort_by_key(|h| h.crawl_time);
        Ok(history)
    }

    async fn get_stats(&self) -> Result<AgentStats, StoreError> {
        let state = self.state.lock().await;
        let active_agents = state.agents.values().filter(|a| a.is_active).count() as i64;
        let inactive_agents = state.agents.len() as i64 - active_agents;
        let mut crawl_times = state.history.iter().map(|h| h.crawl_time).collect::<Vec<_>>();
        crawl_times.sort_unstable();
        crawl_times.dedup();
        Ok(AgentStats {
            active_agents,
            inactive_agents,
            total_crawls: crawl_times.len() as i64,
            latest_crawl: crawl_times.last().copied(),
        })
    }

    async fn rank_changes(&self, limit: i64) -> Result<Vec<RankChange>, StoreError> {
        let state = self.state.lock().await;
        let agents = state.agents.values().cloned().collect::<Vec<_>>();
        Ok(rank_changes_between_latest_crawls(
            &state.history,
            &agents,
            limit.max(0) as usize,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use mulerank_core::{reconcile, RawRecord, ReconcileOptions};

    fn t(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 4, day, 0, 0, 0).single().unwrap()
    }

    fn rec(link: &str) -> RawRecord {
        RawRecord {
            link: link.to_string(),
            name: link.to_uppercase(),
            description: None,
            avatar_url: None,
            price: None,
            author: None,
        }
    }

    async fn run(store: &MemoryAgentStore, links: &[&str], day: u32) {
        let records = links.iter().map(|l| rec(l)).collect::<Vec<_>>();
        let snapshot = store.snapshot().await.unwrap();
        let plan = reconcile(&records, &snapshot, t(day), &ReconcileOptions { max_deactivation_ratio: 1.0 });
        store.apply(&plan).await.unwrap();
    }

    #[tokio::test]
    async fn applying_plans_tracks_state_and_history() {
        let store = MemoryAgentStore::new();
        run(&store, &["/@a", "/@b", "/@c"], 1).await;
        run(&store, &["/@c", "/@a"], 2).await;

        let b = store.get_agent("/@b").await.unwrap().unwrap();
        assert!(!b.is_active);
        assert_eq!(b.rank, 2);
        assert_eq!(b.last_updated, t(2));

        let active = store.list_agents(true, None).await.unwrap();
        let links = active.iter().map(|a| a.link.as_str()).collect::<Vec<_>>();
        assert_eq!(links, vec!["/@c", "/@a"]);

        let all = store.list_agents(false, Some(2)).await.unwrap();
        assert_eq!(all.len(), 2);

        let history = store.get_history("/@c").await.unwrap();
        assert_eq!(history.iter().map(|h| h.rank).collect::<Vec<_>>(), vec![3, 1]);

        let stats = store.get_stats().await.unwrap();
        assert_eq!(stats.active_agents, 2);
        assert_eq!(stats.inactive_agents, 1);
        assert_eq!(stats.total_crawls, 2);
        assert_eq!(stats.latest_crawl, Some(t(2)));

        let changes = store.rank_changes(10).await.unwrap();
        assert_eq!(changes[0].link, "/@c");
        assert_eq!(changes[0].delta, 2);
    }

    #[tokio::test]
    async fn reactivated_agent_keeps_first_seen() {
        let store = MemoryAgentStore::new();
        run(&store, &["/@a", "/@b"], 1).await;
        run(&store, &["/@b"], 2).await;
        run(&store, &["/@a", "/@b"], 3).await;

        let a = store.get_agent("/@a").await.unwrap().unwrap();
        assert!(a.is_active);
        assert_eq!(a.first_seen, t(1));
        assert_eq!(a.rank, 1);
        assert_eq!(store.history_len().await, 5);
    }
}
