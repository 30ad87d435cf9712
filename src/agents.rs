use crate::api::RemoteDataService;
use crate::cache::CacheStore;
use crate::config::StaleTimes;
use crate::error::{ChatError, Result};
use crate::models::{Agent, AgentDraft};
use crate::query_keys::QueryKey;
use chrono::Utc;
use std::sync::Arc;

/// Agent list and detail cache, including local drafts that only get a
/// server id once created.
#[derive(Clone)]
pub struct AgentDirectory {
    store: CacheStore,
    service: Arc<dyn RemoteDataService>,
    stale_times: StaleTimes,
}

impl AgentDirectory {
    pub fn new(store: CacheStore, service: Arc<dyn RemoteDataService>, stale_times: StaleTimes) -> Self {
        Self {
            store,
            service,
            stale_times,
        }
    }

    pub fn cached_agents(&self) -> Option<Vec<Agent>> {
        self.store
            .get::<Vec<Agent>>(QueryKey::AgentList)
            .map(|entry| entry.value)
    }

    /// All agents, drafts first. Stale lists are served while a background
    /// refresh runs.
    pub async fn list_agents(&self) -> Result<Vec<Agent>> {
        match self.store.get::<Vec<Agent>>(QueryKey::AgentList) {
            Some(entry) if !entry.is_stale() => Ok(entry.value),
            Some(entry) => {
                let this = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = this.fetch_agents().await {
                        log::warn!("Background refresh of agents failed: {}", e);
                    }
                });
                Ok(entry.value)
            }
            None => self.fetch_agents().await,
        }
    }

    pub async fn fetch_agents(&self) -> Result<Vec<Agent>> {
        let fetched = self.service.list_agents().await?;
        let mut agents: Vec<Agent> = self
            .cached_agents()
            .unwrap_or_default()
            .into_iter()
            .filter(|a| !a.is_persisted())
            .collect();
        agents.extend(fetched);
        log::info!("Fetched {} agents", agents.len());
        self.store
            .set(QueryKey::AgentList, agents.clone(), self.stale_times.agents());
        Ok(agents)
    }

    pub async fn get_agent(&self, agent_id: i64) -> Result<Agent> {
        let key = QueryKey::Agent(agent_id);
        if let Some(entry) = self.store.get::<Agent>(&key) {
            if !entry.is_stale() || !entry.value.is_persisted() {
                return Ok(entry.value);
            }
        }
        if agent_id < 0 {
            return Err(ChatError::not_found("agent", agent_id));
        }
        match self.service.get_agent(agent_id).await {
            Ok(agent) => {
                self.store
                    .set(&key, agent.clone(), self.stale_times.agents());
                Ok(agent)
            }
            Err(e) => {
                if e.is_not_found() {
                    log::warn!("Agent {} no longer exists", agent_id);
                    self.forget_agent(agent_id);
                }
                Err(e)
            }
        }
    }

    /// Caches a new, unsaved agent under a negative id.
    pub fn draft_agent(&self, draft: AgentDraft) -> Agent {
        let agent = Agent {
            id: self.store.next_placeholder_id(),
            name: draft.name,
            description: draft.description,
            avatar: draft.avatar,
            generation: draft.generation,
            created_at: Utc::now(),
        };
        log::info!("Drafted agent {} '{}'", agent.id, agent.name);
        self.store
            .set(QueryKey::Agent(agent.id), agent.clone(), self.stale_times.agents());
        let inserted = self.store.update::<Vec<Agent>, _>(QueryKey::AgentList, |agents| {
            agents.insert(0, agent.clone());
            true
        });
        if !inserted {
            self.store
                .set(QueryKey::AgentList, vec![agent.clone()], self.stale_times.agents());
            self.store.invalidate(QueryKey::AgentList);
        }
        agent
    }

    /// Persists a draft and moves everything cached under its placeholder id
    /// to the server id.
    pub async fn create_agent(&self, draft_id: i64) -> Result<Agent> {
        let draft = self
            .store
            .get::<Agent>(QueryKey::Agent(draft_id))
            .map(|entry| entry.value)
            .filter(|agent| !agent.is_persisted())
            .ok_or_else(|| ChatError::not_found("agent draft", draft_id))?;
        if draft.name.trim().is_empty() {
            return Err(ChatError::validation("Agent name cannot be empty."));
        }

        let created = self.service.create_agent(&AgentDraft::from(&draft)).await?;
        let from = QueryKey::Agent(draft_id);
        let to = QueryKey::Agent(created.id);
        let stale_time = self.stale_times.agents();
        self.store.transaction(|txn| {
            if let Err(e) = txn.move_prefix(&from, &to) {
                log::warn!("{}; re-fetching agent {}", e, created.id);
                txn.remove_prefix(&from);
                txn.invalidate(&to);
            }
            txn.set(&to, created.clone(), stale_time);
            txn.update::<Vec<Agent>, _>(QueryKey::AgentList, |agents| {
                let Some(index) = agents.iter().position(|a| a.id == draft_id) else {
                    agents.push(created.clone());
                    return true;
                };
                agents[index] = created.clone();
                true
            });
        });
        log::info!("Created agent {} (draft {})", created.id, draft_id);
        Ok(created)
    }

    /// Saves changes to an agent. Drafts are changed locally only.
    pub async fn update_agent(&self, agent_id: i64, draft: AgentDraft) -> Result<Agent> {
        if draft.name.trim().is_empty() {
            return Err(ChatError::validation("Agent name cannot be empty."));
        }
        let updated = if agent_id < 0 {
            let mut agent = self
                .store
                .get::<Agent>(QueryKey::Agent(agent_id))
                .map(|entry| entry.value)
                .ok_or_else(|| ChatError::not_found("agent draft", agent_id))?;
            agent.name = draft.name;
            agent.description = draft.description;
            agent.avatar = draft.avatar;
            agent.generation = draft.generation;
            agent
        } else {
            match self.service.update_agent(agent_id, &draft).await {
                Ok(agent) => agent,
                Err(e) => {
                    log::error!("Failed to update agent {}: {}", agent_id, e);
                    if e.is_not_found() {
                        self.forget_agent(agent_id);
                    }
                    return Err(e);
                }
            }
        };
        self.store
            .set(QueryKey::Agent(agent_id), updated.clone(), self.stale_times.agents());
        self.store.update::<Vec<Agent>, _>(QueryKey::AgentList, |agents| {
            match agents.iter_mut().find(|a| a.id == agent_id) {
                Some(agent) if *agent != updated => {
                    *agent = updated.clone();
                    true
                }
                _ => false,
            }
        });
        Ok(updated)
    }

    /// Marks the agent and everything below it (sessions, histories) stale.
    pub fn invalidate_agent(&self, agent_id: i64) -> usize {
        self.store.invalidate(QueryKey::Agent(agent_id))
    }

    pub fn discard_draft(&self, draft_id: i64) -> bool {
        if draft_id > 0 {
            return false;
        }
        self.forget_agent(draft_id)
    }

    fn forget_agent(&self, agent_id: i64) -> bool {
        let removed = self.store.remove_prefix(QueryKey::Agent(agent_id)) > 0;
        let delisted = self.store.update::<Vec<Agent>, _>(QueryKey::AgentList, |agents| {
            let before = agents.len();
            agents.retain(|a| a.id != agent_id);
            agents.len() != before
        });
        removed || delisted
    }
}
