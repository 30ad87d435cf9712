use crate::agents::AgentDirectory;
use crate::api::{HttpDataService, RemoteDataService};
use crate::cache::{CacheEvent, CacheStore};
use crate::config::{resolve_auth_token, ClientConfig};
use crate::coordinator::SessionCoordinator;
use crate::saved_words::SavedWordBook;
use crate::translation::TranslationCache;
use anyhow::Context;
use std::sync::Arc;
use tokio::sync::broadcast;

// One per application session; every component shares the same CacheStore.
#[derive(Clone)] // Cheap to clone into background tasks
pub struct ClientState {
    pub store: CacheStore,
    pub service: Arc<dyn RemoteDataService>,
    pub config: Arc<ClientConfig>,
    pub translations: TranslationCache,
    pub saved_words: SavedWordBook,
    pub agents: AgentDirectory,
}

impl ClientState {
    pub fn new(config: ClientConfig, service: Arc<dyn RemoteDataService>) -> Self {
        let store = CacheStore::new();
        let translations =
            TranslationCache::new(store.clone(), service.clone(), config.stale_times.clone());
        let saved_words =
            SavedWordBook::new(store.clone(), service.clone(), config.stale_times.clone());
        let agents = AgentDirectory::new(store.clone(), service.clone(), config.stale_times.clone());
        Self {
            store,
            service,
            config: Arc::new(config),
            translations,
            saved_words,
            agents,
        }
    }

    /// Builds the state on top of the HTTP service described by `config`.
    pub fn connect(config: ClientConfig) -> anyhow::Result<Self> {
        let token = resolve_auth_token(&config)?;
        let service = HttpDataService::new(config.base_url.clone(), token)
            .with_context(|| format!("Failed to set up data service for {}", config.base_url))?;
        log::info!("Connected chat cache to {}", config.base_url);
        Ok(Self::new(config, Arc::new(service)))
    }

    /// A coordinator for one agent context. Coordinators share the cache, so
    /// several can be alive at once (e.g. one per open window).
    pub fn coordinator(&self, agent_id: i64) -> SessionCoordinator {
        SessionCoordinator::new(
            self.store.clone(),
            self.service.clone(),
            self.config.clone(),
            agent_id,
        )
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.store.subscribe()
    }
}
