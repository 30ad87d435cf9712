//! Session and message coordination for one agent context.
//!
//! Tracks which session is active, creates sessions optimistically behind a
//! negative placeholder id, pages message history backwards, and reconciles
//! locally echoed messages with what the server confirms. All cache writes
//! happen synchronously in response handlers, never across an `.await`.

use crate::api::RemoteDataService;
use crate::cache::{CacheStore, CreationClaim};
use crate::config::{ClientConfig, SessionCreation};
use crate::error::{ChatError, Result};
use crate::history::MessageHistory;
use crate::models::{
    Message, MessageRole, SendMessageRequest, Session, SessionDraft,
};
use crate::query_keys::QueryKey;
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Where the coordinator is in the session lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionPhase {
    NoSession,
    /// Created locally; the server does not know it yet.
    Optimistic { placeholder_id: i64 },
    Confirmed { session_id: i64 },
}

impl SessionPhase {
    pub fn session_id(&self) -> Option<i64> {
        match self {
            SessionPhase::NoSession => None,
            SessionPhase::Optimistic { placeholder_id } => Some(*placeholder_id),
            SessionPhase::Confirmed { session_id } => Some(*session_id),
        }
    }
}

/// What the user is asked to confirm.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfirmRequest {
    RenameSession { session_id: i64, new_name: String },
    DeleteSession { session_id: i64, display_name: String },
}

/// Confirmation dialog owned by the UI.
#[async_trait]
pub trait UserConfirmation: Send + Sync {
    async fn confirm(&self, request: &ConfirmRequest) -> bool;
}

/// Confirms everything. For hosts that ask before calling in.
pub struct AlwaysConfirm;

#[async_trait]
impl UserConfirmation for AlwaysConfirm {
    async fn confirm(&self, _request: &ConfirmRequest) -> bool {
        true
    }
}

/// Server-confirmed result of a send.
#[derive(Clone, Debug, PartialEq)]
pub struct SendOutcome {
    pub local_id: Uuid,
    pub session: Session,
    pub message: Message,
    pub reply: Option<Message>,
}

/// Result of selecting a session.
#[derive(Debug)]
pub struct Selection {
    pub session_id: i64,
    /// What to render right away.
    pub history: MessageHistory,
    /// Background refresh started because a cached history was shown.
    pub refresh: Option<JoinHandle<()>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageOutcome {
    Loaded { added: usize },
    Exhausted,
}

/// Server side of an optimistic rename.
pub type MutationHandle = JoinHandle<Result<()>>;

#[derive(Debug)]
pub enum RenameOutcome {
    Cancelled,
    /// Placeholder session, renamed locally only.
    Applied,
    /// Applied locally; the server call is still running and rolls the name
    /// back if it fails.
    Syncing(MutationHandle),
}

struct ContextState {
    agent_id: i64,
    phase: SessionPhase,
    // Bumped whenever the active context changes; late responses compare against it.
    generation: u64,
}

#[derive(Clone)]
pub struct SessionCoordinator {
    store: CacheStore,
    service: Arc<dyn RemoteDataService>,
    config: Arc<ClientConfig>,
    context: Arc<Mutex<ContextState>>,
}

impl SessionCoordinator {
    pub fn new(
        store: CacheStore,
        service: Arc<dyn RemoteDataService>,
        config: Arc<ClientConfig>,
        agent_id: i64,
    ) -> Self {
        Self {
            store,
            service,
            config,
            context: Arc::new(Mutex::new(ContextState {
                agent_id,
                phase: SessionPhase::NoSession,
                generation: 0,
            })),
        }
    }

    fn context(&self) -> MutexGuard<'_, ContextState> {
        self.context.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn agent_id(&self) -> i64 {
        self.context().agent_id
    }

    pub fn phase(&self) -> SessionPhase {
        self.context().phase
    }

    pub fn active_session_id(&self) -> Option<i64> {
        self.phase().session_id()
    }

    pub fn generation(&self) -> u64 {
        self.context().generation
    }

    fn is_current(&self, generation: u64) -> bool {
        self.context().generation == generation
    }

    fn enter(&self, agent_id: i64, phase: SessionPhase) -> Option<u64> {
        let mut context = self.context();
        if context.agent_id != agent_id {
            return None;
        }
        context.phase = phase;
        context.generation += 1;
        Some(context.generation)
    }

    /// Moves to another agent. Nothing is selected afterwards.
    pub fn switch_agent(&self, agent_id: i64) {
        let mut context = self.context();
        log::info!("Switching agent context {} -> {}", context.agent_id, agent_id);
        context.agent_id = agent_id;
        context.phase = SessionPhase::NoSession;
        context.generation += 1;
    }

    pub fn clear_selection(&self) {
        let agent_id = self.agent_id();
        self.enter(agent_id, SessionPhase::NoSession);
    }

    // --- Reads ---

    pub fn cached_sessions(&self) -> Option<Vec<Session>> {
        self.store
            .get::<Vec<Session>>(QueryKey::AgentSessions(self.agent_id()))
            .map(|entry| entry.value)
    }

    pub fn cached_history(&self, session_id: i64) -> Option<MessageHistory> {
        self.store
            .get::<MessageHistory>(QueryKey::session_messages(self.agent_id(), session_id))
            .map(|entry| entry.value)
    }

    pub fn active_history(&self) -> Option<MessageHistory> {
        self.active_session_id()
            .and_then(|session_id| self.cached_history(session_id))
    }

    /// Sessions of the active agent. A stale list is returned as is while a
    /// refresh runs in the background; a missing one is fetched.
    pub async fn list_sessions(&self) -> Result<Vec<Session>> {
        let agent_id = self.agent_id();
        match self.store.get::<Vec<Session>>(QueryKey::AgentSessions(agent_id)) {
            Some(entry) if !entry.is_stale() => Ok(entry.value),
            Some(entry) => {
                let this = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = this.fetch_sessions(agent_id).await {
                        log::warn!("Background refresh of sessions for agent {} failed: {}", agent_id, e);
                    }
                });
                Ok(entry.value)
            }
            None => self.fetch_sessions(agent_id).await,
        }
    }

    /// Fetches the session list, keeping local placeholders at the top.
    pub async fn fetch_sessions(&self, agent_id: i64) -> Result<Vec<Session>> {
        log::debug!("Fetching sessions for agent {}", agent_id);
        let fetched = self.service.list_sessions(agent_id).await?;
        let key = QueryKey::AgentSessions(agent_id);
        let mut merged: Vec<Session> = self
            .store
            .get::<Vec<Session>>(&key)
            .map(|entry| entry.value)
            .unwrap_or_default()
            .into_iter()
            .filter(Session::is_placeholder)
            .collect();
        for session in fetched {
            if session.agent_id != agent_id {
                log::warn!(
                    "Dropping session {} of agent {} from the list of agent {}",
                    session.id,
                    session.agent_id,
                    agent_id
                );
                continue;
            }
            merged.push(session);
        }
        log::info!("Fetched {} sessions for agent {}", merged.len(), agent_id);
        self.store
            .set(key, merged.clone(), self.config.stale_times.sessions());
        Ok(merged)
    }

    /// Resolves `session_id` within the active agent, or fails with
    /// [`ChatError::SessionAgentMismatch`].
    pub async fn ensure_session_belongs(&self, session_id: i64) -> Result<Session> {
        let agent_id = self.agent_id();
        let cached = self
            .store
            .get::<Vec<Session>>(QueryKey::AgentSessions(agent_id))
            .map(|entry| entry.value)
            .filter(|sessions| sessions.iter().any(|s| s.id == session_id));
        let sessions = match cached {
            Some(sessions) => sessions,
            None => self.fetch_sessions(agent_id).await?,
        };
        match sessions.into_iter().find(|s| s.id == session_id) {
            Some(session) if session.agent_id == agent_id => Ok(session),
            _ => {
                log::warn!("Rejected session {} for agent {}", session_id, agent_id);
                Err(ChatError::SessionAgentMismatch {
                    session_id,
                    agent_id,
                })
            }
        }
    }

    // --- Selection ---

    /// Makes `session_id` the active session.
    ///
    /// A cached history is returned immediately, stale or not, and refreshed
    /// in the background. Without one, the newest page is fetched first.
    pub async fn select_session(&self, session_id: i64) -> Result<Selection> {
        let agent_id = self.agent_id();
        let session = self.ensure_session_belongs(session_id).await?;
        let phase = if session.is_placeholder() {
            SessionPhase::Optimistic {
                placeholder_id: session_id,
            }
        } else {
            SessionPhase::Confirmed { session_id }
        };
        let generation = self.enter(agent_id, phase).ok_or_else(|| {
            ChatError::Superseded(format!("agent changed while selecting session {}", session_id))
        })?;
        log::info!("Selected session {} of agent {}", session_id, agent_id);

        let key = QueryKey::session_messages(agent_id, session_id);
        if session.is_placeholder() {
            let history = match self.store.get::<MessageHistory>(&key) {
                Some(entry) => entry.value,
                None => {
                    let history = MessageHistory::empty(session_id);
                    self.store
                        .set(&key, history.clone(), self.config.stale_times.messages());
                    history
                }
            };
            return Ok(Selection {
                session_id,
                history,
                refresh: None,
            });
        }

        if let Some(entry) = self.store.get::<MessageHistory>(&key) {
            let refresh = self.spawn_refresh(agent_id, session_id, generation);
            return Ok(Selection {
                session_id,
                history: entry.value,
                refresh: Some(refresh),
            });
        }

        let page = match self
            .service
            .fetch_messages(agent_id, session_id, 1, self.config.page_size)
            .await
        {
            Ok(page) => page,
            Err(e) => {
                log::error!("Failed to load history of session {}: {}", session_id, e);
                if e.is_not_found() {
                    self.forget_session(agent_id, session_id);
                }
                return Err(e);
            }
        };
        if !self.is_current(generation) {
            log::debug!("Discarding history of session {}: selection changed", session_id);
            return Err(ChatError::Superseded(format!(
                "history of session {} arrived after navigation",
                session_id
            )));
        }
        let history = MessageHistory::from_page(session_id, page);
        log::info!("Fetched {} messages for session {}", history.len(), session_id);
        self.store
            .set(&key, history.clone(), self.config.stale_times.messages());
        Ok(Selection {
            session_id,
            history,
            refresh: None,
        })
    }

    fn spawn_refresh(&self, agent_id: i64, session_id: i64, generation: u64) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let result = this
                .service
                .fetch_messages(agent_id, session_id, 1, this.config.page_size)
                .await;
            match result {
                Ok(page) => {
                    if !this.is_current(generation) {
                        log::debug!("Discarding late refresh of session {}", session_id);
                        return;
                    }
                    let key = QueryKey::session_messages(agent_id, session_id);
                    let changed = this
                        .store
                        .update::<MessageHistory, _>(&key, |history| history.merge_page(page).changed());
                    this.store.touch(&key);
                    log::debug!("Refreshed session {} (changed: {})", session_id, changed);
                }
                Err(e) if e.is_not_found() => {
                    log::warn!("Session {} disappeared on the server", session_id);
                    this.forget_session(agent_id, session_id);
                }
                // Best effort: the cached history stays authoritative.
                Err(e) => log::warn!("Background refresh of session {} failed: {}", session_id, e),
            }
        })
    }

    // --- Optimistic creation ---

    /// Starts a new session under a placeholder id and makes it active.
    ///
    /// With lazy creation the placeholder id is returned and the first send
    /// creates the session on the server. With eager creation the server is
    /// asked right away and the reconciled id is returned; if that fails the
    /// placeholder stays usable and the error is returned. Sends into the
    /// placeholder are refused until the eager create has settled.
    pub async fn start_new_session(&self) -> Result<i64> {
        let agent_id = self.agent_id();
        let placeholder_id = self.store.next_placeholder_id();
        let claim = match self.config.session_creation {
            SessionCreation::Lazy => None,
            SessionCreation::Eager => self.claim_session(placeholder_id)?,
        };
        let session = Session::placeholder(placeholder_id, agent_id);
        log::info!("Starting placeholder session {} for agent {}", placeholder_id, agent_id);

        let stale_times = &self.config.stale_times;
        self.store.transaction(|txn| {
            txn.set(
                QueryKey::session(agent_id, placeholder_id),
                session.clone(),
                stale_times.sessions(),
            );
            txn.set(
                QueryKey::session_messages(agent_id, placeholder_id),
                MessageHistory::empty(placeholder_id),
                stale_times.messages(),
            );
            let list_key = QueryKey::AgentSessions(agent_id);
            let inserted = txn.update::<Vec<Session>, _>(&list_key, |sessions| {
                sessions.insert(0, session.clone());
                true
            });
            if !inserted {
                // Nothing cached yet: seed the list, but let the next read fetch.
                txn.set(&list_key, vec![session.clone()], stale_times.sessions());
                txn.invalidate(&list_key);
            }
        });
        self.enter(agent_id, SessionPhase::Optimistic { placeholder_id });

        let Some(_claim) = claim else {
            return Ok(placeholder_id);
        };
        let created = self
            .service
            .create_session(agent_id, &SessionDraft { name: None })
            .await
            .map_err(|e| {
                log::error!("Eager creation of session {} failed: {}", placeholder_id, e);
                e
            })?;
        self.reconcile_session(agent_id, placeholder_id, &created);
        Ok(created.id)
    }

    /// Claims the first server round trip of a placeholder session; server
    /// sessions need none. Fails while another create or send for the same
    /// placeholder is in flight.
    fn claim_session(&self, session_id: i64) -> Result<Option<CreationClaim>> {
        if session_id > 0 {
            return Ok(None);
        }
        match self.store.claim_creation(session_id) {
            Some(claim) => Ok(Some(claim)),
            None => {
                log::warn!("Refusing to send into session {} while it is being created", session_id);
                Err(ChatError::validation(
                    "Session is still being created; wait for it to be confirmed.",
                ))
            }
        }
    }

    /// Re-keys everything cached under a placeholder session to its server id.
    ///
    /// One store transaction, so no reader sees a half-moved state; the phase
    /// switches inside it too. A collision with an already cached server
    /// session falls back to keeping the unconfirmed messages and re-fetching
    /// the agent's session subtree.
    fn reconcile_session(&self, agent_id: i64, placeholder_id: i64, server: &Session) {
        let from = QueryKey::session(agent_id, placeholder_id);
        let to = QueryKey::session(agent_id, server.id);
        let placeholder_messages = QueryKey::session_messages(agent_id, placeholder_id);
        let messages_key = QueryKey::session_messages(agent_id, server.id);
        let stale_times = &self.config.stale_times;

        self.store.transaction(|txn| {
            match txn.move_prefix(&from, &to) {
                Ok(moved) => {
                    log::info!(
                        "Reconciled session {} -> {} ({} cache entries)",
                        placeholder_id,
                        server.id,
                        moved
                    );
                }
                Err(e) => {
                    log::warn!("{}; re-fetching sessions of agent {}", e, agent_id);
                    let placeholder_history = txn
                        .get::<MessageHistory>(&placeholder_messages)
                        .map(|entry| entry.value);
                    txn.remove_prefix(&from);
                    if let Some(history) = placeholder_history {
                        let adopted = txn.update::<MessageHistory, _>(&messages_key, |existing| {
                            existing.adopt_local_entries(history.clone())
                        });
                        if !adopted && !txn.contains(&messages_key) {
                            txn.set(&messages_key, history, stale_times.messages());
                        }
                    }
                    txn.invalidate(QueryKey::AgentSessions(agent_id));
                }
            }

            txn.set(&to, server.clone(), stale_times.sessions());
            txn.update::<MessageHistory, _>(&messages_key, |history| history.retarget(server.id));
            txn.update::<Vec<Session>, _>(QueryKey::AgentSessions(agent_id), |sessions| {
                replace_session(sessions, placeholder_id, server)
            });

            let mut context = self.context();
            if context.agent_id == agent_id
                && context.phase == (SessionPhase::Optimistic { placeholder_id })
            {
                context.phase = SessionPhase::Confirmed {
                    session_id: server.id,
                };
            }
        });
    }

    // --- Sending ---

    /// Sends a message in the active session, starting a new one if none is
    /// active.
    ///
    /// The message is echoed into the history at once as a pending entry. On
    /// success the server's copy takes its place; on failure the entry is
    /// marked failed and kept for [`retry_message`](Self::retry_message).
    pub async fn send_message(&self, content: &str) -> Result<SendOutcome> {
        if content.trim().is_empty() {
            return Err(ChatError::validation("Message cannot be empty."));
        }
        let agent_id = self.agent_id();
        let session_id = match self.phase().session_id() {
            Some(session_id) => session_id,
            None => self.start_new_session().await?,
        };
        let claim = self.claim_session(session_id)?;
        let key = QueryKey::session_messages(agent_id, session_id);

        let local_id = Uuid::new_v4();
        let echo = Message::new(
            self.store.next_placeholder_id(),
            session_id,
            MessageRole::User,
            content,
        );
        let appended = self.store.update::<MessageHistory, _>(&key, |history| {
            history.push_pending(local_id, echo.clone());
            true
        });
        if !appended {
            let mut history = MessageHistory::empty(session_id);
            history.push_pending(local_id, echo);
            self.store
                .set(&key, history, self.config.stale_times.messages());
        }
        log::info!("Queued message {} in session {}", local_id, session_id);

        self.deliver(agent_id, session_id, local_id, content.to_string(), claim)
            .await
    }

    /// Resends a message whose previous attempt failed. Refused like a new
    /// send while its placeholder session is still being created.
    pub async fn retry_message(&self, local_id: Uuid) -> Result<SendOutcome> {
        let agent_id = self.agent_id();
        let found = self.store.find_map::<MessageHistory, _, _>(
            QueryKey::AgentSessions(agent_id),
            |key, history| {
                history
                    .find_local(local_id)
                    .filter(|entry| entry.is_failed())
                    .map(|_| (key.clone(), history.session_id))
            },
        );
        let Some((key, session_id)) = found else {
            return Err(ChatError::not_found("failed message", local_id));
        };
        let claim = self.claim_session(session_id)?;

        let mut content = None;
        self.store.update::<MessageHistory, _>(key, |history| {
            content = history.retry_local(local_id);
            content.is_some()
        });
        let Some(content) = content else {
            return Err(ChatError::not_found("failed message", local_id));
        };
        log::info!("Retrying message {} in session {}", local_id, session_id);
        self.deliver(agent_id, session_id, local_id, content, claim)
            .await
    }

    /// Removes a failed message at the user's request.
    pub fn discard_failed(&self, local_id: Uuid) -> bool {
        let agent_id = self.agent_id();
        self.store
            .update_all::<MessageHistory, _>(QueryKey::AgentSessions(agent_id), |_, history| {
                history.discard_failed(local_id)
            })
            > 0
    }

    /// Sends the pending entry `local_id` of `session_id` and settles it.
    /// `claim` is held until a placeholder session has been reconciled.
    async fn deliver(
        &self,
        agent_id: i64,
        session_id: i64,
        local_id: Uuid,
        content: String,
        claim: Option<CreationClaim>,
    ) -> Result<SendOutcome> {
        let request_key = QueryKey::session_messages(agent_id, session_id);
        let request = SendMessageRequest {
            session_id: (session_id > 0).then_some(session_id),
            message: content,
        };
        let response = match self.service.send_message(agent_id, &request).await {
            Ok(response) => response,
            Err(e) => {
                log::error!("Failed to send message {} in session {}: {}", local_id, session_id, e);
                self.fail_delivery(&request_key, local_id, e.to_string());
                return Err(e);
            }
        };

        let server_session = response.session.clone();
        if server_session.agent_id != agent_id {
            let err = ChatError::SessionAgentMismatch {
                session_id: server_session.id,
                agent_id,
            };
            log::error!(
                "Server placed message {} in session {} of agent {}",
                local_id,
                server_session.id,
                server_session.agent_id
            );
            self.fail_delivery(&request_key, local_id, err.to_string());
            return Err(err);
        }
        if session_id < 0 {
            self.reconcile_session(agent_id, session_id, &server_session);
        } else if server_session.id != session_id {
            log::warn!(
                "Message {} was sent to session {} but confirmed in {}",
                local_id,
                session_id,
                server_session.id
            );
        }
        drop(claim);

        let key = QueryKey::session_messages(agent_id, server_session.id);
        let user_message = response.user_message.clone();
        let reply = response.reply.clone();
        let stale_time = self.config.stale_times.messages();
        self.store.transaction(|txn| {
            let confirmed = txn.update::<MessageHistory, _>(&key, |history| {
                if !history.confirm_local(local_id, user_message.clone()) {
                    return false;
                }
                if let Some(reply) = &reply {
                    history.upsert(reply.clone());
                }
                true
            });
            if !confirmed {
                // The echo sits in the history the message was sent from.
                txn.update::<MessageHistory, _>(&request_key, |history| {
                    history.remove_local(local_id)
                });
                let upserted = txn.update::<MessageHistory, _>(&key, |history| {
                    let mut changed = history.upsert(user_message.clone());
                    if let Some(reply) = &reply {
                        changed |= history.upsert(reply.clone());
                    }
                    changed
                });
                if !upserted && !txn.contains(&key) {
                    let mut history = MessageHistory::empty(server_session.id);
                    history.upsert(user_message.clone());
                    if let Some(reply) = &reply {
                        history.upsert(reply.clone());
                    }
                    txn.set(&key, history, stale_time);
                }
            }
            txn.update::<Vec<Session>, _>(QueryKey::AgentSessions(agent_id), |sessions| {
                if sessions.iter().any(|s| s.id == server_session.id) {
                    replace_session(sessions, server_session.id, &server_session)
                } else {
                    sessions.insert(0, server_session.clone());
                    true
                }
            });
        });
        log::info!(
            "Message {} confirmed as {} in session {}",
            local_id,
            response.user_message.id,
            server_session.id
        );

        Ok(SendOutcome {
            local_id,
            session: response.session,
            message: response.user_message,
            reply: response.reply,
        })
    }

    fn fail_delivery(&self, key: &QueryKey, local_id: Uuid, reason: String) {
        self.store
            .update::<MessageHistory, _>(key, |history| history.mark_failed(local_id, &reason));
        self.store.report_failure(key, reason);
    }

    // --- Pagination ---

    /// Whether [`fetch_next_page`](Self::fetch_next_page) could load anything.
    pub fn has_next_page(&self) -> bool {
        let SessionPhase::Confirmed { session_id } = self.phase() else {
            return false;
        };
        self.cached_history(session_id)
            .map_or(true, |history| history.loaded_pages == 0 || history.has_more)
    }

    /// Fetches the next older page of the active session and merges it in.
    pub async fn fetch_next_page(&self) -> Result<PageOutcome> {
        let (agent_id, phase, generation) = {
            let context = self.context();
            (context.agent_id, context.phase, context.generation)
        };
        let session_id = match phase {
            SessionPhase::Confirmed { session_id } => session_id,
            SessionPhase::Optimistic { .. } => return Ok(PageOutcome::Exhausted),
            SessionPhase::NoSession => {
                return Err(ChatError::validation("No session selected."));
            }
        };
        let key = QueryKey::session_messages(agent_id, session_id);
        let next_page = match self.store.get::<MessageHistory>(&key) {
            Some(entry) if entry.value.loaded_pages > 0 && !entry.value.has_more => {
                return Ok(PageOutcome::Exhausted);
            }
            Some(entry) => entry.value.loaded_pages + 1,
            None => 1,
        };

        log::debug!("Fetching page {} of session {}", next_page, session_id);
        let page = match self
            .service
            .fetch_messages(agent_id, session_id, next_page, self.config.page_size)
            .await
        {
            Ok(page) => page,
            Err(e) => {
                if e.is_not_found() {
                    self.forget_session(agent_id, session_id);
                }
                return Err(e);
            }
        };
        if !self.is_current(generation) {
            log::debug!("Discarding page {} of session {}", next_page, session_id);
            return Err(ChatError::Superseded(format!(
                "page {} of session {} arrived after navigation",
                next_page, session_id
            )));
        }

        let mut added = 0;
        let merged = self.store.update::<MessageHistory, _>(&key, |history| {
            let stats = history.merge_page(page.clone());
            added = stats.added;
            // Paging metadata may move even when no message is new.
            true
        });
        if !merged {
            let history = MessageHistory::from_page(session_id, page);
            added = history.len();
            self.store
                .set(&key, history, self.config.stale_times.messages());
        }
        log::info!("Loaded page {} of session {} ({} new)", next_page, session_id, added);
        Ok(PageOutcome::Loaded { added })
    }

    // --- Rename / delete ---

    /// Renames a session optimistically after the user confirms.
    pub async fn rename_session(
        &self,
        session_id: i64,
        new_name: &str,
        confirmation: &dyn UserConfirmation,
    ) -> Result<RenameOutcome> {
        let name = new_name.trim().to_string();
        if name.is_empty() {
            return Err(ChatError::validation("New name cannot be empty."));
        }
        let agent_id = self.agent_id();
        let session = self.ensure_session_belongs(session_id).await?;
        let request = ConfirmRequest::RenameSession {
            session_id,
            new_name: name.clone(),
        };
        if !confirmation.confirm(&request).await {
            log::debug!("Rename of session {} cancelled", session_id);
            return Ok(RenameOutcome::Cancelled);
        }

        let previous = session.name.clone();
        self.apply_session_name(agent_id, session_id, Some(name.clone()));
        if session.is_placeholder() {
            return Ok(RenameOutcome::Applied);
        }

        let this = self.clone();
        let handle = tokio::spawn(async move {
            match this.service.rename_session(agent_id, session_id, &name).await {
                Ok(server) => {
                    this.store.update::<Vec<Session>, _>(
                        QueryKey::AgentSessions(agent_id),
                        |sessions| replace_session(sessions, session_id, &server),
                    );
                    log::info!("Renamed session {} to '{}'", session_id, name);
                    Ok(())
                }
                Err(e) => {
                    log::error!("Failed to rename session {}: {}", session_id, e);
                    if e.is_not_found() {
                        this.forget_session(agent_id, session_id);
                    } else {
                        this.rollback_session_name(agent_id, session_id, &name, previous);
                    }
                    this.store
                        .report_failure(QueryKey::session(agent_id, session_id), e.to_string());
                    Err(e)
                }
            }
        });
        Ok(RenameOutcome::Syncing(handle))
    }

    fn apply_session_name(&self, agent_id: i64, session_id: i64, name: Option<String>) {
        self.store
            .update::<Vec<Session>, _>(QueryKey::AgentSessions(agent_id), |sessions| {
                match sessions.iter_mut().find(|s| s.id == session_id) {
                    Some(session) if session.name != name => {
                        session.name = name.clone();
                        true
                    }
                    _ => false,
                }
            });
        self.store
            .update::<Session, _>(QueryKey::session(agent_id, session_id), |session| {
                if session.name == name {
                    return false;
                }
                session.name = name.clone();
                true
            });
    }

    /// Restores the old name unless a later rename replaced ours meanwhile.
    fn rollback_session_name(
        &self,
        agent_id: i64,
        session_id: i64,
        attempted: &str,
        previous: Option<String>,
    ) {
        let still_ours = self
            .store
            .get::<Vec<Session>>(QueryKey::AgentSessions(agent_id))
            .and_then(|entry| entry.value.into_iter().find(|s| s.id == session_id))
            .is_some_and(|s| s.name.as_deref() == Some(attempted));
        if still_ours {
            self.apply_session_name(agent_id, session_id, previous);
        }
    }

    /// Deletes a session after the user confirms. Returns `false` when
    /// cancelled.
    pub async fn delete_session(
        &self,
        session_id: i64,
        confirmation: &dyn UserConfirmation,
    ) -> Result<bool> {
        let agent_id = self.agent_id();
        let session = self.ensure_session_belongs(session_id).await?;
        let request = ConfirmRequest::DeleteSession {
            session_id,
            display_name: session.display_name(),
        };
        if !confirmation.confirm(&request).await {
            log::debug!("Deletion of session {} cancelled", session_id);
            return Ok(false);
        }

        if !session.is_placeholder() {
            match self.service.delete_session(agent_id, session_id).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {
                    log::warn!("Session {} was already deleted on the server", session_id);
                }
                Err(e) => {
                    log::error!("Failed to delete session {}: {}", session_id, e);
                    return Err(e);
                }
            }
        }
        self.forget_session(agent_id, session_id);
        log::info!("Deleted session {} of agent {}", session_id, agent_id);
        Ok(true)
    }

    /// Drops a session from every cached view. Leaves the active context if
    /// it pointed at that session.
    fn forget_session(&self, agent_id: i64, session_id: i64) {
        let message_ids: Vec<i64> = self
            .store
            .get::<MessageHistory>(QueryKey::session_messages(agent_id, session_id))
            .map(|entry| {
                let ids: Vec<i64> = entry.value.messages().map(|m| m.id).filter(|id| *id > 0).collect();
                ids
            })
            .unwrap_or_default();
        self.store.remove_prefix(QueryKey::session(agent_id, session_id));
        for message_id in message_ids {
            self.store.remove_prefix(QueryKey::Message(message_id));
        }
        self.store
            .update::<Vec<Session>, _>(QueryKey::AgentSessions(agent_id), |sessions| {
                let before = sessions.len();
                sessions.retain(|s| s.id != session_id);
                sessions.len() != before
            });
        // Saved-word examples link back to sessions.
        self.store.invalidate(QueryKey::SavedWords);

        let mut context = self.context();
        if context.agent_id == agent_id && context.phase.session_id() == Some(session_id) {
            context.phase = SessionPhase::NoSession;
            context.generation += 1;
        }
    }
}

/// Replaces the session with id `id` by `session`, keeping its position and
/// dropping any other copy of `session.id`.
fn replace_session(sessions: &mut Vec<Session>, id: i64, session: &Session) -> bool {
    let Some(index) = sessions.iter().position(|s| s.id == id) else {
        return false;
    };
    if sessions[index] == *session {
        return false;
    }
    sessions[index] = session.clone();
    let mut seen = false;
    sessions.retain(|s| {
        if s.id != session.id {
            return true;
        }
        let keep = !seen;
        seen = true;
        keep
    });
    true
}
