#![allow(dead_code)]

use async_trait::async_trait;
use chatcache::models::{
    Agent, AgentDraft, FullTranslation, GenerationConfig, Message, MessagePage, MessageRole,
    NewSavedWord, SavedWord, SavedWordUpdate, SendMessageRequest, SendMessageResponse, Session,
    SessionDraft, WordTranslation, WordTranslationSet,
};
use chatcache::{ChatError, RemoteDataService, Result};
use chrono::{TimeZone, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

pub const TRANSLATE_DELAY: Duration = Duration::from_millis(50);
/// Latency of sends and session creates while `slow_server` is set.
pub const SERVER_DELAY: Duration = Duration::from_millis(50);

#[derive(Default)]
struct Data {
    agents: Vec<Agent>,
    sessions: Vec<Session>,
    messages: HashMap<i64, Vec<Message>>,
    saved_words: Vec<SavedWord>,
    translations: HashMap<i64, WordTranslationSet>,
    next_agent_id: i64,
    next_session_id: i64,
    next_message_id: i64,
    next_word_id: i64,
}

/// In-memory stand-in for the chat server.
pub struct MockDataService {
    data: Mutex<Data>,
    pub replies: AtomicBool,
    pub fail_next_send: AtomicBool,
    pub fail_next_rename: AtomicBool,
    pub fail_next_translate: AtomicBool,
    pub slow_server: AtomicBool,
    /// Next send without a session id opens the session under this agent.
    pub foreign_agent: Mutex<Option<i64>>,
    pub send_calls: AtomicUsize,
    pub fetch_calls: AtomicUsize,
    pub list_session_calls: AtomicUsize,
    pub translate_calls: AtomicUsize,
    pub word_translate_calls: AtomicUsize,
    pub match_calls: AtomicUsize,
    pub create_session_calls: AtomicUsize,
}

pub fn timestamp(offset: i64) -> chrono::DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + offset, 0).unwrap()
}

pub fn agent(id: i64, name: &str) -> Agent {
    Agent {
        id,
        name: name.to_string(),
        description: None,
        avatar: None,
        generation: GenerationConfig::default(),
        created_at: timestamp(0),
    }
}

pub fn session(id: i64, agent_id: i64, name: Option<&str>) -> Session {
    Session {
        id,
        agent_id,
        name: name.map(str::to_string),
        created_at: timestamp(id),
    }
}

pub fn message(id: i64, session_id: i64, role: MessageRole, content: &str) -> Message {
    let mut message = Message::new(id, session_id, role, content);
    message.created_at = timestamp(id);
    message
}

impl MockDataService {
    pub fn new() -> Self {
        Self {
            data: Mutex::new(Data {
                next_agent_id: 100,
                next_session_id: 42,
                next_message_id: 501,
                next_word_id: 900,
                ..Data::default()
            }),
            replies: AtomicBool::new(false),
            fail_next_send: AtomicBool::new(false),
            fail_next_rename: AtomicBool::new(false),
            fail_next_translate: AtomicBool::new(false),
            slow_server: AtomicBool::new(false),
            foreign_agent: Mutex::new(None),
            send_calls: AtomicUsize::new(0),
            fetch_calls: AtomicUsize::new(0),
            list_session_calls: AtomicUsize::new(0),
            translate_calls: AtomicUsize::new(0),
            word_translate_calls: AtomicUsize::new(0),
            match_calls: AtomicUsize::new(0),
            create_session_calls: AtomicUsize::new(0),
        }
    }

    /// Agent 7 with no sessions, the usual starting point.
    pub fn with_agent() -> Arc<Self> {
        let mock = Self::new();
        mock.add_agent(agent(7, "Tutor"));
        Arc::new(mock)
    }

    fn data(&self) -> MutexGuard<'_, Data> {
        self.data.lock().unwrap()
    }

    pub fn add_agent(&self, agent: Agent) {
        self.data().agents.push(agent);
    }

    pub fn add_session(&self, session: Session) {
        let mut data = self.data();
        data.messages.entry(session.id).or_default();
        data.sessions.push(session);
    }

    /// Seeds `count` alternating user/assistant messages, ids starting at `first_id`.
    pub fn seed_messages(&self, session_id: i64, first_id: i64, count: i64) {
        let mut data = self.data();
        let list = data.messages.entry(session_id).or_default();
        for id in first_id..first_id + count {
            let role = if id % 2 == 0 {
                MessageRole::User
            } else {
                MessageRole::Assistant
            };
            list.push(message(id, session_id, role, &format!("m{}", id)));
        }
    }

    pub fn set_translation(&self, message_id: i64, translation: &str, words: &[(&str, &str)]) {
        self.data().translations.insert(
            message_id,
            WordTranslationSet {
                translation: translation.to_string(),
                word_translations: words
                    .iter()
                    .map(|(o, t)| WordTranslation::new(*o, *t))
                    .collect(),
            },
        );
    }

    pub fn add_saved_word(&self, word: &str, translation: &str) -> i64 {
        let mut data = self.data();
        let id = data.next_word_id;
        data.next_word_id += 1;
        data.saved_words.push(SavedWord {
            id,
            word: word.to_string(),
            translation: translation.to_string(),
            pinyin: None,
            examples: Vec::new(),
            language: "zh".to_string(),
            created_at: timestamp(0),
        });
        id
    }

    pub fn server_messages(&self, session_id: i64) -> Vec<Message> {
        self.data()
            .messages
            .get(&session_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn server_session(&self, session_id: i64) -> Option<Session> {
        self.data()
            .sessions
            .iter()
            .find(|s| s.id == session_id)
            .cloned()
    }

    /// Deletes a session behind the client's back.
    pub fn drop_session(&self, session_id: i64) {
        let mut data = self.data();
        data.sessions.retain(|s| s.id != session_id);
        data.messages.remove(&session_id);
    }

    async fn latency(&self) {
        if self.slow_server.load(Ordering::SeqCst) {
            tokio::time::sleep(SERVER_DELAY).await;
        }
    }

    fn find_session(&self, agent_id: i64, session_id: i64) -> Result<Session> {
        self.data()
            .sessions
            .iter()
            .find(|s| s.id == session_id && s.agent_id == agent_id)
            .cloned()
            .ok_or_else(|| ChatError::not_found("session", session_id))
    }

    fn new_session(data: &mut Data, agent_id: i64, name: Option<String>) -> Session {
        let id = data.next_session_id;
        data.next_session_id += 1;
        let session = Session {
            id,
            agent_id,
            name,
            created_at: timestamp(id),
        };
        data.sessions.push(session.clone());
        data.messages.insert(id, Vec::new());
        session
    }

    fn new_message(data: &mut Data, session_id: i64, role: MessageRole, content: &str) -> Message {
        let id = data.next_message_id;
        data.next_message_id += 1;
        let message = message(id, session_id, role, content);
        data.messages
            .entry(session_id)
            .or_default()
            .push(message.clone());
        message
    }
}

#[async_trait]
impl RemoteDataService for MockDataService {
    async fn list_agents(&self) -> Result<Vec<Agent>> {
        Ok(self.data().agents.clone())
    }

    async fn get_agent(&self, agent_id: i64) -> Result<Agent> {
        self.data()
            .agents
            .iter()
            .find(|a| a.id == agent_id)
            .cloned()
            .ok_or_else(|| ChatError::not_found("agent", agent_id))
    }

    async fn create_agent(&self, draft: &AgentDraft) -> Result<Agent> {
        let mut data = self.data();
        let mut created = agent(data.next_agent_id, &draft.name);
        data.next_agent_id += 1;
        created.description = draft.description.clone();
        created.generation = draft.generation.clone();
        data.agents.push(created.clone());
        Ok(created)
    }

    async fn update_agent(&self, agent_id: i64, draft: &AgentDraft) -> Result<Agent> {
        let mut data = self.data();
        let agent = data
            .agents
            .iter_mut()
            .find(|a| a.id == agent_id)
            .ok_or_else(|| ChatError::not_found("agent", agent_id))?;
        agent.name = draft.name.clone();
        agent.description = draft.description.clone();
        agent.generation = draft.generation.clone();
        Ok(agent.clone())
    }

    async fn list_sessions(&self, agent_id: i64) -> Result<Vec<Session>> {
        self.list_session_calls.fetch_add(1, Ordering::SeqCst);
        let data = self.data();
        let mut sessions: Vec<Session> = data
            .sessions
            .iter()
            .filter(|s| s.agent_id == agent_id)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(sessions)
    }

    async fn create_session(&self, agent_id: i64, draft: &SessionDraft) -> Result<Session> {
        self.create_session_calls.fetch_add(1, Ordering::SeqCst);
        self.latency().await;
        let mut data = self.data();
        Ok(Self::new_session(&mut data, agent_id, draft.name.clone()))
    }

    async fn rename_session(&self, agent_id: i64, session_id: i64, name: &str) -> Result<Session> {
        if self.fail_next_rename.swap(false, Ordering::SeqCst) {
            return Err(ChatError::Network("connection reset".into()));
        }
        self.find_session(agent_id, session_id)?;
        let mut data = self.data();
        let session = data
            .sessions
            .iter_mut()
            .find(|s| s.id == session_id)
            .ok_or_else(|| ChatError::not_found("session", session_id))?;
        session.name = Some(name.to_string());
        Ok(session.clone())
    }

    async fn delete_session(&self, agent_id: i64, session_id: i64) -> Result<()> {
        self.find_session(agent_id, session_id)?;
        self.drop_session(session_id);
        Ok(())
    }

    async fn fetch_messages(
        &self,
        agent_id: i64,
        session_id: i64,
        page: u32,
        page_size: u32,
    ) -> Result<MessagePage> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.find_session(agent_id, session_id)?;
        let all = self.server_messages(session_id);
        let size = page_size.max(1) as usize;
        let skip = (page.max(1) as usize - 1) * size;
        let end = all.len().saturating_sub(skip);
        let start = end.saturating_sub(size);
        Ok(MessagePage {
            messages: all[start..end].to_vec(),
            page,
            has_more: start > 0,
        })
    }

    async fn send_message(
        &self,
        agent_id: i64,
        request: &SendMessageRequest,
    ) -> Result<SendMessageResponse> {
        self.send_calls.fetch_add(1, Ordering::SeqCst);
        self.latency().await;
        if self.fail_next_send.swap(false, Ordering::SeqCst) {
            return Err(ChatError::Network("connection refused".into()));
        }
        let session = match request.session_id {
            Some(id) => self.find_session(agent_id, id)?,
            None => {
                let owner = self.foreign_agent.lock().unwrap().take().unwrap_or(agent_id);
                let mut data = self.data();
                Self::new_session(&mut data, owner, None)
            }
        };
        let mut data = self.data();
        let user_message =
            Self::new_message(&mut data, session.id, MessageRole::User, &request.message);
        let reply = if self.replies.load(Ordering::SeqCst) {
            let content = format!("echo: {}", request.message);
            Some(Self::new_message(
                &mut data,
                session.id,
                MessageRole::Assistant,
                &content,
            ))
        } else {
            None
        };
        Ok(SendMessageResponse {
            session,
            user_message,
            reply,
        })
    }

    async fn translate(&self, message_id: i64) -> Result<FullTranslation> {
        self.translate_calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(TRANSLATE_DELAY).await;
        if self.fail_next_translate.swap(false, Ordering::SeqCst) {
            return Err(ChatError::Network("translator unavailable".into()));
        }
        let translation = self
            .data()
            .translations
            .get(&message_id)
            .map(|set| set.translation.clone())
            .ok_or_else(|| ChatError::not_found("message", message_id))?;
        Ok(FullTranslation { translation })
    }

    async fn translate_with_words(&self, message_id: i64) -> Result<WordTranslationSet> {
        self.word_translate_calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(TRANSLATE_DELAY).await;
        self.data()
            .translations
            .get(&message_id)
            .cloned()
            .ok_or_else(|| ChatError::not_found("message", message_id))
    }

    async fn list_saved_words(&self) -> Result<Vec<SavedWord>> {
        Ok(self.data().saved_words.clone())
    }

    async fn match_saved_words(&self, words: &[String]) -> Result<Vec<SavedWord>> {
        self.match_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .data()
            .saved_words
            .iter()
            .filter(|w| words.contains(&w.word.to_lowercase()))
            .cloned()
            .collect())
    }

    async fn save_word(&self, word: &NewSavedWord) -> Result<SavedWord> {
        let id = self.add_saved_word(&word.word, &word.translation);
        let data = self.data();
        data.saved_words
            .iter()
            .find(|w| w.id == id)
            .cloned()
            .ok_or_else(|| ChatError::not_found("saved word", id))
    }

    async fn update_saved_word(&self, word_id: i64, update: &SavedWordUpdate) -> Result<SavedWord> {
        let mut data = self.data();
        let word = data
            .saved_words
            .iter_mut()
            .find(|w| w.id == word_id)
            .ok_or_else(|| ChatError::not_found("saved word", word_id))?;
        if let Some(translation) = &update.translation {
            word.translation = translation.clone();
        }
        if let Some(pinyin) = &update.pinyin {
            word.pinyin = Some(pinyin.clone());
        }
        Ok(word.clone())
    }

    async fn delete_saved_word(&self, word_id: i64) -> Result<()> {
        let mut data = self.data();
        let before = data.saved_words.len();
        data.saved_words.retain(|w| w.id != word_id);
        if data.saved_words.len() == before {
            return Err(ChatError::not_found("saved word", word_id));
        }
        Ok(())
    }
}
