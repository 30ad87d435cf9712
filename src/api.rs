use crate::error::{ChatError, Result};
use crate::models::{
    Agent, AgentDraft, FullTranslation, MessagePage, NewSavedWord, SavedWord, SavedWordUpdate,
    SendMessageRequest, SendMessageResponse, Session, SessionDraft, WordTranslationSet,
};
use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;

// Trait defining the remote data service the cache sits in front of.
#[async_trait]
pub trait RemoteDataService: Send + Sync {
    async fn list_agents(&self) -> Result<Vec<Agent>>;
    async fn get_agent(&self, agent_id: i64) -> Result<Agent>;
    async fn create_agent(&self, draft: &AgentDraft) -> Result<Agent>;
    async fn update_agent(&self, agent_id: i64, draft: &AgentDraft) -> Result<Agent>;

    async fn list_sessions(&self, agent_id: i64) -> Result<Vec<Session>>;
    async fn create_session(&self, agent_id: i64, draft: &SessionDraft) -> Result<Session>;
    async fn rename_session(&self, agent_id: i64, session_id: i64, name: &str) -> Result<Session>;
    async fn delete_session(&self, agent_id: i64, session_id: i64) -> Result<()>;

    /// One page of history; page 1 is the newest.
    async fn fetch_messages(
        &self,
        agent_id: i64,
        session_id: i64,
        page: u32,
        page_size: u32,
    ) -> Result<MessagePage>;
    async fn send_message(
        &self,
        agent_id: i64,
        request: &SendMessageRequest,
    ) -> Result<SendMessageResponse>;

    async fn translate(&self, message_id: i64) -> Result<FullTranslation>;
    async fn translate_with_words(&self, message_id: i64) -> Result<WordTranslationSet>;

    async fn list_saved_words(&self) -> Result<Vec<SavedWord>>;
    async fn match_saved_words(&self, words: &[String]) -> Result<Vec<SavedWord>>;
    async fn save_word(&self, word: &NewSavedWord) -> Result<SavedWord>;
    async fn update_saved_word(&self, word_id: i64, update: &SavedWordUpdate) -> Result<SavedWord>;
    async fn delete_saved_word(&self, word_id: i64) -> Result<()>;
}

// --- HTTP implementation ---

pub struct HttpDataService {
    client: Client,
    base_url: String,
    auth_token: Option<String>,
}

impl HttpDataService {
    pub fn new(base_url: impl Into<String>, auth_token: Option<String>) -> anyhow::Result<Self> {
        let base_url = base_url.into();
        reqwest::Url::parse(&base_url)
            .with_context(|| format!("Invalid base URL '{}'", base_url))?;
        let client = Client::builder()
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_token,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self.client.request(method, self.url(path));
        match &self.auth_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder, entity: &'static str, id: String) -> Result<Response> {
        let response = builder.send().await.map_err(|e| {
            log::error!("Request for {} '{}' failed: {}", entity, id, e);
            ChatError::from(e)
        })?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<Failed to read error body>".to_string());
        log::warn!("Request for {} '{}' returned {}: {}", entity, id, status, body);
        Err(status_error(status, entity, id, body))
    }

    async fn json<T: DeserializeOwned>(
        &self,
        builder: RequestBuilder,
        entity: &'static str,
        id: String,
    ) -> Result<T> {
        let response = self.send(builder, entity, id).await?;
        let bytes = response.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn with_body<B: Serialize + ?Sized>(&self, method: Method, path: &str, body: &B) -> RequestBuilder {
        self.request(method, path).json(body)
    }
}

fn status_error(status: StatusCode, entity: &'static str, id: String, body: String) -> ChatError {
    match status {
        StatusCode::NOT_FOUND => ChatError::NotFound { entity, id },
        StatusCode::CONFLICT => ChatError::Conflict(body),
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => ChatError::Validation(body),
        _ => ChatError::Network(format!("status {}: {}", status, body)),
    }
}

#[async_trait]
impl RemoteDataService for HttpDataService {
    async fn list_agents(&self) -> Result<Vec<Agent>> {
        log::debug!("GET /agents");
        self.json(self.request(Method::GET, "/agents"), "agents", "*".into())
            .await
    }

    async fn get_agent(&self, agent_id: i64) -> Result<Agent> {
        let path = format!("/agents/{}", agent_id);
        self.json(self.request(Method::GET, &path), "agent", agent_id.to_string())
            .await
    }

    async fn create_agent(&self, draft: &AgentDraft) -> Result<Agent> {
        log::info!("Creating agent '{}'", draft.name);
        self.json(self.with_body(Method::POST, "/agents", draft), "agent", "new".into())
            .await
    }

    async fn update_agent(&self, agent_id: i64, draft: &AgentDraft) -> Result<Agent> {
        let path = format!("/agents/{}", agent_id);
        self.json(self.with_body(Method::PUT, &path, draft), "agent", agent_id.to_string())
            .await
    }

    async fn list_sessions(&self, agent_id: i64) -> Result<Vec<Session>> {
        let path = format!("/agents/{}/sessions", agent_id);
        self.json(self.request(Method::GET, &path), "agent", agent_id.to_string())
            .await
    }

    async fn create_session(&self, agent_id: i64, draft: &SessionDraft) -> Result<Session> {
        let path = format!("/agents/{}/sessions", agent_id);
        self.json(self.with_body(Method::POST, &path, draft), "agent", agent_id.to_string())
            .await
    }

    async fn rename_session(&self, agent_id: i64, session_id: i64, name: &str) -> Result<Session> {
        let path = format!("/agents/{}/sessions/{}", agent_id, session_id);
        let body = SessionDraft {
            name: Some(name.to_string()),
        };
        self.json(self.with_body(Method::PUT, &path, &body), "session", session_id.to_string())
            .await
    }

    async fn delete_session(&self, agent_id: i64, session_id: i64) -> Result<()> {
        let path = format!("/agents/{}/sessions/{}", agent_id, session_id);
        self.send(self.request(Method::DELETE, &path), "session", session_id.to_string())
            .await?;
        Ok(())
    }

    async fn fetch_messages(
        &self,
        agent_id: i64,
        session_id: i64,
        page: u32,
        page_size: u32,
    ) -> Result<MessagePage> {
        let path = format!("/agents/{}/chat", agent_id);
        let builder = self.request(Method::GET, &path).query(&[
            ("session", session_id.to_string()),
            ("page", page.to_string()),
            ("limit", page_size.to_string()),
        ]);
        self.json(builder, "session", session_id.to_string()).await
    }

    async fn send_message(
        &self,
        agent_id: i64,
        request: &SendMessageRequest,
    ) -> Result<SendMessageResponse> {
        let path = format!("/agents/{}/chat", agent_id);
        let id = request
            .session_id
            .map_or_else(|| "new".to_string(), |id| id.to_string());
        self.json(self.with_body(Method::POST, &path, request), "session", id)
            .await
    }

    async fn translate(&self, message_id: i64) -> Result<FullTranslation> {
        let path = format!("/messages/{}/translate", message_id);
        self.json(self.request(Method::POST, &path), "message", message_id.to_string())
            .await
    }

    async fn translate_with_words(&self, message_id: i64) -> Result<WordTranslationSet> {
        let path = format!("/messages/{}/translate-with-words", message_id);
        self.json(self.request(Method::POST, &path), "message", message_id.to_string())
            .await
    }

    async fn list_saved_words(&self) -> Result<Vec<SavedWord>> {
        self.json(self.request(Method::GET, "/saved-words"), "saved words", "*".into())
            .await
    }

    async fn match_saved_words(&self, words: &[String]) -> Result<Vec<SavedWord>> {
        let builder = self
            .request(Method::GET, "/saved-words/match")
            .query(&[("words", words.join(","))]);
        self.json(builder, "saved words", words.join(",")).await
    }

    async fn save_word(&self, word: &NewSavedWord) -> Result<SavedWord> {
        self.json(self.with_body(Method::POST, "/saved-words", word), "saved word", word.word.clone())
            .await
    }

    async fn update_saved_word(&self, word_id: i64, update: &SavedWordUpdate) -> Result<SavedWord> {
        let path = format!("/saved-words/{}", word_id);
        self.json(self.with_body(Method::PUT, &path, update), "saved word", word_id.to_string())
            .await
    }

    async fn delete_saved_word(&self, word_id: i64) -> Result<()> {
        let path = format!("/saved-words/{}", word_id);
        self.send(self.request(Method::DELETE, &path), "saved word", word_id.to_string())
            .await?;
        Ok(())
    }
}
