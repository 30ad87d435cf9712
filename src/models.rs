use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Generation settings attached to an agent.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub temperature: f32,
    #[serde(default)]
    pub system_prompt: String,
    // Ordered; the server applies them in sequence.
    #[serde(default)]
    pub rules: Vec<String>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            system_prompt: String::new(),
            rules: Vec::new(),
        }
    }
}

/// A chat agent. Positive ids are persisted, negative ids are local drafts.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub id: i64,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Agent {
    pub fn is_persisted(&self) -> bool {
        self.id > 0
    }
}

/// Body of `POST /agents` and `PUT /agents/:id`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentDraft {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(default)]
    pub generation: GenerationConfig,
}

impl From<&Agent> for AgentDraft {
    fn from(agent: &Agent) -> Self {
        Self {
            name: agent.name.clone(),
            description: agent.description.clone(),
            avatar: agent.avatar.clone(),
            generation: agent.generation.clone(),
        }
    }
}

/// A conversation thread owned by one agent.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: i64,
    pub agent_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Session {
    /// Local, not yet persisted session.
    pub fn placeholder(id: i64, agent_id: i64) -> Self {
        Self {
            id,
            agent_id,
            name: None,
            created_at: Utc::now(),
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.id < 0
    }

    /// The name shown in the sidebar: explicit name or the creation date.
    pub fn display_name(&self) -> String {
        match self.name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => self.created_at.format("%Y-%m-%d %H:%M").to_string(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

/// One word of a message and its translation.
///
/// `original_word` is the exact substring as it appears in the message.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WordTranslation {
    pub original_word: String,
    pub translation: String,
}

impl WordTranslation {
    pub fn new(original_word: impl Into<String>, translation: impl Into<String>) -> Self {
        Self {
            original_word: original_word.into(),
            translation: translation.into(),
        }
    }
}

/// A chat message. Append-only per session, except for the translation fields.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: i64,
    pub session_id: i64,
    pub role: MessageRole,
    pub content: String,
    // Raw provider payloads, kept for the debug view.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_request: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub translation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub word_translations: Option<Vec<WordTranslation>>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(id: i64, session_id: i64, role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            id,
            session_id,
            role,
            content: content.into(),
            raw_request: None,
            raw_response: None,
            translation: None,
            word_translations: None,
            created_at: Utc::now(),
        }
    }

    /// System messages are never rendered.
    pub fn is_visible(&self) -> bool {
        self.role != MessageRole::System
    }

    pub fn supports_word_translation(&self) -> bool {
        self.role == MessageRole::Assistant
    }
}

/// An example sentence attached to a saved word, linked to where it came from.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExampleSentence {
    pub sentence: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub translation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<i64>,
}

/// A vocabulary entry collected by the user.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SavedWord {
    pub id: i64,
    pub word: String,
    pub translation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pinyin: Option<String>,
    #[serde(default)]
    pub examples: Vec<ExampleSentence>,
    pub language: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

/// Body of `POST /saved-words`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NewSavedWord {
    pub word: String,
    pub translation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pinyin: Option<String>,
    #[serde(default)]
    pub examples: Vec<ExampleSentence>,
    pub language: String,
}

/// Body of `PUT /saved-words/:id`. Absent fields are left unchanged.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SavedWordUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub translation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pinyin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub examples: Option<Vec<ExampleSentence>>,
}

// --- Wire payloads ---

/// Body of `POST /agents/:id/chat`. A missing session id lets the server create one.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<i64>,
    pub message: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageResponse {
    pub session: Session,
    pub user_message: Message,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply: Option<Message>,
}

/// One page of history, oldest first. Page 1 is the newest page.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MessagePage {
    pub messages: Vec<Message>,
    pub page: u32,
    #[serde(default)]
    pub has_more: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionDraft {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FullTranslation {
    pub translation: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WordTranslationSet {
    pub translation: String,
    #[serde(default)]
    pub word_translations: Vec<WordTranslation>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn session_display_name_falls_back_to_date() {
        let mut session = Session::placeholder(-1, 7);
        session.created_at = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 0).unwrap();
        assert_eq!(session.display_name(), "2024-03-09 14:05");

        session.name = Some("  ".into());
        assert_eq!(session.display_name(), "2024-03-09 14:05");

        session.name = Some("Grammar drills".into());
        assert_eq!(session.display_name(), "Grammar drills");
    }

    #[test]
    fn decodes_camel_case_message() {
        let json = r#"{
            "id": 501,
            "sessionId": 42,
            "role": "assistant",
            "content": "你好",
            "wordTranslations": [{"originalWord": "你好", "translation": "hello"}]
        }"#;
        let message: Message = serde_json::from_str(json).unwrap();
        assert_eq!(message.role, MessageRole::Assistant);
        assert!(message.supports_word_translation());
        assert_eq!(
            message.word_translations,
            Some(vec![WordTranslation::new("你好", "hello")])
        );
    }

    #[test]
    fn system_messages_are_hidden() {
        let message = Message::new(1, 1, MessageRole::System, "be terse");
        assert!(!message.is_visible());
        assert!(!message.supports_word_translation());
    }

    #[test]
    fn send_request_omits_missing_session() {
        let body = SendMessageRequest {
            session_id: None,
            message: "hello".into(),
        };
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            serde_json::json!({ "message": "hello" })
        );
    }
}
