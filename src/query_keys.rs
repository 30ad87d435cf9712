//! Hierarchical cache keys.
//!
//! Every cacheable query maps to a [`KeyPath`]. Keys of related entities nest
//! under their parent, so invalidating `[agents, detail, 7]` reaches the
//! sessions and message histories of agent 7 without enumerating them.

use std::fmt;

/// One scalar segment of a key path.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeySegment {
    Tag(&'static str),
    Id(i64),
    Text(String),
}

impl fmt::Display for KeySegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeySegment::Tag(tag) => f.write_str(tag),
            KeySegment::Id(id) => write!(f, "{}", id),
            KeySegment::Text(text) => write!(f, "{:?}", text),
        }
    }
}

/// Ordered tuple of segments. Compared by value.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyPath(Vec<KeySegment>);

impl KeyPath {
    pub fn new(segments: Vec<KeySegment>) -> Self {
        Self(segments)
    }

    pub fn segments(&self) -> &[KeySegment] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True when `prefix` is this path or one of its ancestors.
    pub fn starts_with(&self, prefix: &KeyPath) -> bool {
        self.0.starts_with(&prefix.0)
    }

    /// Swaps `from` for `to` at the front of this path.
    /// Returns `None` when `from` is not a prefix.
    pub fn replace_prefix(&self, from: &KeyPath, to: &KeyPath) -> Option<KeyPath> {
        if !self.starts_with(from) {
            return None;
        }
        let mut segments = to.0.clone();
        segments.extend_from_slice(&self.0[from.len()..]);
        Some(KeyPath(segments))
    }
}

impl fmt::Display for KeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, segment) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", segment)?;
        }
        f.write_str("]")
    }
}

const AGENTS: KeySegment = KeySegment::Tag("agents");
const LIST: KeySegment = KeySegment::Tag("list");
const DETAIL: KeySegment = KeySegment::Tag("detail");
const SESSIONS: KeySegment = KeySegment::Tag("sessions");
const MESSAGES: KeySegment = KeySegment::Tag("messages");
const TRANSLATION: KeySegment = KeySegment::Tag("translation");
const WORD_TRANSLATIONS: KeySegment = KeySegment::Tag("word-translations");
const SAVED_WORDS: KeySegment = KeySegment::Tag("saved-words");
const MATCHING: KeySegment = KeySegment::Tag("matching");

/// Every cacheable query, one variant per entity kind.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum QueryKey {
    /// `[agents]`, the root of everything agent-scoped.
    Agents,
    /// `[agents, list]`
    AgentList,
    /// `[agents, detail, id]`
    Agent(i64),
    /// `[agents, detail, id, sessions]`
    AgentSessions(i64),
    /// `[agents, detail, agent, sessions, session]`
    Session { agent_id: i64, session_id: i64 },
    /// `[agents, detail, agent, sessions, session, messages]`
    SessionMessages { agent_id: i64, session_id: i64 },
    /// `[messages, id]`
    Message(i64),
    /// `[messages, id, translation]`
    MessageTranslation(i64),
    /// `[messages, id, word-translations]`
    MessageWordTranslations(i64),
    /// `[saved-words]`
    SavedWords,
    /// `[saved-words, list]`
    SavedWordList,
    /// `[saved-words, matching, "a,b"]`; holds an already normalised word list.
    SavedWordMatches(String),
}

impl QueryKey {
    pub fn session(agent_id: i64, session_id: i64) -> Self {
        QueryKey::Session {
            agent_id,
            session_id,
        }
    }

    pub fn session_messages(agent_id: i64, session_id: i64) -> Self {
        QueryKey::SessionMessages {
            agent_id,
            session_id,
        }
    }

    /// Key for a "which of these words are saved" lookup. Caller order,
    /// casing, padding and duplicates do not change the key.
    pub fn saved_word_matches<S: AsRef<str>>(words: &[S]) -> Self {
        QueryKey::SavedWordMatches(normalize_word_list(words).join(","))
    }

    pub fn path(&self) -> KeyPath {
        use KeySegment::{Id, Text};
        let segments = match self {
            QueryKey::Agents => vec![AGENTS],
            QueryKey::AgentList => vec![AGENTS, LIST],
            QueryKey::Agent(id) => vec![AGENTS, DETAIL, Id(*id)],
            QueryKey::AgentSessions(id) => vec![AGENTS, DETAIL, Id(*id), SESSIONS],
            QueryKey::Session {
                agent_id,
                session_id,
            } => vec![AGENTS, DETAIL, Id(*agent_id), SESSIONS, Id(*session_id)],
            QueryKey::SessionMessages {
                agent_id,
                session_id,
            } => vec![
                AGENTS,
                DETAIL,
                Id(*agent_id),
                SESSIONS,
                Id(*session_id),
                MESSAGES,
            ],
            QueryKey::Message(id) => vec![MESSAGES, Id(*id)],
            QueryKey::MessageTranslation(id) => vec![MESSAGES, Id(*id), TRANSLATION],
            QueryKey::MessageWordTranslations(id) => vec![MESSAGES, Id(*id), WORD_TRANSLATIONS],
            QueryKey::SavedWords => vec![SAVED_WORDS],
            QueryKey::SavedWordList => vec![SAVED_WORDS, LIST],
            QueryKey::SavedWordMatches(joined) => {
                vec![SAVED_WORDS, MATCHING, Text(joined.clone())]
            }
        };
        KeyPath::new(segments)
    }
}

impl From<QueryKey> for KeyPath {
    fn from(key: QueryKey) -> Self {
        key.path()
    }
}

impl From<&QueryKey> for KeyPath {
    fn from(key: &QueryKey) -> Self {
        key.path()
    }
}

/// Lower-cased, trimmed form used for saved-word lookups.
pub fn normalize_word(word: &str) -> String {
    word.trim().to_lowercase()
}

/// Normalises, drops empties, sorts and de-duplicates.
pub fn normalize_word_list<S: AsRef<str>>(words: &[S]) -> Vec<String> {
    let mut normalized: Vec<String> = words
        .iter()
        .map(|w| normalize_word(w.as_ref()))
        .filter(|w| !w.is_empty())
        .collect();
    normalized.sort();
    normalized.dedup();
    normalized
}
