//! Error types surfaced by the chat cache engine.

use thiserror::Error;

/// Typed failure returned by the coordinator, the translation cache and the
/// remote data service.
///
/// `Clone` because a single in-flight fetch may be awaited by several callers
/// and every one of them receives the same outcome.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChatError {
    /// Transport failure or a retryable server error. Cached data stays visible.
    #[error("Network error: {0}")]
    Network(String),

    /// The entity no longer exists on the server.
    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    /// Input rejected before or by the server. Never retried.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A session id that does not resolve to the active agent.
    #[error("Session {session_id} does not belong to agent {agent_id}")]
    SessionAgentMismatch { session_id: i64, agent_id: i64 },

    /// Optimistic id reconciliation collided with existing state.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The response arrived after the user moved to another session or agent
    /// and was dropped.
    #[error("Superseded: {0}")]
    Superseded(String),

    /// The server answered with something we could not decode.
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl ChatError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::SessionAgentMismatch { .. }
        )
    }
}

impl From<reqwest::Error> for ChatError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ChatError::Protocol(err.to_string())
        } else {
            ChatError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(err: serde_json::Error) -> Self {
        ChatError::Protocol(err.to_string())
    }
}

pub type Result<T, E = ChatError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_error_kinds() {
        assert!(ChatError::Network("down".into()).is_retryable());
        assert!(!ChatError::validation("empty").is_retryable());
        assert!(ChatError::not_found("session", 3).is_not_found());
        assert!(ChatError::SessionAgentMismatch {
            session_id: 3,
            agent_id: 7
        }
        .is_validation());
    }

    #[test]
    fn mismatch_message_names_both_ids() {
        let err = ChatError::SessionAgentMismatch {
            session_id: 3,
            agent_id: 7,
        };
        assert_eq!(err.to_string(), "Session 3 does not belong to agent 7");
    }

    #[test]
    fn json_errors_become_protocol_errors() {
        let err = serde_json::from_str::<u32>("nope").unwrap_err();
        assert!(matches!(ChatError::from(err), ChatError::Protocol(_)));
    }
}
