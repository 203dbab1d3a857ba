//! Conversation session and message history for the consultant loop.
//!
//! Sessions are keyed by id and hold an append-only list of messages
//! (user/assistant). The gateway runs consultant turns against them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Unique session identifier (opaque string).
pub type SessionId = String;

fn is_false(b: &bool) -> bool {
    !*b
}

/// A single message in a session. Immutable once appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMessage {
    pub id: String,
    pub role: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
    /// True for synthetic failure notices, so a client can offer a retry action.
    #[serde(default, skip_serializing_if = "is_false")]
    pub error: bool,
}

impl ConversationMessage {
    fn new(role: &str, text: impl Into<String>, error: bool) -> Self {
        Self {
            id: format!("msg-{}", uuid::Uuid::new_v4()),
            role: role.to_string(),
            text: text.into(),
            created_at: Utc::now(),
            error,
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new("user", text, false)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new("assistant", text, false)
    }

    pub fn assistant_error(text: impl Into<String>) -> Self {
        Self::new("assistant", text, true)
    }
}

/// A session: id and ordered message history.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub messages: Vec<ConversationMessage>,
}

/// In-memory store for sessions (create, get, append, remove).
pub struct SessionStore {
    inner: Arc<RwLock<HashMap<SessionId, Session>>>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Create a new session with a generated id; returns the session id.
    pub async fn create(&self) -> SessionId {
        let id = format!("sess-{}", uuid::Uuid::new_v4());
        let session = Session {
            id: id.clone(),
            messages: Vec::new(),
        };
        self.inner.write().await.insert(id.clone(), session);
        id
    }

    /// Create a session with the given id if it does not exist; returns the id.
    pub async fn get_or_create(&self, id: impl Into<SessionId>) -> SessionId {
        let id = id.into();
        if self.inner.read().await.contains_key(&id) {
            return id;
        }
        let session = Session {
            id: id.clone(),
            messages: Vec::new(),
        };
        self.inner.write().await.insert(id.clone(), session);
        id
    }

    /// Return a clone of the session if it exists.
    pub async fn get(&self, id: &str) -> Option<Session> {
        self.inner.read().await.get(id).cloned()
    }

    /// Append a message to the session; returns error if session not found.
    pub async fn append_message(
        &self,
        id: &str,
        message: ConversationMessage,
    ) -> Result<(), String> {
        let mut g = self.inner.write().await;
        let session = g.get_mut(id).ok_or_else(|| "session not found".to_string())?;
        session.messages.push(message);
        Ok(())
    }

    /// Drop a session and its history (e.g. when its lead is deleted).
    pub async fn remove(&self, id: &str) -> bool {
        self.inner.write().await.remove(id).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_requires_an_existing_session() {
        let store = SessionStore::new();
        let err = store
            .append_message("sess-missing", ConversationMessage::user("oi"))
            .await;
        assert!(err.is_err());

        let id = store.create().await;
        store
            .append_message(&id, ConversationMessage::user("oi"))
            .await
            .unwrap();
        store
            .append_message(&id, ConversationMessage::assistant("olá"))
            .await
            .unwrap();
        let session = store.get(&id).await.unwrap();
        assert_eq!(session.messages.len(), 2);
        assert_eq!(session.messages[0].role, "user");
        assert_eq!(session.messages[1].role, "assistant");
    }

    #[test]
    fn error_flag_serializes_only_when_set() {
        let normal = serde_json::to_value(ConversationMessage::assistant("ok")).unwrap();
        assert!(normal.get("error").is_none());
        let failed = serde_json::to_value(ConversationMessage::assistant_error("erro")).unwrap();
        assert_eq!(failed.get("error"), Some(&serde_json::Value::Bool(true)));
    }
}
