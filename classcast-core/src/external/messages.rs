//! Chat message collaborator
//!
//! Class chat persists outside this system; signaling only validates,
//! hands the message to the collaborator, and relays the stored record to
//! the other connections in the class.

use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use classcast_media::ClassId;
use nanoid::nanoid;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

const MAX_MESSAGE_LENGTH: usize = 500;

/// A stored chat message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub class_id: ClassId,
    pub sender: String,
    pub content: String,
    pub sent_at: DateTime<Utc>,
}

/// A message about to be stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessage {
    pub class_id: ClassId,
    pub sender: String,
    pub content: String,
}

impl NewMessage {
    /// Shared validation applied before any store sees the message.
    pub fn validate(&self) -> Result<()> {
        if self.content.trim().is_empty() {
            return Err(Error::Validation(
                "message content cannot be empty".to_string(),
            ));
        }
        if self.content.len() > MAX_MESSAGE_LENGTH {
            return Err(Error::Validation(format!(
                "message content must be at most {MAX_MESSAGE_LENGTH} characters"
            )));
        }
        Ok(())
    }
}

/// Narrow contract against the chat persistence collaborator.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist the message and return the stored record.
    async fn create_message(&self, message: NewMessage) -> Result<ChatMessage>;
}

/// In-process message store for development and tests.
#[derive(Default)]
pub struct MemoryMessageStore {
    messages: Mutex<Vec<ChatMessage>>,
}

impl MemoryMessageStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored messages for a class, in arrival order. Test observability.
    pub async fn messages_for(&self, class_id: &ClassId) -> Vec<ChatMessage> {
        self.messages
            .lock()
            .await
            .iter()
            .filter(|m| &m.class_id == class_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn create_message(&self, message: NewMessage) -> Result<ChatMessage> {
        message.validate()?;
        let stored = ChatMessage {
            id: nanoid!(10),
            class_id: message.class_id,
            sender: message.sender,
            content: message.content,
            sent_at: Utc::now(),
        };
        self.messages.lock().await.push(stored.clone());
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stores_and_returns_the_message() {
        let store = MemoryMessageStore::new();
        let message = store
            .create_message(NewMessage {
                class_id: ClassId::new("class-a"),
                sender: "student-1".to_string(),
                content: "hello".to_string(),
            })
            .await
            .unwrap();

        assert_eq!(message.content, "hello");
        assert_eq!(store.messages_for(&ClassId::new("class-a")).await.len(), 1);
        assert!(store.messages_for(&ClassId::new("class-b")).await.is_empty());
    }

    #[tokio::test]
    async fn empty_and_oversized_messages_are_rejected() {
        let store = MemoryMessageStore::new();

        let empty = store
            .create_message(NewMessage {
                class_id: ClassId::new("class-a"),
                sender: "student-1".to_string(),
                content: "   ".to_string(),
            })
            .await;
        assert!(matches!(empty, Err(Error::Validation(_))));

        let oversized = store
            .create_message(NewMessage {
                class_id: ClassId::new("class-a"),
                sender: "student-1".to_string(),
                content: "x".repeat(MAX_MESSAGE_LENGTH + 1),
            })
            .await;
        assert!(matches!(oversized, Err(Error::Validation(_))));
    }
}
