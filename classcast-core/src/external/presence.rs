//! Participant presence registry
//!
//! Ephemeral, class-scoped roster of who is currently in a class. Entries
//! exist only while the owning connection is live and are not expected to
//! survive a restart; the production implementation keeps them in Redis so
//! every node of a multi-replica deployment sees the same roster.

use crate::error::{Error, Result};
use async_trait::async_trait;
use classcast_media::ClassId;
use nanoid::nanoid;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::debug;

/// One present participant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: String,
    pub class_id: ClassId,
    pub student: String,
}

/// Narrow contract against the presence key-value store.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Add a participant to the class roster, returning the stored entry.
    async fn join(&self, class_id: &ClassId, student: &str) -> Result<Participant>;

    /// Remove a participant; returns the removed entry if it existed.
    async fn leave(&self, participant_id: &str) -> Result<Option<Participant>>;

    /// Everyone currently present in the class.
    async fn roster(&self, class_id: &ClassId) -> Result<Vec<Participant>>;

    /// Drop the class's whole roster (class ended).
    async fn clear(&self, class_id: &ClassId) -> Result<()>;
}

fn new_participant(class_id: &ClassId, student: &str) -> Participant {
    Participant {
        id: nanoid!(10),
        class_id: class_id.clone(),
        student: student.to_string(),
    }
}

/// Redis-backed presence store.
///
/// Layout: one JSON value per participant under
/// `{prefix}participant:{id}`, plus a per-class id set under
/// `{prefix}class:{class_id}:participants` for the roster lookup.
pub struct RedisPresenceStore {
    redis: ConnectionManager,
    key_prefix: String,
}

impl RedisPresenceStore {
    #[must_use]
    pub fn new(redis: ConnectionManager, key_prefix: impl Into<String>) -> Self {
        Self {
            redis,
            key_prefix: key_prefix.into(),
        }
    }

    fn participant_key(&self, participant_id: &str) -> String {
        format!("{}participant:{participant_id}", self.key_prefix)
    }

    fn class_key(&self, class_id: &ClassId) -> String {
        format!("{}class:{class_id}:participants", self.key_prefix)
    }
}

#[async_trait]
impl PresenceStore for RedisPresenceStore {
    async fn join(&self, class_id: &ClassId, student: &str) -> Result<Participant> {
        let participant = new_participant(class_id, student);
        let payload = serde_json::to_string(&participant)?;

        let mut conn = self.redis.clone();
        let _: () = conn
            .set(self.participant_key(&participant.id), payload)
            .await?;
        let _: () = conn
            .sadd(self.class_key(class_id), &participant.id)
            .await?;

        debug!(class_id = %class_id, participant_id = %participant.id, "participant joined");
        Ok(participant)
    }

    async fn leave(&self, participant_id: &str) -> Result<Option<Participant>> {
        let mut conn = self.redis.clone();
        let key = self.participant_key(participant_id);

        let payload: Option<String> = conn.get(&key).await?;
        let Some(payload) = payload else {
            return Ok(None);
        };
        let participant: Participant = serde_json::from_str(&payload)?;

        let _: () = conn.del(&key).await?;
        let _: () = conn
            .srem(self.class_key(&participant.class_id), participant_id)
            .await?;

        debug!(
            class_id = %participant.class_id,
            participant_id = %participant_id,
            "participant left"
        );
        Ok(Some(participant))
    }

    async fn roster(&self, class_id: &ClassId) -> Result<Vec<Participant>> {
        let mut conn = self.redis.clone();
        let ids: Vec<String> = conn.smembers(self.class_key(class_id)).await?;

        let mut participants = Vec::with_capacity(ids.len());
        for id in ids {
            // Entries can expire between SMEMBERS and GET; skip the gaps.
            let payload: Option<String> = conn.get(self.participant_key(&id)).await?;
            if let Some(payload) = payload {
                participants.push(serde_json::from_str(&payload)?);
            }
        }
        Ok(participants)
    }

    async fn clear(&self, class_id: &ClassId) -> Result<()> {
        let mut conn = self.redis.clone();
        let class_key = self.class_key(class_id);
        let ids: Vec<String> = conn.smembers(&class_key).await?;

        for id in ids {
            let _: () = conn.del(self.participant_key(&id)).await?;
        }
        let _: () = conn.del(&class_key).await?;
        Ok(())
    }
}

/// In-process presence store for development and tests.
#[derive(Default)]
pub struct MemoryPresenceStore {
    participants: Mutex<HashMap<String, Participant>>,
}

impl MemoryPresenceStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PresenceStore for MemoryPresenceStore {
    async fn join(&self, class_id: &ClassId, student: &str) -> Result<Participant> {
        let participant = new_participant(class_id, student);
        self.participants
            .lock()
            .await
            .insert(participant.id.clone(), participant.clone());
        Ok(participant)
    }

    async fn leave(&self, participant_id: &str) -> Result<Option<Participant>> {
        Ok(self.participants.lock().await.remove(participant_id))
    }

    async fn roster(&self, class_id: &ClassId) -> Result<Vec<Participant>> {
        Ok(self
            .participants
            .lock()
            .await
            .values()
            .filter(|p| &p.class_id == class_id)
            .cloned()
            .collect())
    }

    async fn clear(&self, class_id: &ClassId) -> Result<()> {
        self.participants
            .lock()
            .await
            .retain(|_, p| &p.class_id != class_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn join_leave_roster_roundtrip() {
        let store = MemoryPresenceStore::new();
        let class = ClassId::new("class-a");

        let alice = store.join(&class, "alice").await.unwrap();
        let bob = store.join(&class, "bob").await.unwrap();
        store.join(&ClassId::new("class-b"), "carol").await.unwrap();

        let mut roster = store.roster(&class).await.unwrap();
        roster.sort_by(|a, b| a.student.cmp(&b.student));
        assert_eq!(roster.len(), 2);
        assert_eq!(roster[0].student, "alice");

        let left = store.leave(&alice.id).await.unwrap();
        assert_eq!(left, Some(alice));
        assert_eq!(store.roster(&class).await.unwrap(), vec![bob]);

        // Leaving twice is a no-op.
        let gone = store.leave("missing").await.unwrap();
        assert!(gone.is_none());
    }

    #[tokio::test]
    async fn clear_scopes_to_one_class() {
        let store = MemoryPresenceStore::new();
        store.join(&ClassId::new("class-a"), "alice").await.unwrap();
        store.join(&ClassId::new("class-b"), "bob").await.unwrap();

        store.clear(&ClassId::new("class-a")).await.unwrap();
        assert!(store.roster(&ClassId::new("class-a")).await.unwrap().is_empty());
        assert_eq!(store.roster(&ClassId::new("class-b")).await.unwrap().len(), 1);
    }
}
