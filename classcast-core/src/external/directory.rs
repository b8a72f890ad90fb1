//! Class metadata collaborator
//!
//! Class records (title, ownership, schedule) live in a separate service;
//! classcast only reads a class's lifecycle status and writes back the
//! fields the live session produces: status transitions, the recording's
//! object key, and start/end timestamps.

use crate::config::DirectoryConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use classcast_media::ClassId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

/// Lifecycle status of a class as stored by the metadata service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClassStatus {
    Pending,
    Live,
    Finished,
}

/// The slice of a class record this system reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassInfo {
    pub class_id: ClassId,
    pub status: ClassStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

/// Partial update applied to a class record. Unset fields stay untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<ClassStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl ClassPatch {
    #[must_use]
    pub const fn with_status(mut self, status: ClassStatus) -> Self {
        self.status = Some(status);
        self
    }

    #[must_use]
    pub fn with_record_url(mut self, record_url: impl Into<String>) -> Self {
        self.record_url = Some(record_url.into());
        self
    }

    #[must_use]
    pub const fn with_started_at(mut self, at: DateTime<Utc>) -> Self {
        self.started_at = Some(at);
        self
    }

    #[must_use]
    pub const fn with_ended_at(mut self, at: DateTime<Utc>) -> Self {
        self.ended_at = Some(at);
        self
    }
}

/// Narrow contract against the class metadata service.
#[async_trait]
pub trait ClassDirectory: Send + Sync {
    /// Fetch a class record; `NotFound` when the class does not exist.
    async fn get_class(&self, class_id: &ClassId) -> Result<ClassInfo>;

    /// Apply a partial update to a class record.
    async fn update_class(&self, class_id: &ClassId, patch: ClassPatch) -> Result<()>;
}

/// REST-backed directory client.
pub struct RestClassDirectory {
    client: reqwest::Client,
    base_url: String,
}

impl RestClassDirectory {
    pub fn new(config: &DirectoryConfig) -> Result<Arc<Self>> {
        let base_url = config
            .base_url
            .clone()
            .ok_or_else(|| Error::Internal("class directory base url not configured".to_string()))?;

        let timeout = if config.request_timeout_seconds == 0 {
            Duration::from_secs(10)
        } else {
            Duration::from_secs(config.request_timeout_seconds)
        };

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Internal(format!("failed to build directory client: {e}")))?;

        Ok(Arc::new(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }))
    }

    fn class_url(&self, class_id: &ClassId) -> String {
        format!("{}/classes/{class_id}", self.base_url)
    }
}

#[async_trait]
impl ClassDirectory for RestClassDirectory {
    async fn get_class(&self, class_id: &ClassId) -> Result<ClassInfo> {
        let response = self
            .client
            .get(self.class_url(class_id))
            .send()
            .await
            .map_err(|e| Error::Internal(format!("class directory request failed: {e}")))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::NotFound(format!("class {class_id}")));
        }
        if !response.status().is_success() {
            return Err(Error::Internal(format!(
                "class directory returned {} for {class_id}",
                response.status()
            )));
        }

        response
            .json::<ClassInfo>()
            .await
            .map_err(|e| Error::Internal(format!("malformed class record: {e}")))
    }

    async fn update_class(&self, class_id: &ClassId, patch: ClassPatch) -> Result<()> {
        let response = self
            .client
            .patch(self.class_url(class_id))
            .json(&patch)
            .send()
            .await
            .map_err(|e| Error::Internal(format!("class directory request failed: {e}")))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::NotFound(format!("class {class_id}")));
        }
        if !response.status().is_success() {
            return Err(Error::Internal(format!(
                "class directory returned {} updating {class_id}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// In-process directory for development and tests.
pub struct MemoryDirectory {
    classes: Mutex<HashMap<ClassId, ClassInfo>>,
    /// When set, unknown classes are registered as pending on first read
    /// (single-node development without a metadata service).
    auto_register: bool,
}

impl Default for MemoryDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self {
            classes: Mutex::new(HashMap::new()),
            auto_register: false,
        }
    }

    /// Directory that creates unknown classes on demand.
    #[must_use]
    pub fn permissive() -> Self {
        Self {
            classes: Mutex::new(HashMap::new()),
            auto_register: true,
        }
    }

    /// Seed a pending class record.
    pub async fn register(&self, class_id: ClassId) {
        let mut classes = self.classes.lock().await;
        classes.insert(
            class_id.clone(),
            ClassInfo {
                class_id,
                status: ClassStatus::Pending,
                record_url: None,
                started_at: None,
                ended_at: None,
            },
        );
    }

    /// Current record, if any. Test observability.
    pub async fn class(&self, class_id: &ClassId) -> Option<ClassInfo> {
        self.classes.lock().await.get(class_id).cloned()
    }
}

#[async_trait]
impl ClassDirectory for MemoryDirectory {
    async fn get_class(&self, class_id: &ClassId) -> Result<ClassInfo> {
        let mut classes = self.classes.lock().await;
        if let Some(info) = classes.get(class_id) {
            return Ok(info.clone());
        }
        if self.auto_register {
            let info = ClassInfo {
                class_id: class_id.clone(),
                status: ClassStatus::Pending,
                record_url: None,
                started_at: None,
                ended_at: None,
            };
            classes.insert(class_id.clone(), info.clone());
            return Ok(info);
        }
        Err(Error::NotFound(format!("class {class_id}")))
    }

    async fn update_class(&self, class_id: &ClassId, patch: ClassPatch) -> Result<()> {
        let mut classes = self.classes.lock().await;
        let info = classes
            .get_mut(class_id)
            .ok_or_else(|| Error::NotFound(format!("class {class_id}")))?;

        if let Some(status) = patch.status {
            info.status = status;
        }
        if let Some(record_url) = patch.record_url {
            info.record_url = Some(record_url);
        }
        if let Some(started_at) = patch.started_at {
            info.started_at = Some(started_at);
        }
        if let Some(ended_at) = patch.ended_at {
            info.ended_at = Some(ended_at);
        }

        debug!(class_id = %class_id, status = ?info.status, "class record updated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn patch_merges_into_the_record() {
        let directory = MemoryDirectory::new();
        let class = ClassId::new("class-a");
        directory.register(class.clone()).await;

        directory
            .update_class(&class, ClassPatch::default().with_status(ClassStatus::Live))
            .await
            .unwrap();
        directory
            .update_class(
                &class,
                ClassPatch::default().with_record_url("recordings/class-a.webm"),
            )
            .await
            .unwrap();

        let info = directory.class(&class).await.unwrap();
        assert_eq!(info.status, ClassStatus::Live);
        assert_eq!(info.record_url.as_deref(), Some("recordings/class-a.webm"));
    }

    #[tokio::test]
    async fn unknown_class_is_not_found() {
        let directory = MemoryDirectory::new();
        let result = directory.get_class(&ClassId::new("ghost")).await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn permissive_directory_registers_on_read() {
        let directory = MemoryDirectory::permissive();
        let info = directory.get_class(&ClassId::new("new-class")).await.unwrap();
        assert_eq!(info.status, ClassStatus::Pending);
    }
}
