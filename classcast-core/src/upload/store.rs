//! Object store boundary
//!
//! The upload pipeline talks to durable storage through the narrow
//! multipart contract below. The production implementation rides on
//! OpenDAL (any S3-compatible backend); parts are staged as sibling
//! objects and stitched into the final key on completion, so the same
//! implementation works against backends without native multipart
//! support. The in-memory implementation backs development and tests.

use crate::config::StorageConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use nanoid::nanoid;
use opendal::{services::S3, Operator};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tracing::{debug, info, trace};

/// One successfully uploaded part, as reported back by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

/// Multipart upload contract against durable object storage.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Open a multipart upload for `key`, returning an opaque upload handle.
    async fn create_multipart_upload(&self, key: &str) -> Result<String>;

    /// Upload one part, returning its entity tag.
    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> Result<String>;

    /// Stitch the listed parts (already sorted by part number) into the
    /// final object and drop the upload handle.
    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<()>;

    /// Discard the upload and any parts uploaded so far. Idempotent.
    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> Result<()>;
}

fn etag_of(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    format!("\"{:x}\"", hasher.finalize())
}

/// OSS-backed store (AWS S3, Minio, any S3-compatible endpoint).
pub struct OssStore {
    operator: Operator,
    base_path: String,
}

impl OssStore {
    pub fn new(config: &StorageConfig) -> Result<Self> {
        info!(
            bucket = %config.bucket,
            endpoint = %config.endpoint,
            "initializing OSS recording store"
        );

        let mut builder = S3::default()
            .endpoint(&config.endpoint)
            .access_key_id(&config.access_key_id)
            .secret_access_key(&config.secret_access_key)
            .bucket(&config.bucket);

        if let Some(region) = &config.region {
            builder = builder.region(region);
        }

        let operator = Operator::new(builder)
            .map_err(|e| Error::Upload(format!("failed to build storage operator: {e}")))?
            .finish();

        Ok(Self::with_operator(operator, config.base_path.clone()))
    }

    /// Build the store over an arbitrary OpenDAL operator. Used by tests
    /// (memory service) and for non-S3 backends.
    #[must_use]
    pub fn with_operator(operator: Operator, base_path: impl Into<String>) -> Self {
        Self {
            operator,
            base_path: base_path.into(),
        }
    }

    fn object_key(&self, key: &str) -> String {
        format!("{}{key}", self.base_path)
    }

    fn staging_prefix(&self, key: &str, upload_id: &str) -> String {
        format!("{}.upload-{upload_id}/", self.object_key(key))
    }

    fn part_key(prefix: &str, part_number: u32) -> String {
        format!("{prefix}part-{part_number:05}")
    }
}

#[async_trait]
impl ObjectStore for OssStore {
    async fn create_multipart_upload(&self, key: &str) -> Result<String> {
        let upload_id = nanoid!();
        debug!(key, upload_id = %upload_id, "multipart upload opened");
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> Result<String> {
        let prefix = self.staging_prefix(key, upload_id);
        let part_key = Self::part_key(&prefix, part_number);
        let etag = etag_of(&body);
        let size = body.len();

        self.operator.write(&part_key, body).await?;

        trace!(key, part_number, size, "part staged");
        Ok(etag)
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<()> {
        let object_key = self.object_key(key);
        let prefix = self.staging_prefix(key, upload_id);

        let mut writer = self.operator.writer(&object_key).await?;
        for part in parts {
            let part_key = Self::part_key(&prefix, part.part_number);
            let buffer = self.operator.read(&part_key).await?;
            let body = buffer.to_bytes();
            if etag_of(&body) != part.etag {
                return Err(Error::Upload(format!(
                    "etag mismatch on part {} of {key}",
                    part.part_number
                )));
            }
            writer.write(body).await?;
        }
        writer.close().await?;

        self.operator.remove_all(&prefix).await?;
        info!(key, upload_id = %upload_id, parts = parts.len(), "multipart upload completed");
        Ok(())
    }

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> Result<()> {
        let prefix = self.staging_prefix(key, upload_id);
        self.operator.remove_all(&prefix).await?;
        debug!(key, upload_id = %upload_id, "multipart upload aborted");
        Ok(())
    }
}

struct PendingUpload {
    key: String,
    parts: HashMap<u32, (String, Bytes)>,
}

#[derive(Default)]
struct MemoryStoreState {
    uploads: HashMap<String, PendingUpload>,
    objects: HashMap<String, Bytes>,
    created: Vec<String>,
    completed_parts: HashMap<String, Vec<u32>>,
    finalize_counts: HashMap<String, u32>,
}

/// In-process object store for development and tests.
///
/// Beyond the trait it exposes the finished objects and bookkeeping the
/// test suite asserts on (finalize counts, completed part lists).
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryStoreState>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Finished object bytes, if the upload was completed.
    #[must_use]
    pub fn object(&self, key: &str) -> Option<Bytes> {
        self.state.lock().objects.get(key).cloned()
    }

    /// Whether the upload handle is still open (not completed or aborted).
    #[must_use]
    pub fn upload_open(&self, upload_id: &str) -> bool {
        self.state.lock().uploads.contains_key(upload_id)
    }

    /// Part numbers passed to `complete_multipart_upload`, in call order.
    #[must_use]
    pub fn completed_parts(&self, upload_id: &str) -> Option<Vec<u32>> {
        self.state.lock().completed_parts.get(upload_id).cloned()
    }

    /// Every upload handle ever opened, in creation order.
    #[must_use]
    pub fn upload_ids(&self) -> Vec<String> {
        self.state.lock().created.clone()
    }

    /// How many times `complete_multipart_upload` ran for the handle.
    #[must_use]
    pub fn finalize_count(&self, upload_id: &str) -> u32 {
        self.state
            .lock()
            .finalize_counts
            .get(upload_id)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn create_multipart_upload(&self, key: &str) -> Result<String> {
        let upload_id = nanoid!();
        let mut state = self.state.lock();
        state.created.push(upload_id.clone());
        state.uploads.insert(
            upload_id.clone(),
            PendingUpload {
                key: key.to_string(),
                parts: HashMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> Result<String> {
        let mut state = self.state.lock();
        let upload = state
            .uploads
            .get_mut(upload_id)
            .ok_or_else(|| Error::Upload(format!("unknown upload {upload_id} for {key}")))?;
        let etag = etag_of(&body);
        upload.parts.insert(part_number, (etag.clone(), body));
        Ok(etag)
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<()> {
        let mut state = self.state.lock();
        *state
            .finalize_counts
            .entry(upload_id.to_string())
            .or_insert(0) += 1;

        let upload = state
            .uploads
            .remove(upload_id)
            .ok_or_else(|| Error::Upload(format!("unknown upload {upload_id} for {key}")))?;

        let mut body = Vec::new();
        for part in parts {
            let (etag, bytes) = upload.parts.get(&part.part_number).ok_or_else(|| {
                Error::Upload(format!("part {} missing from upload", part.part_number))
            })?;
            if *etag != part.etag {
                return Err(Error::Upload(format!(
                    "etag mismatch on part {}",
                    part.part_number
                )));
            }
            body.extend_from_slice(bytes);
        }

        state
            .completed_parts
            .insert(upload_id.to_string(), parts.iter().map(|p| p.part_number).collect());
        state.objects.insert(upload.key, Bytes::from(body));
        Ok(())
    }

    async fn abort_multipart_upload(&self, _key: &str, upload_id: &str) -> Result<()> {
        self.state.lock().uploads.remove(upload_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opendal::services::Memory;

    fn oss_on_memory() -> (OssStore, Operator) {
        let operator = Operator::new(Memory::default())
            .expect("memory operator")
            .finish();
        (
            OssStore::with_operator(operator.clone(), "recordings/"),
            operator,
        )
    }

    #[tokio::test]
    async fn oss_store_stitches_parts_in_order() {
        let (store, operator) = oss_on_memory();

        let upload_id = store.create_multipart_upload("class-a.webm").await.unwrap();
        let mut parts = Vec::new();
        for (n, payload) in [(1u32, b"aaa".as_slice()), (2, b"bb"), (3, b"cccc")] {
            let etag = store
                .upload_part("class-a.webm", &upload_id, n, Bytes::from_static(payload))
                .await
                .unwrap();
            parts.push(CompletedPart {
                part_number: n,
                etag,
            });
        }

        store
            .complete_multipart_upload("class-a.webm", &upload_id, &parts)
            .await
            .unwrap();

        let body = operator
            .read("recordings/class-a.webm")
            .await
            .unwrap()
            .to_bytes();
        assert_eq!(&body[..], b"aaabbcccc");

        // Staging objects are gone after completion.
        let staged = operator
            .list(&format!("recordings/class-a.webm.upload-{upload_id}/"))
            .await
            .unwrap();
        assert!(staged.is_empty());
    }

    #[tokio::test]
    async fn oss_store_abort_discards_staging() {
        let (store, operator) = oss_on_memory();

        let upload_id = store.create_multipart_upload("class-b.webm").await.unwrap();
        store
            .upload_part("class-b.webm", &upload_id, 1, Bytes::from_static(b"junk"))
            .await
            .unwrap();
        store
            .abort_multipart_upload("class-b.webm", &upload_id)
            .await
            .unwrap();

        let staged = operator
            .list(&format!("recordings/class-b.webm.upload-{upload_id}/"))
            .await
            .unwrap();
        assert!(staged.is_empty());
        assert!(!operator.exists("recordings/class-b.webm").await.unwrap());
    }

    #[tokio::test]
    async fn memory_store_tracks_finalization() {
        let store = MemoryStore::new();
        let upload_id = store.create_multipart_upload("rec.webm").await.unwrap();

        let etag_1 = store
            .upload_part("rec.webm", &upload_id, 1, Bytes::from_static(b"hello "))
            .await
            .unwrap();
        let etag_2 = store
            .upload_part("rec.webm", &upload_id, 2, Bytes::from_static(b"world"))
            .await
            .unwrap();

        let parts = vec![
            CompletedPart {
                part_number: 1,
                etag: etag_1,
            },
            CompletedPart {
                part_number: 2,
                etag: etag_2,
            },
        ];
        store
            .complete_multipart_upload("rec.webm", &upload_id, &parts)
            .await
            .unwrap();

        assert_eq!(store.object("rec.webm").unwrap(), Bytes::from_static(b"hello world"));
        assert_eq!(store.finalize_count(&upload_id), 1);
        assert_eq!(store.completed_parts(&upload_id).unwrap(), vec![1, 2]);
        assert!(!store.upload_open(&upload_id));
    }

    #[tokio::test]
    async fn memory_store_rejects_unknown_upload() {
        let store = MemoryStore::new();
        let result = store
            .upload_part("rec.webm", "missing", 1, Bytes::from_static(b"x"))
            .await;
        assert!(matches!(result, Err(Error::Upload(_))));
    }
}
