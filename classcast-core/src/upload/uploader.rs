//! Recording uploader and completion watcher
//!
//! One [`RecordingUploader`] exists per active recording. It turns the
//! recorder's unbounded byte stream into numbered multipart parts: bytes
//! accumulate in a single buffer, and once the buffer reaches the target
//! part size it is dispatched whole as the next part (part numbers are
//! pre-incremented, so they start at 1 and are gap-free by construction).
//!
//! Finalization is event-driven. Every part completion is posted to the
//! recording's watcher task, which accumulates `{part_number → etag}`
//! idempotently and — once the expected total is known and met — sorts the
//! parts and completes the multipart upload exactly once, then publishes
//! the final object key to the class directory. A recording that never
//! reports its total (abnormal termination) is aborted after an
//! inactivity timeout rather than leaking the upload handle.

use crate::error::Result;
use crate::external::directory::{ClassDirectory, ClassPatch};
use crate::upload::queue::{PartUploaded, UploadJob, UploadQueue};
use crate::upload::store::{CompletedPart, ObjectStore};
use bytes::{Bytes, BytesMut};
use classcast_media::ClassId;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const COMPLETION_CHANNEL_CAPACITY: usize = 64;

/// How the watcher resolved a recording's upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatcherOutcome {
    /// All parts uploaded and the object was finalized.
    Completed { parts: u32 },
    /// The upload was abandoned and the handle aborted.
    Aborted { reason: String },
    /// Finalization itself failed permanently; the handle was left for
    /// operator intervention.
    Failed { error: String },
}

/// The uploader side of a finished recording, returned by
/// [`RecordingUploader::finish`].
pub struct FinishedRecording {
    pub parts: u32,
    pub key: String,
    /// Resolves once the watcher finalized, aborted or gave up.
    pub watcher: JoinHandle<WatcherOutcome>,
}

/// Chunks recorded bytes into multipart parts for one recording.
pub struct RecordingUploader {
    class_id: ClassId,
    key: String,
    upload_id: String,
    queue: Arc<UploadQueue>,
    buffer: BytesMut,
    threshold: usize,
    next_part: u32,
    completions: mpsc::Sender<PartUploaded>,
    total_tx: Option<oneshot::Sender<u32>>,
    watcher: JoinHandle<WatcherOutcome>,
}

impl RecordingUploader {
    /// Open a multipart upload for `key` and arm its completion watcher.
    pub async fn begin(
        store: Arc<dyn ObjectStore>,
        queue: Arc<UploadQueue>,
        directory: Arc<dyn ClassDirectory>,
        class_id: ClassId,
        key: String,
        threshold: usize,
        completion_timeout: Duration,
    ) -> Result<Self> {
        let upload_id = store.create_multipart_upload(&key).await?;
        let (completions_tx, completions_rx) = mpsc::channel(COMPLETION_CHANNEL_CAPACITY);
        let (total_tx, total_rx) = oneshot::channel();

        let watcher = tokio::spawn(completion_watcher(
            store,
            directory,
            class_id.clone(),
            key.clone(),
            upload_id.clone(),
            completions_rx,
            total_rx,
            completion_timeout,
        ));

        info!(class_id = %class_id, key = %key, upload_id = %upload_id, "recording upload opened");

        Ok(Self {
            class_id,
            key,
            upload_id,
            queue,
            buffer: BytesMut::new(),
            threshold: threshold.max(1),
            next_part: 0,
            completions: completions_tx,
            total_tx: Some(total_tx),
            watcher,
        })
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Append recorded bytes; dispatches one part whenever the
    /// accumulated buffer reaches the target size.
    pub async fn push(&mut self, chunk: &[u8]) -> Result<()> {
        self.buffer.extend_from_slice(chunk);
        if self.buffer.len() >= self.threshold {
            self.dispatch_buffer().await?;
        }
        Ok(())
    }

    async fn dispatch_buffer(&mut self) -> Result<()> {
        self.next_part += 1;
        let part_number = self.next_part;
        let body: Bytes = self.buffer.split().freeze();

        debug!(
            class_id = %self.class_id,
            part_number,
            size = body.len(),
            "dispatching recording part"
        );

        self.queue
            .enqueue(UploadJob::Part {
                key: self.key.clone(),
                upload_id: self.upload_id.clone(),
                part_number,
                body,
                completions: self.completions.clone(),
            })
            .await
    }

    /// Flush any buffered remainder as the final part and hand the
    /// expected total to the watcher. No further parts are accepted.
    pub async fn finish(mut self) -> Result<FinishedRecording> {
        if !self.buffer.is_empty() {
            self.dispatch_buffer().await?;
        }
        let total = self.next_part;

        if let Some(total_tx) = self.total_tx.take() {
            let _ = total_tx.send(total);
        }

        info!(
            class_id = %self.class_id,
            key = %self.key,
            parts = total,
            "recording stream ended"
        );

        Ok(FinishedRecording {
            parts: total,
            key: self.key,
            watcher: self.watcher,
        })
    }
}

#[allow(clippy::too_many_arguments)]
async fn completion_watcher(
    store: Arc<dyn ObjectStore>,
    directory: Arc<dyn ClassDirectory>,
    class_id: ClassId,
    key: String,
    upload_id: String,
    mut completions: mpsc::Receiver<PartUploaded>,
    mut total_rx: oneshot::Receiver<u32>,
    timeout: Duration,
) -> WatcherOutcome {
    let mut uploaded: HashMap<u32, String> = HashMap::new();
    let mut expected: Option<u32> = None;
    let mut total_pending = true;
    let mut channel_open = true;

    loop {
        if let Some(total) = expected {
            if uploaded.len() as u32 == total {
                return finalize(&*store, &*directory, &class_id, &key, &upload_id, &uploaded)
                    .await;
            }
        }

        if !channel_open {
            // Every sender is gone: the uploader finished (or died) and all
            // queued jobs either completed or dead-lettered. Whatever is
            // missing now will never arrive.
            let reason = if expected.is_some() {
                "parts permanently failed".to_string()
            } else {
                "recording ended without a completion signal".to_string()
            };
            return abort(&*store, &class_id, &key, &upload_id, reason).await;
        }

        tokio::select! {
            event = completions.recv() => match event {
                Some(part) => {
                    // Idempotent by part number: redelivered completions
                    // overwrite with the same etag.
                    uploaded.insert(part.part_number, part.etag);
                }
                None => channel_open = false,
            },
            total = &mut total_rx, if total_pending => {
                total_pending = false;
                match total {
                    Ok(n) => expected = Some(n),
                    // Uploader dropped without finish(); the channel close
                    // or the timeout below resolves the upload.
                    Err(_) => {}
                }
            },
            () = tokio::time::sleep(timeout) => {
                return abort(
                    &*store,
                    &class_id,
                    &key,
                    &upload_id,
                    "completion timed out".to_string(),
                )
                .await;
            }
        }
    }
}

async fn finalize(
    store: &dyn ObjectStore,
    directory: &dyn ClassDirectory,
    class_id: &ClassId,
    key: &str,
    upload_id: &str,
    uploaded: &HashMap<u32, String>,
) -> WatcherOutcome {
    if uploaded.is_empty() {
        warn!(class_id = %class_id, key, "recording produced no data, aborting upload");
        return abort(store, class_id, key, upload_id, "empty recording".to_string()).await;
    }

    let mut parts: Vec<CompletedPart> = uploaded
        .iter()
        .map(|(part_number, etag)| CompletedPart {
            part_number: *part_number,
            etag: etag.clone(),
        })
        .collect();
    parts.sort_by_key(|p| p.part_number);

    match store.complete_multipart_upload(key, upload_id, &parts).await {
        Ok(()) => {
            info!(
                class_id = %class_id,
                key,
                parts = parts.len(),
                "recording finalized"
            );
            if let Err(e) = directory
                .update_class(class_id, ClassPatch::default().with_record_url(key))
                .await
            {
                warn!(class_id = %class_id, error = %e, "failed to publish record url");
            }
            WatcherOutcome::Completed {
                parts: parts.len() as u32,
            }
        }
        Err(e) => {
            error!(
                class_id = %class_id,
                key,
                upload_id,
                error = %e,
                "multipart finalization failed, upload left for operator"
            );
            WatcherOutcome::Failed {
                error: e.to_string(),
            }
        }
    }
}

async fn abort(
    store: &dyn ObjectStore,
    class_id: &ClassId,
    key: &str,
    upload_id: &str,
    reason: String,
) -> WatcherOutcome {
    warn!(class_id = %class_id, key, upload_id, reason = %reason, "aborting multipart upload");
    if let Err(e) = store.abort_multipart_upload(key, upload_id).await {
        warn!(class_id = %class_id, key, error = %e, "abort-multipart failed");
    }
    WatcherOutcome::Aborted { reason }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::directory::MemoryDirectory;
    use crate::upload::queue::RetryPolicy;
    use crate::upload::store::MemoryStore;

    const MIB: usize = 1024 * 1024;

    struct Fixture {
        store: Arc<MemoryStore>,
        directory: Arc<MemoryDirectory>,
        queue: Arc<UploadQueue>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let directory = Arc::new(MemoryDirectory::new());
        let queue = UploadQueue::new(
            Arc::clone(&store) as Arc<dyn ObjectStore>,
            2,
            RetryPolicy {
                max_retries: 2,
                min_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
        );
        Fixture {
            store,
            directory,
            queue,
        }
    }

    async fn uploader(fx: &Fixture, class: &str, key: &str, threshold: usize) -> RecordingUploader {
        fx.directory.register(ClassId::new(class)).await;
        RecordingUploader::begin(
            Arc::clone(&fx.store) as Arc<dyn ObjectStore>,
            Arc::clone(&fx.queue),
            Arc::clone(&fx.directory) as Arc<dyn ClassDirectory>,
            ClassId::new(class),
            key.to_string(),
            threshold,
            Duration::from_secs(5),
        )
        .await
        .expect("uploader")
    }

    #[tokio::test]
    async fn three_small_chunks_become_one_part() {
        let fx = fixture();
        let mut uploader = uploader(&fx, "class-a", "rec.webm", 5 * MIB).await;

        // 2 MiB + 2 MiB stays under the 5 MiB threshold; the third chunk
        // pushes the running total to 6 MiB and dispatches one 6 MiB part.
        for _ in 0..3 {
            uploader.push(&vec![7u8; 2 * MIB]).await.unwrap();
        }
        let finished = uploader.finish().await.unwrap();
        assert_eq!(finished.parts, 1);

        let outcome = finished.watcher.await.unwrap();
        assert_eq!(outcome, WatcherOutcome::Completed { parts: 1 });
        assert_eq!(fx.store.object("rec.webm").unwrap().len(), 6 * MIB);
    }

    #[tokio::test]
    async fn part_numbers_are_gap_free() {
        let fx = fixture();
        let mut uploader = uploader(&fx, "class-a", "rec.webm", 4).await;

        // Every push crosses the threshold, so each becomes its own part.
        for n in 0u8..5 {
            uploader.push(&[n; 8]).await.unwrap();
        }
        // Sub-threshold remainder flushes as the final part.
        uploader.push(&[9u8; 2]).await.unwrap();

        let finished = uploader.finish().await.unwrap();
        assert_eq!(finished.parts, 6);

        let outcome = finished.watcher.await.unwrap();
        assert_eq!(outcome, WatcherOutcome::Completed { parts: 6 });

        let object = fx.store.object("rec.webm").unwrap();
        assert_eq!(object.len(), 5 * 8 + 2);

        // The only upload the store saw; check its recorded part list.
        let upload_id = fx.store.upload_ids().remove(0);
        assert_eq!(
            fx.store.completed_parts(&upload_id).unwrap(),
            vec![1, 2, 3, 4, 5, 6]
        );
        assert_eq!(fx.store.finalize_count(&upload_id), 1);
    }

    #[tokio::test]
    async fn empty_recording_is_aborted() {
        let fx = fixture();
        let uploader = uploader(&fx, "class-a", "rec.webm", 5 * MIB).await;
        let finished = uploader.finish().await.unwrap();
        assert_eq!(finished.parts, 0);

        let outcome = finished.watcher.await.unwrap();
        assert!(matches!(outcome, WatcherOutcome::Aborted { .. }));
        assert!(fx.store.object("rec.webm").is_none());
    }

    #[tokio::test]
    async fn watcher_deduplicates_completion_events() {
        let store = Arc::new(MemoryStore::new());
        let directory = Arc::new(MemoryDirectory::new());
        directory.register(ClassId::new("class-a")).await;

        let upload_id = store.create_multipart_upload("rec.webm").await.unwrap();
        let etag = store
            .upload_part("rec.webm", &upload_id, 1, Bytes::from_static(b"data"))
            .await
            .unwrap();

        let (tx, rx) = mpsc::channel(8);
        let (total_tx, total_rx) = oneshot::channel();
        let watcher = tokio::spawn(completion_watcher(
            Arc::clone(&store) as Arc<dyn ObjectStore>,
            Arc::clone(&directory) as Arc<dyn ClassDirectory>,
            ClassId::new("class-a"),
            "rec.webm".to_string(),
            upload_id.clone(),
            rx,
            total_rx,
            Duration::from_secs(5),
        ));

        // The same completion delivered twice must count once.
        for _ in 0..2 {
            tx.send(PartUploaded {
                part_number: 1,
                etag: etag.clone(),
            })
            .await
            .unwrap();
        }
        total_tx.send(1).unwrap();

        let outcome = watcher.await.unwrap();
        assert_eq!(outcome, WatcherOutcome::Completed { parts: 1 });
        assert_eq!(store.finalize_count(&upload_id), 1);

        let record_url = directory
            .class(&ClassId::new("class-a"))
            .await
            .and_then(|c| c.record_url);
        assert_eq!(record_url.as_deref(), Some("rec.webm"));
        drop(tx);
    }

    #[tokio::test]
    async fn missing_total_aborts_after_timeout() {
        let store = Arc::new(MemoryStore::new());
        let directory = Arc::new(MemoryDirectory::new());

        let upload_id = store.create_multipart_upload("rec.webm").await.unwrap();
        let (tx, rx) = mpsc::channel::<PartUploaded>(8);
        let (_total_tx, total_rx) = oneshot::channel();

        let watcher = tokio::spawn(completion_watcher(
            Arc::clone(&store) as Arc<dyn ObjectStore>,
            Arc::clone(&directory) as Arc<dyn ClassDirectory>,
            ClassId::new("class-a"),
            "rec.webm".to_string(),
            upload_id.clone(),
            rx,
            total_rx,
            Duration::from_millis(50),
        ));

        let outcome = watcher.await.unwrap();
        assert!(matches!(outcome, WatcherOutcome::Aborted { .. }));
        assert!(!store.upload_open(&upload_id));
        drop(tx);
    }
}
