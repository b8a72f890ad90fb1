//! Shared test doubles and fixtures
//!
//! Used by unit tests across the crate and by the integration suite.
//! Everything here rides on the real in-process implementations (loopback
//! engine, memory stores); only the failure-injection wrappers fake
//! behavior.

use crate::config::RecordingConfig;
use crate::error::{Error, Result};
use crate::external::directory::{ClassDirectory, MemoryDirectory};
use crate::external::messages::MemoryMessageStore;
use crate::external::presence::MemoryPresenceStore;
use crate::recording::{Recorder, RecorderSession, RecordingBridge};
use crate::session::SessionRegistry;
use crate::signaling::SignalingService;
use crate::upload::{CompletedPart, MemoryStore, ObjectStore, RetryPolicy, UploadQueue};
use async_trait::async_trait;
use bytes::Bytes;
use classcast_media::{LoopbackEngine, MediaConfig, PortAllocator};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Object store wrapper that fails the first `failures` part uploads.
pub struct FlakyStore {
    inner: Arc<dyn ObjectStore>,
    failures: usize,
    attempts: AtomicUsize,
}

impl FlakyStore {
    #[must_use]
    pub fn new(inner: Arc<dyn ObjectStore>, failures: usize) -> Self {
        Self {
            inner,
            failures,
            attempts: AtomicUsize::new(0),
        }
    }

    /// Total `upload_part` attempts observed.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::Acquire)
    }
}

#[async_trait]
impl ObjectStore for FlakyStore {
    async fn create_multipart_upload(&self, key: &str) -> Result<String> {
        self.inner.create_multipart_upload(key).await
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> Result<String> {
        let attempt = self.attempts.fetch_add(1, Ordering::AcqRel);
        if attempt < self.failures {
            return Err(Error::Upload(format!(
                "injected failure on attempt {}",
                attempt + 1
            )));
        }
        self.inner
            .upload_part(key, upload_id, part_number, body)
            .await
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<()> {
        self.inner
            .complete_multipart_upload(key, upload_id, parts)
            .await
    }

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> Result<()> {
        self.inner.abort_multipart_upload(key, upload_id).await
    }
}

/// Recorder double that emits scripted chunks, then holds its output open
/// until stopped — the shape of a real remux process.
pub struct ScriptedRecorder {
    chunks: Mutex<Vec<Bytes>>,
}

impl ScriptedRecorder {
    #[must_use]
    pub fn new(chunks: Vec<Bytes>) -> Arc<Self> {
        Arc::new(Self {
            chunks: Mutex::new(chunks),
        })
    }
}

#[async_trait]
impl Recorder for ScriptedRecorder {
    async fn start(&self, _sdp: String) -> Result<Arc<dyn RecorderSession>> {
        let chunks = std::mem::take(&mut *self.chunks.lock());
        let (bytes_tx, bytes_rx) = mpsc::channel(chunks.len().max(1));
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            for chunk in chunks {
                if bytes_tx.send(chunk).await.is_err() {
                    return;
                }
            }
            // Keep the stream open until stop, like a live process would.
            let _ = stop_rx.await;
        });

        Ok(Arc::new(ScriptedSession {
            output: Mutex::new(Some(bytes_rx)),
            stop: Mutex::new(Some(stop_tx)),
        }))
    }
}

struct ScriptedSession {
    output: Mutex<Option<mpsc::Receiver<Bytes>>>,
    stop: Mutex<Option<oneshot::Sender<()>>>,
}

#[async_trait]
impl RecorderSession for ScriptedSession {
    fn take_output(&self) -> Option<mpsc::Receiver<Bytes>> {
        self.output.lock().take()
    }

    async fn stop(&self) {
        let _ = self.stop.lock().take();
    }
}

/// Fully wired in-process stack for end-to-end signaling tests.
pub struct TestStack {
    pub service: Arc<SignalingService>,
    pub registry: Arc<SessionRegistry>,
    pub ports: Arc<PortAllocator>,
    pub store: Arc<MemoryStore>,
    pub directory: Arc<MemoryDirectory>,
    pub presence: Arc<MemoryPresenceStore>,
    pub messages: Arc<MemoryMessageStore>,
}

/// Build a test stack around the given recorder, with fast retry/timeout
/// settings.
#[must_use]
pub fn test_stack(recorder: Arc<dyn Recorder>) -> TestStack {
    let media = MediaConfig::default();
    let recording = RecordingConfig {
        part_size_bytes: 16,
        resume_delay_ms: 10,
        upload_workers: 2,
        upload_max_retries: 2,
        upload_retry_min_delay_ms: 1,
        upload_retry_max_delay_ms: 5,
        completion_timeout_secs: 5,
        ffmpeg_path: "ffmpeg".to_string(),
    };

    let registry = Arc::new(SessionRegistry::new(LoopbackEngine::new(), media.clone()));
    let ports = Arc::new(PortAllocator::new(media.min_port, media.max_port));
    let store = Arc::new(MemoryStore::new());
    let directory = Arc::new(MemoryDirectory::new());
    let presence = Arc::new(MemoryPresenceStore::new());
    let messages = Arc::new(MemoryMessageStore::new());

    let queue = UploadQueue::new(
        Arc::clone(&store) as Arc<dyn ObjectStore>,
        recording.upload_workers,
        RetryPolicy::from(&recording),
    );

    let bridge = Arc::new(RecordingBridge::new(
        Arc::clone(&ports),
        recorder,
        Arc::clone(&store) as Arc<dyn ObjectStore>,
        queue,
        Arc::clone(&directory) as Arc<dyn ClassDirectory>,
        media,
        recording,
    ));

    let service = Arc::new(SignalingService::new(
        Arc::clone(&registry),
        Arc::clone(&ports),
        bridge,
        Arc::clone(&presence) as _,
        Arc::clone(&directory) as _,
        Arc::clone(&messages) as _,
    ));

    TestStack {
        service,
        registry,
        ports,
        store,
        directory,
        presence,
        messages,
    }
}
