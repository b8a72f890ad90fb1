//! Durable upload job queue
//!
//! Part uploads run in their own concurrency domain, decoupled from the
//! signaling connections that produce recording bytes. Workers pull jobs
//! from a shared channel, retry transient failures with exponential
//! backoff, and report completions to the per-recording watcher. A job
//! whose retries are exhausted is dead-lettered: logged and published on
//! the dead-letter channel, never silently dropped.

use crate::config::RecordingConfig;
use crate::error::{Error, Result};
use crate::upload::store::ObjectStore;
use backon::{ExponentialBuilder, Retryable};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, error, warn};

/// Completion event posted to a recording's watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartUploaded {
    pub part_number: u32,
    pub etag: String,
}

/// A permanently failed upload job.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub key: String,
    pub upload_id: String,
    pub part_number: u32,
    pub error: String,
}

/// Work accepted by the queue.
pub enum UploadJob {
    Part {
        key: String,
        upload_id: String,
        part_number: u32,
        body: Bytes,
        /// Where the worker reports success for this recording.
        completions: mpsc::Sender<PartUploaded>,
    },
}

/// Retry shape for part uploads.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl From<&RecordingConfig> for RetryPolicy {
    fn from(config: &RecordingConfig) -> Self {
        Self {
            max_retries: config.upload_max_retries,
            min_delay: Duration::from_millis(config.upload_retry_min_delay_ms),
            max_delay: Duration::from_millis(config.upload_retry_max_delay_ms),
        }
    }
}

const JOB_CHANNEL_CAPACITY: usize = 256;
const DEAD_LETTER_CAPACITY: usize = 64;

/// Worker pool uploading recording parts to the object store.
pub struct UploadQueue {
    jobs: mpsc::Sender<UploadJob>,
    dead_letters: broadcast::Sender<DeadLetter>,
}

impl UploadQueue {
    #[must_use]
    pub fn new(store: Arc<dyn ObjectStore>, workers: usize, policy: RetryPolicy) -> Arc<Self> {
        let (jobs_tx, jobs_rx) = mpsc::channel(JOB_CHANNEL_CAPACITY);
        let jobs_rx = Arc::new(Mutex::new(jobs_rx));
        let (dead_letters, _) = broadcast::channel(DEAD_LETTER_CAPACITY);

        for worker_id in 0..workers.max(1) {
            tokio::spawn(worker_loop(
                worker_id,
                Arc::clone(&store),
                Arc::clone(&jobs_rx),
                policy.clone(),
                dead_letters.clone(),
            ));
        }

        Arc::new(Self {
            jobs: jobs_tx,
            dead_letters,
        })
    }

    /// Hand a job to the workers. At-least-once: a job is only lost if the
    /// process dies with it in flight.
    pub async fn enqueue(&self, job: UploadJob) -> Result<()> {
        self.jobs
            .send(job)
            .await
            .map_err(|_| Error::Upload("upload queue is shut down".to_string()))
    }

    /// Observe permanently failed jobs.
    #[must_use]
    pub fn subscribe_dead_letters(&self) -> broadcast::Receiver<DeadLetter> {
        self.dead_letters.subscribe()
    }
}

async fn worker_loop(
    worker_id: usize,
    store: Arc<dyn ObjectStore>,
    jobs: Arc<Mutex<mpsc::Receiver<UploadJob>>>,
    policy: RetryPolicy,
    dead_letters: broadcast::Sender<DeadLetter>,
) {
    loop {
        let job = { jobs.lock().await.recv().await };
        let Some(job) = job else {
            debug!(worker_id, "upload worker shutting down");
            return;
        };

        match job {
            UploadJob::Part {
                key,
                upload_id,
                part_number,
                body,
                completions,
            } => {
                let backoff = ExponentialBuilder::default()
                    .with_min_delay(policy.min_delay)
                    .with_max_delay(policy.max_delay)
                    .with_max_times(policy.max_retries);

                let upload = || {
                    let store = Arc::clone(&store);
                    let key = key.clone();
                    let upload_id = upload_id.clone();
                    let body = body.clone();
                    async move { store.upload_part(&key, &upload_id, part_number, body).await }
                };

                let result = upload
                    .retry(backoff)
                    .notify(|err: &Error, delay: Duration| {
                        warn!(
                            key,
                            part_number,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "part upload failed, retrying"
                        );
                    })
                    .await;

                match result {
                    Ok(etag) => {
                        debug!(key, part_number, "part uploaded");
                        let _ = completions
                            .send(PartUploaded { part_number, etag })
                            .await;
                    }
                    Err(e) => {
                        error!(
                            key,
                            part_number,
                            error = %e,
                            "part upload dead-lettered after exhausting retries"
                        );
                        let _ = dead_letters.send(DeadLetter {
                            key,
                            upload_id,
                            part_number,
                            error: e.to_string(),
                        });
                    }
                }
            }
        }
    }
}
