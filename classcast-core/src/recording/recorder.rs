//! External recorder process boundary
//!
//! The recorder is the external remux capability: it reads the session
//! description naming the plain-RTP ports, receives the forwarded streams,
//! and emits a single remuxed container byte stream. classcast only
//! launches it, consumes its output and stops it.

use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

const OUTPUT_CHANNEL_CAPACITY: usize = 32;
const READ_BUFFER_CAPACITY: usize = 64 * 1024;

/// Launches recorder processes.
#[async_trait]
pub trait Recorder: Send + Sync {
    /// Start a recorder consuming the given session description.
    async fn start(&self, sdp: String) -> Result<Arc<dyn RecorderSession>>;
}

/// One running recorder.
#[async_trait]
pub trait RecorderSession: Send + Sync {
    /// The recorder's byte output. Yields `None` once the process exited
    /// and its output drained. Can only be taken once.
    fn take_output(&self) -> Option<mpsc::Receiver<Bytes>>;

    /// Ask the recorder to stop; its output stream ends shortly after.
    /// Idempotent.
    async fn stop(&self);
}

/// ffmpeg-based recorder: SDP on stdin, remuxed WebM on stdout, both
/// streams copied without re-encoding.
pub struct FfmpegRecorder {
    ffmpeg_path: String,
}

impl FfmpegRecorder {
    #[must_use]
    pub fn new(ffmpeg_path: impl Into<String>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
        }
    }
}

#[async_trait]
impl Recorder for FfmpegRecorder {
    async fn start(&self, sdp: String) -> Result<Arc<dyn RecorderSession>> {
        let mut child = Command::new(&self.ffmpeg_path)
            .args([
                "-loglevel",
                "error",
                "-protocol_whitelist",
                "pipe,udp,rtp",
                "-fflags",
                "+genpts",
                "-f",
                "sdp",
                "-i",
                "pipe:0",
                "-c:v",
                "copy",
                "-c:a",
                "copy",
                "-f",
                "webm",
                "pipe:1",
            ])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Internal(format!("failed to spawn recorder process: {e}")))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Internal("recorder stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Internal("recorder stdout unavailable".to_string()))?;

        // The SDP is the whole input; closing stdin tells the recorder
        // where it ends.
        stdin
            .write_all(sdp.as_bytes())
            .await
            .map_err(|e| Error::Internal(format!("failed to hand sdp to recorder: {e}")))?;
        drop(stdin);

        let (bytes_tx, bytes_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let (stop_tx, stop_rx) = oneshot::channel();
        tokio::spawn(drive_process(child, stdout, bytes_tx, stop_rx));

        debug!(ffmpeg = %self.ffmpeg_path, "recorder process started");

        Ok(Arc::new(FfmpegSession {
            output: Mutex::new(Some(bytes_rx)),
            stop: Mutex::new(Some(stop_tx)),
        }))
    }
}

struct FfmpegSession {
    output: Mutex<Option<mpsc::Receiver<Bytes>>>,
    stop: Mutex<Option<oneshot::Sender<()>>>,
}

#[async_trait]
impl RecorderSession for FfmpegSession {
    fn take_output(&self) -> Option<mpsc::Receiver<Bytes>> {
        self.output.lock().take()
    }

    async fn stop(&self) {
        if let Some(stop) = self.stop.lock().take() {
            let _ = stop.send(());
        }
    }
}

/// Owns the child process: forwards stdout chunks to the channel, kills
/// the process on the stop signal and keeps draining until EOF so the
/// tail of the recording is not lost.
async fn drive_process(
    mut child: Child,
    mut stdout: ChildStdout,
    bytes_tx: mpsc::Sender<Bytes>,
    mut stop_rx: oneshot::Receiver<()>,
) {
    let mut buf = BytesMut::with_capacity(READ_BUFFER_CAPACITY);
    let mut stopping = false;

    loop {
        tokio::select! {
            read = stdout.read_buf(&mut buf) => match read {
                Ok(0) => break,
                Ok(_) => {
                    let chunk = buf.split().freeze();
                    if bytes_tx.send(chunk).await.is_err() {
                        // Downstream is gone; nothing left to record into.
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "recorder output read failed");
                    break;
                }
            },
            _ = &mut stop_rx, if !stopping => {
                stopping = true;
                if let Err(e) = child.start_kill() {
                    warn!(error = %e, "failed to signal recorder process");
                }
            }
        }
    }

    match child.wait().await {
        Ok(status) => debug!(%status, "recorder process exited"),
        Err(e) => warn!(error = %e, "failed to reap recorder process"),
    }
}
