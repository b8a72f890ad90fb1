//! Chunked multipart upload pipeline for session recordings

pub mod queue;
pub mod store;
pub mod uploader;

pub use queue::{DeadLetter, PartUploaded, RetryPolicy, UploadJob, UploadQueue};
pub use store::{CompletedPart, MemoryStore, ObjectStore, OssStore};
pub use uploader::{FinishedRecording, RecordingUploader, WatcherOutcome};
