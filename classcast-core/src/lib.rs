//! classcast core
//!
//! The live virtual-classroom media backend: per-class session registry,
//! signaling protocol handler, recording bridge, chunked multipart upload
//! pipeline, and the narrow interfaces over external collaborators (class
//! metadata, chat persistence, presence roster, object storage).
//!
//! The media engine itself lives behind the `classcast-media` facade; this
//! crate orchestrates it and never touches media bytes.

pub mod config;
pub mod error;
pub mod external;
pub mod logging;
pub mod recording;
pub mod session;
pub mod signaling;
pub mod test_support;
pub mod upload;

pub use config::Config;
pub use error::{Error, Result};
