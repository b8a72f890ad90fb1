use thiserror::Error;

/// Errors surfaced by the media layer
#[derive(Error, Debug)]
pub enum MediaError {
    #[error("UDP port pool exhausted")]
    PortPoolExhausted,

    #[error("{0} is closed")]
    Closed(&'static str),

    #[error("Media resource not found: {0}")]
    NotFound(String),

    #[error("Incompatible RTP capabilities: {0}")]
    Incompatible(String),

    #[error("Media engine error: {0}")]
    Engine(String),
}

pub type Result<T> = std::result::Result<T, MediaError>;
