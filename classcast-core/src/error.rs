use classcast_media::MediaError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Media engine error: {0}")]
    Engine(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Upload error: {0}")]
    Upload(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<MediaError> for Error {
    fn from(err: MediaError) -> Self {
        match err {
            MediaError::PortPoolExhausted => {
                Self::ResourceExhausted("UDP port pool exhausted".to_string())
            }
            MediaError::NotFound(what) => Self::NotFound(what),
            MediaError::Incompatible(msg) => Self::Conflict(msg),
            MediaError::Closed(what) => Self::Conflict(format!("{what} is closed")),
            MediaError::Engine(msg) => Self::Engine(msg),
        }
    }
}

impl From<opendal::Error> for Error {
    fn from(err: opendal::Error) -> Self {
        Self::Upload(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
