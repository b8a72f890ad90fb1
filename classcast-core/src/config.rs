use classcast_media::MediaConfig;
use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub redis: RedisConfig,
    pub storage: StorageConfig,
    pub directory: DirectoryConfig,
    pub recording: RecordingConfig,
    pub media: MediaConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub http_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            http_port: 8080,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// When false the presence roster lives in process memory
    pub enabled: bool,
    pub url: String,
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: "redis://localhost:6379".to_string(),
            key_prefix: "classcast:".to_string(),
        }
    }
}

/// Object storage backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageDriver {
    /// S3-compatible object storage
    S3,
    /// In-process storage for development and tests
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub driver: StorageDriver,
    /// OSS endpoint (e.g. "s3.amazonaws.com" or a Minio URL)
    pub endpoint: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub bucket: String,
    pub region: Option<String>,
    /// Key prefix inside the bucket (e.g. "recordings/")
    pub base_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            driver: StorageDriver::Memory,
            endpoint: String::new(),
            access_key_id: String::new(),
            secret_access_key: String::new(),
            bucket: String::new(),
            region: None,
            base_path: "recordings/".to_string(),
        }
    }
}

/// Class-metadata collaborator endpoint
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    /// Base URL of the class metadata service; unset means the in-process
    /// directory (development and tests)
    pub base_url: Option<String>,
    pub request_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    /// Accumulation threshold before a buffer becomes one upload part
    pub part_size_bytes: usize,
    /// Grace period before recording consumers are resumed, giving the
    /// recorder process time to attach to the RTP ports
    pub resume_delay_ms: u64,
    /// Upload queue worker count
    pub upload_workers: usize,
    /// Part upload attempts before a job is dead-lettered
    pub upload_max_retries: usize,
    /// First retry backoff; grows exponentially from here
    pub upload_retry_min_delay_ms: u64,
    pub upload_retry_max_delay_ms: u64,
    /// Inactivity window after which an unfinished multipart upload is
    /// aborted instead of leaking
    pub completion_timeout_secs: u64,
    /// Recorder binary
    pub ffmpeg_path: String,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            part_size_bytes: 5 * 1024 * 1024,
            resume_delay_ms: 1000,
            upload_workers: 4,
            upload_max_retries: 5,
            upload_retry_min_delay_ms: 500,
            upload_retry_max_delay_ms: 15_000,
            completion_timeout_secs: 300,
            ffmpeg_path: "ffmpeg".to_string(),
        }
    }
}

impl RecordingConfig {
    #[must_use]
    pub const fn resume_delay(&self) -> Duration {
        Duration::from_millis(self.resume_delay_ms)
    }

    #[must_use]
    pub const fn completion_timeout(&self) -> Duration {
        Duration::from_secs(self.completion_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // Override with environment variables (CLASSCAST_SERVER_HOST, etc.)
        builder = builder.add_source(
            Environment::with_prefix("CLASSCAST")
                .separator("_")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only (for Docker/K8s)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    #[must_use]
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.http_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_usable() {
        let config = Config::default();
        assert_eq!(config.recording.part_size_bytes, 5 * 1024 * 1024);
        assert_eq!(config.storage.driver, StorageDriver::Memory);
        assert!(config.media.min_port < config.media.max_port);
        assert!(!config.http_address().is_empty());
    }

    #[test]
    fn http_address_joins_host_and_port() {
        let config = Config {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                http_port: 9000,
            },
            ..Config::default()
        };
        assert_eq!(config.http_address(), "127.0.0.1:9000");
    }
}
