//! classcast server entry point

mod server;
mod ws;

use anyhow::Context;
use clap::Parser;
use classcast_core::config::{Config, StorageDriver};
use classcast_core::external::directory::{ClassDirectory, MemoryDirectory, RestClassDirectory};
use classcast_core::external::messages::{MemoryMessageStore, MessageStore};
use classcast_core::external::presence::{MemoryPresenceStore, PresenceStore, RedisPresenceStore};
use classcast_core::logging::init_logging;
use classcast_core::recording::{FfmpegRecorder, Recorder, RecordingBridge};
use classcast_core::session::SessionRegistry;
use classcast_core::signaling::SignalingService;
use classcast_core::upload::{MemoryStore, ObjectStore, OssStore, RetryPolicy, UploadQueue};
use classcast_media::{LoopbackEngine, PortAllocator};
use server::{build_router, AppState};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "classcast", about = "Live virtual-classroom media backend")]
struct Args {
    /// Path to a configuration file (environment variables override it)
    #[arg(short, long, env = "CLASSCAST_CONFIG")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = Config::load(args.config.as_deref()).context("failed to load configuration")?;
    init_logging(&config.logging).context("failed to initialize logging")?;

    info!(
        address = %config.http_address(),
        storage = ?config.storage.driver,
        "starting classcast"
    );

    let state = build_state(&config).await?;
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind(config.http_address())
        .await
        .with_context(|| format!("failed to bind {}", config.http_address()))?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("classcast stopped");
    Ok(())
}

async fn build_state(config: &Config) -> anyhow::Result<AppState> {
    // The in-process engine covers single-node deployments and local
    // development; a clustered deployment binds the facade to its SFU
    // engine here instead.
    let engine = LoopbackEngine::new();

    let registry = Arc::new(SessionRegistry::new(engine, config.media.clone()));
    let ports = Arc::new(PortAllocator::new(
        config.media.min_port,
        config.media.max_port,
    ));

    let store: Arc<dyn ObjectStore> = match config.storage.driver {
        StorageDriver::S3 => Arc::new(OssStore::new(&config.storage)?),
        StorageDriver::Memory => {
            warn!("using in-memory recording storage; recordings will not survive a restart");
            Arc::new(MemoryStore::new())
        }
    };

    let queue = UploadQueue::new(
        Arc::clone(&store),
        config.recording.upload_workers,
        RetryPolicy::from(&config.recording),
    );

    // Surface dead-lettered upload parts in the logs.
    let mut dead_letters = queue.subscribe_dead_letters();
    tokio::spawn(async move {
        while let Ok(letter) = dead_letters.recv().await {
            warn!(
                key = %letter.key,
                part_number = letter.part_number,
                error = %letter.error,
                "upload part permanently failed"
            );
        }
    });

    let directory: Arc<dyn ClassDirectory> = if config.directory.base_url.is_some() {
        RestClassDirectory::new(&config.directory)?
    } else {
        warn!("no class directory configured; using in-process class records");
        Arc::new(MemoryDirectory::permissive())
    };

    let presence: Arc<dyn PresenceStore> = if config.redis.enabled {
        let client = redis::Client::open(config.redis.url.as_str())
            .context("invalid redis url")?;
        let manager = client
            .get_connection_manager()
            .await
            .context("failed to connect to redis")?;
        Arc::new(RedisPresenceStore::new(
            manager,
            config.redis.key_prefix.clone(),
        ))
    } else {
        Arc::new(MemoryPresenceStore::new())
    };

    let messages: Arc<dyn MessageStore> = Arc::new(MemoryMessageStore::new());

    let recorder: Arc<dyn Recorder> =
        Arc::new(FfmpegRecorder::new(config.recording.ffmpeg_path.clone()));

    let bridge = Arc::new(RecordingBridge::new(
        Arc::clone(&ports),
        recorder,
        store,
        queue,
        Arc::clone(&directory),
        config.media.clone(),
        config.recording.clone(),
    ));

    let signaling = Arc::new(SignalingService::new(
        registry,
        ports,
        bridge,
        presence,
        directory,
        messages,
    ));

    Ok(AppState { signaling })
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for shutdown signal");
    }
    info!("shutdown signal received");
}
