// ABOUTME: Root library for the parley bot: config, storage, console adapter and plugins
// ABOUTME: Wires a parley-core dispatcher to concrete collaborators and runs it

pub mod config;
pub mod console;
pub mod logging;
pub mod paths;
pub mod plugins;
pub mod storage;
pub mod telemetry;

use anyhow::Result;
use config::Config;
use parley_core::{
    serve, Dispatcher, MemoryStorage, MessagingPlatform, PlatformRegistry, RegistryBroadcaster,
    ServeSummary, Storage,
};
use std::sync::Arc;
use storage::SqliteStorage;

/// Storage selected by the config
pub fn open_storage(config: &Config) -> Result<Arc<dyn Storage>> {
    if config.storage.in_memory {
        tracing::info!("Using in-memory storage");
        return Ok(Arc::new(MemoryStorage::new()));
    }
    let path = config.storage.database_path();
    tracing::info!(path = %path.display(), "Opening database");
    Ok(Arc::new(SqliteStorage::open(path)?))
}

/// Serve `platforms` until their streams end. Registry snapshots are logged
/// from the start, so the plugin installation shows up as one change.
pub async fn run(
    config: &Config,
    storage: Arc<dyn Storage>,
    platforms: Vec<Arc<dyn MessagingPlatform>>,
) -> Result<ServeSummary> {
    let dispatcher = Dispatcher::new(config.dispatcher.clone(), Some(storage))?;
    let broadcaster = RegistryBroadcaster::spawn(&dispatcher, Arc::new(plugins::LogSink));
    plugins::install(&dispatcher)?;

    let mut registry = PlatformRegistry::new();
    for platform in platforms {
        registry.register(platform);
    }

    let summary = serve(dispatcher, &registry).await;
    broadcaster.shutdown();
    let summary = summary?;
    tracing::info!(
        dispatched = summary.dispatched,
        duplicates = summary.duplicates,
        own_messages = summary.own_messages,
        "Stopped serving"
    );
    Ok(summary)
}
