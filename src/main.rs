use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use comfy_relay::{
    config::Config,
    engine::EngineClient,
    events,
    notify::HttpNotifier,
    registry::JobRegistry,
    shutdown::IdleMonitor,
    storage::S3Store,
    upload::{UploadConfig, Uploader},
    watcher::{CompletionWatcher, WatcherConfig},
    AppState,
};
use tracing::{info, warn};

/// Read timeout generous enough for the largest multipart part.
const STORAGE_READ_TIMEOUT: Duration = Duration::from_secs(300);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "comfy_relay=info,tower_http=info".into()),
        )
        .init();

    let config = Config::from_env()?;
    if !config.storage.is_configured() {
        warn!("Storage credentials not configured; artifacts will queue in the local fallback");
    }
    tokio::fs::create_dir_all(&config.fallback_dir)
        .await
        .with_context(|| {
            format!(
                "Failed to create fallback dir {}",
                config.fallback_dir.display()
            )
        })?;

    let registry = JobRegistry::new();
    let engine = EngineClient::new(&config.engine_url)?;
    let store = Arc::new(S3Store::new(config.storage.clone(), STORAGE_READ_TIMEOUT));
    let notifier = Arc::new(HttpNotifier::new(&config.backend_url)?);
    let uploader = Arc::new(Uploader::new(
        registry.clone(),
        store,
        notifier,
        UploadConfig::from_config(&config),
        config.fallback_dir.clone(),
    ));
    let watcher = CompletionWatcher::new(
        registry.clone(),
        engine.clone(),
        uploader,
        config.output_dir.clone(),
        WatcherConfig::from_config(&config),
    );

    events::spawn_event_listener(registry.clone(), engine.clone());
    IdleMonitor::new(
        registry.clone(),
        engine.clone(),
        config.idle_check_interval,
        config.idle_shutdown_after,
    )
    .spawn();

    let state = AppState {
        config: config.clone(),
        registry,
        engine,
        watcher,
    };

    let app = comfy_relay::router(state);
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    info!("comfy-relay listening on {}", config.bind_addr);
    axum::serve(listener, app).await?;
    Ok(())
}
