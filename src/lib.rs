pub mod commands;
pub mod config;
pub mod core;
pub mod db;
pub mod error;
pub mod host;
pub mod router;
pub mod services;

use std::sync::Arc;

use tokio::io::BufReader;
use tokio::sync::mpsc;

use config::ServiceConfig;
use host::bridge;
use host::KeyValueStore;
use router::EventRouter;
use services::BackgroundServices;

pub fn run() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        tracing::error!("PANIC in tabwatch: {info}");
        default_hook(info);
    }));

    // stdout carries the bridge protocol, so logs go to stderr.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config::DEFAULT_LOG_FILTER.into()),
        )
        .init();

    let config = ServiceConfig::from_env();
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!("Failed to build async runtime: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(serve(config)) {
        tracing::error!("tabwatch stopped with an error: {e:#}");
        std::process::exit(1);
    }
}

async fn serve(config: ServiceConfig) -> anyhow::Result<()> {
    let mirror = match db::Database::open(&config.db_path) {
        Ok(database) => {
            let keys = database.key_count().unwrap_or(0);
            tracing::info!(
                "Settings mirror opened at {} ({keys} keys)",
                config.db_path.display()
            );
            Some(Arc::new(database))
        }
        Err(e) => {
            tracing::warn!("{e:#}. Running without a local settings mirror.");
            None
        }
    };

    let (writer, writer_task) = bridge::spawn_writer(tokio::io::stdout());
    let host = bridge::BridgeHost::new(writer, mirror);
    let storage: Arc<dyn KeyValueStore> = Arc::new(host.store());
    let engine = Arc::new(host.rule_engine());

    let storage_changes = storage.subscribe();
    let router = EventRouter::new(storage, engine);

    // The reader must be running before startup: loading settings waits on the host.
    let (events_tx, events_rx) = mpsc::channel(config.event_queue_capacity);
    let reader = tokio::spawn(bridge::run_reader(
        BufReader::new(tokio::io::stdin()),
        events_tx.clone(),
        host.clone(),
    ));

    tracing::info!("tabwatch started");
    BackgroundServices::run(&router, storage_changes, events_tx, events_rx).await;

    match reader.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!("Bridge reader failed: {e:#}"),
        Err(e) => tracing::warn!("Bridge reader task aborted: {e}"),
    }

    // Every writer clone must be gone before the writer task can finish.
    drop(router);
    drop(host);
    writer_task.await??;
    Ok(())
}
