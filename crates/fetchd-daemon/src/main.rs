mod config;

use std::collections::BTreeMap;
use std::sync::Arc;

use fetchd_db::Database;
use fetchd_engine::{
    DirectoryPolicy, EngineContext, FileNameMutex, HttpRequester, NetworkMonitor,
    TokioProcessRunner, TransferManager, run_probe,
};
use fetchd_types::events::{Notification, TransferEvent};
use fetchd_types::metadata::TransferMetadata;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fetchd=debug,fetchd_engine=debug,fetchd_db=info".into()),
        )
        .init();

    let config = Config::from_env()?;
    std::fs::create_dir_all(&config.download_dir)?;

    // Init database
    let db = Arc::new(Database::open(&config.db_path)?);

    let ctx = EngineContext {
        requester: Arc::new(HttpRequester::new()?),
        processes: Arc::new(TokioProcessRunner),
        file_names: Arc::new(FileNameMutex::new()),
    };
    let network = NetworkMonitor::default();
    let shutdown = CancellationToken::new();
    tokio::spawn(run_probe(
        network.clone(),
        config.probe_addr.clone(),
        config.probe_interval,
        shutdown.clone(),
    ));

    let manager = TransferManager::new(
        ctx,
        Arc::new(DirectoryPolicy::new(&config.download_dir)),
        db,
        network,
        config.default_throttle,
    );

    let pending = manager.uncollected(&config.owner)?;
    if !pending.is_empty() {
        info!("{} finished downloads waiting to be collected by {}", pending.len(), config.owner);
    }

    tokio::spawn(log_notifications(manager.subscribe()));

    for url in std::env::args().skip(1) {
        let id = manager.create_download(&config.owner, &url, TransferMetadata::default(), BTreeMap::new());
        manager.start(&id)?;
    }

    info!(
        "fetchd running: downloads in {}, catalog at {}",
        config.download_dir.display(),
        config.db_path.display()
    );
    shutdown_signal().await;

    shutdown.cancel();
    manager.shutdown().await;
    Ok(())
}

async fn log_notifications(mut rx: tokio::sync::broadcast::Receiver<Notification>) {
    loop {
        match rx.recv().await {
            Ok(Notification { transfer_id, event }) => match &event {
                TransferEvent::Progress { received, total } => {
                    debug!(transfer_id = %transfer_id, "{}/{} bytes", received, total);
                }
                TransferEvent::Error { message } => {
                    error!(transfer_id = %transfer_id, "{}", message);
                }
                _ => match serde_json::to_string(&event) {
                    Ok(json) => info!(transfer_id = %transfer_id, "{}", json),
                    Err(e) => warn!(transfer_id = %transfer_id, "Unprintable event: {}", e),
                },
            },
            Err(RecvError::Lagged(missed)) => warn!("Notification log skipped {} events", missed),
            Err(RecvError::Closed) => break,
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
}
