use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use ecdsa_scanner::api::{self, AppState};
use ecdsa_scanner::collision::{Orchestrator, WORKER_POOL_SIZE};
use ecdsa_scanner::config::Config;
use ecdsa_scanner::logbuf::{BufferLayer, LogBuffer};
use ecdsa_scanner::notify::Notifier;
use ecdsa_scanner::rpc::HttpRpc;
use ecdsa_scanner::scanner::{Scanner, COLLISION_CHANNEL_CAPACITY};
use ecdsa_scanner::storage::{MemoryStorage, RetryingStorage, SqliteStorage, Storage};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cfg = Config::from_env();

    let logs = LogBuffer::new(500);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(BufferLayer::new(Arc::clone(&logs)))
        .init();

    let storage: Arc<dyn Storage> = if cfg.database_url.is_empty() {
        warn!("DATABASE_URL not set - running in demo mode");
        Arc::new(MemoryStorage::with_sample_data())
    } else {
        let sqlite = SqliteStorage::open(&cfg.database_url)
            .with_context(|| format!("opening database {}", cfg.database_url))?;
        info!("connected to database");
        Arc::new(RetryingStorage::new(Arc::new(sqlite)))
    };

    let notifier = Notifier::new(cfg.pushover_app_token.clone(), cfg.pushover_user_key.clone());
    if notifier.is_enabled() {
        info!("push notifications enabled");
    }

    let rpc = Arc::new(HttpRpc::new(cfg.ankr_api_key.clone()));
    let (collision_tx, collision_rx) = mpsc::channel(COLLISION_CHANNEL_CAPACITY);

    let scanner = Arc::new(Scanner::new(
        Arc::clone(&storage),
        rpc.clone(),
        collision_tx,
    ));
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&storage),
        rpc.clone(),
        notifier.clone(),
    ));
    let workers = orchestrator.spawn_workers(collision_rx, WORKER_POOL_SIZE);

    // Give the HTTP server a head start before the scanners pile on.
    {
        let scanner = Arc::clone(&scanner);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            info!("auto-starting scanners");
            scanner.start_all().await;
        });
    }

    let state = Arc::new(AppState {
        scanner: Arc::clone(&scanner),
        orchestrator: Arc::clone(&orchestrator),
        storage: Arc::clone(&storage),
        rpc,
        notifier,
        logs,
    });

    let mut servers = Vec::new();
    for addr in cfg.bind_addrs.split(',') {
        let bind: SocketAddr = format!("{}:{}", addr.trim(), cfg.port)
            .parse()
            .with_context(|| format!("invalid bind address {addr}"))?;
        let state = Arc::clone(&state);
        servers.push(tokio::spawn(async move {
            if let Err(e) = api::serve(bind, state).await {
                tracing::error!("http server on {bind} failed: {e}");
            }
        }));
    }

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutting down");

    // Scanners stop at their next loop boundary; workers drain the channel
    // and exit once the senders are gone. Storage drops last.
    scanner.stop_all();
    tokio::time::sleep(Duration::from_secs(1)).await;
    for server in servers {
        server.abort();
    }
    for worker in workers {
        worker.abort();
    }
    Ok(())
}
