//! `Strongroom` server entry point.
//!
//! Applies process hardening, opens the storage backend, wires the core
//! components, and serves the JSON API with graceful shutdown. The lease
//! sweeper runs beside the server and is stopped through the same shutdown
//! channel.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use strongroom_core::{AuditManager, FileAuditBackend, LeaseSweeper};
use strongroom_server::config::{ServerConfig, StorageBackendType};
use strongroom_server::hardening;
use strongroom_server::routes;
use strongroom_server::state::AppState;
use strongroom_storage::{MemoryBackend, StorageBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_env();

    // Before logging exists and before any key is in memory.
    apply_hardening(&config);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .json()
        .init();

    info!(storage = storage_label(&config.storage_backend), "Strongroom starting");

    let storage = open_storage(&config.storage_backend).await?;

    let audit_manager = Arc::new(AuditManager::new());
    if let Some(path) = &config.audit_file_path {
        audit_manager
            .add_backend(Arc::new(FileAuditBackend::new(path)))
            .await;
        info!(path = %path, "file audit backend registered");
    }

    let state = Arc::new(AppState::new(
        storage,
        audit_manager,
        config.secret_store_options(),
        config.lease_manager_options(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = LeaseSweeper::new(
        Arc::clone(&state.lease_manager),
        config.lease_sweep_interval(),
    );
    let sweeper_handle = tokio::spawn(sweeper.run(shutdown_rx));

    let app = routes::app(state);
    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "Strongroom listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await
        .context("server error")?;

    info!("waiting for lease sweeper to stop");
    if tokio::time::timeout(Duration::from_secs(10), sweeper_handle)
        .await
        .is_err()
    {
        warn!("lease sweeper did not stop within 10s");
    }

    info!("Strongroom stopped");
    Ok(())
}

async fn open_storage(backend: &StorageBackendType) -> anyhow::Result<Arc<dyn StorageBackend>> {
    let storage: Arc<dyn StorageBackend> = match backend {
        StorageBackendType::Memory => {
            warn!("using in-memory storage; data will not survive a restart");
            Arc::new(MemoryBackend::new())
        }
        #[cfg(feature = "rocksdb-backend")]
        StorageBackendType::RocksDb { path } => {
            info!(path = %path, "using RocksDB storage");
            Arc::new(
                strongroom_storage::RocksDbBackend::open(path)
                    .context("failed to open RocksDB storage")?,
            )
        }
        #[cfg(not(feature = "rocksdb-backend"))]
        StorageBackendType::RocksDb { .. } => {
            anyhow::bail!("RocksDB storage requested but feature 'rocksdb-backend' is not enabled");
        }
        #[cfg(feature = "redb-backend")]
        StorageBackendType::Redb { path } => {
            info!(path = %path, "using redb storage");
            Arc::new(
                strongroom_storage::RedbBackend::open(path).context("failed to open redb storage")?,
            )
        }
        #[cfg(not(feature = "redb-backend"))]
        StorageBackendType::Redb { .. } => {
            anyhow::bail!("redb storage requested but feature 'redb-backend' is not enabled");
        }
        #[cfg(feature = "postgres-backend")]
        StorageBackendType::Postgres { url } => {
            info!("using PostgreSQL storage");
            Arc::new(
                strongroom_storage::PostgresBackend::connect(url)
                    .await
                    .context("failed to connect to PostgreSQL storage")?,
            )
        }
        #[cfg(not(feature = "postgres-backend"))]
        StorageBackendType::Postgres { .. } => {
            anyhow::bail!("PostgreSQL storage requested but feature 'postgres-backend' is not enabled");
        }
    };
    Ok(storage)
}

/// Backend name without paths or connection strings.
fn storage_label(backend: &StorageBackendType) -> &'static str {
    match backend {
        StorageBackendType::Memory => "memory",
        StorageBackendType::RocksDb { .. } => "rocksdb",
        StorageBackendType::Redb { .. } => "redb",
        StorageBackendType::Postgres { .. } => "postgres",
    }
}

/// Wait for SIGINT or SIGTERM, then broadcast shutdown.
async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut sig) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            sig.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
}

/// Logging is not up yet, so warnings go to stderr.
#[allow(clippy::print_stderr)]
fn apply_hardening(config: &ServerConfig) {
    if let Err(e) = hardening::disable_core_dumps() {
        eprintln!("WARNING: could not disable core dumps: {e}");
    }

    if config.disable_mlock {
        eprintln!("WARNING: mlock disabled via STRONGROOM_DISABLE_MLOCK; key pages may be swapped to disk");
    } else if let Err(e) = hardening::lock_memory() {
        eprintln!("WARNING: could not lock memory: {e} (set STRONGROOM_DISABLE_MLOCK=true for development)");
    }
}
