//! jobrelay -- Durable cross-process request queue for host-driven test runs
//! and asset refreshes.
//!
//! Controllers write requests into a shared SQLite store; a long-running host
//! claims them one at a time, runs them through its capability, and records
//! exactly one terminal result per request.

pub mod capability;
pub mod config;
pub mod controller;
pub mod dispatch;
pub mod executor;
pub mod host;
pub mod request;
pub mod storage;

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::capability::CommandCapability;
use crate::config::{JobrelayConfig, LoggingConfig};

/// Start the host: open the store, wire the runner capability, and run the
/// host loop until Ctrl-C.
pub async fn serve(config: JobrelayConfig) -> Result<()> {
    // 1. Initialize Storage
    tracing::info!(db_path = %config.store.path.display(), "Initializing request store");
    let store = storage::Store::open(&config.store).with_context(|| {
        format!("failed to open request store at {}", config.store.path.display())
    })?;

    // 2. Host capability
    let capability = Arc::new(CommandCapability::new(
        config.capability.clone(),
        config.executor.results_dir.clone(),
    ));
    tracing::info!(
        program = %config.capability.program.display(),
        results_dir = %config.executor.results_dir.display(),
        "Using runner capability"
    );

    // 3. Host loop
    let (host, handle) = host::HostLoop::new(store, capability, &config);
    tracing::info!(session = %handle.session_id(), "Host ready");

    // 4. Shut down on Ctrl-C
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown requested");
            handle.shutdown();
        }
    });

    host.run().await;
    Ok(())
}

/// Install the global tracing subscriber. `RUST_LOG` overrides the
/// configured level.
pub fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));

    if logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}
