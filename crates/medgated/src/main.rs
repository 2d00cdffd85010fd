//! medgated - governed AI request mediator
//!
//! Loads policy and provider config, opens the audit store, replays any
//! near-miss audit journal, then serves the HTTP API.

use anyhow::{Context, Result};
use medgated::audit_store::{AuditStore, SqliteAuditStore};
use medgated::config::Config;
use medgated::provider::ProviderRegistry;
use medgated::server::{self, AppState};
use medgated::Mediator;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{info, warn};

fn spawn_maintenance(mediator: Arc<Mediator>, every: Duration) {
    tokio::spawn(async move {
        let mut interval = interval(every);
        // First tick fires immediately; startup already did the work
        interval.tick().await;

        loop {
            interval.tick().await;
            if let Err(e) = mediator.run_maintenance().await {
                warn!("Maintenance pass failed: {}", e);
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("[BOOT] medgated v{} starting...", env!("CARGO_PKG_VERSION"));

    let config = Config::load();
    config.validate().context("Invalid configuration")?;
    info!("[BOOT] Policy loaded: {} roles, {} models", config.policy.role_access.len(), config.policy.models.len());

    let store = SqliteAuditStore::open_at(&config.audit.db_path)
        .with_context(|| format!("Failed to open audit store at {}", config.audit.db_path.display()))?;
    let store: Arc<dyn AuditStore> = Arc::new(store);
    info!("[BOOT] Audit store ready ({} records)", store.count().await.unwrap_or(0));

    let registry = ProviderRegistry::from_config(&config.providers).context("Failed to build provider backends")?;

    let mediator = Arc::new(Mediator::new(&config, registry, store));

    match mediator.replay_journal().await {
        Ok(report) if report.remaining > 0 => {
            warn!("[BOOT] {} audit record(s) still waiting in the near-miss journal", report.remaining)
        }
        Ok(_) => {}
        Err(e) => warn!("[BOOT] Audit journal replay failed: {}", e),
    }
    if let Err(e) = mediator.run_maintenance().await {
        warn!("[BOOT] Initial maintenance pass failed: {}", e);
    }

    spawn_maintenance(
        Arc::clone(&mediator),
        Duration::from_secs(config.audit.maintenance_interval_secs.max(60)),
    );

    let state = AppState::new(mediator, config.server.max_batch_size);
    server::run(state, &config.server.bind_addr).await
}
