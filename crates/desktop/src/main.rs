//! Headless till sync agent.
//!
//! `tillsync-desktop` keeps syncing every fetch interval until Ctrl-C;
//! `tillsync-desktop sync-now` and `tillsync-desktop reset-catalog` run a
//! single command and exit.

use anyhow::Context;

use tillsync_desktop::{AppState, RunOutcome, SyncConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tillsync_observability::init();

    let config = SyncConfig::from_env().context("invalid sync configuration")?;
    let app = AppState::from_config(&config)?;

    if !app.initialize_offline_sync().await {
        tracing::warn!("local store unavailable; pending invoice count starts at zero");
    }

    let command = std::env::args().nth(1);
    match command.as_deref() {
        Some("sync-now") => {
            let outcome = app.sync_now().await;
            tracing::info!(outcome = %serde_json::to_string(&outcome)?, "sync finished");
            if matches!(outcome, RunOutcome::Failed(_)) {
                anyhow::bail!("sync failed");
            }
        }
        Some("reset-catalog") => {
            let outcome = app.reset_catalog().await.context("catalog reset failed")?;
            tracing::info!(?outcome, "catalog reset finished");
        }
        Some(other) => anyhow::bail!("unknown command '{other}' (expected sync-now or reset-catalog)"),
        None => {
            app.start_connectivity_monitor().await;
            app.start_periodic_fetch();
            tracing::info!(pending_invoices = app.pending_invoice_count(), "tillsync agent running");

            tokio::signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
            tracing::info!("shutdown requested");
            app.shutdown().await;
        }
    }

    Ok(())
}
