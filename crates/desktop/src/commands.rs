//! The surface a shell (UI or headless agent) drives the engine through.

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use tillsync_auth::Session;

use crate::cache::{DurableStore, LocalStore, StoreRegistry};
use crate::catalog::{CatalogReconciler, PageSizes, ReconcileOutcome};
use crate::command_queue::OutboxQueue;
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::notify::{Notifier, TracingNotifier};
use crate::offline::{ConnectivityMonitor, MonitorSettings, NetworkProbe, SystemProbe};
use crate::roster::RosterRefresher;
use crate::session::{LocalSession, SessionProvider};
use crate::sync::{ApiClient, HttpApi};
use crate::sync_manager::SyncManager;
use crate::sync_worker::{SyncComponents, SyncPhase, SyncWorker};
use crate::types::{ConnectivityState, RunOutcome, SyncStatus, SyncTrigger};

/// Application state shared by every entry point.
#[derive(Clone)]
pub struct AppState {
    stores: StoreRegistry,
    session: LocalSession,
    monitor: Arc<ConnectivityMonitor>,
    catalog: Arc<CatalogReconciler>,
    outbox: Arc<SyncManager>,
    worker: Arc<SyncWorker>,
    monitor_task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl AppState {
    /// Wire the production collaborators described by `config`.
    ///
    /// The database is opened lazily, so this only fails on an unusable
    /// configuration.
    pub fn from_config(config: &SyncConfig) -> anyhow::Result<Self> {
        let store = match &config.db_path {
            Some(path) => LocalStore::new(path.clone()),
            None => LocalStore::at_default_path().context("failed to resolve the local database path")?,
        };
        let api = HttpApi::new(config.api_url.clone(), config.auth_token.clone(), config.request_timeout)
            .context("failed to build the API client")?;
        let probe = SystemProbe::new(config.probe_host.clone(), config.probe_url.clone(), config.probe_timeout)
            .context("failed to build the connectivity probe")?;

        tracing::info!(api_url = %config.api_url, probe_host = %config.probe_host, "sync engine configured");
        Ok(Self::new(
            config,
            Arc::new(api),
            Arc::new(probe),
            Arc::new(store),
            Arc::new(TracingNotifier),
        ))
    }

    /// Wire the engine around injected collaborators.
    pub fn new(
        config: &SyncConfig,
        api: Arc<dyn ApiClient>,
        probe: Arc<dyn NetworkProbe>,
        backend: Arc<dyn DurableStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let stores = StoreRegistry::new(backend);
        let session = LocalSession::new(&stores);

        let monitor = Arc::new(ConnectivityMonitor::new(
            probe,
            MonitorSettings {
                interval: config.connectivity_interval,
                offline_recheck: config.offline_recheck,
                probe_timeout: config.probe_timeout,
            },
        ));
        let catalog = Arc::new(CatalogReconciler::new(
            api.clone(),
            stores.products(),
            monitor.clone(),
            PageSizes {
                bulk: config.bulk_page_size,
                delta: config.delta_page_size,
            },
        ));
        let outbox = Arc::new(SyncManager::new(
            api.clone(),
            OutboxQueue::new(stores.clone()),
            config.retry,
        ));
        let roster = Arc::new(RosterRefresher::new(api, stores.users()));

        let worker = Arc::new(SyncWorker::new(
            SyncComponents {
                monitor: monitor.clone(),
                sessions: Arc::new(session.clone()),
                catalog: catalog.clone(),
                outbox: outbox.clone(),
                roster,
                notifier,
            },
            config.fetch_interval,
        ));

        Self {
            stores,
            session,
            monitor,
            catalog,
            outbox,
            worker,
            monitor_task: Arc::new(Mutex::new(None)),
        }
    }

    pub fn stores(&self) -> &StoreRegistry {
        &self.stores
    }

    /// Login state and till binding.
    pub fn session(&self) -> &LocalSession {
        &self.session
    }

    /// Queue that point-of-sale flows enqueue invoices and balances into.
    pub fn outbox(&self) -> &OutboxQueue {
        self.outbox.queue()
    }

    pub async fn initialize_offline_sync(&self) -> bool {
        self.outbox.initialize_offline_sync().await
    }

    pub fn pending_invoice_count(&self) -> usize {
        self.outbox.queue().invoice_count()
    }

    pub fn has_pending_invoices(&self) -> bool {
        self.pending_invoice_count() > 0
    }

    pub fn sync_status(&self) -> SyncStatus {
        let phase = self.worker.phase();
        SyncStatus {
            phase,
            is_syncing: phase != SyncPhase::Idle,
            last_sync_at: self.outbox.last_sync_at(),
            pending_invoices: self.pending_invoice_count(),
        }
    }

    pub fn connectivity_state(&self) -> ConnectivityState {
        self.monitor.state()
    }

    pub fn subscribe_connectivity(&self) -> watch::Receiver<ConnectivityState> {
        self.monitor.subscribe()
    }

    /// Start the background connectivity loop; a no-op if it is running.
    pub async fn start_connectivity_monitor(&self) {
        let mut task = self.monitor_task.lock().await;
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        *task = Some(self.monitor.start());
    }

    pub fn start_periodic_fetch(&self) {
        self.worker.start_periodic_fetch();
    }

    pub fn stop_periodic_fetch(&self) {
        self.worker.stop_periodic_fetch();
    }

    pub async fn fetch_updated_data(&self, trigger: SyncTrigger) -> RunOutcome {
        self.worker.fetch_updated_data(trigger).await
    }

    /// Operator-requested sync.
    pub async fn sync_now(&self) -> RunOutcome {
        self.fetch_updated_data(SyncTrigger::SyncNow).await
    }

    /// Re-download the catalog, reconciling counts with the server first.
    pub async fn refresh_catalog(&self) -> Result<ReconcileOutcome, SyncError> {
        let session = self.catalog_session().await?;
        self.catalog.fetch_fresh(&session).await
    }

    /// Ask the server to reset the stock snapshot, then re-download it.
    pub async fn reset_catalog(&self) -> Result<ReconcileOutcome, SyncError> {
        let session = self.catalog_session().await?;
        self.catalog.fetch_reset(&session).await
    }

    async fn catalog_session(&self) -> Result<Session, SyncError> {
        self.monitor.refresh_status().await;
        self.session
            .current_session()
            .await?
            .ok_or_else(|| SyncError::Validation("no user is logged in on this till".to_string()))
    }

    /// Stop both background loops and wait for the connectivity loop to exit.
    pub async fn shutdown(&self) {
        self.worker.stop_periodic_fetch();

        let task = self.monitor_task.lock().await.take();
        if let Some(handle) = task {
            self.monitor.shutdown();
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "connectivity monitor ended abnormally");
            }
        }
        tracing::info!("sync engine stopped");
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("connectivity", &self.monitor.state())
            .field("pending_invoices", &self.pending_invoice_count())
            .finish_non_exhaustive()
    }
}
