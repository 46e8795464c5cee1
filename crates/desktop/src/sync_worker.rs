//! Run orchestration and the periodic fetch timer.
//!
//! A run moves through `Idle → Fetching → Syncing → Reporting → Idle`; a
//! request arriving while the machine is not idle is suppressed.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::catalog::{CatalogReconciler, ReconcileOutcome};
use crate::error::SyncError;
use crate::notify::{Notification, Notifier};
use crate::offline::ConnectivityMonitor;
use crate::roster::RosterRefresher;
use crate::session::SessionProvider;
use crate::sync_manager::SyncManager;
use crate::types::{RunOutcome, SyncOutcome, SyncReport, SyncTrigger};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPhase {
    Idle,
    /// Connectivity check, session lookup and catalog delta.
    Fetching,
    /// Outbox delivery and roster refresh.
    Syncing,
    Reporting,
}

impl SyncPhase {
    pub fn can_advance_to(self, next: SyncPhase) -> bool {
        use SyncPhase::*;
        matches!(
            (self, next),
            (Idle, Fetching)
                | (Fetching, Syncing)
                | (Fetching | Syncing, Reporting)
                | (Fetching | Syncing | Reporting, Idle)
        )
    }
}

/// Exclusive hold on the phase machine for one run; returns it to `Idle`
/// when dropped.
struct PhaseGuard<'a> {
    phase: &'a Mutex<SyncPhase>,
}

impl<'a> PhaseGuard<'a> {
    fn begin(phase: &'a Mutex<SyncPhase>) -> Option<Self> {
        let mut current = phase.lock().unwrap_or_else(PoisonError::into_inner);
        if !current.can_advance_to(SyncPhase::Fetching) {
            return None;
        }
        *current = SyncPhase::Fetching;
        Some(Self { phase })
    }

    fn advance(&self, next: SyncPhase) -> Result<(), String> {
        let mut current = self.phase.lock().unwrap_or_else(PoisonError::into_inner);
        if !current.can_advance_to(next) {
            return Err(format!("invalid sync phase transition {:?} -> {:?}", *current, next));
        }
        tracing::debug!(from = ?*current, to = ?next, "sync phase");
        *current = next;
        Ok(())
    }
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner) = SyncPhase::Idle;
    }
}

/// Components a run sequences.
pub struct SyncComponents {
    pub monitor: Arc<ConnectivityMonitor>,
    pub sessions: Arc<dyn SessionProvider>,
    pub catalog: Arc<CatalogReconciler>,
    pub outbox: Arc<SyncManager>,
    pub roster: Arc<RosterRefresher>,
    pub notifier: Arc<dyn Notifier>,
}

/// Sequences catalog download, outbox delivery and roster refresh, and
/// drives them periodically in the background.
pub struct SyncWorker {
    parts: SyncComponents,
    fetch_interval: Duration,
    phase: Mutex<SyncPhase>,
    periodic: Mutex<Option<PeriodicTask>>,
}

struct PeriodicTask {
    shutdown: Arc<Notify>,
    handle: JoinHandle<()>,
}

impl SyncWorker {
    pub fn new(parts: SyncComponents, fetch_interval: Duration) -> Self {
        Self {
            parts,
            fetch_interval,
            phase: Mutex::new(SyncPhase::Idle),
            periodic: Mutex::new(None),
        }
    }

    pub fn phase(&self) -> SyncPhase {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run one full fetch-and-sync cycle and report it.
    pub async fn fetch_updated_data(&self, trigger: SyncTrigger) -> RunOutcome {
        let Some(guard) = PhaseGuard::begin(&self.phase) else {
            tracing::debug!(?trigger, "sync run already in progress; request suppressed");
            self.report(trigger, &RunOutcome::Suppressed);
            return RunOutcome::Suppressed;
        };

        let outcome = match self.run(trigger, &guard).await {
            Ok(outcome) => outcome,
            Err(error) => {
                tracing::error!(?trigger, %error, "sync run failed");
                RunOutcome::Failed(error)
            }
        };

        if let Err(error) = guard.advance(SyncPhase::Reporting) {
            tracing::warn!(%error, "reporting outside the expected phase");
        }
        self.report(trigger, &outcome);
        drop(guard);
        outcome
    }

    async fn run(&self, trigger: SyncTrigger, guard: &PhaseGuard<'_>) -> Result<RunOutcome, String> {
        if !self.parts.monitor.refresh_status().await {
            tracing::info!(?trigger, "offline; sync deferred");
            return Ok(RunOutcome::Offline);
        }

        let session = match self.parts.sessions.current_session().await {
            Ok(Some(session)) => session,
            Ok(None) => {
                tracing::warn!(?trigger, "no active session; sync skipped");
                return Ok(RunOutcome::NoSession);
            }
            Err(err) => return Err(err.to_string()),
        };

        let mut report = SyncReport::default();
        match self.parts.catalog.fetch_delta(&session).await {
            Ok(ReconcileOutcome::Merged { fetched, .. }) => report.products_fetched = fetched,
            Ok(other) => tracing::debug!(outcome = ?other, "catalog delta"),
            Err(err) => return Err(format!("could not download updates: {err}")),
        }

        guard.advance(SyncPhase::Syncing)?;

        let (invoices, balances) = tokio::join!(
            self.parts.outbox.sync_invoices(trigger),
            self.parts.outbox.sync_balances(trigger),
        );
        report.invoices = settle(invoices)?;
        report.balances = settle(balances)?;

        if trigger.is_manual() {
            let update = self
                .parts
                .roster
                .refresh(&session.store, true)
                .await
                .map_err(|err| format!("could not refresh users: {err}"))?;
            report.current_user_revoked = update.current_user_revoked;
        }

        Ok(RunOutcome::Completed(report))
    }

    fn report(&self, trigger: SyncTrigger, outcome: &RunOutcome) {
        if let RunOutcome::Completed(report) = outcome {
            tracing::info!(
                ?trigger,
                products = report.products_fetched,
                invoices_synced = report.invoices.success_count,
                invoices_failed = report.invoices.fail_count,
                balances_synced = report.balances.success_count,
                balances_failed = report.balances.fail_count,
                "sync run completed"
            );
        }
        if let Some(notification) = Notification::for_run(trigger, outcome) {
            self.parts.notifier.notify(notification);
        }
    }

    /// Fetch now, then every `fetch_interval`, until stopped.
    ///
    /// Starting again replaces the running timer.
    pub fn start_periodic_fetch(self: &Arc<Self>) {
        self.stop_periodic_fetch();

        let shutdown = Arc::new(Notify::new());
        let worker = Arc::clone(self);
        let signal = shutdown.clone();
        let handle = tokio::spawn(async move {
            tracing::info!(interval = ?worker.fetch_interval, "periodic fetch started");

            let mut ticker = tokio::time::interval(worker.fetch_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = signal.notified() => break,
                    _ = ticker.tick() => {
                        worker.fetch_updated_data(SyncTrigger::Periodic).await;
                    }
                }
            }

            tracing::info!("periodic fetch stopped");
        });

        *self.periodic.lock().unwrap_or_else(PoisonError::into_inner) = Some(PeriodicTask { shutdown, handle });
    }

    /// Cancel the timer. A run already in flight finishes normally.
    pub fn stop_periodic_fetch(&self) {
        let task = self.periodic.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            task.shutdown.notify_one();
            drop(task.handle);
        }
    }

    pub fn is_periodic_fetch_running(&self) -> bool {
        self.periodic
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|task| !task.handle.is_finished())
    }
}

/// A batch refused as busy is already being handled by another run.
fn settle(result: Result<SyncOutcome, SyncError>) -> Result<SyncOutcome, String> {
    match result {
        Ok(outcome) => Ok(outcome),
        Err(SyncError::Busy(kind)) => {
            tracing::debug!(kind, "outbox batch already running");
            Ok(SyncOutcome::default())
        }
        Err(err) => Err(err.to_string()),
    }
}
