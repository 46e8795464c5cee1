//! Outbox delivery with bounded retries.
//!
//! This module provides a `SyncManager` that:
//! - Delivers queued invoices and balances one by one, in key order
//! - Retries failed attempts with linear backoff
//! - Verifies that the server acknowledged the right record
//! - Removes acknowledged records from the queue

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};

use crate::command_queue::{OutboxQueue, OutboxRecord, QueuedBalance, QueuedInvoice};
use crate::config::RetryPolicy;
use crate::error::SyncError;
use crate::sync::{decode, ApiClient, DeliveryAck};
use crate::types::{SyncOutcome, SyncTrigger};

pub struct SyncManager {
    api: Arc<dyn ApiClient>,
    queue: OutboxQueue,
    retry: RetryPolicy,
    invoices_running: AtomicBool,
    balances_running: AtomicBool,
    last_sync_at: Mutex<Option<DateTime<Utc>>>,
}

/// Holds a per-operation flag for the lifetime of one run.
struct RunGuard<'a>(&'a AtomicBool);

impl<'a> RunGuard<'a> {
    fn acquire(flag: &'a AtomicBool, kind: &'static str) -> Result<Self, SyncError> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| SyncError::Busy(kind))?;
        Ok(Self(flag))
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl SyncManager {
    pub fn new(api: Arc<dyn ApiClient>, queue: OutboxQueue, retry: RetryPolicy) -> Self {
        Self {
            api,
            queue,
            retry,
            invoices_running: AtomicBool::new(false),
            balances_running: AtomicBool::new(false),
            last_sync_at: Mutex::new(None),
        }
    }

    pub fn queue(&self) -> &OutboxQueue {
        &self.queue
    }

    /// Prime the pending-invoice counter; `false` if the store is unreadable.
    pub async fn initialize_offline_sync(&self) -> bool {
        match self.queue.initialize().await {
            Ok(count) => {
                tracing::info!(pending_invoices = count, "offline sync initialized");
                true
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to initialize offline sync");
                false
            }
        }
    }

    /// When the last invoice run finished.
    pub fn last_sync_at(&self) -> Option<DateTime<Utc>> {
        *self.last_sync_at.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn sync_invoices(&self, trigger: SyncTrigger) -> Result<SyncOutcome, SyncError> {
        let _guard = RunGuard::acquire(&self.invoices_running, QueuedInvoice::KIND)?;
        let outcome = self.deliver_all::<QueuedInvoice>(trigger).await?;
        *self.last_sync_at.lock().unwrap_or_else(PoisonError::into_inner) = Some(Utc::now());
        Ok(outcome)
    }

    pub async fn sync_balances(&self, trigger: SyncTrigger) -> Result<SyncOutcome, SyncError> {
        let _guard = RunGuard::acquire(&self.balances_running, QueuedBalance::KIND)?;
        self.deliver_all::<QueuedBalance>(trigger).await
    }

    /// Deliver every queued record of kind `R`.
    ///
    /// A record that cannot be delivered is counted failed and left queued;
    /// the batch moves on. Only a store failure while removing an
    /// acknowledged record aborts the whole batch.
    async fn deliver_all<R: OutboxRecord>(&self, trigger: SyncTrigger) -> Result<SyncOutcome, SyncError> {
        let pending = self.queue.load::<R>().await?;
        let mut outcome = SyncOutcome::default();
        if pending.is_empty() {
            return Ok(outcome);
        }

        tracing::info!(kind = R::KIND, count = pending.len(), ?trigger, "syncing offline records");

        for (key, record) in pending {
            let record = match record {
                Ok(record) => record,
                Err(err) => {
                    tracing::warn!(kind = R::KIND, %key, error = %err, "skipping unusable record");
                    outcome.fail_count += 1;
                    continue;
                }
            };

            match self.deliver(&record).await {
                Ok(()) => {
                    self.queue.retire(&key, &record).await?;
                    outcome.success_count += 1;
                }
                Err(err) => {
                    tracing::warn!(
                        kind = R::KIND,
                        unique_id = %record.unique_id(),
                        error = %err,
                        "failed to sync record"
                    );
                    outcome.fail_count += 1;
                }
            }
        }

        tracing::info!(
            kind = R::KIND,
            success = outcome.success_count,
            failed = outcome.fail_count,
            "offline sync finished"
        );
        Ok(outcome)
    }

    /// Deliver one record, retrying transient failures.
    async fn deliver<R: OutboxRecord>(&self, record: &R) -> Result<(), SyncError> {
        let payload = serde_json::to_value(record).map_err(|e| SyncError::Parse(e.to_string()))?;

        let mut attempt = 1;
        let ack = loop {
            match self.attempt::<R>(&payload).await {
                Ok(ack) => break ack,
                Err(err) if err.is_retryable() && attempt < self.retry.attempts => {
                    let delay = self.retry.delay_after(attempt);
                    tracing::warn!(
                        kind = R::KIND,
                        unique_id = %record.unique_id(),
                        attempt,
                        error = %err,
                        "sync attempt failed, retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        };

        match R::acknowledged_id(&ack) {
            Some(id) if &id == record.unique_id() => {
                tracing::debug!(kind = R::KIND, unique_id = %id, attempt, "record acknowledged");
                Ok(())
            }
            Some(id) => Err(SyncError::Validation(format!(
                "server acknowledged {} '{id}' while syncing '{}'",
                R::KIND,
                record.unique_id()
            ))),
            None => Err(SyncError::Validation(format!(
                "server acknowledged {} '{}' without an id",
                R::KIND,
                record.unique_id()
            ))),
        }
    }

    async fn attempt<R: OutboxRecord>(&self, payload: &serde_json::Value) -> Result<DeliveryAck, SyncError> {
        let body = self.api.post(R::ENDPOINT, payload).await?;
        let ack: DeliveryAck = decode(R::ENDPOINT, body)?;
        if !ack.is_success() {
            return Err(SyncError::Rejected(ack.message()));
        }
        Ok(ack)
    }
}

impl std::fmt::Debug for SyncManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncManager")
            .field("retry", &self.retry)
            .field("pending_invoices", &self.queue.invoice_count())
            .finish_non_exhaustive()
    }
}
