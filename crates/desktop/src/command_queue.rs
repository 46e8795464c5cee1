//! Durable outbox of records created while offline.
//!
//! Invoices and cash balances are queued in their own partitions, keyed by
//! the caller-assigned `uniqueID`. Records are never mutated in place; they
//! leave the queue only once the server has acknowledged them.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use tillsync_core::UniqueId;

use crate::cache::{Partition, StoreRegistry};
use crate::error::SyncError;
use crate::sync::{DeliveryAck, Endpoint};

pub use crate::types::{QueuedBalance, QueuedInvoice};

/// A record kind the outbox knows how to deliver.
pub trait OutboxRecord: Serialize + DeserializeOwned + Send + Sync {
    /// Human-readable kind, used in logs and [`SyncError::Busy`].
    const KIND: &'static str;
    const PARTITION: Partition;
    const ENDPOINT: Endpoint;

    fn unique_id(&self) -> &UniqueId;

    /// The id the server echoed back in a successful reply.
    fn acknowledged_id(ack: &DeliveryAck) -> Option<UniqueId>;

    /// Whether an acknowledged record is removed from the queue.
    fn retires_on_ack(&self) -> bool;
}

impl OutboxRecord for QueuedInvoice {
    const KIND: &'static str = "invoice";
    const PARTITION: Partition = Partition::Invoices;
    const ENDPOINT: Endpoint = Endpoint::SyncOfflineInvoices;

    fn unique_id(&self) -> &UniqueId {
        &self.unique_id
    }

    fn acknowledged_id(ack: &DeliveryAck) -> Option<UniqueId> {
        ack.top_level_id()
    }

    fn retires_on_ack(&self) -> bool {
        true
    }
}

impl OutboxRecord for QueuedBalance {
    const KIND: &'static str = "balance";
    const PARTITION: Partition = Partition::Balances;
    const ENDPOINT: Endpoint = Endpoint::SyncOfflineBalance;

    fn unique_id(&self) -> &UniqueId {
        &self.unique_id
    }

    fn acknowledged_id(ack: &DeliveryAck) -> Option<UniqueId> {
        ack.data_id()
    }

    fn retires_on_ack(&self) -> bool {
        QueuedBalance::retires_on_ack(self)
    }
}

/// A stored entry; records that no longer decode are kept as errors so
/// callers can account for them.
pub type Pending<R> = (String, Result<R, SyncError>);

/// Outbox over the `invoices` and `balances` partitions.
///
/// This struct is cheap to clone; clones share the pending-invoice counter.
#[derive(Debug, Clone)]
pub struct OutboxQueue {
    stores: StoreRegistry,
    pending_invoices: Arc<AtomicUsize>,
}

impl OutboxQueue {
    pub fn new(stores: StoreRegistry) -> Self {
        Self {
            stores,
            pending_invoices: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Prime the pending-invoice counter from what is already stored.
    pub async fn initialize(&self) -> Result<usize, SyncError> {
        let count = self.stores.invoices().keys().await?.len();
        self.pending_invoices.store(count, Ordering::SeqCst);
        Ok(count)
    }

    /// Invoices waiting for delivery, as last counted.
    pub fn invoice_count(&self) -> usize {
        self.pending_invoices.load(Ordering::SeqCst)
    }

    pub async fn enqueue_invoice(&self, record: Value) -> Result<UniqueId, SyncError> {
        self.enqueue::<QueuedInvoice>(record).await
    }

    pub async fn enqueue_balance(&self, record: Value) -> Result<UniqueId, SyncError> {
        self.enqueue::<QueuedBalance>(record).await
    }

    async fn enqueue<R: OutboxRecord>(&self, record: Value) -> Result<UniqueId, SyncError> {
        let parsed: R = serde_json::from_value(record.clone())
            .map_err(|e| SyncError::Validation(format!("{} record rejected: {e}", R::KIND)))?;
        let id = parsed.unique_id().clone();
        let store = self.stores.partition(R::PARTITION);

        let is_new = store.get(id.as_str()).await?.is_none();
        store.set(id.as_str(), &record).await?;
        if is_new && R::PARTITION == Partition::Invoices {
            self.pending_invoices.fetch_add(1, Ordering::SeqCst);
        }

        tracing::debug!(kind = R::KIND, unique_id = %id, "record queued");
        Ok(id)
    }

    pub async fn invoices(&self) -> Result<Vec<QueuedInvoice>, SyncError> {
        Ok(valid(self.load::<QueuedInvoice>().await?))
    }

    pub async fn balances(&self) -> Result<Vec<QueuedBalance>, SyncError> {
        Ok(valid(self.load::<QueuedBalance>().await?))
    }

    /// Every stored record of kind `R`, in key order.
    pub async fn load<R: OutboxRecord>(&self) -> Result<Vec<Pending<R>>, SyncError> {
        let entries = self.stores.partition(R::PARTITION).entries().await?;
        Ok(entries
            .into_iter()
            .map(|(key, value)| {
                let record = serde_json::from_value::<R>(value).map_err(|e| {
                    SyncError::Validation(format!("stored {} '{key}' is unusable: {e}", R::KIND))
                });
                (key, record)
            })
            .collect())
    }

    /// Drop an acknowledged record, unless the record asks to be kept.
    ///
    /// Returns whether the record was removed.
    pub async fn retire<R: OutboxRecord>(&self, key: &str, record: &R) -> Result<bool, SyncError> {
        if !record.retires_on_ack() {
            tracing::info!(kind = R::KIND, unique_id = %record.unique_id(), "acknowledged record kept (still active)");
            return Ok(false);
        }

        self.stores.partition(R::PARTITION).remove(key).await?;
        if R::PARTITION == Partition::Invoices {
            let _ = self
                .pending_invoices
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)));
        }
        tracing::info!(kind = R::KIND, unique_id = %record.unique_id(), "synced record removed");
        Ok(true)
    }
}

fn valid<R>(pending: Vec<Pending<R>>) -> Vec<R> {
    pending
        .into_iter()
        .filter_map(|(key, record)| match record {
            Ok(record) => Some(record),
            Err(err) => {
                tracing::warn!(%key, error = %err, "skipping unusable outbox record");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryStore;
    use serde_json::json;

    fn queue() -> (OutboxQueue, StoreRegistry) {
        let stores = StoreRegistry::new(Arc::new(MemoryStore::new()));
        (OutboxQueue::new(stores.clone()), stores)
    }

    #[tokio::test]
    async fn enqueue_counts_new_invoices_once() {
        let (queue, _) = queue();
        queue.enqueue_invoice(json!({ "uniqueID": "a", "total": 1 })).await.unwrap();
        queue.enqueue_invoice(json!({ "uniqueID": "b", "total": 2 })).await.unwrap();
        queue.enqueue_invoice(json!({ "uniqueID": "a", "total": 1 })).await.unwrap();

        assert_eq!(queue.invoice_count(), 2);
        let ids: Vec<String> = queue
            .invoices()
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.unique_id.to_string())
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn records_without_unique_id_are_rejected() {
        let (queue, stores) = queue();
        let err = queue.enqueue_balance(json!({ "isActive": 1 })).await.unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
        let err = queue.enqueue_invoice(json!({ "uniqueID": "  " })).await.unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
        assert!(stores.balances().keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn initialize_primes_the_counter_from_storage() {
        let (queue, stores) = queue();
        stores.invoices().set("x", &json!({ "uniqueID": "x" })).await.unwrap();
        stores.invoices().set("y", &json!({ "uniqueID": "y" })).await.unwrap();

        assert_eq!(queue.initialize().await.unwrap(), 2);
        assert_eq!(queue.invoice_count(), 2);
    }

    #[tokio::test]
    async fn load_reports_unusable_records() {
        let (queue, stores) = queue();
        stores.balances().set("ok", &json!({ "uniqueID": "ok", "isActive": 1 })).await.unwrap();
        stores.balances().set("broken", &json!({ "amount": 3 })).await.unwrap();

        let pending = queue.load::<QueuedBalance>().await.unwrap();
        assert_eq!(pending.len(), 2);
        assert!(pending[0].1.is_ok());
        assert!(matches!(pending[1].1, Err(SyncError::Validation(_))));
        assert_eq!(queue.balances().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn retire_keeps_active_balances() {
        let (queue, stores) = queue();
        queue.enqueue_balance(json!({ "uniqueID": "b0", "isActive": 0 })).await.unwrap();
        queue.enqueue_balance(json!({ "uniqueID": "b1", "isActive": 1 })).await.unwrap();

        for record in queue.balances().await.unwrap() {
            let key = record.unique_id.to_string();
            queue.retire(&key, &record).await.unwrap();
        }
        assert_eq!(stores.balances().keys().await.unwrap(), vec!["b0"]);
    }

    #[tokio::test]
    async fn retiring_invoices_decrements_the_counter() {
        let (queue, _) = queue();
        queue.enqueue_invoice(json!({ "uniqueID": "a" })).await.unwrap();
        let invoice = queue.invoices().await.unwrap().remove(0);

        assert!(queue.retire("a", &invoice).await.unwrap());
        assert_eq!(queue.invoice_count(), 0);
        // Never underflows.
        assert!(queue.retire("a", &invoice).await.unwrap());
        assert_eq!(queue.invoice_count(), 0);
    }
}
