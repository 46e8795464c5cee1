//! Server → local reconciliation of the product catalog.
//!
//! Three entry points, all gated on catalog access and connectivity:
//! - [`CatalogReconciler::fetch_fresh`]: compare counts, reset if the server
//!   reports a big difference, then repopulate page by page.
//! - [`CatalogReconciler::fetch_reset`]: unconditional reset + repopulate.
//! - [`CatalogReconciler::fetch_delta`]: merge one bounded page of updates.

use std::sync::Arc;

use serde_json::{json, Value};

use tillsync_auth::{authorize_catalog_pull, ActiveStore, Session};
use tillsync_products::{Catalog, Product};

use crate::cache::PartitionStore;
use crate::error::SyncError;
use crate::offline::ConnectivityMonitor;
use crate::sync::{decode, ApiClient, DataPage, Endpoint, Params, StockCount};

/// Key of the catalog blob inside the `products` partition.
pub const CATALOG_KEY: &str = "products";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageSizes {
    pub bulk: u32,
    pub delta: u32,
}

impl Default for PageSizes {
    fn default() -> Self {
        Self {
            bulk: 1000,
            delta: 200,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The user's role does not sell from the local catalog.
    Unauthorized,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Skipped(SkipReason),
    /// Nothing was written.
    Unchanged,
    /// The catalog was replaced wholesale by a bulk download.
    Replaced { count: usize },
    /// A delta page was merged in.
    Merged { fetched: usize, total: usize },
}

pub struct CatalogReconciler {
    api: Arc<dyn ApiClient>,
    products: PartitionStore,
    monitor: Arc<ConnectivityMonitor>,
    pages: PageSizes,
}

impl CatalogReconciler {
    pub fn new(
        api: Arc<dyn ApiClient>,
        products: PartitionStore,
        monitor: Arc<ConnectivityMonitor>,
        pages: PageSizes,
    ) -> Self {
        Self {
            api,
            products,
            monitor,
            pages,
        }
    }

    /// The locally cached catalog (empty when nothing was stored yet).
    pub async fn load(&self) -> Result<Catalog, SyncError> {
        Ok(self.products.get_as(CATALOG_KEY).await?.unwrap_or_default())
    }

    async fn save(&self, catalog: &Catalog) -> Result<(), SyncError> {
        self.products.set_as(CATALOG_KEY, catalog).await?;
        Ok(())
    }

    async fn clear(&self) -> Result<(), SyncError> {
        self.products.remove(CATALOG_KEY).await?;
        tracing::info!("local catalog cleared");
        Ok(())
    }

    /// Authorization comes first so a refused user never touches the network.
    fn gate(&self, session: &Session) -> Option<ReconcileOutcome> {
        if let Err(err) = authorize_catalog_pull(&session.user, &session.store) {
            tracing::debug!(error = %err, "catalog pull skipped");
            return Some(ReconcileOutcome::Skipped(SkipReason::Unauthorized));
        }
        if let Err(err) = self.monitor.require_online() {
            tracing::debug!(error = %err, "catalog pull skipped");
            return Some(ReconcileOutcome::Skipped(SkipReason::Offline));
        }
        None
    }

    pub async fn fetch_fresh(&self, session: &Session) -> Result<ReconcileOutcome, SyncError> {
        if let Some(skipped) = self.gate(session) {
            return Ok(skipped);
        }

        let counted = self.load().await?.len();
        let body = self
            .api
            .get(
                Endpoint::CountAllStock,
                &vec![
                    ("storeID", session.store.id.to_string()),
                    ("userID", session.user.id.to_string()),
                    ("counted", counted.to_string()),
                ],
            )
            .await?;
        let count: StockCount = decode(Endpoint::CountAllStock, body)?;

        if count.has_big_difference() {
            tracing::info!(counted, "server reports a big catalog difference; resetting");
            self.reset_remote(session).await?;
            self.clear().await?;
        }

        self.repopulate(session).await
    }

    pub async fn fetch_reset(&self, session: &Session) -> Result<ReconcileOutcome, SyncError> {
        if let Some(skipped) = self.gate(session) {
            return Ok(skipped);
        }

        self.reset_remote(session).await?;
        self.clear().await?;
        self.repopulate(session).await
    }

    async fn reset_remote(&self, session: &Session) -> Result<(), SyncError> {
        self.api
            .post(
                Endpoint::ResetAllStock,
                &json!({ "storeID": session.store.id, "userID": session.user.id }),
            )
            .await?;
        Ok(())
    }

    /// Download the whole catalog and write it as one replacement.
    ///
    /// Pagination stops at the first page without a usable record. A failed
    /// page also stops it; whatever arrived before is still written.
    async fn repopulate(&self, session: &Session) -> Result<ReconcileOutcome, SyncError> {
        let page_size = self.pages.bulk;
        let mut catalog = Catalog::default();
        let mut offset: u64 = 0;

        loop {
            let mut params: Params = vec![
                ("needle", String::new()),
                ("storeID", session.store.id.to_string()),
                ("userID", session.user.id.to_string()),
                ("offset", offset.to_string()),
                ("rowCount", page_size.to_string()),
                ("chkEXP", "false".to_string()),
                ("chkStockQty", "true".to_string()),
            ];
            params.extend(stock_filters(&session.store));

            let page = match self.api.get(Endpoint::FetchAllStock, &params).await {
                Ok(body) => decode::<DataPage>(Endpoint::FetchAllStock, body),
                Err(err) => Err(err),
            };
            let page = match page {
                Ok(page) => page,
                Err(err) => {
                    tracing::warn!(offset, error = %err, "stock page failed; stopping pagination");
                    break;
                }
            };

            let products = parse_rows(page.data);
            if products.is_empty() {
                break;
            }
            let added = catalog.extend_unique(products);
            tracing::debug!(offset, added, "stock page received");
            offset += u64::from(page_size);
        }

        if catalog.is_empty() {
            tracing::info!("bulk download returned no products; local catalog left as is");
            return Ok(ReconcileOutcome::Unchanged);
        }

        self.save(&catalog).await?;
        tracing::info!(count = catalog.len(), "catalog replaced");
        Ok(ReconcileOutcome::Replaced { count: catalog.len() })
    }

    /// Merge one bounded page of recently changed stock into the catalog.
    pub async fn fetch_delta(&self, session: &Session) -> Result<ReconcileOutcome, SyncError> {
        if let Some(skipped) = self.gate(session) {
            return Ok(skipped);
        }

        let mut params: Params = vec![
            ("storeID", session.store.id.to_string()),
            ("userID", session.user.id.to_string()),
        ];
        params.extend(stock_filters(&session.store));
        params.push(("offset", "0".to_string()));
        params.push(("rowCount", self.pages.delta.to_string()));

        let body = self.api.get(Endpoint::FetchUpdatedStock, &params).await?;
        let page: DataPage = decode(Endpoint::FetchUpdatedStock, body)?;
        let delta = parse_rows(page.data);
        if delta.is_empty() {
            return Ok(ReconcileOutcome::Unchanged);
        }

        let mut catalog = self.load().await?;
        let stats = catalog.merge_delta(&delta);
        self.save(&catalog).await?;

        tracing::info!(
            fetched = delta.len(),
            replaced = stats.replaced,
            appended = stats.appended,
            pruned = stats.pruned,
            total = catalog.len(),
            "catalog delta merged"
        );
        Ok(ReconcileOutcome::Merged {
            fetched: delta.len(),
            total: catalog.len(),
        })
    }
}

/// `noNegativeQty` / `noExpired` query flags derived from the store settings.
fn stock_filters(store: &ActiveStore) -> [(&'static str, String); 2] {
    let flag = |allowed: bool| (if allowed { "false" } else { "true" }).to_string();
    [
        ("noNegativeQty", flag(store.allows_negative_qty())),
        ("noExpired", flag(store.allows_expired())),
    ]
}

/// Parse server rows, dropping malformed ones.
fn parse_rows(rows: Vec<Value>) -> Vec<Product> {
    rows.into_iter()
        .filter_map(|row| {
            let sid = row.get("SID").cloned().unwrap_or(Value::Null);
            match Product::from_value(row) {
                Ok(product) => Some(product),
                Err(err) => {
                    tracing::warn!(%sid, error = %err, "dropping malformed stock record");
                    None
                }
            }
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::cache::{MemoryStore, StoreRegistry};
    use crate::offline::tests::{probed_monitor, FakeProbe};
    use crate::sync::tests::{param, FakeApi};
    use serde_json::json;

    pub(crate) fn row(sid: i64, qty: i64, active: &str) -> Value {
        json!({
            "SID": sid.to_string(),
            "brand": "Acme",
            "description": "{\"other\":\"item\"}",
            "discounts": "",
            "expiryDate": null,
            "generics": "[]",
            "manufacturer": "Acme Labs",
            "productCode": format!("P{sid}"),
            "productType": "retail",
            "costPrice": "1.00",
            "sellingPrice": "2.00",
            "stockIn": null,
            "stockQty": qty.to_string(),
            "stockVersion": 1,
            "isActive": active
        })
    }

    fn page(rows: Vec<Value>) -> Result<Value, SyncError> {
        Ok(json!({ "data": rows }))
    }

    fn session(roles: &[&str], store: Value) -> Session {
        Session {
            user: serde_json::from_value(json!({ "id": 5, "username": "ana", "roles": roles })).unwrap(),
            store: serde_json::from_value(store).unwrap(),
        }
    }

    fn sales_rep() -> Session {
        session(&["sales-rep"], json!({ "id": 9, "Settings": { "SalesQty": "Y", "SalesExp": "N" } }))
    }

    struct Harness {
        api: Arc<FakeApi>,
        products: PartitionStore,
        reconciler: CatalogReconciler,
    }

    async fn harness(probe: FakeProbe) -> Harness {
        let api = Arc::new(FakeApi::new());
        let registry = StoreRegistry::new(Arc::new(MemoryStore::new()));
        let products = registry.products();
        let reconciler = CatalogReconciler::new(
            api.clone(),
            products.clone(),
            probed_monitor(probe).await,
            PageSizes { bulk: 2, delta: 200 },
        );
        Harness {
            api,
            products,
            reconciler,
        }
    }

    async fn seed(products: &PartitionStore, sids: &[i64]) {
        let catalog = Catalog::new(
            sids.iter()
                .map(|sid| Product::from_value(row(*sid, 1, "1")).unwrap())
                .collect(),
        );
        products.set_as(CATALOG_KEY, &catalog).await.unwrap();
    }

    async fn stored_sids(h: &Harness) -> Vec<i64> {
        h.reconciler
            .load()
            .await
            .unwrap()
            .products()
            .iter()
            .map(|p| p.sid.get())
            .collect()
    }

    #[tokio::test]
    async fn manager_triggers_no_network_calls() {
        let h = harness(FakeProbe::online()).await;
        let manager = session(&["manager"], json!({ "id": 9, "dedicatedCashier": "0" }));

        for outcome in [
            h.reconciler.fetch_fresh(&manager).await.unwrap(),
            h.reconciler.fetch_reset(&manager).await.unwrap(),
            h.reconciler.fetch_delta(&manager).await.unwrap(),
        ] {
            assert_eq!(outcome, ReconcileOutcome::Skipped(SkipReason::Unauthorized));
        }
        assert!(h.api.calls().is_empty());
    }

    #[tokio::test]
    async fn offline_skips_without_calls() {
        let h = harness(FakeProbe::offline()).await;
        let outcome = h.reconciler.fetch_delta(&sales_rep()).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Skipped(SkipReason::Offline));
        assert!(h.api.calls().is_empty());
    }

    #[tokio::test]
    async fn fresh_without_difference_keeps_catalog_until_replaced() {
        let h = harness(FakeProbe::online()).await;
        seed(&h.products, &[1, 2, 3]).await;
        h.api
            .reply(Endpoint::CountAllStock, Ok(json!({ "diff": false })))
            .reply(Endpoint::FetchAllStock, page(vec![row(10, 1, "1"), row(11, 1, "1")]))
            .reply(Endpoint::FetchAllStock, page(vec![row(11, 1, "1"), row(12, 1, "1")]))
            .reply(Endpoint::FetchAllStock, page(vec![]));

        let outcome = h.reconciler.fetch_fresh(&sales_rep()).await.unwrap();

        assert_eq!(outcome, ReconcileOutcome::Replaced { count: 3 });
        assert!(h.api.calls_to(Endpoint::ResetAllStock).is_empty());
        assert_eq!(stored_sids(&h).await, vec![10, 11, 12]);

        let count_call = &h.api.calls_to(Endpoint::CountAllStock)[0];
        assert_eq!(param(count_call, "counted"), Some("3"));
        assert_eq!(param(count_call, "storeID"), Some("9"));

        let pages = h.api.calls_to(Endpoint::FetchAllStock);
        let offsets: Vec<_> = pages.iter().map(|c| param(c, "offset").unwrap().to_string()).collect();
        assert_eq!(offsets, vec!["0", "2", "4"]);
        assert_eq!(param(&pages[0], "rowCount"), Some("2"));
        assert_eq!(param(&pages[0], "needle"), Some(""));
        assert_eq!(param(&pages[0], "chkEXP"), Some("false"));
        assert_eq!(param(&pages[0], "chkStockQty"), Some("true"));
        assert_eq!(param(&pages[0], "noNegativeQty"), Some("false"));
        assert_eq!(param(&pages[0], "noExpired"), Some("true"));
    }

    #[tokio::test]
    async fn fresh_with_big_difference_resets_before_paginating() {
        let h = harness(FakeProbe::online()).await;
        seed(&h.products, &[1, 2]).await;
        h.api
            .reply(Endpoint::CountAllStock, Ok(json!({ "diff": true })))
            .reply(Endpoint::ResetAllStock, Ok(json!({ "status": "success" })))
            .reply(Endpoint::FetchAllStock, Err(SyncError::Network("connection reset".into())));

        let outcome = h.reconciler.fetch_fresh(&sales_rep()).await.unwrap();

        // Reset cleared the catalog and the first page failed: nothing left.
        assert_eq!(outcome, ReconcileOutcome::Unchanged);
        let resets = h.api.calls_to(Endpoint::ResetAllStock);
        assert_eq!(resets.len(), 1);
        assert_eq!(resets[0].body, Some(json!({ "storeID": 9, "userID": 5 })));
        assert!(h.products.get(CATALOG_KEY).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_page_keeps_what_was_accumulated() {
        let h = harness(FakeProbe::online()).await;
        h.api
            .reply(Endpoint::ResetAllStock, Ok(json!({})))
            .reply(Endpoint::FetchAllStock, page(vec![row(1, 1, "1"), row(2, 1, "1")]))
            .reply(Endpoint::FetchAllStock, Err(SyncError::Api(500, "boom".into())));

        let outcome = h.reconciler.fetch_reset(&sales_rep()).await.unwrap();

        assert_eq!(outcome, ReconcileOutcome::Replaced { count: 2 });
        assert_eq!(stored_sids(&h).await, vec![1, 2]);
    }

    #[tokio::test]
    async fn failed_first_page_leaves_catalog_untouched() {
        let h = harness(FakeProbe::online()).await;
        seed(&h.products, &[4]).await;
        h.api
            .reply(Endpoint::CountAllStock, Ok(json!({ "diff": 0 })))
            .reply(Endpoint::FetchAllStock, Err(SyncError::Network("timeout".into())));

        assert_eq!(
            h.reconciler.fetch_fresh(&sales_rep()).await.unwrap(),
            ReconcileOutcome::Unchanged
        );
        assert_eq!(stored_sids(&h).await, vec![4]);
    }

    #[tokio::test]
    async fn malformed_rows_are_dropped_individually() {
        let h = harness(FakeProbe::online()).await;
        let mut broken = row(2, 1, "1");
        broken["description"] = json!("{oops");
        h.api
            .reply(Endpoint::ResetAllStock, Ok(json!({})))
            .reply(Endpoint::FetchAllStock, page(vec![row(1, 1, "1"), broken]))
            .reply(Endpoint::FetchAllStock, page(vec![]));

        assert_eq!(
            h.reconciler.fetch_reset(&sales_rep()).await.unwrap(),
            ReconcileOutcome::Replaced { count: 1 }
        );
    }

    #[tokio::test]
    async fn delta_merges_and_prunes() {
        let h = harness(FakeProbe::online()).await;
        seed(&h.products, &[1, 2, 3]).await;
        h.api.reply(
            Endpoint::FetchUpdatedStock,
            page(vec![row(2, 7, "1"), row(3, 1, "0"), row(4, 1, "1")]),
        );

        let outcome = h.reconciler.fetch_delta(&sales_rep()).await.unwrap();

        assert_eq!(outcome, ReconcileOutcome::Merged { fetched: 3, total: 3 });
        assert_eq!(stored_sids(&h).await, vec![1, 2, 4]);

        let call = &h.api.calls_to(Endpoint::FetchUpdatedStock)[0];
        assert_eq!(param(call, "offset"), Some("0"));
        assert_eq!(param(call, "rowCount"), Some("200"));
        assert_eq!(param(call, "userID"), Some("5"));
    }

    #[tokio::test]
    async fn empty_delta_writes_nothing() {
        let h = harness(FakeProbe::online()).await;
        h.api.reply(Endpoint::FetchUpdatedStock, page(vec![]));

        assert_eq!(
            h.reconciler.fetch_delta(&sales_rep()).await.unwrap(),
            ReconcileOutcome::Unchanged
        );
        assert!(h.products.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn shared_cashier_is_allowed() {
        let h = harness(FakeProbe::online()).await;
        h.api.reply(Endpoint::FetchUpdatedStock, page(vec![row(1, 1, "1")]));
        let cashier = session(&["cashier"], json!({ "id": 9, "dedicatedCashier": "0" }));

        let outcome = h.reconciler.fetch_delta(&cashier).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Merged { fetched: 1, total: 1 });
        let call = &h.api.calls_to(Endpoint::FetchUpdatedStock)[0];
        assert_eq!(param(call, "noNegativeQty"), Some("true"));
    }

    #[tokio::test]
    async fn delta_transport_failure_propagates() {
        let h = harness(FakeProbe::online()).await;
        h.api.reply(Endpoint::FetchUpdatedStock, Err(SyncError::Api(503, "down".into())));
        assert!(matches!(
            h.reconciler.fetch_delta(&sales_rep()).await,
            Err(SyncError::Api(503, _))
        ));
    }
}
