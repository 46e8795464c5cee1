//! The locally cached catalog and its merge rules.
//!
//! Identity is the stock id (`SID`): the catalog never holds two products with
//! the same SID, and a delta merge only ever leaves active products behind.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use tillsync_core::StockId;

use crate::product::Product;

/// Ordered collection of products, persisted as a single blob.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Catalog {
    products: Vec<Product>,
}

/// What a delta merge did to the catalog.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub replaced: usize,
    pub appended: usize,
    pub pruned: usize,
}

impl Catalog {
    /// Build a catalog, keeping the first product seen for each SID.
    pub fn new(products: Vec<Product>) -> Self {
        let mut catalog = Self::default();
        catalog.extend_unique(products);
        catalog
    }

    pub fn len(&self) -> usize {
        self.products.len()
    }

    pub fn is_empty(&self) -> bool {
        self.products.is_empty()
    }

    pub fn products(&self) -> &[Product] {
        &self.products
    }

    pub fn get(&self, sid: StockId) -> Option<&Product> {
        self.products.iter().find(|p| p.sid == sid)
    }

    /// Append a page of a bulk download; SIDs already present are skipped.
    ///
    /// Returns how many products were added.
    pub fn extend_unique(&mut self, page: impl IntoIterator<Item = Product>) -> usize {
        let mut seen: HashSet<StockId> = self.products.iter().map(|p| p.sid).collect();
        let before = self.products.len();
        self.products
            .extend(page.into_iter().filter(|p| seen.insert(p.sid)));
        self.products.len() - before
    }

    /// Merge an incremental page into the catalog.
    ///
    /// Products whose SID appears in `delta` are replaced entirely, unknown
    /// SIDs are appended, and inactive products are pruned afterwards.
    /// Applying the same delta twice yields the same catalog as applying it
    /// once.
    pub fn merge_delta(&mut self, delta: &[Product]) -> MergeStats {
        let mut incoming: HashMap<StockId, &Product> = HashMap::with_capacity(delta.len());
        for product in delta {
            incoming.entry(product.sid).or_insert(product);
        }

        let mut stats = MergeStats::default();
        let mut seen = HashSet::with_capacity(self.products.len() + incoming.len());
        let mut merged = Vec::with_capacity(self.products.len() + incoming.len());

        for existing in self.products.drain(..) {
            if !seen.insert(existing.sid) {
                continue;
            }
            match incoming.get(&existing.sid) {
                Some(update) => {
                    merged.push((*update).clone());
                    stats.replaced += 1;
                }
                None => merged.push(existing),
            }
        }

        for product in delta {
            if seen.insert(product.sid) {
                merged.push(product.clone());
                stats.appended += 1;
            }
        }

        let before = merged.len();
        merged.retain(Product::active);
        stats.pruned = before - merged.len();

        self.products = merged;
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::product::tests::raw_row;
    use serde_json::json;

    fn product(sid: i64, qty: i64, active: &str) -> Product {
        let mut row = raw_row(sid);
        row["stockQty"] = json!(qty);
        row["isActive"] = json!(active);
        Product::from_value(row).unwrap()
    }

    #[test]
    fn delta_replaces_appends_and_prunes() {
        let mut catalog = Catalog::new(vec![
            product(1, 10, "1"),
            product(2, 20, "1"),
            product(3, 30, "1"),
        ]);

        let stats = catalog.merge_delta(&[
            product(2, 5, "1"),
            product(3, 30, "0"),
            product(4, 1, "1"),
        ]);

        assert_eq!(
            stats,
            MergeStats {
                replaced: 2,
                appended: 1,
                pruned: 1
            }
        );
        let sids: Vec<i64> = catalog.products().iter().map(|p| p.sid.get()).collect();
        assert_eq!(sids, vec![1, 2, 4]);
        assert_eq!(catalog.get(StockId::new(2)).unwrap().stock_qty, 5);
    }

    #[test]
    fn delta_with_duplicate_sids_keeps_first_occurrence() {
        let mut catalog = Catalog::default();
        catalog.merge_delta(&[product(7, 1, "1"), product(7, 2, "1")]);
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.get(StockId::new(7)).unwrap().stock_qty, 1);
    }

    #[test]
    fn merge_prunes_previously_inactive_entries() {
        let mut catalog = Catalog::new(vec![product(1, 1, "0"), product(2, 1, "1")]);
        catalog.merge_delta(&[]);
        assert_eq!(catalog.len(), 1);
    }

    #[test]
    fn bulk_pages_skip_known_sids() {
        let mut catalog = Catalog::default();
        assert_eq!(catalog.extend_unique(vec![product(1, 1, "1"), product(2, 1, "0")]), 2);
        assert_eq!(catalog.extend_unique(vec![product(2, 9, "1"), product(3, 1, "1")]), 1);
        assert_eq!(catalog.len(), 3);
        assert_eq!(catalog.get(StockId::new(2)).unwrap().stock_qty, 1);
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        fn arb_products() -> impl Strategy<Value = Vec<Product>> {
            prop::collection::vec((0i64..20, -5i64..50, prop::bool::ANY), 0..25).prop_map(
                |rows| {
                    rows.into_iter()
                        .map(|(sid, qty, active)| product(sid, qty, if active { "1" } else { "0" }))
                        .collect()
                },
            )
        }

        proptest! {
            #![proptest_config(ProptestConfig {
                cases: 256,
                ..ProptestConfig::default()
            })]

            /// Property: applying the same delta twice equals applying it once.
            #[test]
            fn merge_is_idempotent(existing in arb_products(), delta in arb_products()) {
                let mut once = Catalog::new(existing);
                once.merge_delta(&delta);

                let mut twice = once.clone();
                twice.merge_delta(&delta);

                prop_assert_eq!(once, twice);
            }

            /// Property: after a merge SIDs are unique and every product is active.
            #[test]
            fn merge_leaves_unique_active_products(existing in arb_products(), delta in arb_products()) {
                let mut catalog = Catalog::new(existing);
                catalog.merge_delta(&delta);

                let mut sids = HashSet::new();
                for p in catalog.products() {
                    prop_assert!(sids.insert(p.sid));
                    prop_assert!(p.active());
                }
            }

            /// Property: every active delta product ends up in the catalog as sent.
            #[test]
            fn active_delta_products_win(existing in arb_products(), delta in arb_products()) {
                let mut catalog = Catalog::new(existing);
                catalog.merge_delta(&delta);

                let mut first: HashMap<StockId, &Product> = HashMap::new();
                for p in &delta {
                    first.entry(p.sid).or_insert(p);
                }
                for (sid, p) in first {
                    if p.active() {
                        prop_assert_eq!(catalog.get(sid), Some(p));
                    } else {
                        prop_assert!(catalog.get(sid).is_none());
                    }
                }
            }
        }
    }
}
