//! Catalog domain module.
//!
//! This crate contains the rules for turning server stock rows into sellable
//! products and for merging them into the local catalog, implemented purely
//! as deterministic domain logic (no IO, no HTTP, no storage).

pub mod catalog;
pub mod product;

pub use catalog::{Catalog, MergeStats};
pub use product::{Product, RawStockRecord};
