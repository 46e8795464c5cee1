//! `tillsync-core`: domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! the identifiers shared by the catalog, the outbox and the session, and the
//! domain error model.

pub mod error;
pub mod id;

pub use error::DomainError;
pub use id::{StockId, StoreId, UniqueId, UserId};
