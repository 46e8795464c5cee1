//! `tillsync-desktop`
//!
//! **Responsibility:** Offline sync engine for the point-of-sale till.
//!
//! This crate provides:
//! - A partitioned durable key-value store (SQLite) for invoices, balances,
//!   the product catalog, the user roster and tills
//! - Connectivity detection with a single published online/offline state
//! - Catalog download (bulk and delta) from the POS API
//! - Outbox delivery of invoices and balances with bounded retries
//! - A periodic fetch-and-sync cycle and an on-demand "sync now"
//!
//! The API stays the authority; the till sells from its local copy while
//! offline and pushes what it recorded once connectivity is back.

pub mod cache;
pub mod catalog;
pub mod command_queue;
pub mod commands;
pub mod config;
pub mod error;
pub mod notify;
pub mod offline;
pub mod roster;
pub mod session;
pub mod sync;
pub mod sync_manager;
pub mod sync_worker;
pub mod types;

pub use cache::{LocalStore, MemoryStore, Partition, StoreRegistry};
pub use commands::AppState;
pub use config::SyncConfig;
pub use error::SyncError;
pub use offline::{ConnectivityMonitor, ConnectivityState};
pub use sync::{ApiClient, HttpApi};
pub use types::{RunOutcome, SyncReport, SyncStatus, SyncTrigger};
