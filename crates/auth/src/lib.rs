//! `tillsync-auth`: session identity and the authorization rules the sync
//! engine consults before pulling server data.
//!
//! This crate is intentionally decoupled from HTTP and storage.

pub mod authorize;
pub mod roles;
pub mod user;

pub use authorize::{authorize_catalog_pull, AuthzError, CatalogAccess};
pub use roles::Role;
pub use user::{ActiveStore, Session, SessionUser, StoreSettings};
