use thiserror::Error;

use crate::{ActiveStore, Role, SessionUser};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthzError {
    #[error("forbidden: {0}")]
    Forbidden(String),
}

/// Why a user may hold a local copy of the stock catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogAccess {
    /// Sales representatives always sell from the local catalog.
    SalesRep,
    /// A cashier at a store without a dedicated cashier desk.
    SharedCashier,
}

/// Decide whether `user` may pull catalog data for `store`.
///
/// - No IO
/// - No panics
///
/// Every other role (managers, dedicated cashiers, ...) never pulls catalog
/// data; callers treat the error as a silent no-op.
pub fn authorize_catalog_pull(
    user: &SessionUser,
    store: &ActiveStore,
) -> Result<CatalogAccess, AuthzError> {
    if user.has_role(&Role::SALES_REP) {
        return Ok(CatalogAccess::SalesRep);
    }
    if user.has_role(&Role::CASHIER) && store.has_shared_cashier() {
        return Ok(CatalogAccess::SharedCashier);
    }

    let roles: Vec<&str> = user.roles.iter().map(Role::as_str).collect();
    Err(AuthzError::Forbidden(format!(
        "user '{}' with roles [{}] does not sell from the local catalog",
        user.username,
        roles.join(", ")
    )))
}
