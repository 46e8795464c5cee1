use std::borrow::Cow;

use serde::{Deserialize, Deserializer, Serialize};

/// Role identifier used for RBAC.
///
/// Roles are opaque strings as issued by the server; the handful the client
/// reasons about are exposed as constants.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Role(Cow<'static, str>);

impl Role {
    /// Field sales representative; always allowed to hold a local catalog.
    pub const SALES_REP: Role = Role(Cow::Borrowed("sales-rep"));

    /// Till operator.
    pub const CASHIER: Role = Role(Cow::Borrowed("cashier"));

    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for Role {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Deserialize a role list, treating `null` as "no roles".
pub(crate) fn roles_or_empty<'de, D>(deserializer: D) -> Result<Vec<Role>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<Role>>::deserialize(deserializer)?.unwrap_or_default())
}
