//! Logged-in user and active store, as cached from the login token.
//!
//! Both records are kept close to the server shape: unknown fields are
//! carried through untouched so a round-trip through the local store never
//! loses data the UI relies on.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use tillsync_core::{StoreId, UserId};

use crate::roles::{roles_or_empty, Role};

/// A user as known to the till (current operator or roster entry).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionUser {
    pub id: UserId,
    #[serde(default)]
    pub username: String,
    #[serde(default, deserialize_with = "roles_or_empty")]
    pub roles: Vec<Role>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SessionUser {
    pub fn has_role(&self, role: &Role) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

/// Per-store sales settings (`Settings` on the wire).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreSettings {
    /// `"Y"` allows selling below zero stock.
    #[serde(rename = "SalesQty", default, skip_serializing_if = "Option::is_none")]
    pub sales_qty: Option<String>,
    /// `"Y"` allows selling expired stock.
    #[serde(rename = "SalesExp", default, skip_serializing_if = "Option::is_none")]
    pub sales_exp: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The store the current till is bound to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveStore {
    pub id: StoreId,
    #[serde(rename = "Settings", default)]
    pub settings: Option<StoreSettings>,
    #[serde(
        rename = "dedicatedCashier",
        default,
        deserialize_with = "flag_text",
        skip_serializing_if = "Option::is_none"
    )]
    pub dedicated_cashier: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ActiveStore {
    /// Whether the store runs a shared (non-dedicated) cashier desk.
    pub fn has_shared_cashier(&self) -> bool {
        self.dedicated_cashier.as_deref() == Some("0")
    }

    pub fn allows_negative_qty(&self) -> bool {
        self.settings
            .as_ref()
            .and_then(|s| s.sales_qty.as_deref())
            == Some("Y")
    }

    pub fn allows_expired(&self) -> bool {
        self.settings
            .as_ref()
            .and_then(|s| s.sales_exp.as_deref())
            == Some("Y")
    }
}

/// The pair every sync operation runs on behalf of.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub user: SessionUser,
    pub store: ActiveStore,
}

/// Flags arrive as `"0"`, `0` or `false`; normalize them to text.
fn flag_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(Value::Bool(b)) => Some(if b { "1" } else { "0" }.to_string()),
        Some(other) => Some(other.to_string()),
    })
}
