//! Local roster of cashiers allowed to log in on this till while offline.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;

use tillsync_auth::{ActiveStore, Role};

use crate::cache::PartitionStore;
use crate::error::SyncError;
use crate::sync::{decode, ApiClient, DataPage, Endpoint};

/// Key of the logged-in user inside the `users` partition.
pub const CURRENT_USER_KEY: &str = "currentUser";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RosterUpdate {
    pub upserted: usize,
    pub removed: usize,
    /// The logged-in user is no longer on the roster and was logged out.
    pub current_user_revoked: bool,
}

pub struct RosterRefresher {
    api: Arc<dyn ApiClient>,
    users: PartitionStore,
}

impl RosterRefresher {
    pub fn new(api: Arc<dyn ApiClient>, users: PartitionStore) -> Self {
        Self { api, users }
    }

    /// Replace the local roster with the store's current cashiers.
    ///
    /// With `validate_current`, a logged-in user missing from the new roster
    /// is removed and logged out.
    pub async fn refresh(&self, store: &ActiveStore, validate_current: bool) -> Result<RosterUpdate, SyncError> {
        let body = self
            .api
            .get(Endpoint::LoadUsers, &vec![("storeID", store.id.to_string())])
            .await?;
        let page: DataPage = decode(Endpoint::LoadUsers, body)?;

        let cashiers: Vec<(String, Value)> = page.data.into_iter().filter_map(cashier).collect();
        if cashiers.is_empty() {
            return Err(SyncError::Validation(format!(
                "server returned no cashiers for store {}",
                store.id
            )));
        }

        let mut update = RosterUpdate::default();
        let stamp = Value::String(Utc::now().to_rfc3339());
        let mut listed = HashSet::with_capacity(cashiers.len());

        for (username, mut record) in cashiers {
            if let Value::Object(map) = &mut record {
                map.insert("lastUpdated".to_string(), stamp.clone());
            }
            self.users.set(&username, &record).await?;
            listed.insert(username);
            update.upserted += 1;
        }

        let current = self.current_username().await?;

        for key in self.users.keys().await? {
            if key == CURRENT_USER_KEY || current.as_deref() == Some(key.as_str()) {
                continue;
            }
            if !listed.contains(&key) {
                self.users.remove(&key).await?;
                tracing::info!(username = %key, "removed stale user");
                update.removed += 1;
            }
        }

        if validate_current {
            if let Some(username) = current.filter(|name| !listed.contains(name)) {
                self.users.remove(&username).await?;
                self.users.remove(CURRENT_USER_KEY).await?;
                tracing::warn!(%username, "current user no longer exists; logged out");
                update.current_user_revoked = true;
            }
        }

        tracing::info!(
            upserted = update.upserted,
            removed = update.removed,
            current_user_revoked = update.current_user_revoked,
            "user roster refreshed"
        );
        Ok(update)
    }

    async fn current_username(&self) -> Result<Option<String>, SyncError> {
        let current = self.users.get(CURRENT_USER_KEY).await?;
        Ok(current
            .as_ref()
            .and_then(|user| user.get("username"))
            .and_then(Value::as_str)
            .filter(|name| !name.trim().is_empty())
            .map(str::to_string))
    }
}

/// The fields of a server user row the roster filters on.
#[derive(Deserialize)]
struct RosterEntry {
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    roles: Option<Vec<Role>>,
}

/// Keep a server row if it is a cashier with a username.
fn cashier(row: Value) -> Option<(String, Value)> {
    let entry: RosterEntry = match serde_json::from_value(row.clone()) {
        Ok(entry) => entry,
        Err(err) => {
            tracing::warn!(error = %err, "skipping malformed user record");
            return None;
        }
    };
    if !entry.roles.unwrap_or_default().contains(&Role::CASHIER) {
        return None;
    }
    match entry.username {
        Some(username) if !username.trim().is_empty() => Some((username, row)),
        _ => {
            tracing::warn!(id = %row.get("id").unwrap_or(&serde_json::Value::Null), "skipping cashier without a username");
            None
        }
    }
}
