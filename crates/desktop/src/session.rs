//! The logged-in user and the till they operate, as persisted locally.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use tillsync_auth::{ActiveStore, Session, SessionUser};

use crate::cache::{PartitionStore, StoreRegistry};
use crate::error::SyncError;
use crate::roster::CURRENT_USER_KEY;

/// Source of the session sync runs act on behalf of.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    /// `Ok(None)` when nobody is logged in or no till is bound.
    async fn current_session(&self) -> Result<Option<Session>, SyncError>;
}

/// Stored till record: the till itself plus the store it was bound to,
/// JSON-encoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TillRecord {
    id: Value,
    #[serde(rename = "tillD")]
    till: Value,
    #[serde(rename = "storeD")]
    store: String,
}

/// Session backed by the `users` and `tills` partitions.
#[derive(Clone)]
pub struct LocalSession {
    users: PartitionStore,
    tills: PartitionStore,
}

impl LocalSession {
    pub fn new(stores: &StoreRegistry) -> Self {
        Self {
            users: stores.users(),
            tills: stores.tills(),
        }
    }

    pub async fn current_user(&self) -> Result<Option<SessionUser>, SyncError> {
        Ok(self.users.get_as(CURRENT_USER_KEY).await?)
    }

    /// Log `user` in: remember them as current and add them to the roster.
    pub async fn set_current_user(&self, user: &SessionUser) -> Result<(), SyncError> {
        if user.username.trim().is_empty() {
            return Err(SyncError::Validation("user must have a username".to_string()));
        }
        self.users.set_as(&user.username, user).await?;
        self.users.set_as(CURRENT_USER_KEY, user).await?;
        Ok(())
    }

    pub async fn logout(&self) -> Result<(), SyncError> {
        self.users.remove(CURRENT_USER_KEY).await?;
        Ok(())
    }

    /// Bind the till to `store`. The till must carry an `id`.
    pub async fn save_till(&self, till: &Value, store: &ActiveStore) -> Result<(), SyncError> {
        let id = till.get("id").cloned().unwrap_or(Value::Null);
        let key = match &id {
            Value::String(s) if !s.trim().is_empty() => s.clone(),
            Value::Number(n) => n.to_string(),
            _ => return Err(SyncError::Validation("till data must have an id".to_string())),
        };
        let record = TillRecord {
            id,
            till: till.clone(),
            store: serde_json::to_string(store).map_err(|e| SyncError::Parse(e.to_string()))?,
        };
        self.tills.set_as(&key, &record).await?;
        tracing::info!(till = %key, store = %store.id, "till saved");
        Ok(())
    }

    /// The store of the first saved till.
    pub async fn active_store(&self) -> Result<Option<ActiveStore>, SyncError> {
        let Some(key) = self.tills.keys().await?.into_iter().next() else {
            return Ok(None);
        };
        let Some(record) = self.tills.get_as::<TillRecord>(&key).await? else {
            return Ok(None);
        };
        let store = serde_json::from_str(&record.store)
            .map_err(|e| SyncError::Parse(format!("till '{key}' has an unreadable store: {e}")))?;
        Ok(Some(store))
    }
}

#[async_trait]
impl SessionProvider for LocalSession {
    async fn current_session(&self) -> Result<Option<Session>, SyncError> {
        let Some(user) = self.current_user().await? else {
            return Ok(None);
        };
        let Some(store) = self.active_store().await? else {
            return Ok(None);
        };
        Ok(Some(Session { user, store }))
    }
}

impl std::fmt::Debug for LocalSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalSession").finish_non_exhaustive()
    }
}
