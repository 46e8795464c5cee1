//! Durable key-value store with named partitions.
//!
//! Everything the sync engine persists (queued invoices and balances, the
//! product catalog, the user roster, the till) lives here as JSON values
//! keyed by string inside a [`Partition`]. Each operation is atomic on its
//! own; callers never need multi-key transactions.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, RwLock};

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tokio::sync::Mutex;

/// Independent namespaces inside the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Partition {
    Invoices,
    Balances,
    Products,
    Users,
    Tills,
}

impl Partition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Partition::Invoices => "invoices",
            Partition::Balances => "balances",
            Partition::Products => "products",
            Partition::Users => "users",
            Partition::Tills => "tills",
        }
    }
}

impl core::fmt::Display for Partition {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Async key-value persistence with named partitions.
///
/// Reading a missing key yields `Ok(None)`; only real I/O or encoding
/// failures are errors.
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn get(&self, partition: Partition, key: &str) -> Result<Option<Value>, StoreError>;

    async fn set(&self, partition: Partition, key: &str, value: &Value) -> Result<(), StoreError>;

    async fn remove(&self, partition: Partition, key: &str) -> Result<(), StoreError>;

    /// Keys of a partition in insertion order.
    async fn keys(&self, partition: Partition) -> Result<Vec<String>, StoreError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// SQLite backend
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum StoreLocation {
    File(PathBuf),
    Memory,
}

/// SQLite-backed durable store.
///
/// The connection pool is opened lazily on first use, so constructing the
/// store never fails; an unreachable database surfaces as a [`StoreError`]
/// on the first operation.
#[derive(Debug, Clone)]
pub struct LocalStore {
    location: StoreLocation,
    pool: Arc<Mutex<Option<SqlitePool>>>,
}

impl LocalStore {
    /// Store backed by the SQLite file at `path` (created if missing).
    pub fn new(path: PathBuf) -> Self {
        Self {
            location: StoreLocation::File(path),
            pool: Arc::new(Mutex::new(None)),
        }
    }

    /// Store backed by a private in-memory database.
    pub fn in_memory() -> Self {
        Self {
            location: StoreLocation::Memory,
            pool: Arc::new(Mutex::new(None)),
        }
    }

    /// Store at `{app_data_dir}/tillsync/store.db`.
    pub fn at_default_path() -> anyhow::Result<Self> {
        Ok(Self::new(default_db_path()?))
    }

    /// Get the pool, opening the database and creating the schema on first use.
    async fn get_pool(&self) -> Result<SqlitePool, StoreError> {
        let mut pool_guard = self.pool.lock().await;
        if let Some(pool) = pool_guard.as_ref() {
            return Ok(pool.clone());
        }

        let pool = self
            .open()
            .await
            .map_err(|err| StoreError::Unavailable(format!("{err:#}")))?;
        *pool_guard = Some(pool.clone());
        Ok(pool)
    }

    async fn open(&self) -> anyhow::Result<SqlitePool> {
        let pool = match &self.location {
            StoreLocation::File(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("failed to create store directory at {parent:?}"))?;
                }
                let options = SqliteConnectOptions::new()
                    .filename(path)
                    .create_if_missing(true)
                    .journal_mode(SqliteJournalMode::Wal);
                SqlitePoolOptions::new()
                    .max_connections(4)
                    .connect_with(options)
                    .await
                    .with_context(|| format!("failed to open SQLite store at {path:?}"))?
            }
            // A single connection that is never recycled keeps the in-memory
            // database alive for the lifetime of the pool.
            StoreLocation::Memory => SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(SqliteConnectOptions::from_str("sqlite::memory:")?)
                .await
                .context("failed to open in-memory SQLite store")?,
        };

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kv_store (
                partition  TEXT NOT NULL,
                key        TEXT NOT NULL,
                value      TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (partition, key)
            )
            "#,
        )
        .execute(&pool)
        .await
        .context("failed to create kv_store table")?;

        Ok(pool)
    }
}

#[async_trait]
impl DurableStore for LocalStore {
    async fn get(&self, partition: Partition, key: &str) -> Result<Option<Value>, StoreError> {
        let pool = self.get_pool().await?;

        let row = sqlx::query(
            r#"
            SELECT value
            FROM kv_store
            WHERE partition = ?1
              AND key = ?2
            "#,
        )
        .bind(partition.as_str())
        .bind(key)
        .fetch_optional(&pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let data: String = row.try_get("value")?;
        Ok(Some(serde_json::from_str(&data)?))
    }

    async fn set(&self, partition: Partition, key: &str, value: &Value) -> Result<(), StoreError> {
        let pool = self.get_pool().await?;
        let payload = serde_json::to_string(value)?;

        sqlx::query(
            r#"
            INSERT INTO kv_store (partition, key, value, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(partition, key)
            DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(partition.as_str())
        .bind(key)
        .bind(&payload)
        .bind(Utc::now().to_rfc3339())
        .execute(&pool)
        .await?;

        Ok(())
    }

    async fn remove(&self, partition: Partition, key: &str) -> Result<(), StoreError> {
        let pool = self.get_pool().await?;

        sqlx::query(
            r#"
            DELETE FROM kv_store
            WHERE partition = ?1
              AND key = ?2
            "#,
        )
        .bind(partition.as_str())
        .bind(key)
        .execute(&pool)
        .await?;

        Ok(())
    }

    async fn keys(&self, partition: Partition) -> Result<Vec<String>, StoreError> {
        let pool = self.get_pool().await?;

        let rows = sqlx::query(
            r#"
            SELECT key
            FROM kv_store
            WHERE partition = ?1
            ORDER BY rowid ASC
            "#,
        )
        .bind(partition.as_str())
        .fetch_all(&pool)
        .await?;

        rows.into_iter()
            .map(|row| row.try_get::<String, _>("key").map_err(StoreError::from))
            .collect()
    }
}

/// Resolve the path to the SQLite store:
/// `{app_data_dir}/tillsync/store.db`.
pub fn default_db_path() -> anyhow::Result<PathBuf> {
    let base = dirs::data_dir()
        .or_else(|| {
            dirs::home_dir().map(|mut h| {
                h.push(".local");
                h.push("share");
                h
            })
        })
        .context("failed to resolve OS app data directory - tried data_dir() and home_dir()/.local/share")?;

    let mut path = base;
    path.push("tillsync");
    path.push("store.db");
    Ok(path)
}

// ─────────────────────────────────────────────────────────────────────────────
// In-memory backend
// ─────────────────────────────────────────────────────────────────────────────

/// In-memory durable store.
///
/// Intended for tests/dev. Keeps insertion order per partition.
#[derive(Debug, Default)]
pub struct MemoryStore {
    partitions: RwLock<HashMap<Partition, Vec<(String, Value)>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> StoreError {
    StoreError::Unavailable("lock poisoned".to_string())
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn get(&self, partition: Partition, key: &str) -> Result<Option<Value>, StoreError> {
        let partitions = self.partitions.read().map_err(|_| poisoned())?;
        Ok(partitions
            .get(&partition)
            .and_then(|entries| entries.iter().find(|(k, _)| k == key))
            .map(|(_, v)| v.clone()))
    }

    async fn set(&self, partition: Partition, key: &str, value: &Value) -> Result<(), StoreError> {
        let mut partitions = self.partitions.write().map_err(|_| poisoned())?;
        let entries = partitions.entry(partition).or_default();
        match entries.iter_mut().find(|(k, _)| k == key) {
            Some((_, existing)) => *existing = value.clone(),
            None => entries.push((key.to_string(), value.clone())),
        }
        Ok(())
    }

    async fn remove(&self, partition: Partition, key: &str) -> Result<(), StoreError> {
        let mut partitions = self.partitions.write().map_err(|_| poisoned())?;
        if let Some(entries) = partitions.get_mut(&partition) {
            entries.retain(|(k, _)| k != key);
        }
        Ok(())
    }

    async fn keys(&self, partition: Partition) -> Result<Vec<String>, StoreError> {
        let partitions = self.partitions.read().map_err(|_| poisoned())?;
        Ok(partitions
            .get(&partition)
            .map(|entries| entries.iter().map(|(k, _)| k.clone()).collect())
            .unwrap_or_default())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Registry
// ─────────────────────────────────────────────────────────────────────────────

/// Store handles for every partition, built once at start-up and passed to
/// each component that needs persistence.
#[derive(Clone)]
pub struct StoreRegistry {
    backend: Arc<dyn DurableStore>,
}

impl StoreRegistry {
    pub fn new(backend: Arc<dyn DurableStore>) -> Self {
        Self { backend }
    }

    pub fn partition(&self, partition: Partition) -> PartitionStore {
        PartitionStore {
            backend: self.backend.clone(),
            partition,
        }
    }

    pub fn invoices(&self) -> PartitionStore {
        self.partition(Partition::Invoices)
    }

    pub fn balances(&self) -> PartitionStore {
        self.partition(Partition::Balances)
    }

    pub fn products(&self) -> PartitionStore {
        self.partition(Partition::Products)
    }

    pub fn users(&self) -> PartitionStore {
        self.partition(Partition::Users)
    }

    pub fn tills(&self) -> PartitionStore {
        self.partition(Partition::Tills)
    }
}

impl core::fmt::Debug for StoreRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StoreRegistry").finish_non_exhaustive()
    }
}

/// A view of one partition with typed helpers.
#[derive(Clone)]
pub struct PartitionStore {
    backend: Arc<dyn DurableStore>,
    partition: Partition,
}

impl PartitionStore {
    pub fn partition(&self) -> Partition {
        self.partition
    }

    pub async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        self.backend.get(self.partition, key).await
    }

    pub async fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.get(key).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    pub async fn set(&self, key: &str, value: &Value) -> Result<(), StoreError> {
        self.backend.set(self.partition, key, value).await
    }

    pub async fn set_as<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let value = serde_json::to_value(value)?;
        self.set(key, &value).await
    }

    pub async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.backend.remove(self.partition, key).await
    }

    pub async fn keys(&self) -> Result<Vec<String>, StoreError> {
        self.backend.keys(self.partition).await
    }

    /// Every `(key, value)` pair of the partition, in key order.
    ///
    /// Keys that vanish between listing and reading are skipped.
    pub async fn entries(&self) -> Result<Vec<(String, Value)>, StoreError> {
        let keys = self.keys().await?;
        let mut entries = Vec::with_capacity(keys.len());
        for key in keys {
            match self.get(&key).await? {
                Some(value) => entries.push((key, value)),
                None => tracing::warn!(partition = %self.partition, %key, "no value found for listed key"),
            }
        }
        Ok(entries)
    }
}
