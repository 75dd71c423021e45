use std::collections::BTreeMap;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::{Pool, Sqlite};
use tokio::sync::RwLock;
use tracing::debug;

/// A flat key/value namespace backed by the `entries` table.
///
/// Reads are served from an in-memory map loaded at open time. Every mutation is written
/// to SQLite first and only then applied to the map.
#[derive(Debug)]
pub struct Collection<T> {
    name: String,
    pool: Pool<Sqlite>,
    entries: RwLock<BTreeMap<String, T>>,
}

impl<T> Collection<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync,
{
    pub(super) async fn open(pool: Pool<Sqlite>, name: &str) -> Result<Self> {
        let entries = Self::load(&pool, name).await?;
        debug!(collection = name, entries = entries.len(), "collection loaded");

        Ok(Self {
            name: name.to_string(),
            pool,
            entries: RwLock::new(entries),
        })
    }

    async fn load(pool: &Pool<Sqlite>, name: &str) -> Result<BTreeMap<String, T>> {
        let rows = sqlx::query_as::<_, (String, String)>(
            "SELECT key, value FROM entries WHERE collection = ?1",
        )
        .bind(name)
        .fetch_all(pool)
        .await?;

        rows.into_iter()
            .map(|(key, raw)| {
                let value = serde_json::from_str::<T>(&raw)
                    .with_context(|| format!("corrupt entry {name}/{key}"))?;
                Ok((key, value))
            })
            .collect()
    }

    /// Replaces the in-memory view with the persisted one.
    ///
    /// # Errors
    /// Returns an error if the snapshot cannot be read or decoded.
    pub async fn reload(&self) -> Result<()> {
        let fresh = Self::load(&self.pool, &self.name).await?;
        *self.entries.write().await = fresh;
        Ok(())
    }

    /// # Errors
    /// Returns an error if the value cannot be serialized or written.
    pub async fn set(&self, key: &str, value: T) -> Result<()> {
        let raw = serde_json::to_string(&value)?;
        sqlx::query(
            "INSERT INTO entries (collection, key, value) VALUES (?1, ?2, ?3)
            ON CONFLICT(collection, key) DO UPDATE SET
              value = excluded.value,
              updated_at = CURRENT_TIMESTAMP",
        )
        .bind(&self.name)
        .bind(key)
        .bind(raw)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to persist {}/{key}", self.name))?;

        self.entries.write().await.insert(key.to_string(), value);
        debug!(collection = %self.name, key, "entry written");
        Ok(())
    }

    /// Stores `value` only if no row exists for `key`, returning whether it was stored.
    /// The check happens in SQLite, so it also holds across processes sharing the file.
    ///
    /// # Errors
    /// Returns an error if the value cannot be serialized or written.
    pub async fn insert_new(&self, key: &str, value: T) -> Result<bool> {
        let raw = serde_json::to_string(&value)?;
        let result = sqlx::query(
            "INSERT INTO entries (collection, key, value) VALUES (?1, ?2, ?3)
            ON CONFLICT(collection, key) DO NOTHING",
        )
        .bind(&self.name)
        .bind(key)
        .bind(raw)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to persist {}/{key}", self.name))?;

        if result.rows_affected() == 0 {
            return Ok(false);
        }
        self.entries.write().await.insert(key.to_string(), value);
        debug!(collection = %self.name, key, "entry inserted");
        Ok(true)
    }

    pub async fn get(&self, key: &str) -> Option<T> {
        self.entries.read().await.get(key).cloned()
    }

    pub async fn get_or(&self, key: &str, default: T) -> T {
        self.get(key).await.unwrap_or(default)
    }

    pub async fn has(&self, key: &str) -> bool {
        self.entries.read().await.contains_key(key)
    }

    /// Removes the entry, returning whether a row existed.
    ///
    /// # Errors
    /// Returns an error if the delete cannot be written.
    pub async fn delete(&self, key: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM entries WHERE collection = ?1 AND key = ?2")
            .bind(&self.name)
            .bind(key)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to delete {}/{key}", self.name))?;

        let cached = self.entries.write().await.remove(key).is_some();
        debug!(collection = %self.name, key, "entry deleted");
        Ok(result.rows_affected() > 0 || cached)
    }

    /// All values, ordered by key.
    pub async fn get_all(&self) -> Vec<T> {
        self.entries.read().await.values().cloned().collect()
    }
}
