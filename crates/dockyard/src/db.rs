use std::path::Path;

use anyhow::{bail, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Sqlite};

mod collection;

pub use collection::Collection;

pub const SERVICES_COLLECTION: &str = "services";
pub const SERVICE_KEYS_COLLECTION: &str = "service_keys";

#[derive(Debug, Clone)]
pub struct DbClient {
    pool: Pool<Sqlite>,
}

impl DbClient {
    /// Opens a pooled connection to the SQLite file at `database_path`.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened.
    pub async fn connect(database_path: &Path) -> Result<Self> {
        let connect_options = SqliteConnectOptions::new()
            .filename(database_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;

        Ok(Self { pool })
    }

    /// Creates the parent directory, connects and applies migrations.
    ///
    /// # Errors
    /// Returns an error if the directory, connection or migrations fail.
    pub async fn initialize(database_path: &Path) -> Result<Self> {
        if let Some(parent_dir) = database_path.parent() {
            std::fs::create_dir_all(parent_dir)?;
        }

        let db = Self::connect(database_path).await?;
        db.run_migrations().await?;
        db.ensure_wal_mode().await?;

        Ok(db)
    }

    /// # Errors
    /// Returns an error if a migration fails to apply.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// # Errors
    /// Returns an error if the journal mode is not WAL.
    pub async fn ensure_wal_mode(&self) -> Result<()> {
        let journal_mode: String = sqlx::query_scalar("PRAGMA journal_mode=WAL;")
            .fetch_one(&self.pool)
            .await?;

        if journal_mode.to_uppercase() != "WAL" {
            bail!("SQLite WAL mode is not enabled");
        }

        Ok(())
    }

    /// Opens (and loads) the named collection.
    ///
    /// # Errors
    /// Returns an error if the collection snapshot cannot be read or decoded.
    pub async fn collection<T>(&self, name: &str) -> Result<Collection<T>>
    where
        T: serde::Serialize + serde::de::DeserializeOwned + Clone + Send + Sync,
    {
        Collection::open(self.pool.clone(), name).await
    }
}
