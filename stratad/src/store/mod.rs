//! Persistent metadata: backends, files, tags, filters, sync configuration and
//! sync bookkeeping. One SQL text serves both the embedded SQLite variant and the
//! networked PostgreSQL variant through sqlx's `Any` driver.

mod backends;
mod changes;
mod files;
mod filters;
pub mod migrations;
mod models;
mod sync;
mod tags;

use std::sync::{Arc, RwLock};
use std::{fs, path::PathBuf};

use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{Any, AnyPool, Row, Transaction};
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};

pub use files::UpsertOutcome;
pub use migrations::{MIGRATIONS, MigrationStatus};
pub use models::*;
pub use sync::EntryUpdate;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration {version} ({description}) failed: {source}")]
    Migration {
        version: i64,
        description: &'static str,
        #[source]
        source: sqlx::Error,
    },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("XDG data directory is unavailable")]
    MissingDataDir,
    #[error("unsupported database url: {0}")]
    UnsupportedUrl(String),
    #[error("{0} already exists")]
    Duplicate(String),
    #[error("invalid stored value for {column}: {value}")]
    InvalidValue { column: &'static str, value: String },
    #[error("row missing after write: {0}")]
    MissingRow(&'static str),
    #[error("no applied migration to roll back")]
    NothingToRollBack,
    #[error("failed to encode column value: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Sqlite,
    Postgres,
}

impl StoreKind {
    pub fn from_url(url: &str) -> Result<Self, StoreError> {
        if url.starts_with("sqlite:") {
            Ok(StoreKind::Sqlite)
        } else if url.starts_with("postgres:") || url.starts_with("postgresql:") {
            Ok(StoreKind::Postgres)
        } else {
            Err(StoreError::UnsupportedUrl(url.to_string()))
        }
    }
}

/// Told about committed writes that can change which files a query matches.
/// Called synchronously, before the write returns to its caller.
pub trait CatalogObserver: Send + Sync {
    fn backend_changed(&self, backend_id: &str);
}

pub struct MetadataStore {
    pool: AnyPool,
    kind: StoreKind,
    write_gate: Option<Mutex<()>>,
    observers: RwLock<Vec<Arc<dyn CatalogObserver>>>,
}

impl MetadataStore {
    pub fn from_pool(pool: AnyPool, kind: StoreKind) -> Self {
        Self {
            pool,
            kind,
            write_gate: (kind == StoreKind::Sqlite).then(|| Mutex::new(())),
            observers: RwLock::new(Vec::new()),
        }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        sqlx::any::install_default_drivers();
        let kind = StoreKind::from_url(database_url)?;
        let max_connections = match kind {
            StoreKind::Sqlite if database_url.contains(":memory:") => 1,
            StoreKind::Sqlite => 4,
            StoreKind::Postgres => 16,
        };
        let mut options = AnyPoolOptions::new().max_connections(max_connections);
        if database_url.contains(":memory:") {
            // the database lives only as long as its connection
            options = options.idle_timeout(None).max_lifetime(None);
        }
        let pool = options.connect(database_url).await?;
        Ok(Self::from_pool(pool, kind))
    }

    pub async fn open_default() -> Result<Self, StoreError> {
        let db_path = default_db_path()?;
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        let store = Self::connect(&url).await?;
        store.migrate().await?;
        Ok(store)
    }

    /// Fresh migrated in-memory database.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let store = Self::connect("sqlite::memory:").await?;
        store.migrate().await?;
        Ok(store)
    }

    pub fn kind(&self) -> StoreKind {
        self.kind
    }

    pub async fn health(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Serialises writers on the embedded variant. The networked variant relies
    /// on the database's own isolation.
    pub(crate) async fn write_lock(&self) -> Option<MutexGuard<'_, ()>> {
        match &self.write_gate {
            Some(gate) => Some(gate.lock().await),
            None => None,
        }
    }

    pub fn subscribe(&self, observer: Arc<dyn CatalogObserver>) {
        let mut observers = self
            .observers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        observers.push(observer);
    }

    pub(crate) fn notify_backend_changed(&self, backend_id: &str) {
        let observers = self
            .observers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for observer in observers.iter() {
            observer.backend_changed(backend_id);
        }
    }

    pub(crate) async fn begin(&self) -> Result<Transaction<'static, Any>, StoreError> {
        Ok(self.pool.begin().await?)
    }
}

pub fn default_db_path() -> Result<PathBuf, StoreError> {
    let base = dirs::data_dir().ok_or(StoreError::MissingDataDir)?;
    Ok(base.join("strata").join("metadata.db"))
}

pub(crate) fn now_unix() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

pub(crate) fn bool_to_int(value: bool) -> i64 {
    if value { 1 } else { 0 }
}

pub(crate) fn get_bool(row: &AnyRow, column: &str) -> Result<bool, StoreError> {
    let value: i64 = row.try_get(column)?;
    Ok(value != 0)
}

pub(crate) fn map_unique(err: sqlx::Error, what: impl Into<String>) -> StoreError {
    match err.as_database_error() {
        Some(db) if db.is_unique_violation() => StoreError::Duplicate(what.into()),
        _ => StoreError::Sqlx(err),
    }
}

/// Parent directory of a backend-relative path, `None` at the root.
pub(crate) fn parent_path(path: &str) -> Option<&str> {
    path.trim_end_matches('/')
        .rsplit_once('/')
        .map(|(parent, _)| parent)
        .filter(|parent| !parent.is_empty())
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
