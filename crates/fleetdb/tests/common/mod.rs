//! Fleet store test utilities.

pub mod fixtures;

use roost_fleetdb::{FleetResult, FleetStore, SqliteStore};
use sqlx::{Pool, Sqlite};
use std::sync::Arc;
use tempfile::TempDir;

/// A test fleet store wrapper that cleans up on drop.
#[allow(dead_code)]
pub struct TestFleet {
    pub store: Arc<dyn FleetStore>,
    sqlite_store: Arc<SqliteStore>,
    _temp_dir: TempDir,
}

#[allow(dead_code)]
impl TestFleet {
    /// Create a new test fleet store backed by a temporary SQLite file.
    pub async fn new() -> FleetResult<Self> {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
        let db_path = temp_dir.path().join("fleet.db");
        let store = SqliteStore::new(&db_path).await?;
        let arc_store = Arc::new(store);

        Ok(Self {
            store: arc_store.clone(),
            sqlite_store: arc_store,
            _temp_dir: temp_dir,
        })
    }

    /// Get a reference to the fleet store.
    pub fn store(&self) -> Arc<dyn FleetStore> {
        self.store.clone()
    }

    /// Get a reference to the SQLite connection pool for raw queries.
    pub fn pool(&self) -> &Pool<Sqlite> {
        self.sqlite_store.pool()
    }
}
