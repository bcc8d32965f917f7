//! Persistent control-plane store for a fleet of remote network appliances.
//!
//! This crate provides the control-plane data model:
//! - Per-site command queue with claim-based dispatch
//! - Content-identified artifact registry
//! - Release catalog with exact-set deduplication
//! - Per-appliance current/target release tracking
//! - Fleet-wide release status aggregation
//!
//! The service layer holds no authoritative in-memory state: the relational
//! store owns every entity, and each check-then-write operation executes as
//! one atomic unit against it, so stateless replicas coordinate purely
//! through the database.

pub mod error;
pub mod models;
pub mod postgres;
pub mod repos;
pub mod store;

pub use error::{FleetError, FleetResult};
pub use postgres::PostgresStore;
pub use store::{FleetStore, SqliteStore};

use roost_core::config::FleetDbConfig;
use std::sync::Arc;

/// Create a fleet store from configuration.
pub async fn from_config(config: &FleetDbConfig) -> FleetResult<Arc<dyn FleetStore>> {
    match config {
        FleetDbConfig::Sqlite { path } => {
            let store = SqliteStore::new(path).await?;
            Ok(Arc::new(store) as Arc<dyn FleetStore>)
        }
        FleetDbConfig::Postgres {
            url,
            host,
            port,
            username,
            password,
            database,
            ssl_mode,
            max_connections,
            statement_timeout_ms,
        } => {
            let store = if let Some(url) = url {
                // URL takes precedence for backward compatibility
                tracing::info!("Connecting to PostgreSQL using connection URL");
                PostgresStore::from_url(url, *max_connections, *statement_timeout_ms).await?
            } else if let (Some(host), Some(database)) = (host.as_ref(), database.as_ref()) {
                PostgresStore::from_params(
                    host,
                    port.unwrap_or(5432),
                    username.as_deref(),
                    password.as_deref(),
                    database,
                    *ssl_mode,
                    *max_connections,
                    *statement_timeout_ms,
                )
                .await?
            } else {
                return Err(FleetError::Config(
                    "postgres config requires either 'url' or 'host' + 'database'".to_string(),
                ));
            };
            Ok(Arc::new(store) as Arc<dyn FleetStore>)
        }
    }
}
