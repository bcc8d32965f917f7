//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// PostgreSQL SSL mode configuration.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PgSslMode {
    /// Disable SSL/TLS entirely.
    Disable,
    /// Prefer SSL/TLS but allow unencrypted connections (default).
    #[default]
    Prefer,
    /// Require SSL/TLS for all connections.
    Require,
}

/// Fleet store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FleetDbConfig {
    /// SQLite database (recommended for testing and single-node deployments).
    Sqlite {
        /// Database file path.
        path: PathBuf,
    },
    /// PostgreSQL database.
    Postgres {
        /// Connection URL (optional if using individual fields).
        /// Takes precedence over individual fields if both are provided.
        url: Option<String>,
        /// Database host (e.g., "localhost" or "db.example.com").
        host: Option<String>,
        /// Database port (default: 5432).
        #[serde(default = "default_pg_port")]
        port: Option<u16>,
        /// Database username.
        username: Option<String>,
        /// Database password. Prefer environment injection over config files.
        password: Option<String>,
        /// Database name.
        database: Option<String>,
        /// SSL mode.
        ssl_mode: Option<PgSslMode>,
        /// Maximum pool connections (default: 10).
        #[serde(default = "default_max_connections")]
        max_connections: u32,
        /// Server-side statement timeout in milliseconds.
        statement_timeout_ms: Option<u64>,
    },
}

fn default_pg_port() -> Option<u16> {
    Some(5432)
}

fn default_max_connections() -> u32 {
    10
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlite_config_parses() {
        let config: FleetDbConfig =
            serde_json::from_str(r#"{"type": "sqlite", "path": "/var/lib/roost/fleet.db"}"#)
                .unwrap();
        match config {
            FleetDbConfig::Sqlite { path } => {
                assert_eq!(path, PathBuf::from("/var/lib/roost/fleet.db"));
            }
            other => panic!("expected sqlite config, got {other:?}"),
        }
    }

    #[test]
    fn test_postgres_config_defaults() {
        let config: FleetDbConfig = serde_json::from_str(
            r#"{"type": "postgres", "host": "db.internal", "database": "fleet"}"#,
        )
        .unwrap();
        match config {
            FleetDbConfig::Postgres {
                port,
                max_connections,
                url,
                ..
            } => {
                assert_eq!(port, Some(5432));
                assert_eq!(max_connections, 10);
                assert!(url.is_none());
            }
            other => panic!("expected postgres config, got {other:?}"),
        }
    }
}
