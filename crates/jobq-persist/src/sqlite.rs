//! SQLite connection setup

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Migration failed: {0}")]
    Migration(String),
}

/// SQLite configuration options
#[derive(Debug, Clone, PartialEq)]
pub struct SqliteConfig {
    /// Database URL (e.g., "sqlite:jobq.db?mode=rwc" or "sqlite::memory:")
    pub url: String,
    /// Maximum number of connections in the pool
    pub max_connections: u32,
    /// Enable WAL journal mode for better concurrency
    pub wal_mode: bool,
    /// Busy timeout in seconds
    pub busy_timeout_secs: u32,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:jobq.db?mode=rwc".to_string(),
            max_connections: 5,
            wal_mode: true,
            busy_timeout_secs: 30,
        }
    }
}

impl SqliteConfig {
    /// Config for an in-memory database (testing).
    ///
    /// Every connection to `:memory:` opens its own database, so the pool is
    /// held to a single connection.
    pub fn memory() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
            wal_mode: false,
            busy_timeout_secs: 5,
        }
    }

    /// Read `JOBQ_DATABASE_URL` and `JOBQ_DB_MAX_CONNECTIONS`, falling back
    /// to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            url: std::env::var("JOBQ_DATABASE_URL").unwrap_or(defaults.url),
            max_connections: std::env::var("JOBQ_DB_MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_connections),
            ..defaults
        }
    }

    pub async fn connect(&self) -> Result<SqlitePool, PersistError> {
        let mut options = SqliteConnectOptions::from_str(&self.url)
            .map_err(|e| PersistError::Connection(e.to_string()))?
            .create_if_missing(true);

        options = options.pragma("busy_timeout", (self.busy_timeout_secs * 1000).to_string());
        if self.wal_mode {
            options = options.pragma("journal_mode", "WAL");
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(self.max_connections.max(1))
            .connect_with(options)
            .await
            .map_err(|e| PersistError::Connection(e.to_string()))?;

        info!(url = %self.url, wal = self.wal_mode, "Connected to SQLite");
        Ok(pool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_config_uses_single_connection() {
        let config = SqliteConfig::memory();
        assert_eq!(config.max_connections, 1);
        assert!(!config.wal_mode);
    }

    #[tokio::test]
    async fn test_connect_memory() {
        let pool = SqliteConfig::memory().connect().await.unwrap();
        let one: (i64,) = sqlx::query_as("SELECT 1").fetch_one(&pool).await.unwrap();
        assert_eq!(one.0, 1);
    }

    #[tokio::test]
    async fn test_bad_url_is_connection_error() {
        let config = SqliteConfig {
            url: "postgres://nope".into(),
            ..SqliteConfig::memory()
        };
        assert!(matches!(
            config.connect().await,
            Err(PersistError::Connection(_))
        ));
    }
}
