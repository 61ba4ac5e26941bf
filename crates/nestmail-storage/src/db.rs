//! Database connection and pool management

use nestmail_common::config::DatabaseConfig;
use nestmail_common::{Error, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Executor;
use std::path::Path;
use tracing::info;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS mails (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    owner_id INTEGER NOT NULL,
    mail_from TEXT NOT NULL,
    mail_to TEXT NOT NULL,
    subject TEXT NOT NULL DEFAULT '',
    body TEXT NOT NULL DEFAULT '',
    raw_data TEXT NOT NULL DEFAULT '',
    received_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
);
CREATE INDEX IF NOT EXISTS idx_mails_owner ON mails(owner_id, received_at DESC);
CREATE INDEX IF NOT EXISTS idx_mails_from ON mails(mail_from);

CREATE TABLE IF NOT EXISTS mail_domains (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    owner_id INTEGER NOT NULL,
    subdomain TEXT NOT NULL,
    full_domain TEXT NOT NULL UNIQUE,
    record_id TEXT NOT NULL,
    address TEXT NOT NULL UNIQUE,
    origin TEXT NOT NULL DEFAULT '',
    created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
);
CREATE INDEX IF NOT EXISTS idx_domains_owner ON mail_domains(owner_id);
CREATE INDEX IF NOT EXISTS idx_domains_address ON mail_domains(address);
"#;

/// Database pool wrapper
#[derive(Clone)]
pub struct DatabasePool {
    pool: SqlitePool,
}

impl DatabasePool {
    /// Open the database from configuration and create the schema
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        Self::open(&config.path, config.max_connections).await
    }

    /// Open a database at a specific path
    pub async fn open(path: &Path, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(|e| Error::Database(format!("Failed to open database: {}", e)))?;

        let db = Self { pool };
        db.init().await?;

        info!(path = %path.display(), "Database opened");
        Ok(db)
    }

    /// Create tables and indexes if they do not exist
    async fn init(&self) -> Result<()> {
        self.pool
            .execute(SCHEMA)
            .await
            .map_err(|e| Error::Database(format!("Failed to create schema: {}", e)))?;
        Ok(())
    }

    /// Get the underlying pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Check database health
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("Health check failed: {}", e)))?;
        Ok(())
    }
}
