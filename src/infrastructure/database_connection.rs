// Database connection and pool management
// This module handles SQLite database connections using sqlx

use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};

pub struct DatabaseConnection {
    pool: SqlitePool,
}

impl DatabaseConnection {
    pub async fn new(database_url: &str) -> Result<Self> {
        Self::with_max_connections(database_url, 5).await
    }

    pub async fn with_max_connections(database_url: &str, max_connections: u32) -> Result<Self> {
        let db_path = database_url
            .trim_start_matches("sqlite://")
            .trim_start_matches("sqlite:");

        let in_memory = db_path.starts_with(":memory:") || db_path.contains("mode=memory");
        if !in_memory {
            if let Some(parent) = Path::new(db_path).parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("Failed to create database directory {}", parent.display()))?;
            }
        }

        let mut options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("Invalid database URL: {database_url}"))?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(std::time::Duration::from_secs(10));
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        // A private in-memory database only exists on its own connection.
        let max_connections = if in_memory { 1 } else { max_connections.max(1) };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .context("Failed to open SQLite pool")?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        let create_entries_sql = r"
            CREATE TABLE IF NOT EXISTS catalog_entries (
                source TEXT NOT NULL,
                sku TEXT NOT NULL,
                name TEXT NOT NULL,
                price_amount TEXT NOT NULL,
                price_currency TEXT NOT NULL,
                discount_amount TEXT,
                discount_currency TEXT,
                availability TEXT NOT NULL DEFAULT 'unknown',
                images TEXT NOT NULL DEFAULT '[]',
                url TEXT NOT NULL,
                vendor TEXT,
                review_count INTEGER,
                attributes TEXT NOT NULL DEFAULT '{}',
                content_hash TEXT NOT NULL,
                revision INTEGER NOT NULL DEFAULT 1,
                first_seen DATETIME NOT NULL,
                last_seen DATETIME NOT NULL,
                last_updated DATETIME NOT NULL,
                expired_at DATETIME,
                PRIMARY KEY (source, sku)
            )
        ";

        let create_changes_sql = r"
            CREATE TABLE IF NOT EXISTS catalog_changes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source TEXT NOT NULL,
                sku TEXT NOT NULL,
                revision INTEGER NOT NULL,
                changed_fields TEXT NOT NULL,
                previous_hash TEXT NOT NULL,
                new_hash TEXT NOT NULL,
                recorded_at DATETIME NOT NULL,
                FOREIGN KEY (source, sku) REFERENCES catalog_entries (source, sku)
            )
        ";

        let create_tasks_sql = r"
            CREATE TABLE IF NOT EXISTS crawl_tasks (
                url TEXT PRIMARY KEY,
                id TEXT NOT NULL,
                host TEXT NOT NULL,
                status TEXT NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                created_at DATETIME NOT NULL,
                finished_at DATETIME NOT NULL
            )
        ";

        let create_indexes_sql = [
            "CREATE INDEX IF NOT EXISTS idx_entries_last_seen ON catalog_entries (source, last_seen)",
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_changes_key_revision ON catalog_changes (source, sku, revision)",
            "CREATE INDEX IF NOT EXISTS idx_tasks_status ON crawl_tasks (status)",
        ];

        sqlx::query(create_entries_sql).execute(&self.pool).await?;
        sqlx::query(create_changes_sql).execute(&self.pool).await?;
        sqlx::query(create_tasks_sql).execute(&self.pool).await?;
        for sql in create_indexes_sql {
            sqlx::query(sql).execute(&self.pool).await?;
        }

        Ok(())
    }
}
