//! Catalog persistence
//!
//! `CatalogStore` is the storage seam used by the reconciler; nothing else
//! writes catalog rows. `TaskArchive` keeps the final state of crawl tasks.
//! `SqliteCatalogStore` implements both on top of a sqlx pool.

#![allow(clippy::uninlined_format_args)]

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tracing::debug;

use crate::domain::crawl_task::{CrawlTask, TaskStatus};
use crate::domain::product::{
    Availability, CanonicalProduct, CatalogEntry, ChangeRecord, Money, NaturalKey,
};

#[derive(Error, Debug)]
pub enum StoreError {
    /// Optimistic revision check failed: someone else wrote the row first
    #[error("Write conflict on {key}: {reason}")]
    WriteConflict { key: String, reason: String },

    /// Insert raced with another insert for the same natural key
    #[error("Catalog entry {key} already exists")]
    DuplicateKey { key: String },

    #[error("Corrupt catalog row {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn write_conflict(key: &NaturalKey, reason: &str) -> Self {
        Self::WriteConflict {
            key: key.to_string(),
            reason: reason.to_string(),
        }
    }

    fn corrupt(key: &str, reason: impl ToString) -> Self {
        Self::Corrupt {
            key: key.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Conflicts and transient database failures are worth another attempt
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::WriteConflict { .. } | Self::DuplicateKey { .. } => true,
            Self::Database(e) => matches!(
                e,
                sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::Database(_)
            ),
            Self::Corrupt { .. } | Self::Serialization(_) => false,
        }
    }
}

/// Archived final state of a crawl task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivedTask {
    pub id: String,
    pub url: String,
    pub host: String,
    pub status: TaskStatus,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub finished_at: DateTime<Utc>,
}

#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn find(&self, key: &NaturalKey) -> Result<Option<CatalogEntry>, StoreError>;

    /// Insert a new entry; fails with `DuplicateKey` if the key exists
    async fn insert(&self, entry: &CatalogEntry) -> Result<(), StoreError>;

    /// Overwrite an entry whose stored revision is `expected_revision` and
    /// record `change` atomically; fails with `WriteConflict` otherwise
    async fn update(
        &self,
        entry: &CatalogEntry,
        expected_revision: i64,
        change: &ChangeRecord,
    ) -> Result<(), StoreError>;

    /// Refresh last-seen (and clear soft expiry) without touching content
    async fn touch(&self, key: &NaturalKey, last_seen: DateTime<Utc>) -> Result<(), StoreError>;

    /// Soft-expire entries of `source` last seen before `before`
    async fn expire_unseen(&self, source: &str, before: DateTime<Utc>) -> Result<u64, StoreError>;

    async fn list(&self, source: Option<&str>, include_expired: bool) -> Result<Vec<CatalogEntry>, StoreError>;

    async fn changes_for(&self, key: &NaturalKey) -> Result<Vec<ChangeRecord>, StoreError>;
}

#[async_trait]
pub trait TaskArchive: Send + Sync {
    /// Store the final state of a task, replacing any earlier row for its URL
    async fn archive(&self, task: &CrawlTask) -> Result<(), StoreError>;

    async fn archived_status(&self, url: &str) -> Result<Option<TaskStatus>, StoreError>;

    async fn archived(&self, status: Option<TaskStatus>) -> Result<Vec<ArchivedTask>, StoreError>;
}

/// SQLite implementation of the catalog and task archive
#[derive(Clone)]
pub struct SqliteCatalogStore {
    pool: Arc<SqlitePool>,
}

impl SqliteCatalogStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool: Arc::new(pool) }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

const ENTRY_COLUMNS: &str = "source, sku, name, price_amount, price_currency, discount_amount, \
     discount_currency, availability, images, url, vendor, review_count, attributes, content_hash, \
     revision, first_seen, last_seen, last_updated, expired_at";

fn parse_decimal(key: &str, raw: &str) -> Result<Decimal, StoreError> {
    Decimal::from_str(raw).map_err(|e| StoreError::corrupt(key, format!("bad amount '{raw}': {e}")))
}

fn entry_from_row(row: &SqliteRow) -> Result<CatalogEntry, StoreError> {
    let source: String = row.try_get("source")?;
    let sku: String = row.try_get("sku")?;
    let key = NaturalKey::new(source, sku);
    let key_str = key.to_string();

    let price_amount: String = row.try_get("price_amount")?;
    let price = Money::new(parse_decimal(&key_str, &price_amount)?, row.try_get::<String, _>("price_currency")?);

    let discount_amount: Option<String> = row.try_get("discount_amount")?;
    let discount_currency: Option<String> = row.try_get("discount_currency")?;
    let discount_price = match (discount_amount, discount_currency) {
        (Some(amount), Some(currency)) => Some(Money::new(parse_decimal(&key_str, &amount)?, currency)),
        _ => None,
    };

    let availability: String = row.try_get("availability")?;
    let availability = Availability::from_str(&availability).map_err(|e| StoreError::corrupt(&key_str, e))?;

    let images: Vec<String> = serde_json::from_str(&row.try_get::<String, _>("images")?)?;
    let attributes: BTreeMap<String, Option<String>> =
        serde_json::from_str(&row.try_get::<String, _>("attributes")?)?;
    let review_count: Option<i64> = row.try_get("review_count")?;

    let product = CanonicalProduct {
        key,
        name: row.try_get("name")?,
        price,
        discount_price,
        availability,
        images,
        url: row.try_get("url")?,
        vendor: row.try_get("vendor")?,
        review_count: review_count.and_then(|c| u32::try_from(c).ok()),
        attributes,
        last_seen: row.try_get("last_seen")?,
        content_hash: row.try_get("content_hash")?,
    };

    Ok(CatalogEntry {
        product,
        first_seen: row.try_get("first_seen")?,
        last_updated: row.try_get("last_updated")?,
        revision: row.try_get("revision")?,
        expired_at: row.try_get("expired_at")?,
    })
}

fn change_from_row(row: &SqliteRow) -> Result<ChangeRecord, StoreError> {
    let changed_fields: Vec<String> = serde_json::from_str(&row.try_get::<String, _>("changed_fields")?)?;
    Ok(ChangeRecord {
        key: NaturalKey::new(row.try_get::<String, _>("source")?, row.try_get::<String, _>("sku")?),
        revision: row.try_get("revision")?,
        changed_fields,
        previous_hash: row.try_get("previous_hash")?,
        new_hash: row.try_get("new_hash")?,
        recorded_at: row.try_get("recorded_at")?,
    })
}

fn map_insert_error(key: &NaturalKey, error: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &error {
        if db.is_unique_violation() {
            return StoreError::DuplicateKey { key: key.to_string() };
        }
    }
    StoreError::Database(error)
}

#[async_trait]
impl CatalogStore for SqliteCatalogStore {
    async fn find(&self, key: &NaturalKey) -> Result<Option<CatalogEntry>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM catalog_entries WHERE source = ? AND sku = ?"
        ))
        .bind(&key.source)
        .bind(&key.sku)
        .fetch_optional(&*self.pool)
        .await?;

        row.as_ref().map(entry_from_row).transpose()
    }

    async fn insert(&self, entry: &CatalogEntry) -> Result<(), StoreError> {
        let p = &entry.product;
        sqlx::query(&format!(
            "INSERT INTO catalog_entries ({ENTRY_COLUMNS}) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(&p.key.source)
        .bind(&p.key.sku)
        .bind(&p.name)
        .bind(p.price.amount.to_string())
        .bind(&p.price.currency)
        .bind(p.discount_price.as_ref().map(|m| m.amount.to_string()))
        .bind(p.discount_price.as_ref().map(|m| m.currency.clone()))
        .bind(p.availability.as_str())
        .bind(serde_json::to_string(&p.images)?)
        .bind(&p.url)
        .bind(&p.vendor)
        .bind(p.review_count.map(i64::from))
        .bind(serde_json::to_string(&p.attributes)?)
        .bind(&p.content_hash)
        .bind(entry.revision)
        .bind(entry.first_seen)
        .bind(p.last_seen)
        .bind(entry.last_updated)
        .bind(entry.expired_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_insert_error(&p.key, e))?;

        debug!("Inserted catalog entry {} (rev {})", p.key, entry.revision);
        Ok(())
    }

    async fn update(
        &self,
        entry: &CatalogEntry,
        expected_revision: i64,
        change: &ChangeRecord,
    ) -> Result<(), StoreError> {
        let p = &entry.product;
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r"
            UPDATE catalog_entries SET
                name = ?, price_amount = ?, price_currency = ?, discount_amount = ?,
                discount_currency = ?, availability = ?, images = ?, url = ?, vendor = ?,
                review_count = ?, attributes = ?, content_hash = ?, revision = ?,
                last_seen = ?, last_updated = ?, expired_at = NULL
            WHERE source = ? AND sku = ? AND revision = ?
            ",
        )
        .bind(&p.name)
        .bind(p.price.amount.to_string())
        .bind(&p.price.currency)
        .bind(p.discount_price.as_ref().map(|m| m.amount.to_string()))
        .bind(p.discount_price.as_ref().map(|m| m.currency.clone()))
        .bind(p.availability.as_str())
        .bind(serde_json::to_string(&p.images)?)
        .bind(&p.url)
        .bind(&p.vendor)
        .bind(p.review_count.map(i64::from))
        .bind(serde_json::to_string(&p.attributes)?)
        .bind(&p.content_hash)
        .bind(entry.revision)
        .bind(p.last_seen)
        .bind(entry.last_updated)
        .bind(&p.key.source)
        .bind(&p.key.sku)
        .bind(expected_revision)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() != 1 {
            tx.rollback().await?;
            return Err(StoreError::write_conflict(
                &p.key,
                &format!("expected revision {expected_revision}"),
            ));
        }

        sqlx::query(
            r"
            INSERT INTO catalog_changes
                (source, sku, revision, changed_fields, previous_hash, new_hash, recorded_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(&change.key.source)
        .bind(&change.key.sku)
        .bind(change.revision)
        .bind(serde_json::to_string(&change.changed_fields)?)
        .bind(&change.previous_hash)
        .bind(&change.new_hash)
        .bind(change.recorded_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!("Updated catalog entry {} to rev {}", p.key, entry.revision);
        Ok(())
    }

    async fn touch(&self, key: &NaturalKey, last_seen: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE catalog_entries SET last_seen = ?, expired_at = NULL WHERE source = ? AND sku = ?",
        )
        .bind(last_seen)
        .bind(&key.source)
        .bind(&key.sku)
        .execute(&*self.pool)
        .await?;
        Ok(())
    }

    async fn expire_unseen(&self, source: &str, before: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r"
            UPDATE catalog_entries SET expired_at = ?
            WHERE source = ? AND expired_at IS NULL AND julianday(last_seen) < julianday(?)
            ",
        )
        .bind(Utc::now())
        .bind(source)
        .bind(before)
        .execute(&*self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn list(&self, source: Option<&str>, include_expired: bool) -> Result<Vec<CatalogEntry>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM catalog_entries \
             WHERE (?1 IS NULL OR source = ?1) AND (?2 OR expired_at IS NULL) \
             ORDER BY source, sku"
        ))
        .bind(source)
        .bind(include_expired)
        .fetch_all(&*self.pool)
        .await?;

        rows.iter().map(entry_from_row).collect()
    }

    async fn changes_for(&self, key: &NaturalKey) -> Result<Vec<ChangeRecord>, StoreError> {
        let rows = sqlx::query(
            r"
            SELECT source, sku, revision, changed_fields, previous_hash, new_hash, recorded_at
            FROM catalog_changes WHERE source = ? AND sku = ? ORDER BY revision
            ",
        )
        .bind(&key.source)
        .bind(&key.sku)
        .fetch_all(&*self.pool)
        .await?;

        rows.iter().map(change_from_row).collect()
    }
}

#[async_trait]
impl TaskArchive for SqliteCatalogStore {
    async fn archive(&self, task: &CrawlTask) -> Result<(), StoreError> {
        sqlx::query(
            r"
            INSERT OR REPLACE INTO crawl_tasks
                (url, id, host, status, retry_count, last_error, created_at, finished_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(task.url.as_str())
        .bind(task.id.to_string())
        .bind(&task.host)
        .bind(task.status.as_str())
        .bind(i64::from(task.retry_count))
        .bind(&task.last_error)
        .bind(task.created_at)
        .bind(Utc::now())
        .execute(&*self.pool)
        .await?;
        Ok(())
    }

    async fn archived_status(&self, url: &str) -> Result<Option<TaskStatus>, StoreError> {
        let status: Option<String> = sqlx::query_scalar("SELECT status FROM crawl_tasks WHERE url = ?")
            .bind(url)
            .fetch_optional(&*self.pool)
            .await?;
        status
            .map(|s| TaskStatus::from_str(&s).map_err(|e| StoreError::corrupt(url, e)))
            .transpose()
    }

    async fn archived(&self, status: Option<TaskStatus>) -> Result<Vec<ArchivedTask>, StoreError> {
        let rows = sqlx::query(
            r"
            SELECT id, url, host, status, retry_count, last_error, finished_at
            FROM crawl_tasks WHERE (?1 IS NULL OR status = ?1) ORDER BY finished_at
            ",
        )
        .bind(status.map(TaskStatus::as_str))
        .fetch_all(&*self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let url: String = row.try_get("url")?;
                let status: String = row.try_get("status")?;
                let retry_count: i64 = row.try_get("retry_count")?;
                Ok(ArchivedTask {
                    id: row.try_get("id")?,
                    status: TaskStatus::from_str(&status).map_err(|e| StoreError::corrupt(&url, e))?,
                    host: row.try_get("host")?,
                    retry_count: u32::try_from(retry_count).unwrap_or(u32::MAX),
                    last_error: row.try_get("last_error")?,
                    finished_at: row.try_get("finished_at")?,
                    url,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::database_connection::DatabaseConnection;
    use url::Url;

    async fn store() -> SqliteCatalogStore {
        let db = DatabaseConnection::new("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        SqliteCatalogStore::new(db.pool().clone())
    }

    fn entry(sku: &str, amount: i64) -> CatalogEntry {
        let now = Utc::now();
        let mut product = CanonicalProduct::new(
            NaturalKey::new("shop", sku),
            "Widget",
            Money::new(Decimal::new(amount, 2), "USD"),
            "https://shop.example/widget",
            now,
        );
        product.attributes.insert("Колір".into(), Some("Black".into()));
        product.images.push("https://shop.example/w.jpg".into());
        CatalogEntry {
            product: product.sealed(),
            first_seen: now,
            last_updated: now,
            revision: 1,
            expired_at: None,
        }
    }

    #[tokio::test]
    async fn test_insert_and_find_round_trip() {
        let store = store().await;
        let e = entry("W-1", 1200);
        store.insert(&e).await.unwrap();

        let found = store.find(e.key()).await.unwrap().unwrap();
        assert_eq!(found.product.price.amount, Decimal::new(1200, 2));
        assert_eq!(found.product.attributes, e.product.attributes);
        assert_eq!(found.product.content_hash, e.product.content_hash);
        assert_eq!(found.revision, 1);
    }

    #[tokio::test]
    async fn test_duplicate_insert_is_reported() {
        let store = store().await;
        let e = entry("W-1", 1200);
        store.insert(&e).await.unwrap();
        let err = store.insert(&e).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateKey { .. }));
        assert_eq!(store.list(None, true).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_update_checks_expected_revision() {
        let store = store().await;
        let mut e = entry("W-1", 1200);
        store.insert(&e).await.unwrap();

        let previous_hash = e.product.content_hash.clone();
        e.product.price.amount = Decimal::new(1500, 2);
        e.product = e.product.sealed();
        e.revision = 2;
        let change = ChangeRecord {
            key: e.key().clone(),
            revision: 2,
            changed_fields: vec!["price".into()],
            previous_hash,
            new_hash: e.product.content_hash.clone(),
            recorded_at: Utc::now(),
        };

        let stale = store.update(&e, 5, &change).await.unwrap_err();
        assert!(matches!(stale, StoreError::WriteConflict { .. }));

        store.update(&e, 1, &change).await.unwrap();
        let changes = store.changes_for(e.key()).await.unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].changed_fields, vec!["price".to_string()]);
    }

    #[tokio::test]
    async fn test_expire_and_touch() {
        let store = store().await;
        let e = entry("W-1", 1200);
        store.insert(&e).await.unwrap();

        let later = Utc::now() + chrono::Duration::seconds(10);
        assert_eq!(store.expire_unseen("shop", later).await.unwrap(), 1);
        assert!(store.list(Some("shop"), false).await.unwrap().is_empty());
        assert_eq!(store.list(Some("shop"), true).await.unwrap().len(), 1);

        store.touch(e.key(), later).await.unwrap();
        assert_eq!(store.list(Some("shop"), false).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_task_archive_replaces_by_url() {
        let store = store().await;
        let mut task = CrawlTask::new(Url::parse("https://shop.example/p/1").unwrap());
        task.start().unwrap();
        task.fail("timeout").unwrap();
        task.schedule_retry(0).unwrap();
        store.archive(&task).await.unwrap();
        assert_eq!(
            store.archived_status(task.url.as_str()).await.unwrap(),
            Some(TaskStatus::Quarantined)
        );

        task.requeue().unwrap();
        task.start().unwrap();
        task.succeed().unwrap();
        store.archive(&task).await.unwrap();

        let all = store.archived(None).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].status, TaskStatus::Succeeded);
        assert!(store.archived(Some(TaskStatus::Quarantined)).await.unwrap().is_empty());
    }
}
