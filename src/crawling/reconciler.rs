//! # Reconciler
//!
//! The only writer of catalog entries. Upserts for the same natural key are
//! serialized through a per-key async lock; the store's revision check
//! catches writers outside this process. A conflict is retried once against
//! a fresh read, then surfaced.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::domain::product::{CanonicalProduct, CatalogEntry, ChangeRecord, NaturalKey, UpsertOutcome};
use crate::infrastructure::catalog_repository::{CatalogStore, StoreError};

type SharedLock = Arc<tokio::sync::Mutex<()>>;

pub struct Reconciler {
    store: Arc<dyn CatalogStore>,
    locks: Mutex<HashMap<NaturalKey, SharedLock>>,
}

/// One caller's claim on a key's lock. Dropping it prunes the map entry
/// once no other caller holds or waits on the same key.
struct KeyLock<'a> {
    locks: &'a Mutex<HashMap<NaturalKey, SharedLock>>,
    key: NaturalKey,
    lock: SharedLock,
}

impl Drop for KeyLock<'_> {
    fn drop(&mut self) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // Clones are only made under the map mutex: ours plus the map's means no one else
        if locks.get(&self.key).is_some_and(|l| Arc::strong_count(l) == 2) {
            locks.remove(&self.key);
        }
    }
}

impl Reconciler {
    pub fn new(store: Arc<dyn CatalogStore>) -> Self {
        Self {
            store,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn CatalogStore> {
        &self.store
    }

    fn key_lock(&self, key: &NaturalKey) -> KeyLock<'_> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        KeyLock {
            locks: &self.locks,
            key: key.clone(),
            lock: Arc::clone(locks.entry(key.clone()).or_default()),
        }
    }

    /// Insert, update or touch the catalog entry for `product.key`
    pub async fn upsert(&self, product: CanonicalProduct) -> Result<UpsertOutcome, StoreError> {
        let key_lock = self.key_lock(&product.key);
        let _guard = key_lock.lock.lock().await;

        match self.try_upsert(&product).await {
            Err(e @ (StoreError::WriteConflict { .. } | StoreError::DuplicateKey { .. })) => {
                warn!("⚠️ {} while upserting {}, retrying against a fresh read", e, product.key);
                self.try_upsert(&product).await
            }
            other => other,
        }
    }

    async fn try_upsert(&self, product: &CanonicalProduct) -> Result<UpsertOutcome, StoreError> {
        let Some(existing) = self.store.find(&product.key).await? else {
            let entry = CatalogEntry {
                product: product.clone(),
                first_seen: product.last_seen,
                last_updated: product.last_seen,
                revision: 1,
                expired_at: None,
            };
            self.store.insert(&entry).await?;
            debug!("Created {}", product.key);
            return Ok(UpsertOutcome::Created { revision: 1 });
        };

        if existing.product.content_hash == product.content_hash {
            self.store.touch(&product.key, product.last_seen).await?;
            debug!("Unchanged {} (rev {})", product.key, existing.revision);
            return Ok(UpsertOutcome::Unchanged {
                revision: existing.revision,
            });
        }

        let changed_fields = product.changed_fields(&existing.product);
        let revision = existing.revision + 1;
        let change = ChangeRecord {
            key: product.key.clone(),
            revision,
            changed_fields: changed_fields.clone(),
            previous_hash: existing.product.content_hash.clone(),
            new_hash: product.content_hash.clone(),
            recorded_at: Utc::now(),
        };
        let entry = CatalogEntry {
            product: product.clone(),
            first_seen: existing.first_seen,
            last_updated: product.last_seen,
            revision,
            expired_at: None,
        };

        self.store.update(&entry, existing.revision, &change).await?;
        info!("Updated {} to rev {} ({})", product.key, revision, changed_fields.join(", "));
        Ok(UpsertOutcome::Updated {
            revision,
            changed_fields,
        })
    }

    /// Soft-expire entries of `source` not seen since `before`
    pub async fn expire_unseen(&self, source: &str, before: DateTime<Utc>) -> Result<u64, StoreError> {
        let expired = self.store.expire_unseen(source, before).await?;
        if expired > 0 {
            info!("Soft-expired {} entries of '{}' unseen since {}", expired, source, before);
        }
        Ok(expired)
    }

    #[cfg(test)]
    fn tracked_keys(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::product::Money;
    use crate::infrastructure::catalog_repository::SqliteCatalogStore;
    use crate::infrastructure::database_connection::DatabaseConnection;
    use rust_decimal::Decimal;
    use std::time::Duration;

    async fn reconciler() -> Reconciler {
        let db = DatabaseConnection::new("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        Reconciler::new(Arc::new(SqliteCatalogStore::new(db.pool().clone())))
    }

    fn product(cents: i64) -> CanonicalProduct {
        CanonicalProduct::new(
            NaturalKey::new("shop", "W-1"),
            "Widget",
            Money::new(Decimal::new(cents, 2), "USD"),
            "https://shop.example/widget",
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_create_update_unchanged() {
        let reconciler = reconciler().await;

        assert_eq!(reconciler.upsert(product(1200)).await.unwrap(), UpsertOutcome::Created { revision: 1 });
        assert_eq!(
            reconciler.upsert(product(1500)).await.unwrap(),
            UpsertOutcome::Updated {
                revision: 2,
                changed_fields: vec!["price".to_string()],
            }
        );
        assert_eq!(reconciler.upsert(product(1500)).await.unwrap(), UpsertOutcome::Unchanged { revision: 2 });

        let key = NaturalKey::new("shop", "W-1");
        let changes = reconciler.store().changes_for(&key).await.unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].revision, 2);
        assert_eq!(reconciler.tracked_keys(), 0);
    }

    #[tokio::test]
    async fn test_unchanged_upsert_refreshes_last_seen_only() {
        let reconciler = reconciler().await;
        let first = product(1200);
        reconciler.upsert(first.clone()).await.unwrap();

        let mut later = first.clone();
        later.last_seen = first.last_seen + chrono::Duration::hours(1);
        reconciler.upsert(later.clone()).await.unwrap();

        let stored = reconciler.store().find(&first.key).await.unwrap().unwrap();
        assert_eq!(stored.revision, 1);
        assert_eq!(stored.product.last_seen, later.last_seen);
        assert_eq!(stored.last_updated, first.last_seen);
    }

    #[tokio::test]
    async fn test_abandoned_upsert_does_not_leak_its_lock_entry() {
        let reconciler = reconciler().await;
        let key = NaturalKey::new("shop", "W-1");

        let held = reconciler.key_lock(&key);
        let guard = held.lock.lock().await;
        let abandoned = tokio::time::timeout(Duration::from_millis(20), reconciler.upsert(product(1200))).await;
        assert!(abandoned.is_err());
        assert_eq!(reconciler.tracked_keys(), 1);

        drop(guard);
        drop(held);
        assert_eq!(reconciler.tracked_keys(), 0);
        assert!(reconciler.store().find(&key).await.unwrap().is_none());
    }
}
