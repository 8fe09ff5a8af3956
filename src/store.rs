//! Local durable store with per-record mutual exclusion.
//!
//! The SQL lives in `db::repo`; this layer adds the per-key lock every writer
//! takes before opening a transaction on a record. Take the lock first, then
//! the transaction: never the other way round.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use chrono::Utc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, instrument};

use crate::db::{self, queue, Pool, StorageUsage};
use crate::error::Result;
use crate::model::{
    InspectionRecord, LocalId, NonConformityPayload, OperationKind, PhotoBlob, RecordStatus,
    SyncQueueItem, UploadStatus,
};

/// Lazily created async mutexes keyed by local id. Entries are held weakly
/// and pruned once no guard refers to them.
#[derive(Debug, Default)]
pub struct KeyLocks {
    inner: Mutex<HashMap<LocalId, Weak<AsyncMutex<()>>>>,
}

impl KeyLocks {
    pub async fn lock(&self, key: LocalId) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            map.retain(|_, weak| weak.strong_count() > 0);
            match map.get(&key).and_then(Weak::upgrade) {
                Some(existing) => existing,
                None => {
                    let fresh = Arc::new(AsyncMutex::new(()));
                    map.insert(key, Arc::downgrade(&fresh));
                    fresh
                }
            }
        };
        mutex.lock_owned().await
    }

    /// Number of keys currently locked or awaited.
    pub fn active(&self) -> usize {
        let map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        map.values().filter(|weak| weak.strong_count() > 0).count()
    }
}

#[derive(Debug, Clone)]
pub struct LocalStore {
    pool: Pool,
    locks: Arc<KeyLocks>,
}

impl LocalStore {
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            locks: Arc::new(KeyLocks::default()),
        }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub async fn lock(&self, local_id: LocalId) -> OwnedMutexGuard<()> {
        self.locks.lock(local_id).await
    }

    /// Writes the business fields atomically and returns the record as
    /// stored. Sync fields of an existing row are left as they are.
    #[instrument(skip_all, fields(local_id = %record.local_id))]
    pub async fn put(&self, record: &InspectionRecord) -> Result<InspectionRecord> {
        let _guard = self.lock(record.local_id).await;
        let mut tx = self.pool.begin().await?;
        db::put_inspection_tx(&mut tx, record).await?;
        let stored = db::get_inspection_tx(&mut tx, record.local_id).await?;
        tx.commit().await?;
        Ok(stored)
    }

    pub async fn get(&self, local_id: LocalId) -> Result<InspectionRecord> {
        db::get_inspection(&self.pool, local_id).await
    }

    pub async fn get_all(&self) -> Result<Vec<InspectionRecord>> {
        db::list_inspections(&self.pool).await
    }

    /// Removes the record, its photos and whatever is still queued for it.
    #[instrument(skip_all, fields(%local_id))]
    pub async fn delete(&self, local_id: LocalId) -> Result<()> {
        let _guard = self.lock(local_id).await;
        let mut tx = self.pool.begin().await?;
        db::delete_inspection_tx(&mut tx, local_id).await?;
        let dropped = queue::drop_for_target_tx(&mut tx, local_id).await?;
        tx.commit().await?;
        debug!(dropped, "inspection deleted");
        Ok(())
    }

    #[instrument(skip_all, fields(%photo_id, %inspection_local_id))]
    pub async fn put_photo(
        &self,
        photo_id: LocalId,
        mime_type: &str,
        content: Vec<u8>,
        inspection_local_id: LocalId,
    ) -> Result<PhotoBlob> {
        let photo = PhotoBlob {
            photo_id,
            inspection_local_id,
            mime_type: mime_type.to_string(),
            content,
            upload_status: UploadStatus::Pending,
            created_at: Utc::now(),
        };
        let _guard = self.lock(inspection_local_id).await;
        let mut tx = self.pool.begin().await?;
        db::put_photo_tx(&mut tx, &photo).await?;
        tx.commit().await?;
        Ok(photo)
    }

    pub async fn get_photos_by_inspection(&self, local_id: LocalId) -> Result<Vec<PhotoBlob>> {
        db::photos_by_inspection(&self.pool, local_id).await
    }

    pub async fn storage_usage(&self) -> Result<StorageUsage> {
        db::storage_usage(&self.pool).await
    }

    /// Applies a successful remote call for `item` in one transaction: id
    /// map entry, the inspection's `remote_id` on create, uploaded photos,
    /// the ack and the sync stamps. The record turns `synced` once nothing
    /// is pending for it.
    #[instrument(skip_all, fields(item_id = %item.item_id, target = %item.target_local_id))]
    pub async fn mark_item_applied(&self, item: &SyncQueueItem, remote_id: Option<&str>) -> Result<()> {
        let target = item.target_local_id;
        let _guard = self.lock(target).await;
        let mut tx = self.pool.begin().await?;

        if let Some(remote_id) = remote_id.filter(|_| item.kind.creates_entity()) {
            db::record_remote_id_tx(&mut tx, item.entity_local_id, remote_id, item.kind.entity()).await?;
            if item.kind == OperationKind::CreateInspection {
                db::set_inspection_remote_id_tx(&mut tx, target, remote_id).await?;
            }
        }
        if item.kind == OperationKind::CreateNonConformity {
            let payload: NonConformityPayload = serde_json::from_value(item.payload.clone())?;
            db::mark_photos_uploaded_tx(&mut tx, &payload.photo_ids).await?;
        }
        if !queue::ack_tx(&mut tx, item.item_id).await? {
            debug!("item already gone at ack");
        }

        let now = Utc::now();
        let remaining = queue::count_pending_for_target_tx(&mut tx, target).await?;
        let status = (remaining == 0).then_some(RecordStatus::Synced);
        db::stamp_synced_tx(&mut tx, target, now, status).await?;
        db::set_last_sync_at_tx(&mut tx, now).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Marks the record `synced` after a parked child if the server knows
    /// the record and nothing else is pending for it.
    pub async fn settle_after_failure(&self, target: LocalId) -> Result<bool> {
        let _guard = self.lock(target).await;
        let mut tx = self.pool.begin().await?;
        let remaining = queue::count_pending_for_target_tx(&mut tx, target).await?;
        let settled = remaining == 0 && db::lookup_remote_id_tx(&mut tx, target).await?.is_some();
        if settled {
            db::set_status_tx(&mut tx, target, RecordStatus::Synced).await?;
        }
        tx.commit().await?;
        Ok(settled)
    }
}
