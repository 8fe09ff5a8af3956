//! Facade for the authoring UI and the presentation layer.
//!
//! Every mutation writes the record and its queue entries in one transaction
//! under the record's lock, so there is never a record change without the
//! matching queue item or the other way round.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::connectivity::ConnectionMonitor;
use crate::db::{self, queue, StorageUsage, Tx};
use crate::engine::{DrainReport, SyncEngine, SyncSettings, Trigger};
use crate::error::{Result, SyncError};
use crate::listeners::SubscriptionId;
use crate::model::{
    InspectionRecord, LocalId, NewOperation, NonConformityEntry, PhotoBlob, PhotoRef, RecordStatus,
    SyncQueueItem, TileConfiguration, UploadStatus,
};
use crate::remote::InspectionApi;
use crate::status::{StatusReporter, SyncStatus};
use crate::store::LocalStore;

#[derive(Debug, Clone, PartialEq)]
pub struct TileInput {
    pub thickness_class: String,
    pub length: f64,
    pub width: f64,
    pub quantity: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhotoInput {
    pub mime_type: String,
    pub content: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NonConformityInput {
    pub title: String,
    pub notes: String,
    pub selected: bool,
    pub photos: Vec<PhotoInput>,
}

#[derive(Debug, Clone)]
pub struct InspectionService {
    engine: Arc<SyncEngine>,
}

impl InspectionService {
    pub fn new(engine: Arc<SyncEngine>) -> Self {
        Self { engine }
    }

    /// Wires monitor, reporter and engine around an existing store.
    pub fn with_api(
        store: LocalStore,
        api: Arc<dyn InspectionApi>,
        settings: SyncSettings,
        initially_online: bool,
    ) -> Self {
        let monitor = Arc::new(ConnectionMonitor::new(initially_online));
        let reporter = Arc::new(StatusReporter::new(initially_online));
        Self::new(Arc::new(SyncEngine::new(store, api, monitor, reporter, settings)))
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    pub fn monitor(&self) -> &Arc<ConnectionMonitor> {
        self.engine.monitor()
    }

    fn store(&self) -> &LocalStore {
        self.engine.store()
    }

    /// Stores the record as ready for sync and enqueues what the server does
    /// not know yet: the inspection create (or an update once a create
    /// exists), then every new tile and submittable non-conformity.
    #[instrument(skip_all, fields(local_id = %record.local_id))]
    pub async fn save_draft(&self, mut record: InspectionRecord) -> Result<InspectionRecord> {
        record.validate_ready()?;
        let local_id = record.local_id;
        let store = self.store();
        {
            let _guard = store.lock(local_id).await;
            let mut tx = store.pool().begin().await?;

            match db::get_inspection_tx(&mut tx, local_id).await {
                Ok(existing) => {
                    record.remote_id = existing.remote_id;
                    record.synced_at = existing.synced_at;
                    record.created_at = existing.created_at;
                }
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err),
            }
            record.status = RecordStatus::PendingSync;
            record.updated_at = db::put_inspection_tx(&mut tx, &record).await?;
            db::set_status_tx(&mut tx, local_id, record.status).await?;

            let op = if is_known_tx(&mut tx, local_id).await? {
                NewOperation::update_inspection(&record)?
            } else {
                NewOperation::create_inspection(&record)?
            };
            queue::enqueue_tx(&mut tx, &op).await?;

            for tile in &record.tiles {
                if !is_known_tx(&mut tx, tile.local_id).await? {
                    queue::enqueue_tx(&mut tx, &NewOperation::create_tile(local_id, tile)?).await?;
                }
            }
            for entry in record.non_conformities.iter().filter(|nc| nc.is_submittable()) {
                if !is_known_tx(&mut tx, entry.local_id).await? {
                    queue::enqueue_tx(&mut tx, &NewOperation::create_non_conformity(local_id, entry)?)
                        .await?;
                }
            }
            tx.commit().await?;
        }
        info!(status = record.status.as_str(), "inspection saved");
        self.after_mutation().await;
        Ok(record)
    }

    /// Appends a tile. A record still in draft only stores it; the tile is
    /// enqueued when the draft is saved.
    #[instrument(skip_all, fields(%local_id))]
    pub async fn add_tile(&self, local_id: LocalId, input: TileInput) -> Result<TileConfiguration> {
        let tile = TileConfiguration::new(input.thickness_class, input.length, input.width, input.quantity)?;
        let store = self.store();
        {
            let _guard = store.lock(local_id).await;
            let mut tx = store.pool().begin().await?;
            let mut record = db::get_inspection_tx(&mut tx, local_id).await?;
            record.tiles.push(tile.clone());
            let submit = record.status != RecordStatus::Draft;
            if submit {
                record.status = RecordStatus::PendingSync;
            }
            db::put_inspection_tx(&mut tx, &record).await?;
            if submit {
                db::set_status_tx(&mut tx, local_id, record.status).await?;
                queue::enqueue_tx(&mut tx, &NewOperation::create_tile(local_id, &tile)?).await?;
            }
            tx.commit().await?;
        }
        self.after_mutation().await;
        Ok(tile)
    }

    /// Appends a non-conformity with its photos. A selected entry must come
    /// with at least one photo; unselected entries are kept but never sent.
    #[instrument(skip_all, fields(%local_id))]
    pub async fn add_non_conformity(
        &self,
        local_id: LocalId,
        input: NonConformityInput,
    ) -> Result<NonConformityEntry> {
        if input.selected && input.photos.is_empty() {
            return Err(SyncError::PermanentValidation(format!(
                "selected non-conformity '{}' needs at least one photo",
                input.title
            )));
        }

        let mut entry = NonConformityEntry::new(input.title, input.notes, input.selected);
        let store = self.store();
        {
            let _guard = store.lock(local_id).await;
            let mut tx = store.pool().begin().await?;
            let mut record = db::get_inspection_tx(&mut tx, local_id).await?;

            for photo in input.photos {
                let blob = PhotoBlob {
                    photo_id: LocalId::new(),
                    inspection_local_id: local_id,
                    mime_type: photo.mime_type,
                    content: photo.content,
                    upload_status: UploadStatus::Pending,
                    created_at: Utc::now(),
                };
                db::put_photo_tx(&mut tx, &blob).await?;
                entry.photos.push(PhotoRef {
                    photo_id: blob.photo_id,
                    mime_type: blob.mime_type,
                });
            }

            record.non_conformities.push(entry.clone());
            let submit = record.status != RecordStatus::Draft && entry.is_submittable();
            if submit {
                record.status = RecordStatus::PendingSync;
            }
            db::put_inspection_tx(&mut tx, &record).await?;
            if submit {
                db::set_status_tx(&mut tx, local_id, record.status).await?;
                queue::enqueue_tx(&mut tx, &NewOperation::create_non_conformity(local_id, &entry)?)
                    .await?;
            }
            tx.commit().await?;
        }
        self.after_mutation().await;
        Ok(entry)
    }

    pub async fn delete_inspection(&self, local_id: LocalId) -> Result<()> {
        self.store().delete(local_id).await?;
        self.after_mutation().await;
        Ok(())
    }

    pub async fn get_inspection(&self, local_id: LocalId) -> Result<InspectionRecord> {
        self.store().get(local_id).await
    }

    pub async fn list_inspections(&self) -> Result<Vec<InspectionRecord>> {
        self.store().get_all().await
    }

    pub async fn get_photos(&self, local_id: LocalId) -> Result<Vec<PhotoBlob>> {
        self.store().get_photos_by_inspection(local_id).await
    }

    /// Fresh snapshot: queue depth and last sync time are re-read first.
    pub async fn get_sync_status(&self) -> Result<SyncStatus> {
        self.engine.refresh_status().await
    }

    pub async fn force_sync(&self) -> Result<DrainReport> {
        self.engine.drain(Trigger::Manual).await
    }

    pub async fn get_storage_usage(&self) -> Result<StorageUsage> {
        self.store().storage_usage().await
    }

    pub async fn failed_items(&self) -> Result<Vec<SyncQueueItem>> {
        queue::list_failed(self.store().pool()).await
    }

    pub async fn dismiss_failure(&self, item_id: Uuid) -> Result<()> {
        queue::dismiss(self.store().pool(), item_id).await?;
        self.after_mutation().await;
        Ok(())
    }

    /// Puts a failed item and the failed items after it in its chain back in
    /// line. Returns how many were revived.
    pub async fn retry_failure(&self, item_id: Uuid) -> Result<u64> {
        let revived = queue::retry_failed(self.store().pool(), item_id).await?;
        self.after_mutation().await;
        Ok(revived)
    }

    pub fn subscribe_status<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&SyncStatus) + Send + Sync + 'static,
    {
        self.engine.reporter().subscribe(callback)
    }

    pub fn unsubscribe_status(&self, id: SubscriptionId) -> bool {
        self.engine.reporter().unsubscribe(id)
    }

    async fn after_mutation(&self) {
        if let Err(err) = self.engine.refresh_status().await {
            warn!(?err, "status refresh failed");
        }
    }
}

/// Whether the server already knows the entity or a create for it is queued.
async fn is_known_tx(tx: &mut Tx<'_>, entity: LocalId) -> Result<bool> {
    if db::lookup_remote_id_tx(tx, entity).await?.is_some() {
        return Ok(true);
    }
    queue::has_queued_create_tx(tx, entity).await
}
