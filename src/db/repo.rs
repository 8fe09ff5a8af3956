use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, Transaction};
use tracing::instrument;

use super::model::{decode_body, encode_body, StorageUsage};
use super::Pool;
use crate::error::{Result, SyncError};
use crate::model::{InspectionRecord, LocalId, PhotoBlob, RecordStatus, UploadStatus};

pub type Tx<'a> = Transaction<'a, Sqlite>;

pub(crate) fn parse_local_id(raw: &str) -> Result<LocalId> {
    raw.parse()
        .map_err(|_| SyncError::CorruptRecord(format!("invalid local id {raw:?}")))
}

fn row_to_record(row: &SqliteRow) -> Result<InspectionRecord> {
    let local_id = parse_local_id(&row.try_get::<String, _>("local_id")?)?;
    let status_str: String = row.try_get("status")?;
    let status = RecordStatus::parse_state(&status_str).ok_or_else(|| {
        SyncError::CorruptRecord(format!("inspection {local_id} has unknown status {status_str}"))
    })?;
    let version: i64 = row.try_get("schema_version")?;
    let raw: String = row.try_get("body")?;
    let body = decode_body(version, &raw)?;

    Ok(InspectionRecord {
        local_id,
        remote_id: row.try_get("remote_id")?,
        protocol_code: body.protocol_code,
        client: body.client,
        site: body.site,
        tiles: body.tiles,
        non_conformities: body.non_conformities,
        status,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        synced_at: row.try_get("synced_at")?,
    })
}

fn row_to_photo(row: &SqliteRow) -> Result<PhotoBlob> {
    let photo_id = parse_local_id(&row.try_get::<String, _>("photo_id")?)?;
    let status_str: String = row.try_get("upload_status")?;
    let upload_status = UploadStatus::parse_state(&status_str).ok_or_else(|| {
        SyncError::CorruptRecord(format!("photo {photo_id} has unknown upload status {status_str}"))
    })?;
    Ok(PhotoBlob {
        photo_id,
        inspection_local_id: parse_local_id(&row.try_get::<String, _>("inspection_local_id")?)?,
        mime_type: row.try_get("mime_type")?,
        content: row.try_get("content")?,
        upload_status,
        created_at: row.try_get("created_at")?,
    })
}

/// Inserts or replaces the business fields of a record and returns the new
/// last-modified timestamp. An existing row keeps its `status`, `remote_id`
/// and `synced_at`; those move only through `set_status_tx` and the sync
/// stamping functions.
#[instrument(skip_all, fields(local_id = %record.local_id))]
pub async fn put_inspection_tx(tx: &mut Tx<'_>, record: &InspectionRecord) -> Result<DateTime<Utc>> {
    let (version, body) = encode_body(record)?;
    let now = Utc::now();
    sqlx::query(
        "INSERT INTO inspections (local_id, remote_id, status, schema_version, body, created_at, updated_at, synced_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(local_id) DO UPDATE SET \
             schema_version = excluded.schema_version, \
             body = excluded.body, \
             updated_at = excluded.updated_at",
    )
    .bind(record.local_id.to_string())
    .bind(record.remote_id.as_deref())
    .bind(record.status.as_str())
    .bind(version)
    .bind(body)
    .bind(record.created_at)
    .bind(now)
    .bind(record.synced_at)
    .execute(&mut **tx)
    .await?;
    Ok(now)
}

async fn fetch_inspection<'e, E>(executor: E, local_id: LocalId) -> Result<InspectionRecord>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query(
        "SELECT local_id, remote_id, status, schema_version, body, created_at, updated_at, synced_at \
         FROM inspections WHERE local_id = ?",
    )
    .bind(local_id.to_string())
    .fetch_optional(executor)
    .await?;

    let Some(row) = row else {
        return Err(SyncError::not_found("inspection", local_id));
    };
    row_to_record(&row)
}

#[instrument(skip_all)]
pub async fn get_inspection(pool: &Pool, local_id: LocalId) -> Result<InspectionRecord> {
    fetch_inspection(pool, local_id).await
}

pub async fn get_inspection_tx(tx: &mut Tx<'_>, local_id: LocalId) -> Result<InspectionRecord> {
    fetch_inspection(&mut **tx, local_id).await
}

#[instrument(skip_all)]
pub async fn list_inspections(pool: &Pool) -> Result<Vec<InspectionRecord>> {
    let rows = sqlx::query(
        "SELECT local_id, remote_id, status, schema_version, body, created_at, updated_at, synced_at \
         FROM inspections ORDER BY created_at ASC, local_id ASC",
    )
    .fetch_all(pool)
    .await?;
    rows.iter().map(row_to_record).collect()
}

/// Deletes the record; its photos go with it through the foreign key.
#[instrument(skip_all, fields(%local_id))]
pub async fn delete_inspection_tx(tx: &mut Tx<'_>, local_id: LocalId) -> Result<()> {
    let done = sqlx::query("DELETE FROM inspections WHERE local_id = ?")
        .bind(local_id.to_string())
        .execute(&mut **tx)
        .await?;
    if done.rows_affected() == 0 {
        return Err(SyncError::not_found("inspection", local_id));
    }
    Ok(())
}

async fn inspection_exists(tx: &mut Tx<'_>, local_id: LocalId) -> Result<bool> {
    let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM inspections WHERE local_id = ?")
        .bind(local_id.to_string())
        .fetch_optional(&mut **tx)
        .await?;
    Ok(found.is_some())
}

/// Stores a photo for its owning inspection. Re-putting the same photo id
/// replaces its content; a photo id owned by another inspection is refused.
#[instrument(skip_all, fields(photo_id = %photo.photo_id))]
pub async fn put_photo_tx(tx: &mut Tx<'_>, photo: &PhotoBlob) -> Result<()> {
    if !inspection_exists(tx, photo.inspection_local_id).await? {
        return Err(SyncError::not_found("inspection", photo.inspection_local_id));
    }
    let done = sqlx::query(
        "INSERT INTO photos (photo_id, inspection_local_id, mime_type, content, upload_status, created_at) \
         VALUES (?, ?, ?, ?, ?, ?) \
         ON CONFLICT(photo_id) DO UPDATE SET \
             mime_type = excluded.mime_type, \
             content = excluded.content, \
             upload_status = excluded.upload_status \
         WHERE photos.inspection_local_id = excluded.inspection_local_id",
    )
    .bind(photo.photo_id.to_string())
    .bind(photo.inspection_local_id.to_string())
    .bind(&photo.mime_type)
    .bind(&photo.content)
    .bind(photo.upload_status.as_str())
    .bind(photo.created_at)
    .execute(&mut **tx)
    .await?;
    if done.rows_affected() == 0 {
        return Err(SyncError::PermanentValidation(format!(
            "photo {} belongs to another inspection",
            photo.photo_id
        )));
    }
    Ok(())
}

#[instrument(skip_all, fields(%local_id))]
pub async fn photos_by_inspection(pool: &Pool, local_id: LocalId) -> Result<Vec<PhotoBlob>> {
    let exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM inspections WHERE local_id = ?")
        .bind(local_id.to_string())
        .fetch_optional(pool)
        .await?;
    if exists.is_none() {
        return Err(SyncError::not_found("inspection", local_id));
    }

    let rows = sqlx::query(
        "SELECT photo_id, inspection_local_id, mime_type, content, upload_status, created_at \
         FROM photos WHERE inspection_local_id = ? ORDER BY created_at ASC, photo_id ASC",
    )
    .bind(local_id.to_string())
    .fetch_all(pool)
    .await?;
    rows.iter().map(row_to_photo).collect()
}

/// Fetches the named photos of one inspection, in the requested order.
pub async fn photos_by_ids(
    pool: &Pool,
    inspection: LocalId,
    photo_ids: &[LocalId],
) -> Result<Vec<PhotoBlob>> {
    let mut photos = Vec::with_capacity(photo_ids.len());
    for photo_id in photo_ids {
        let row = sqlx::query(
            "SELECT photo_id, inspection_local_id, mime_type, content, upload_status, created_at \
             FROM photos WHERE photo_id = ? AND inspection_local_id = ?",
        )
        .bind(photo_id.to_string())
        .bind(inspection.to_string())
        .fetch_optional(pool)
        .await?;
        let Some(row) = row else {
            return Err(SyncError::not_found("photo", photo_id));
        };
        photos.push(row_to_photo(&row)?);
    }
    Ok(photos)
}

pub async fn mark_photos_uploaded_tx(tx: &mut Tx<'_>, photo_ids: &[LocalId]) -> Result<()> {
    for photo_id in photo_ids {
        sqlx::query("UPDATE photos SET upload_status = ? WHERE photo_id = ?")
            .bind(UploadStatus::Uploaded.as_str())
            .bind(photo_id.to_string())
            .execute(&mut **tx)
            .await?;
    }
    Ok(())
}

async fn fetch_remote_id<'e, E>(executor: E, local_id: LocalId) -> Result<Option<String>>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let remote = sqlx::query_scalar::<_, String>("SELECT remote_id FROM id_map WHERE local_id = ?")
        .bind(local_id.to_string())
        .fetch_optional(executor)
        .await?;
    Ok(remote)
}

/// Server-assigned identifier for a local entity, if one was learned.
pub async fn lookup_remote_id(pool: &Pool, local_id: LocalId) -> Result<Option<String>> {
    fetch_remote_id(pool, local_id).await
}

pub async fn lookup_remote_id_tx(tx: &mut Tx<'_>, local_id: LocalId) -> Result<Option<String>> {
    fetch_remote_id(&mut **tx, local_id).await
}

/// Records a learned identifier. The first mapping wins; remote ids never change.
pub async fn record_remote_id_tx(
    tx: &mut Tx<'_>,
    local_id: LocalId,
    remote_id: &str,
    entity: &str,
) -> Result<()> {
    sqlx::query("INSERT OR IGNORE INTO id_map (local_id, remote_id, entity) VALUES (?, ?, ?)")
        .bind(local_id.to_string())
        .bind(remote_id)
        .bind(entity)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

pub async fn set_inspection_remote_id_tx(
    tx: &mut Tx<'_>,
    local_id: LocalId,
    remote_id: &str,
) -> Result<()> {
    sqlx::query("UPDATE inspections SET remote_id = ? WHERE local_id = ? AND remote_id IS NULL")
        .bind(remote_id)
        .bind(local_id.to_string())
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Sync-field update: stamps `synced_at` and optionally moves the status.
pub async fn stamp_synced_tx(
    tx: &mut Tx<'_>,
    local_id: LocalId,
    at: DateTime<Utc>,
    status: Option<RecordStatus>,
) -> Result<()> {
    sqlx::query("UPDATE inspections SET synced_at = ?, status = COALESCE(?, status) WHERE local_id = ?")
        .bind(at)
        .bind(status.map(|s| s.as_str()))
        .bind(local_id.to_string())
        .execute(&mut **tx)
        .await?;
    Ok(())
}

pub async fn set_status_tx(tx: &mut Tx<'_>, local_id: LocalId, status: RecordStatus) -> Result<()> {
    sqlx::query("UPDATE inspections SET status = ? WHERE local_id = ?")
        .bind(status.as_str())
        .bind(local_id.to_string())
        .execute(&mut **tx)
        .await?;
    Ok(())
}

pub async fn set_last_sync_at_tx(tx: &mut Tx<'_>, at: DateTime<Utc>) -> Result<()> {
    sqlx::query("UPDATE sync_meta SET last_sync_at = ? WHERE id = 1")
        .bind(at)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

pub async fn last_sync_at(pool: &Pool) -> Result<Option<DateTime<Utc>>> {
    let at = sqlx::query_scalar::<_, Option<DateTime<Utc>>>("SELECT last_sync_at FROM sync_meta WHERE id = 1")
        .fetch_optional(pool)
        .await?;
    Ok(at.flatten())
}

#[instrument(skip_all)]
pub async fn storage_usage(pool: &Pool) -> Result<StorageUsage> {
    let inspections: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM inspections")
        .fetch_one(pool)
        .await?;
    let (photos, photo_bytes): (i64, i64) =
        sqlx::query_as("SELECT COUNT(*), COALESCE(SUM(LENGTH(content)), 0) FROM photos")
            .fetch_one(pool)
            .await?;
    let queued_items: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sync_queue")
        .fetch_one(pool)
        .await?;
    let page_count: i64 = sqlx::query_scalar("PRAGMA page_count").fetch_one(pool).await?;
    let page_size: i64 = sqlx::query_scalar("PRAGMA page_size").fetch_one(pool).await?;

    Ok(StorageUsage {
        inspections,
        photos,
        photo_bytes,
        queued_items,
        database_bytes: page_count.saturating_mul(page_size),
    })
}
