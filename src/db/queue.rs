//! Durable, ordered sync queue.
//!
//! Sequence numbers come from `AUTOINCREMENT` and define replay order. Items
//! for one target record are always handed out in that order; an item still
//! backing off hides every later item of its chain from `peek_batch`.

use std::collections::HashSet;

use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::instrument;
use uuid::Uuid;

use super::repo::{parse_local_id, Tx};
use super::Pool;
use crate::error::{Result, SyncError};
use crate::model::{ItemState, LocalId, NewOperation, OperationKind, SyncQueueItem};

const ITEM_COLUMNS: &str = "seq, item_id, kind, target_local_id, entity_local_id, payload, attempt, state, last_error, due_at, created_at";

/// Exponential backoff applied by `requeue`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base_secs: i64,
    pub max_secs: i64,
}

impl Backoff {
    /// `base * 2^attempt`, capped at `max_secs` when that is positive.
    pub fn delay_secs(&self, attempt: i32) -> i64 {
        let secs = self.base_secs.max(0).saturating_mul(1_i64 << attempt.clamp(0, 10));
        if self.max_secs <= 0 {
            secs
        } else {
            secs.min(self.max_secs)
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base_secs: 5,
            max_secs: 3600,
        }
    }
}

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn row_to_item(row: &SqliteRow) -> Result<SyncQueueItem> {
    let seq: i64 = row.try_get("seq")?;
    let item_id_raw: String = row.try_get("item_id")?;
    let item_id = Uuid::parse_str(&item_id_raw)
        .map_err(|_| SyncError::CorruptRecord(format!("queue item {seq} has invalid id")))?;
    let kind_raw: String = row.try_get("kind")?;
    let kind = OperationKind::parse_kind(&kind_raw)
        .ok_or_else(|| SyncError::CorruptRecord(format!("queue item {seq} has unknown kind {kind_raw}")))?;
    let state_raw: String = row.try_get("state")?;
    let state = ItemState::parse_state(&state_raw)
        .ok_or_else(|| SyncError::CorruptRecord(format!("queue item {seq} has unknown state {state_raw}")))?;
    let payload_raw: String = row.try_get("payload")?;

    Ok(SyncQueueItem {
        seq,
        item_id,
        kind,
        target_local_id: parse_local_id(&row.try_get::<String, _>("target_local_id")?)?,
        entity_local_id: parse_local_id(&row.try_get::<String, _>("entity_local_id")?)?,
        payload: serde_json::from_str(&payload_raw)?,
        attempt: row.try_get("attempt")?,
        state,
        last_error: row.try_get("last_error")?,
        due_at_ms: row.try_get("due_at")?,
        created_at: row.try_get("created_at")?,
    })
}

/// Appends an operation inside the caller's transaction, so the record write
/// and the queue entry commit together.
#[instrument(skip_all, fields(kind = op.kind.as_str(), target = %op.target_local_id))]
pub async fn enqueue_tx(tx: &mut Tx<'_>, op: &NewOperation) -> Result<SyncQueueItem> {
    let item_id = Uuid::new_v4();
    let payload = serde_json::to_string(&op.payload)?;
    let created_at = Utc::now();
    let due_at = created_at.timestamp_millis();
    let seq: i64 = sqlx::query(
        "INSERT INTO sync_queue (item_id, kind, target_local_id, entity_local_id, payload, attempt, state, due_at, created_at) \
         VALUES (?, ?, ?, ?, ?, 0, 'pending', ?, ?) RETURNING seq",
    )
    .bind(item_id.to_string())
    .bind(op.kind.as_str())
    .bind(op.target_local_id.to_string())
    .bind(op.entity_local_id.to_string())
    .bind(payload)
    .bind(due_at)
    .bind(created_at)
    .fetch_one(&mut **tx)
    .await?
    .get("seq");

    Ok(SyncQueueItem {
        seq,
        item_id,
        kind: op.kind,
        target_local_id: op.target_local_id,
        entity_local_id: op.entity_local_id,
        payload: op.payload.clone(),
        attempt: 0,
        state: ItemState::Pending,
        last_error: None,
        due_at_ms: due_at,
        created_at,
    })
}

/// Appends an operation and commits before returning.
#[instrument(skip_all)]
pub async fn enqueue(pool: &Pool, op: &NewOperation) -> Result<SyncQueueItem> {
    let mut tx = pool.begin().await?;
    let item = enqueue_tx(&mut tx, op).await?;
    tx.commit().await?;
    Ok(item)
}

/// Up to `limit` oldest pending items in sequence order. A chain whose
/// earliest pending item is not yet due is left out from that item on.
pub async fn peek_batch(pool: &Pool, limit: i64, now_ms: i64) -> Result<Vec<SyncQueueItem>> {
    peek_batch_excluding(pool, limit, now_ms, &HashSet::new()).await
}

/// Like `peek_batch`, leaving out every chain whose target is in `skip`.
#[instrument(skip_all, fields(skipped = skip.len()))]
pub async fn peek_batch_excluding(
    pool: &Pool,
    limit: i64,
    now_ms: i64,
    skip: &HashSet<LocalId>,
) -> Result<Vec<SyncQueueItem>> {
    let skip_clause = if skip.is_empty() {
        String::new()
    } else {
        let marks = vec!["?"; skip.len()].join(", ");
        format!("AND q.target_local_id NOT IN ({marks}) ")
    };
    let sql = format!(
        "SELECT {ITEM_COLUMNS} FROM sync_queue q \
         WHERE q.state = 'pending' \
           {skip_clause}\
           AND NOT EXISTS ( \
               SELECT 1 FROM sync_queue p \
               WHERE p.target_local_id = q.target_local_id \
                 AND p.state = 'pending' \
                 AND p.seq <= q.seq \
                 AND p.due_at > ?) \
         ORDER BY q.seq ASC LIMIT ?"
    );
    let mut query = sqlx::query(&sql);
    for target in skip {
        query = query.bind(target.to_string());
    }
    let rows = query.bind(now_ms).bind(limit).fetch_all(pool).await?;
    rows.iter().map(row_to_item).collect()
}

pub async fn get_item(pool: &Pool, item_id: Uuid) -> Result<SyncQueueItem> {
    let sql = format!("SELECT {ITEM_COLUMNS} FROM sync_queue WHERE item_id = ?");
    let row = sqlx::query(&sql)
        .bind(item_id.to_string())
        .fetch_optional(pool)
        .await?;
    let Some(row) = row else {
        return Err(SyncError::not_found("queue item", item_id));
    };
    row_to_item(&row)
}

/// Removes an item after its remote call succeeded. Returns whether a row
/// was removed; a dismissed or already-acked item yields `false`.
pub async fn ack_tx(tx: &mut Tx<'_>, item_id: Uuid) -> Result<bool> {
    let done = sqlx::query("DELETE FROM sync_queue WHERE item_id = ?")
        .bind(item_id.to_string())
        .execute(&mut **tx)
        .await?;
    Ok(done.rows_affected() > 0)
}

#[instrument(skip_all, fields(%item_id))]
pub async fn ack(pool: &Pool, item_id: Uuid) -> Result<()> {
    let mut tx = pool.begin().await?;
    if !ack_tx(&mut tx, item_id).await? {
        return Err(SyncError::not_found("queue item", item_id));
    }
    tx.commit().await?;
    Ok(())
}

/// Bumps the attempt count and pushes the due time out; the item keeps its
/// place in the sequence. Returns the new attempt count.
#[instrument(skip_all, fields(%item_id))]
pub async fn requeue(pool: &Pool, item_id: Uuid, backoff: Backoff, error: &str) -> Result<i32> {
    let attempt: Option<i32> = sqlx::query_scalar(
        "SELECT attempt FROM sync_queue WHERE item_id = ? AND state = 'pending'",
    )
    .bind(item_id.to_string())
    .fetch_optional(pool)
    .await?;
    let Some(attempt) = attempt else {
        return Err(SyncError::not_found("queue item", item_id));
    };

    let due_at = now_ms().saturating_add(backoff.delay_secs(attempt).saturating_mul(1000));
    sqlx::query("UPDATE sync_queue SET attempt = ?, due_at = ?, last_error = ? WHERE item_id = ?")
        .bind(attempt + 1)
        .bind(due_at)
        .bind(error)
        .bind(item_id.to_string())
        .execute(pool)
        .await?;
    Ok(attempt + 1)
}

/// Takes an item off the retry path; it stays listed until dismissed or retried.
#[instrument(skip_all, fields(%item_id))]
pub async fn mark_failed(pool: &Pool, item_id: Uuid, error: &str) -> Result<()> {
    let done = sqlx::query(
        "UPDATE sync_queue SET state = 'failed', attempt = attempt + 1, last_error = ? WHERE item_id = ?",
    )
    .bind(error)
    .bind(item_id.to_string())
    .execute(pool)
    .await?;
    if done.rows_affected() == 0 {
        return Err(SyncError::not_found("queue item", item_id));
    }
    Ok(())
}

pub async fn list_failed(pool: &Pool) -> Result<Vec<SyncQueueItem>> {
    let sql = format!("SELECT {ITEM_COLUMNS} FROM sync_queue WHERE state = 'failed' ORDER BY seq ASC");
    let rows = sqlx::query(&sql).fetch_all(pool).await?;
    rows.iter().map(row_to_item).collect()
}

pub async fn list_all(pool: &Pool) -> Result<Vec<SyncQueueItem>> {
    let sql = format!("SELECT {ITEM_COLUMNS} FROM sync_queue ORDER BY seq ASC");
    let rows = sqlx::query(&sql).fetch_all(pool).await?;
    rows.iter().map(row_to_item).collect()
}

/// Drops a failed item for good.
#[instrument(skip_all, fields(%item_id))]
pub async fn dismiss(pool: &Pool, item_id: Uuid) -> Result<()> {
    let item = get_item(pool, item_id).await?;
    if item.state != ItemState::Failed {
        return Err(SyncError::PermanentValidation(format!(
            "queue item {item_id} is not failed"
        )));
    }
    sqlx::query("DELETE FROM sync_queue WHERE item_id = ?")
        .bind(item_id.to_string())
        .execute(pool)
        .await?;
    Ok(())
}

/// Puts a failed item, and the failed items after it in the same chain, back
/// on the retry path. Returns how many items were revived.
#[instrument(skip_all, fields(%item_id))]
pub async fn retry_failed(pool: &Pool, item_id: Uuid) -> Result<u64> {
    let item = get_item(pool, item_id).await?;
    if item.state != ItemState::Failed {
        return Err(SyncError::PermanentValidation(format!(
            "queue item {item_id} is not failed"
        )));
    }
    let done = sqlx::query(
        "UPDATE sync_queue SET state = 'pending', attempt = 0, due_at = ?, last_error = NULL \
         WHERE target_local_id = ? AND state = 'failed' AND seq >= ?",
    )
    .bind(now_ms())
    .bind(item.target_local_id.to_string())
    .bind(item.seq)
    .execute(pool)
    .await?;
    Ok(done.rows_affected())
}

pub async fn count_pending(pool: &Pool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sync_queue WHERE state = 'pending'")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

/// Failed items plus pending items whose retries crossed `escalate_after`.
pub async fn count_needing_attention(pool: &Pool, escalate_after: i32) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM sync_queue WHERE state = 'failed' OR (state = 'pending' AND attempt >= ?)",
    )
    .bind(escalate_after)
    .fetch_one(pool)
    .await?;
    Ok(count)
}

pub async fn count_pending_for_target_tx(tx: &mut Tx<'_>, target: LocalId) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM sync_queue WHERE target_local_id = ? AND state = 'pending'",
    )
    .bind(target.to_string())
    .fetch_one(&mut **tx)
    .await?;
    Ok(count)
}

/// Whether any create was ever queued for this entity and is still queued.
pub async fn has_queued_create_tx(tx: &mut Tx<'_>, entity: LocalId) -> Result<bool> {
    let found: Option<i64> = sqlx::query_scalar(
        "SELECT 1 FROM sync_queue WHERE entity_local_id = ? AND kind IN ('create_inspection', 'create_tile', 'create_non_conformity') LIMIT 1",
    )
    .bind(entity.to_string())
    .fetch_optional(&mut **tx)
    .await?;
    Ok(found.is_some())
}

/// Removes every queued item of a record; used when the record is deleted.
pub async fn drop_for_target_tx(tx: &mut Tx<'_>, target: LocalId) -> Result<u64> {
    let done = sqlx::query("DELETE FROM sync_queue WHERE target_local_id = ?")
        .bind(target.to_string())
        .execute(&mut **tx)
        .await?;
    Ok(done.rows_affected())
}
