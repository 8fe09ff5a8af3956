//! Aggregated sync status for presentation layers.

use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::instrument;

use crate::db::{self, queue, Pool};
use crate::error::Result;
use crate::listeners::{Listeners, SubscriptionId};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Online,
    Offline,
    Syncing,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Online => "online",
            ConnectionState::Offline => "offline",
            ConnectionState::Syncing => "syncing",
        }
    }
}

/// One consistent read of the reporter.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub status: ConnectionState,
    pub pending_count: i64,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub needs_attention: i64,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Default)]
struct Inner {
    online: bool,
    syncing: bool,
    pending_count: i64,
    last_sync_at: Option<DateTime<Utc>>,
    needs_attention: i64,
    last_error: Option<String>,
}

impl Inner {
    fn snapshot(&self) -> SyncStatus {
        let status = if self.syncing {
            ConnectionState::Syncing
        } else if self.online {
            ConnectionState::Online
        } else {
            ConnectionState::Offline
        };
        SyncStatus {
            status,
            pending_count: self.pending_count,
            last_sync_at: self.last_sync_at,
            needs_attention: self.needs_attention,
            last_error: self.last_error.clone(),
        }
    }
}

#[derive(Debug, Default)]
pub struct StatusReporter {
    inner: RwLock<Inner>,
    listeners: Listeners<SyncStatus>,
}

impl StatusReporter {
    pub fn new(online: bool) -> Self {
        Self {
            inner: RwLock::new(Inner {
                online,
                ..Default::default()
            }),
            listeners: Listeners::default(),
        }
    }

    pub fn snapshot(&self) -> SyncStatus {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .snapshot()
    }

    pub fn set_online(&self, online: bool) {
        self.update(|inner| inner.online = online);
    }

    pub fn set_syncing(&self, syncing: bool) {
        self.update(|inner| inner.syncing = syncing);
    }

    pub fn record_error(&self, error: Option<String>) {
        self.update(|inner| inner.last_error = error);
    }

    /// Re-reads queue depth, attention count and last sync time from the store.
    #[instrument(skip_all)]
    pub async fn refresh(&self, pool: &Pool, escalate_after: i32) -> Result<SyncStatus> {
        let pending_count = queue::count_pending(pool).await?;
        let needs_attention = queue::count_needing_attention(pool, escalate_after).await?;
        let last_sync_at = db::last_sync_at(pool).await?;
        Ok(self.update(|inner| {
            inner.pending_count = pending_count;
            inner.needs_attention = needs_attention;
            inner.last_sync_at = last_sync_at;
        }))
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&SyncStatus) + Send + Sync + 'static,
    {
        self.listeners.subscribe(callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.listeners.unsubscribe(id)
    }

    /// Applies a change under the write lock, then notifies outside it when
    /// the visible snapshot moved.
    fn update(&self, apply: impl FnOnce(&mut Inner)) -> SyncStatus {
        let (before, after) = {
            let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
            let before = inner.snapshot();
            apply(&mut inner);
            (before, inner.snapshot())
        };
        if before != after {
            self.listeners.notify(&after);
        }
        after
    }
}
