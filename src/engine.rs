//! Sync engine: drains the queue against the remote API.
//!
//! A pass takes batches in sequence order and splits each batch into chains,
//! one per inspection. Chains run concurrently up to `max_concurrency`; items
//! within a chain run one after another and a transient failure ends the
//! chain for this pass. Permanent failures are parked as `failed` and the
//! chain moves on.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use crate::connectivity::ConnectionMonitor;
use crate::db::{self, queue, queue::Backoff};
use crate::error::{Result, SyncError};
use crate::listeners::SubscriptionId;
use crate::model::{
    InspectionPayload, LocalId, NonConformityPayload, OperationKind, SyncQueueItem,
    TilePayload,
};
use crate::remote::{InspectionApi, NonConformityUpload, PhotoUpload, RemoteError};
use crate::status::{StatusReporter, SyncStatus};
use crate::store::LocalStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSettings {
    pub batch_size: i64,
    pub max_concurrency: usize,
    pub backoff: Backoff,
    /// Upper bound for one remote call, photo upload included.
    pub request_timeout: Duration,
    /// Retries after which a transient failure counts as needing attention.
    pub escalate_after_attempts: i32,
    pub poll_interval: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            batch_size: 50,
            max_concurrency: 4,
            backoff: Backoff::default(),
            request_timeout: Duration::from_secs(10),
            escalate_after_attempts: 5,
            poll_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Reconnect,
    Manual,
    Periodic,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Reconnect => "reconnect",
            Trigger::Manual => "manual",
            Trigger::Periodic => "periodic",
        }
    }
}

/// What one drain pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainReport {
    pub batches: usize,
    pub succeeded: usize,
    pub requeued: usize,
    pub failed: usize,
    /// Another pass was running, or the trigger does not fire while offline.
    pub skipped: bool,
    /// Connectivity dropped mid-pass; remaining items were left queued.
    pub aborted_offline: bool,
}

#[derive(Debug, Default, Clone, Copy)]
struct ChainOutcome {
    succeeded: usize,
    requeued: usize,
    failed: usize,
    /// Set when a transient failure ended the chain for this pass.
    stalled: Option<LocalId>,
}

impl DrainReport {
    fn absorb(&mut self, chain: ChainOutcome) {
        self.succeeded += chain.succeeded;
        self.requeued += chain.requeued;
        self.failed += chain.failed;
    }
}

enum Outcome {
    Applied,
    Requeued,
    Failed,
}

struct Dispatched {
    remote_id: Option<String>,
    /// False when the local id map already answered and no request was sent.
    remote_call: bool,
}

enum Failure {
    Transient { reason: String, network: bool },
    Permanent(String),
    Storage(SyncError),
}

impl Failure {
    /// Transient errors are retried, validation and missing-entity errors
    /// park the item, anything else aborts the pass.
    fn classify(err: SyncError, network: bool) -> Self {
        match err {
            SyncError::TransientNetwork(_) => Failure::Transient {
                reason: err.to_string(),
                network,
            },
            SyncError::PermanentValidation(_) | SyncError::NotFound { .. } => {
                Failure::Permanent(err.to_string())
            }
            other => Failure::Storage(other),
        }
    }
}

impl From<RemoteError> for Failure {
    fn from(err: RemoteError) -> Self {
        let network = err.is_network();
        Failure::classify(SyncError::from(err), network)
    }
}

/// Clears the running flag even if the pass is dropped half way.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct SyncEngine {
    store: LocalStore,
    api: Arc<dyn InspectionApi>,
    monitor: Arc<ConnectionMonitor>,
    reporter: Arc<StatusReporter>,
    settings: SyncSettings,
    running: AtomicBool,
    connectivity_subscription: SubscriptionId,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("settings", &self.settings)
            .field("running", &self.running)
            .finish_non_exhaustive()
    }
}

impl SyncEngine {
    pub fn new(
        store: LocalStore,
        api: Arc<dyn InspectionApi>,
        monitor: Arc<ConnectionMonitor>,
        reporter: Arc<StatusReporter>,
        settings: SyncSettings,
    ) -> Self {
        reporter.set_online(monitor.is_online());
        let connectivity_subscription = {
            let reporter = Arc::clone(&reporter);
            monitor.subscribe(move |online| reporter.set_online(*online))
        };
        Self {
            store,
            api,
            monitor,
            reporter,
            settings,
            running: AtomicBool::new(false),
            connectivity_subscription,
        }
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn monitor(&self) -> &Arc<ConnectionMonitor> {
        &self.monitor
    }

    pub fn reporter(&self) -> &Arc<StatusReporter> {
        &self.reporter
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub async fn refresh_status(&self) -> Result<SyncStatus> {
        self.reporter
            .refresh(self.store.pool(), self.settings.escalate_after_attempts)
            .await
    }

    /// Runs one drain pass. A pass already in flight makes this a no-op.
    /// A manual trigger assumes the network is back and lets the first call
    /// prove otherwise; automatic triggers do nothing while offline.
    #[instrument(skip_all, fields(trigger = trigger.as_str()))]
    pub async fn drain(&self, trigger: Trigger) -> Result<DrainReport> {
        match trigger {
            Trigger::Manual => self.monitor.report_reachable(),
            Trigger::Reconnect | Trigger::Periodic if !self.monitor.is_online() => {
                debug!("offline; pass skipped");
                return Ok(DrainReport {
                    skipped: true,
                    ..Default::default()
                });
            }
            Trigger::Reconnect | Trigger::Periodic => {}
        }

        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("drain pass already running; trigger skipped");
            return Ok(DrainReport {
                skipped: true,
                ..Default::default()
            });
        }
        let _running = RunningGuard(&self.running);

        self.reporter.set_syncing(true);
        let mut report = DrainReport::default();
        let result = self.drain_batches(&mut report).await;
        self.reporter.set_syncing(false);

        match &result {
            Ok(()) => self.reporter.record_error(None),
            Err(err) => {
                error!(?err, "drain pass failed");
                self.reporter.record_error(Some(err.to_string()));
            }
        }
        if let Err(err) = self.refresh_status().await {
            warn!(?err, "status refresh after drain failed");
        }

        info!(
            batches = report.batches,
            succeeded = report.succeeded,
            requeued = report.requeued,
            failed = report.failed,
            aborted_offline = report.aborted_offline,
            "drain pass finished"
        );
        result.map(|()| report)
    }

    async fn drain_batches(&self, report: &mut DrainReport) -> Result<()> {
        let pool = self.store.pool();
        // Records whose chain hit a transient failure sit out the rest of the pass.
        let mut stalled: HashSet<LocalId> = HashSet::new();
        loop {
            if !self.monitor.is_online() {
                info!("connectivity lost; pass aborted");
                report.aborted_offline = true;
                return Ok(());
            }

            let batch = queue::peek_batch_excluding(
                pool,
                self.settings.batch_size,
                queue::now_ms(),
                &stalled,
            )
            .await?;
            if batch.is_empty() {
                return Ok(());
            }
            report.batches += 1;
            debug!(items = batch.len(), "batch fetched");

            let outcomes: Vec<Result<ChainOutcome>> = stream::iter(group_chains(batch))
                .map(|chain| self.run_chain(chain))
                .buffer_unordered(self.settings.max_concurrency.max(1))
                .collect()
                .await;

            let mut progressed = false;
            for outcome in outcomes {
                let outcome = outcome?;
                progressed |= outcome.succeeded + outcome.failed > 0;
                if let Some(target) = outcome.stalled {
                    progressed |= stalled.insert(target);
                }
                report.absorb(outcome);
            }
            self.refresh_status().await?;

            if !progressed {
                return Ok(());
            }
        }
    }

    async fn run_chain(&self, chain: Vec<SyncQueueItem>) -> Result<ChainOutcome> {
        let mut outcome = ChainOutcome::default();
        for item in chain {
            if !self.monitor.is_online() {
                break;
            }
            let result = self.process_item(&item).await?;
            if let Err(err) = self.refresh_status().await {
                warn!(?err, "status refresh after item failed");
            }
            match result {
                Outcome::Applied => outcome.succeeded += 1,
                Outcome::Failed => outcome.failed += 1,
                Outcome::Requeued => {
                    outcome.requeued += 1;
                    outcome.stalled = Some(item.target_local_id);
                    break;
                }
            }
        }
        Ok(outcome)
    }

    #[instrument(skip_all, fields(item_id = %item.item_id, kind = item.kind.as_str(), target = %item.target_local_id, attempt = item.attempt))]
    async fn process_item(&self, item: &SyncQueueItem) -> Result<Outcome> {
        let timeout = self.settings.request_timeout;
        let dispatched = match tokio::time::timeout(timeout, self.dispatch(item)).await {
            Ok(result) => result,
            Err(_) => Err(Failure::classify(
                SyncError::TransientNetwork(format!("remote call timed out after {timeout:?}")),
                true,
            )),
        };

        let pool = self.store.pool();
        match dispatched {
            Ok(done) => {
                if done.remote_call {
                    self.monitor.report_reachable();
                }
                self.store
                    .mark_item_applied(item, done.remote_id.as_deref())
                    .await?;
                debug!(remote_id = ?done.remote_id, "item applied");
                Ok(Outcome::Applied)
            }
            Err(Failure::Transient { reason, network }) => {
                if network {
                    self.monitor.report_unreachable();
                }
                match queue::requeue(pool, item.item_id, self.settings.backoff, &reason).await {
                    Ok(attempt) if attempt >= self.settings.escalate_after_attempts => {
                        warn!(attempt, %reason, "item keeps failing; needs attention");
                    }
                    Ok(attempt) => debug!(attempt, %reason, "transient failure; requeued"),
                    Err(err) if err.is_not_found() => debug!("item removed before requeue"),
                    Err(err) => return Err(err),
                }
                Ok(Outcome::Requeued)
            }
            Err(Failure::Permanent(reason)) => {
                warn!(%reason, "permanent failure; item parked");
                match queue::mark_failed(pool, item.item_id, &reason).await {
                    Ok(()) => {}
                    Err(err) if err.is_not_found() => debug!("item removed before marking failed"),
                    Err(err) => return Err(err),
                }
                // A parked child does not hold back a record the server already knows.
                if self.store.settle_after_failure(item.target_local_id).await? {
                    debug!("record settled as synced");
                }
                Ok(Outcome::Failed)
            }
            Err(Failure::Storage(err)) => Err(err),
        }
    }

    async fn dispatch(&self, item: &SyncQueueItem) -> std::result::Result<Dispatched, Failure> {
        let key = item.idempotency_key();
        match item.kind {
            OperationKind::CreateInspection => {
                if let Some(existing) = self.already_mapped(item).await? {
                    return Ok(Dispatched {
                        remote_id: Some(existing),
                        remote_call: false,
                    });
                }
                let payload: InspectionPayload = decode_payload(item)?;
                let id = self.api.create_inspection(&key, &payload).await?;
                Ok(Dispatched {
                    remote_id: Some(id),
                    remote_call: true,
                })
            }
            OperationKind::UpdateInspection => {
                let remote_id = self.parent_remote_id(item).await?;
                let payload: InspectionPayload = decode_payload(item)?;
                self.api
                    .update_inspection(&key, &remote_id, &payload)
                    .await?;
                Ok(Dispatched {
                    remote_id: None,
                    remote_call: true,
                })
            }
            OperationKind::CreateTile => {
                if let Some(existing) = self.already_mapped(item).await? {
                    return Ok(Dispatched {
                        remote_id: Some(existing),
                        remote_call: false,
                    });
                }
                let parent = self.parent_remote_id(item).await?;
                let payload: TilePayload = decode_payload(item)?;
                let id = self.api.create_tile(&key, &parent, &payload).await?;
                Ok(Dispatched {
                    remote_id: Some(id),
                    remote_call: true,
                })
            }
            OperationKind::CreateNonConformity => {
                if let Some(existing) = self.already_mapped(item).await? {
                    return Ok(Dispatched {
                        remote_id: Some(existing),
                        remote_call: false,
                    });
                }
                let parent = self.parent_remote_id(item).await?;
                let payload: NonConformityPayload = decode_payload(item)?;
                let photos = db::photos_by_ids(self.store.pool(), item.target_local_id, &payload.photo_ids)
                    .await
                    .map_err(|err| Failure::classify(err, false))?;
                let upload = NonConformityUpload {
                    title: payload.title,
                    notes: payload.notes,
                    photos: photos.iter().map(PhotoUpload::from).collect(),
                };
                let id = self.api.create_non_conformity(&key, &parent, &upload).await?;
                Ok(Dispatched {
                    remote_id: Some(id),
                    remote_call: true,
                })
            }
        }
    }

    /// Remote id learned for the item's entity on an earlier run whose ack
    /// never committed.
    async fn already_mapped(&self, item: &SyncQueueItem) -> std::result::Result<Option<String>, Failure> {
        let existing = db::lookup_remote_id(self.store.pool(), item.entity_local_id)
            .await
            .map_err(Failure::Storage)?;
        if let Some(remote_id) = &existing {
            debug!(%remote_id, "entity already mapped; skipping remote call");
        }
        Ok(existing)
    }

    async fn parent_remote_id(&self, item: &SyncQueueItem) -> std::result::Result<String, Failure> {
        db::lookup_remote_id(self.store.pool(), item.target_local_id)
            .await
            .map_err(Failure::Storage)?
            .ok_or_else(|| {
                Failure::Permanent(format!(
                    "inspection {} has no remote id; its create did not succeed",
                    item.target_local_id
                ))
            })
    }

    /// Drains once per offline→online transition of the monitor.
    pub fn spawn_auto_sync(self: &Arc<Self>) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        let mut online = engine.monitor.watch();
        tokio::spawn(async move {
            while online.changed().await.is_ok() {
                if !*online.borrow_and_update() {
                    continue;
                }
                if let Err(err) = engine.drain(Trigger::Reconnect).await {
                    error!(?err, "reconnect drain failed");
                }
            }
        })
    }

    /// Drains every `poll_interval`, skipping ticks while offline.
    pub fn spawn_periodic(self: &Arc<Self>) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        let period = engine.settings.poll_interval.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(err) = engine.drain(Trigger::Periodic).await {
                    error!(?err, "periodic drain failed");
                }
            }
        })
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.monitor.unsubscribe(self.connectivity_subscription);
    }
}

fn decode_payload<T: DeserializeOwned>(item: &SyncQueueItem) -> std::result::Result<T, Failure> {
    serde_json::from_value(item.payload.clone())
        .map_err(|err| Failure::Permanent(format!("queued payload does not decode: {err}")))
}

/// Splits a batch into per-inspection chains, keeping sequence order inside
/// each chain and first-seen order across chains.
fn group_chains(batch: Vec<SyncQueueItem>) -> Vec<Vec<SyncQueueItem>> {
    let mut index: HashMap<LocalId, usize> = HashMap::new();
    let mut chains: Vec<Vec<SyncQueueItem>> = Vec::new();
    for item in batch {
        match index.get(&item.target_local_id) {
            Some(&i) => chains[i].push(item),
            None => {
                index.insert(item.target_local_id, chains.len());
                chains.push(vec![item]);
            }
        }
    }
    chains
}
