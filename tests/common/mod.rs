#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use tile_survey::db::{self, queue::Backoff};
use tile_survey::engine::SyncSettings;
use tile_survey::model::{ClientInfo, InspectionPayload, InspectionRecord, LocalId, SiteInfo, TilePayload};
use tile_survey::remote::{InspectionApi, NonConformityUpload, RemoteError};
use tile_survey::service::{InspectionService, NonConformityInput, PhotoInput, TileInput};
use tile_survey::store::LocalStore;

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    CreateInspection {
        key: String,
        protocol_code: String,
    },
    UpdateInspection {
        key: String,
        remote_id: String,
        protocol_code: String,
    },
    CreateTile {
        key: String,
        parent: String,
        thickness_class: String,
        gross_area: f64,
    },
    CreateNonConformity {
        key: String,
        parent: String,
        title: String,
        photos: Vec<(LocalId, String)>,
    },
}

impl Call {
    pub fn key(&self) -> &str {
        match self {
            Call::CreateInspection { key, .. }
            | Call::UpdateInspection { key, .. }
            | Call::CreateTile { key, .. }
            | Call::CreateNonConformity { key, .. } => key,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Call::CreateInspection { .. } => "create_inspection",
            Call::UpdateInspection { .. } => "update_inspection",
            Call::CreateTile { .. } => "create_tile",
            Call::CreateNonConformity { .. } => "create_non_conformity",
        }
    }
}

/// In-memory stand-in for the inspection server. It honours idempotency
/// keys the way the real one does: a repeated key returns the entity created
/// the first time.
#[derive(Clone, Default)]
pub struct RecordingApi {
    failures: Arc<Mutex<VecDeque<RemoteError>>>,
    rejections: Arc<Mutex<HashMap<String, u16>>>,
    calls: Arc<Mutex<Vec<Call>>>,
    created: Arc<Mutex<HashMap<String, String>>>,
    next_id: Arc<AtomicUsize>,
    delay: Duration,
}

impl RecordingApi {
    /// The next calls fail with these errors, in order.
    pub fn with_failures(failures: Vec<RemoteError>) -> Self {
        Self {
            failures: Arc::new(Mutex::new(VecDeque::from(failures))),
            ..Default::default()
        }
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    /// Rejects every call whose protocol code, thickness class or title is `label`.
    pub async fn reject(&self, label: &str, status: u16) {
        self.rejections.lock().await.insert(label.to_string(), status);
    }

    pub async fn accept(&self, label: &str) {
        self.rejections.lock().await.remove(label);
    }

    pub async fn calls(&self) -> Vec<Call> {
        self.calls.lock().await.clone()
    }

    pub async fn call_names(&self) -> Vec<&'static str> {
        self.calls.lock().await.iter().map(Call::name).collect()
    }

    /// Entities the server holds; replays of a known key are not counted.
    pub async fn created_count(&self) -> usize {
        self.created.lock().await.len()
    }

    async fn respond(&self, call: Call, label: &str, creates: bool) -> Result<String, RemoteError> {
        let key = call.key().to_string();
        self.calls.lock().await.push(call);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(err) = self.failures.lock().await.pop_front() {
            return Err(err);
        }
        if let Some(status) = self.rejections.lock().await.get(label) {
            return Err(RemoteError::Client {
                status: *status,
                body: format!("{label} rejected"),
            });
        }
        if !creates {
            return Ok(String::new());
        }
        let mut created = self.created.lock().await;
        if let Some(existing) = created.get(&key) {
            return Ok(existing.clone());
        }
        let id = format!("srv-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        created.insert(key, id.clone());
        Ok(id)
    }
}

#[async_trait]
impl InspectionApi for RecordingApi {
    async fn create_inspection(
        &self,
        idempotency_key: &str,
        payload: &InspectionPayload,
    ) -> Result<String, RemoteError> {
        let call = Call::CreateInspection {
            key: idempotency_key.to_string(),
            protocol_code: payload.protocol_code.clone(),
        };
        self.respond(call, &payload.protocol_code, true).await
    }

    async fn update_inspection(
        &self,
        idempotency_key: &str,
        remote_id: &str,
        payload: &InspectionPayload,
    ) -> Result<(), RemoteError> {
        let call = Call::UpdateInspection {
            key: idempotency_key.to_string(),
            remote_id: remote_id.to_string(),
            protocol_code: payload.protocol_code.clone(),
        };
        self.respond(call, &payload.protocol_code, false)
            .await
            .map(|_| ())
    }

    async fn create_tile(
        &self,
        idempotency_key: &str,
        inspection_remote_id: &str,
        payload: &TilePayload,
    ) -> Result<String, RemoteError> {
        let call = Call::CreateTile {
            key: idempotency_key.to_string(),
            parent: inspection_remote_id.to_string(),
            thickness_class: payload.thickness_class.clone(),
            gross_area: payload.gross_area,
        };
        self.respond(call, &payload.thickness_class, true).await
    }

    async fn create_non_conformity(
        &self,
        idempotency_key: &str,
        inspection_remote_id: &str,
        upload: &NonConformityUpload,
    ) -> Result<String, RemoteError> {
        let call = Call::CreateNonConformity {
            key: idempotency_key.to_string(),
            parent: inspection_remote_id.to_string(),
            title: upload.title.clone(),
            photos: upload
                .photos
                .iter()
                .map(|p| (p.photo_id, p.content_base64.clone()))
                .collect(),
        };
        self.respond(call, &upload.title, true).await
    }
}

pub fn fast_settings() -> SyncSettings {
    SyncSettings {
        batch_size: 50,
        max_concurrency: 4,
        backoff: Backoff {
            base_secs: 0,
            max_secs: 0,
        },
        request_timeout: Duration::from_secs(5),
        escalate_after_attempts: 3,
        poll_interval: Duration::from_secs(3600),
    }
}

pub async fn service_with(api: RecordingApi, online: bool) -> InspectionService {
    service_with_settings(api, online, fast_settings()).await
}

pub async fn service_with_settings(
    api: RecordingApi,
    online: bool,
    settings: SyncSettings,
) -> InspectionService {
    let pool = db::open("sqlite::memory:").await.unwrap();
    InspectionService::with_api(LocalStore::new(pool), Arc::new(api), settings, online)
}

pub fn sample_record(protocol_code: &str) -> InspectionRecord {
    InspectionRecord::new(
        protocol_code,
        ClientInfo {
            name: "Dakwerken Peeters".into(),
            email: Some("info@peeters.example".into()),
            phone: None,
        },
        SiteInfo {
            address: "Kerkstraat 12".into(),
            city: Some("Gent".into()),
            ..Default::default()
        },
    )
}

pub fn tile(thickness_class: &str) -> TileInput {
    TileInput {
        thickness_class: thickness_class.into(),
        length: 2.44,
        width: 1.10,
        quantity: 100,
    }
}

pub fn photo(bytes: &[u8]) -> PhotoInput {
    PhotoInput {
        mime_type: "image/jpeg".into(),
        content: bytes.to_vec(),
    }
}

pub fn non_conformity(title: &str, photos: Vec<PhotoInput>) -> NonConformityInput {
    NonConformityInput {
        title: title.into(),
        notes: "seen from the north gutter".into(),
        selected: true,
        photos,
    }
}
