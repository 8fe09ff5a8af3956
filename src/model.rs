use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Result, SyncError};

/// Share of a tile surface lost to overlap with its neighbours.
pub const OVERLAP_FRACTION: f64 = 0.12;

/// Client-generated identifier, stable for the lifetime of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalId(Uuid);

impl LocalId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for LocalId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for LocalId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Draft,
    PendingSync,
    Synced,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Draft => "draft",
            RecordStatus::PendingSync => "pending_sync",
            RecordStatus::Synced => "synced",
        }
    }

    pub fn parse_state(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(RecordStatus::Draft),
            "pending_sync" => Some(RecordStatus::PendingSync),
            "synced" => Some(RecordStatus::Synced),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    Pending,
    Uploaded,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::Pending => "pending",
            UploadStatus::Uploaded => "uploaded",
        }
    }

    pub fn parse_state(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(UploadStatus::Pending),
            "uploaded" => Some(UploadStatus::Uploaded),
            _ => None,
        }
    }
}

/// Remote operation carried by a sync queue item.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    CreateInspection,
    UpdateInspection,
    CreateTile,
    CreateNonConformity,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::CreateInspection => "create_inspection",
            OperationKind::UpdateInspection => "update_inspection",
            OperationKind::CreateTile => "create_tile",
            OperationKind::CreateNonConformity => "create_non_conformity",
        }
    }

    pub fn parse_kind(s: &str) -> Option<Self> {
        match s {
            "create_inspection" => Some(OperationKind::CreateInspection),
            "update_inspection" => Some(OperationKind::UpdateInspection),
            "create_tile" => Some(OperationKind::CreateTile),
            "create_non_conformity" => Some(OperationKind::CreateNonConformity),
            _ => None,
        }
    }

    /// Whether a successful call yields a new server-assigned identifier.
    pub fn creates_entity(&self) -> bool {
        !matches!(self, OperationKind::UpdateInspection)
    }

    /// Entity label written to the identifier map.
    pub fn entity(&self) -> &'static str {
        match self {
            OperationKind::CreateInspection | OperationKind::UpdateInspection => "inspection",
            OperationKind::CreateTile => "tile",
            OperationKind::CreateNonConformity => "non_conformity",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    Pending,
    Failed,
}

impl ItemState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemState::Pending => "pending",
            ItemState::Failed => "failed",
        }
    }

    pub fn parse_state(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ItemState::Pending),
            "failed" => Some(ItemState::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientInfo {
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SiteInfo {
    pub address: String,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub postal_code: Option<String>,
    #[serde(default)]
    pub inspection_date: Option<NaiveDate>,
}

/// One tile configuration measured on the roof. Dimensions are metres.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TileConfiguration {
    pub local_id: LocalId,
    pub thickness_class: String,
    length: f64,
    width: f64,
    quantity: u32,
    gross_area: f64,
    corrected_area: f64,
}

impl TileConfiguration {
    pub fn new(thickness_class: impl Into<String>, length: f64, width: f64, quantity: u32) -> Result<Self> {
        validate_dimension("length", length)?;
        validate_dimension("width", width)?;
        let mut tile = Self {
            local_id: LocalId::new(),
            thickness_class: thickness_class.into(),
            length,
            width,
            quantity,
            gross_area: 0.0,
            corrected_area: 0.0,
        };
        tile.recompute();
        Ok(tile)
    }

    pub fn length(&self) -> f64 {
        self.length
    }

    pub fn width(&self) -> f64 {
        self.width
    }

    pub fn quantity(&self) -> u32 {
        self.quantity
    }

    pub fn gross_area(&self) -> f64 {
        self.gross_area
    }

    pub fn corrected_area(&self) -> f64 {
        self.corrected_area
    }

    pub fn set_dimensions(&mut self, length: f64, width: f64) -> Result<()> {
        validate_dimension("length", length)?;
        validate_dimension("width", width)?;
        self.length = length;
        self.width = width;
        self.recompute();
        Ok(())
    }

    pub fn set_quantity(&mut self, quantity: u32) {
        self.quantity = quantity;
        self.recompute();
    }

    /// Re-derives the areas; also repairs values read from an older snapshot.
    pub fn recompute(&mut self) {
        self.gross_area = self.length * self.width * f64::from(self.quantity);
        self.corrected_area = self.gross_area * (1.0 - OVERLAP_FRACTION);
    }
}

fn validate_dimension(name: &str, value: f64) -> Result<()> {
    if !value.is_finite() || value < 0.0 {
        return Err(SyncError::PermanentValidation(format!(
            "tile {name} must be a non-negative number, got {value}"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PhotoRef {
    pub photo_id: LocalId,
    pub mime_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NonConformityEntry {
    pub local_id: LocalId,
    pub title: String,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub photos: Vec<PhotoRef>,
    #[serde(default)]
    pub selected: bool,
}

impl NonConformityEntry {
    pub fn new(title: impl Into<String>, notes: impl Into<String>, selected: bool) -> Self {
        Self {
            local_id: LocalId::new(),
            title: title.into(),
            notes: notes.into(),
            photos: Vec::new(),
            selected,
        }
    }

    pub fn is_submittable(&self) -> bool {
        self.selected && !self.photos.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InspectionRecord {
    pub local_id: LocalId,
    pub remote_id: Option<String>,
    pub protocol_code: String,
    pub client: ClientInfo,
    pub site: SiteInfo,
    pub tiles: Vec<TileConfiguration>,
    pub non_conformities: Vec<NonConformityEntry>,
    pub status: RecordStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub synced_at: Option<DateTime<Utc>>,
}

impl InspectionRecord {
    pub fn new(protocol_code: impl Into<String>, client: ClientInfo, site: SiteInfo) -> Self {
        let now = Utc::now();
        Self {
            local_id: LocalId::new(),
            remote_id: None,
            protocol_code: protocol_code.into(),
            client,
            site,
            tiles: Vec::new(),
            non_conformities: Vec::new(),
            status: RecordStatus::Draft,
            created_at: now,
            updated_at: now,
            synced_at: None,
        }
    }

    /// Checks the conditions for leaving `draft`.
    pub fn validate_ready(&self) -> Result<()> {
        if self.protocol_code.trim().is_empty() {
            return Err(SyncError::PermanentValidation(
                "protocol code must be non-empty".into(),
            ));
        }
        if let Some(entry) = self
            .non_conformities
            .iter()
            .find(|nc| nc.selected && nc.photos.is_empty())
        {
            return Err(SyncError::PermanentValidation(format!(
                "selected non-conformity '{}' has no photo",
                entry.title
            )));
        }
        Ok(())
    }

    pub fn payload(&self) -> InspectionPayload {
        InspectionPayload {
            protocol_code: self.protocol_code.clone(),
            client: self.client.clone(),
            site: self.site.clone(),
        }
    }
}

/// Snapshot of the inspection's own fields as sent to `POST /inspections`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InspectionPayload {
    pub protocol_code: String,
    pub client: ClientInfo,
    pub site: SiteInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TilePayload {
    pub thickness_class: String,
    pub length: f64,
    pub width: f64,
    pub quantity: u32,
    pub gross_area: f64,
    pub corrected_area: f64,
}

impl From<&TileConfiguration> for TilePayload {
    fn from(tile: &TileConfiguration) -> Self {
        Self {
            thickness_class: tile.thickness_class.clone(),
            length: tile.length,
            width: tile.width,
            quantity: tile.quantity,
            gross_area: tile.gross_area,
            corrected_area: tile.corrected_area,
        }
    }
}

/// Queued snapshot of a non-conformity; photo bytes are resolved at dispatch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NonConformityPayload {
    pub title: String,
    pub notes: String,
    pub photo_ids: Vec<LocalId>,
}

impl From<&NonConformityEntry> for NonConformityPayload {
    fn from(entry: &NonConformityEntry) -> Self {
        Self {
            title: entry.title.clone(),
            notes: entry.notes.clone(),
            photo_ids: entry.photos.iter().map(|p| p.photo_id).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhotoBlob {
    pub photo_id: LocalId,
    pub inspection_local_id: LocalId,
    pub mime_type: String,
    pub content: Vec<u8>,
    pub upload_status: UploadStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncQueueItem {
    pub seq: i64,
    pub item_id: Uuid,
    pub kind: OperationKind,
    pub target_local_id: LocalId,
    pub entity_local_id: LocalId,
    pub payload: serde_json::Value,
    pub attempt: i32,
    pub state: ItemState,
    pub last_error: Option<String>,
    pub due_at_ms: i64,
    pub created_at: DateTime<Utc>,
}

impl SyncQueueItem {
    /// Key sent with the remote call so a replay is recognised server-side.
    pub fn idempotency_key(&self) -> String {
        self.item_id.to_string()
    }
}

/// A new queue entry before it is assigned a sequence number.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOperation {
    pub kind: OperationKind,
    pub target_local_id: LocalId,
    pub entity_local_id: LocalId,
    pub payload: serde_json::Value,
}

impl NewOperation {
    pub fn create_inspection(record: &InspectionRecord) -> Result<Self> {
        Ok(Self {
            kind: OperationKind::CreateInspection,
            target_local_id: record.local_id,
            entity_local_id: record.local_id,
            payload: serde_json::to_value(record.payload())?,
        })
    }

    pub fn update_inspection(record: &InspectionRecord) -> Result<Self> {
        Ok(Self {
            kind: OperationKind::UpdateInspection,
            target_local_id: record.local_id,
            entity_local_id: record.local_id,
            payload: serde_json::to_value(record.payload())?,
        })
    }

    pub fn create_tile(inspection: LocalId, tile: &TileConfiguration) -> Result<Self> {
        Ok(Self {
            kind: OperationKind::CreateTile,
            target_local_id: inspection,
            entity_local_id: tile.local_id,
            payload: serde_json::to_value(TilePayload::from(tile))?,
        })
    }

    pub fn create_non_conformity(inspection: LocalId, entry: &NonConformityEntry) -> Result<Self> {
        Ok(Self {
            kind: OperationKind::CreateNonConformity,
            target_local_id: inspection,
            entity_local_id: entry.local_id,
            payload: serde_json::to_value(NonConformityPayload::from(entry))?,
        })
    }
}
