//! Persisted shapes and view models used by repositories.
//!
//! Business fields of an inspection are stored as a JSON body tagged with a
//! schema version. Sync fields (`remote_id`, `status`, timestamps) live in
//! their own columns so the sync engine can update them without rewriting the
//! body.

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};
use crate::model::{ClientInfo, InspectionRecord, NonConformityEntry, SiteInfo, TileConfiguration};

/// Version written by this build.
pub const INSPECTION_SCHEMA_VERSION: i64 = 1;

/// Business fields of an inspection, version 1.
///
/// Fields added later must carry `#[serde(default)]` so older rows decode.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InspectionBodyV1 {
    pub protocol_code: String,
    #[serde(default)]
    pub client: ClientInfo,
    #[serde(default)]
    pub site: SiteInfo,
    #[serde(default)]
    pub tiles: Vec<TileConfiguration>,
    #[serde(default)]
    pub non_conformities: Vec<NonConformityEntry>,
}

impl From<&InspectionRecord> for InspectionBodyV1 {
    fn from(record: &InspectionRecord) -> Self {
        Self {
            protocol_code: record.protocol_code.clone(),
            client: record.client.clone(),
            site: record.site.clone(),
            tiles: record.tiles.clone(),
            non_conformities: record.non_conformities.clone(),
        }
    }
}

pub fn encode_body(record: &InspectionRecord) -> Result<(i64, String)> {
    let body = serde_json::to_string(&InspectionBodyV1::from(record))?;
    Ok((INSPECTION_SCHEMA_VERSION, body))
}

pub fn decode_body(version: i64, raw: &str) -> Result<InspectionBodyV1> {
    match version {
        1 => {
            let mut body: InspectionBodyV1 = serde_json::from_str(raw).map_err(|err| {
                SyncError::CorruptRecord(format!("inspection body v1 does not decode: {err}"))
            })?;
            for tile in &mut body.tiles {
                tile.recompute();
            }
            Ok(body)
        }
        other => Err(SyncError::CorruptRecord(format!(
            "unsupported inspection schema version {other}"
        ))),
    }
}

/// Disk usage summary for presentation layers.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StorageUsage {
    pub inspections: i64,
    pub photos: i64,
    pub photo_bytes: i64,
    pub queued_items: i64,
    pub database_bytes: i64,
}
