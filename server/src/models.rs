use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A logical endpoint with a stable derived id. The binding to a live
/// channel is transient connection state and lives in the hub's connection
/// table, never here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_name: Option<String>,
    #[serde(rename = "type")]
    pub device_type: DeviceType,
    pub platform: String,
    pub browser: String,
    pub user_agent: String,
    #[serde(default)]
    pub pinned: bool,
    /// Transient; excluded from the persisted projection. Loaded devices
    /// always come back offline.
    #[serde(skip)]
    pub online: bool,
    pub last_seen: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    #[serde(default)]
    pub connection_strength: ConnectionStrength,
}

impl Device {
    /// Display name: the custom override when present, otherwise the
    /// platform-derived default.
    pub fn display_name(&self) -> &str {
        self.custom_name.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Mobile,
    Tablet,
    Desktop,
    Unknown,
}

impl Default for DeviceType {
    fn default() -> Self {
        DeviceType::Unknown
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStrength {
    Good,
    Fair,
    Poor,
}

impl Default for ConnectionStrength {
    fn default() -> Self {
        ConnectionStrength::Good
    }
}

/// A named multicast scope. Name uniqueness is case-insensitive with
/// surrounding whitespace ignored; the stored form preserves the creator's
/// casing for display.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub id: String,
    pub name: String,
    pub created: DateTime<Utc>,
    pub created_by: String,
    pub members: BTreeSet<String>,
}

impl Room {
    /// The case-folded, trimmed form used for uniqueness and lookup.
    pub fn fold_name(name: &str) -> String {
        name.trim().to_lowercase()
    }
}

/// Metadata for one offered file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMeta {
    pub name: String,
    pub size: u64,
    #[serde(rename = "type", default)]
    pub mime_type: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Pending,
    Accepted,
    Streaming,
    Completed,
    Rejected,
    Errored,
    Cancelled,
}

impl TransferStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferStatus::Completed
                | TransferStatus::Rejected
                | TransferStatus::Errored
                | TransferStatus::Cancelled
        )
    }
}

/// A server-mediated unidirectional file movement. Chunk buffers hold
/// decoded bytes and exist only while streaming; a terminal transition
/// frees them and settles the governor balance exactly once.
#[derive(Debug)]
pub struct Transfer {
    pub id: String,
    pub from_device_id: String,
    pub target_device_id: String,
    pub files: Vec<FileMeta>,
    pub status: TransferStatus,
    pub total_size: u64,
    pub total_chunks: Option<u32>,
    pub chunks: Vec<Option<Vec<u8>>>,
    /// Bytes currently charged against the governor for this transfer.
    pub accounted: u64,
    pub created: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Transfer {
    pub fn received_chunks(&self) -> u32 {
        self.chunks.iter().filter(|c| c.is_some()).count() as u32
    }

    /// The primary file driving the chunked path.
    pub fn primary_file(&self) -> Option<&FileMeta> {
        self.files.first()
    }
}
