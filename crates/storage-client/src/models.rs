//! Storage API models
//!
//! These mirror the block-storage service's REST resources. Sizes travel as
//! strings with binary-suffix units (e.g. "10Gi"), matching the service.

use serde::{Deserialize, Serialize};

/// A replicated block volume as reported by the service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    pub name: String,
    #[serde(default)]
    pub frontend: String,
    #[serde(default)]
    pub size: String,
    #[serde(default)]
    pub base_image: String,
    #[serde(default)]
    pub number_of_replicas: i32,
    #[serde(default)]
    pub stale_replica_timeout: i32,
    #[serde(default)]
    pub robustness: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub controllers: Vec<VolumeController>,
}

/// Frontend controller of an attached volume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VolumeController {
    pub name: String,
    #[serde(default)]
    pub endpoint: String,
    #[serde(rename = "hostId", default)]
    pub node_id: String,
}

/// Body of `POST /v1/volumes`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateVolumeRequest {
    pub name: String,
    pub frontend: String,
    pub size: String,
    pub base_image: String,
    pub number_of_replicas: i32,
    pub stale_replica_timeout: i32,
}

/// Body of the `attach` volume action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachVolumeRequest {
    #[serde(rename = "hostId")]
    pub node_id: String,
}

/// Reply of the `snapshotCreate` volume action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Snapshot {
    pub name: String,
    #[serde(default)]
    pub size: String,
}

/// Body of the `snapshotBackup` volume action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateBackupRequest {
    /// Name of the snapshot to back up
    pub name: String,
}

/// One backup of a volume, as returned by the `backupList` action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Backup {
    pub name: String,
    #[serde(default)]
    pub snapshot_name: String,
    #[serde(default)]
    pub volume_name: String,
    pub url: String,
    #[serde(default)]
    pub labels: std::collections::HashMap<String, String>,
}

/// Reply of the `backupList` action.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BackupListResponse {
    #[serde(rename = "data", default)]
    pub items: Vec<Backup>,
}
