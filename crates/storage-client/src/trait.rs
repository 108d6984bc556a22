//! StorageClient trait for mocking
//!
//! Abstracts the storage client so reconciler logic can be unit tested
//! against an in-memory implementation. The concrete `StorageClient`
//! implements this trait; tests use `MockStorageClient`.

use crate::error::StorageError;
use crate::models::*;

/// Operations the reconcilers require from the block-storage service.
///
/// All methods must be `Send` so implementations work on Tokio's
/// work-stealing runtime.
#[async_trait::async_trait]
pub trait StorageClientTrait: Send + Sync {
    /// Fetch a volume by name. `Ok(None)` means the volume does not exist.
    async fn get_volume(&self, name: &str) -> Result<Option<Volume>, StorageError>;

    /// Create a volume. The service answers 200 on success.
    async fn create_volume(&self, request: CreateVolumeRequest) -> Result<(), StorageError>;

    /// Delete a volume by name.
    async fn delete_volume(&self, name: &str) -> Result<(), StorageError>;

    /// Attach a volume to a node.
    async fn attach_volume(&self, name: &str, node_id: &str) -> Result<(), StorageError>;

    /// Take a snapshot of a volume and return it.
    async fn create_snapshot(&self, volume: &str) -> Result<Snapshot, StorageError>;

    /// Start a backup of a snapshot.
    async fn create_backup(&self, volume: &str, snapshot: &str) -> Result<(), StorageError>;

    /// Look up the backup of a specific snapshot. `Ok(None)` means the
    /// backup has not appeared yet; callers requeue and retry.
    async fn get_backup(&self, volume: &str, snapshot: &str)
        -> Result<Option<Backup>, StorageError>;

    /// List all backups of a volume.
    async fn backup_list(&self, volume: &str) -> Result<BackupListResponse, StorageError>;
}
