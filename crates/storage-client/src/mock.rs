//! Mock storage client for unit testing
//!
//! In-memory implementation of `StorageClientTrait`. Tests seed volumes and
//! backups directly and can flip per-operation failure switches to exercise
//! error paths without a running storage service.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::StorageError;
use crate::models::*;
use crate::storage_trait::StorageClientTrait;

/// In-memory stand-in for the block-storage service.
#[derive(Clone, Default)]
pub struct MockStorageClient {
    pub(crate) volumes: Arc<Mutex<HashMap<String, Volume>>>,
    /// volume name -> backups
    pub(crate) backups: Arc<Mutex<HashMap<String, Vec<Backup>>>>,
    /// volume name -> snapshot counter, used to mint snapshot names
    pub(crate) snapshot_seq: Arc<Mutex<HashMap<String, u32>>>,
    /// when set, every operation fails with an API error
    pub(crate) fail_all: Arc<Mutex<bool>>,
}

impl MockStorageClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a volume (for test setup).
    pub fn add_volume(&self, volume: Volume) {
        self.volumes
            .lock()
            .unwrap()
            .insert(volume.name.clone(), volume);
    }

    /// Seed a backup (for test setup).
    pub fn add_backup(&self, volume: &str, backup: Backup) {
        self.backups
            .lock()
            .unwrap()
            .entry(volume.to_string())
            .or_default()
            .push(backup);
    }

    /// Make every subsequent operation fail.
    pub fn set_fail_all(&self, fail: bool) {
        *self.fail_all.lock().unwrap() = fail;
    }

    /// Number of stored volumes.
    pub fn volume_count(&self) -> usize {
        self.volumes.lock().unwrap().len()
    }

    fn check_failure(&self) -> Result<(), StorageError> {
        if *self.fail_all.lock().unwrap() {
            return Err(StorageError::Api("mock failure injected".to_string()));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl StorageClientTrait for MockStorageClient {
    async fn get_volume(&self, name: &str) -> Result<Option<Volume>, StorageError> {
        self.check_failure()?;
        Ok(self.volumes.lock().unwrap().get(name).cloned())
    }

    async fn create_volume(&self, request: CreateVolumeRequest) -> Result<(), StorageError> {
        self.check_failure()?;
        let mut volumes = self.volumes.lock().unwrap();
        if volumes.contains_key(&request.name) {
            return Err(StorageError::Api(format!(
                "volume {} already exists",
                request.name
            )));
        }
        volumes.insert(
            request.name.clone(),
            Volume {
                name: request.name,
                frontend: request.frontend,
                size: request.size,
                base_image: request.base_image,
                number_of_replicas: request.number_of_replicas,
                stale_replica_timeout: request.stale_replica_timeout,
                robustness: "healthy".to_string(),
                state: "detached".to_string(),
                controllers: Vec::new(),
            },
        );
        Ok(())
    }

    async fn delete_volume(&self, name: &str) -> Result<(), StorageError> {
        self.check_failure()?;
        self.volumes.lock().unwrap().remove(name);
        self.backups.lock().unwrap().remove(name);
        Ok(())
    }

    async fn attach_volume(&self, name: &str, node_id: &str) -> Result<(), StorageError> {
        self.check_failure()?;
        let mut volumes = self.volumes.lock().unwrap();
        let volume = volumes
            .get_mut(name)
            .ok_or_else(|| StorageError::NotFound(format!("volume {} not found", name)))?;
        volume.state = "attached".to_string();
        volume.controllers = vec![VolumeController {
            name: format!("{}-c", name),
            endpoint: String::new(),
            node_id: node_id.to_string(),
        }];
        Ok(())
    }

    async fn create_snapshot(&self, volume: &str) -> Result<Snapshot, StorageError> {
        self.check_failure()?;
        if !self.volumes.lock().unwrap().contains_key(volume) {
            return Err(StorageError::NotFound(format!(
                "volume {} not found",
                volume
            )));
        }
        let mut seq = self.snapshot_seq.lock().unwrap();
        let n = seq.entry(volume.to_string()).or_insert(0);
        *n += 1;
        Ok(Snapshot {
            name: format!("{}-snap-{}", volume, n),
            size: String::new(),
        })
    }

    async fn create_backup(&self, volume: &str, snapshot: &str) -> Result<(), StorageError> {
        self.check_failure()?;
        self.add_backup(
            volume,
            Backup {
                name: format!("backup-{}", snapshot),
                snapshot_name: snapshot.to_string(),
                volume_name: volume.to_string(),
                url: format!(
                    "s3://backups@us-east-1/?backup=backup-{}&volume={}",
                    snapshot, volume
                ),
                labels: HashMap::new(),
            },
        );
        Ok(())
    }

    async fn get_backup(
        &self,
        volume: &str,
        snapshot: &str,
    ) -> Result<Option<Backup>, StorageError> {
        self.check_failure()?;
        Ok(self
            .backups
            .lock()
            .unwrap()
            .get(volume)
            .and_then(|list| list.iter().find(|b| b.snapshot_name == snapshot).cloned()))
    }

    async fn backup_list(&self, volume: &str) -> Result<BackupListResponse, StorageError> {
        self.check_failure()?;
        Ok(BackupListResponse {
            items: self
                .backups
                .lock()
                .unwrap()
                .get(volume)
                .cloned()
                .unwrap_or_default(),
        })
    }
}
