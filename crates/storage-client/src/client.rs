//! Block-storage API client
//!
//! Thin REST client against the configured storage endpoint. Requests carry
//! optional HTTP basic auth; TLS verification can be suppressed for
//! self-signed endpoints. Volume actions use the service's
//! `?action=` POST convention.

use std::time::Duration;

use reqwest::{Client, RequestBuilder, Response, StatusCode};
use tracing::debug;

use crate::error::StorageError;
use crate::models::*;
use crate::storage_trait::StorageClientTrait;

/// Client for the block-storage REST API.
pub struct StorageClient {
    client: Client,
    endpoint: String,
    access_key: String,
    secret_key: String,
}

impl StorageClient {
    /// Create a new storage client.
    ///
    /// # Arguments
    /// * `endpoint` - base URL of the service (e.g. "http://longhorn-backend:9500")
    /// * `access_key` / `secret_key` - basic auth pair; both empty disables auth
    /// * `insecure_skip_verify` - accept invalid TLS certificates
    pub fn new(
        endpoint: String,
        access_key: String,
        secret_key: String,
        insecure_skip_verify: bool,
    ) -> Result<Self, StorageError> {
        if endpoint.is_empty() {
            return Err(StorageError::InvalidRequest(
                "storage endpoint is not configured".to_string(),
            ));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .danger_accept_invalid_certs(insecure_skip_verify)
            .build()
            .map_err(StorageError::Http)?;

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            access_key,
            secret_key,
        })
    }

    /// The configured base URL.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn authorize(&self, req: RequestBuilder) -> RequestBuilder {
        if !self.access_key.is_empty() && !self.secret_key.is_empty() {
            req.basic_auth(&self.access_key, Some(&self.secret_key))
        } else {
            req
        }
    }

    async fn get(&self, path: &str) -> Result<Response, StorageError> {
        let url = format!("{}{}", self.endpoint, path);
        debug!(%url, "storage GET");
        Ok(self.authorize(self.client.get(&url)).send().await?)
    }

    async fn post<B: serde::Serialize>(
        &self,
        path: &str,
        body: Option<&B>,
    ) -> Result<Response, StorageError> {
        let url = format!("{}{}", self.endpoint, path);
        debug!(%url, "storage POST");
        let mut req = self
            .authorize(self.client.post(&url))
            .header("Content-Type", "application/json");
        if let Some(body) = body {
            req = req.json(body);
        }
        Ok(req.send().await?)
    }

    async fn delete(&self, path: &str) -> Result<Response, StorageError> {
        let url = format!("{}{}", self.endpoint, path);
        debug!(%url, "storage DELETE");
        Ok(self.authorize(self.client.delete(&url)).send().await?)
    }
}

async fn api_error(op: &str, resp: Response) -> StorageError {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    StorageError::Api(format!("{} failed: {} - {}", op, status, body))
}

#[async_trait::async_trait]
impl StorageClientTrait for StorageClient {
    async fn get_volume(&self, name: &str) -> Result<Option<Volume>, StorageError> {
        let resp = self.get(&format!("/v1/volumes/{}", name)).await?;
        match resp.status() {
            StatusCode::OK => Ok(Some(resp.json().await?)),
            StatusCode::NOT_FOUND => Ok(None),
            _ => Err(api_error("GetVolume", resp).await),
        }
    }

    async fn create_volume(&self, request: CreateVolumeRequest) -> Result<(), StorageError> {
        let resp = self.post("/v1/volumes", Some(&request)).await?;
        if resp.status() != StatusCode::OK {
            return Err(api_error("CreateVolume", resp).await);
        }
        Ok(())
    }

    async fn delete_volume(&self, name: &str) -> Result<(), StorageError> {
        let resp = self.delete(&format!("/v1/volumes/{}", name)).await?;
        if resp.status() != StatusCode::OK {
            return Err(api_error("DeleteVolume", resp).await);
        }
        Ok(())
    }

    async fn attach_volume(&self, name: &str, node_id: &str) -> Result<(), StorageError> {
        let body = AttachVolumeRequest {
            node_id: node_id.to_string(),
        };
        let resp = self
            .post(&format!("/v1/volumes/{}?action=attach", name), Some(&body))
            .await?;
        if resp.status() != StatusCode::OK {
            return Err(api_error("AttachVolume", resp).await);
        }
        Ok(())
    }

    async fn create_snapshot(&self, volume: &str) -> Result<Snapshot, StorageError> {
        let resp = self
            .post(
                &format!("/v1/volumes/{}?action=snapshotCreate", volume),
                Some(&serde_json::json!({})),
            )
            .await?;
        if resp.status() != StatusCode::OK {
            return Err(api_error("CreateSnapshot", resp).await);
        }
        Ok(resp.json().await?)
    }

    async fn create_backup(&self, volume: &str, snapshot: &str) -> Result<(), StorageError> {
        let body = CreateBackupRequest {
            name: snapshot.to_string(),
        };
        let resp = self
            .post(
                &format!("/v1/volumes/{}?action=snapshotBackup", volume),
                Some(&body),
            )
            .await?;
        if resp.status() != StatusCode::OK {
            return Err(api_error("CreateBackup", resp).await);
        }
        Ok(())
    }

    async fn get_backup(
        &self,
        volume: &str,
        snapshot: &str,
    ) -> Result<Option<Backup>, StorageError> {
        let list = self.backup_list(volume).await?;
        Ok(list
            .items
            .into_iter()
            .find(|b| b.snapshot_name == snapshot))
    }

    async fn backup_list(&self, volume: &str) -> Result<BackupListResponse, StorageError> {
        let resp = self
            .post::<serde_json::Value>(
                &format!("/v1/backupvolumes/{}?action=backupList", volume),
                None,
            )
            .await?;
        match resp.status() {
            StatusCode::OK => Ok(resp.json().await?),
            // The service answers 404 until the first backup of a volume
            // lands in the object store.
            StatusCode::NOT_FOUND => Ok(BackupListResponse::default()),
            _ => Err(api_error("BackupList", resp).await),
        }
    }
}
