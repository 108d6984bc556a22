//! Settings reconciliation
//!
//! Creates missing settings from the bundled defaults at leader start, and
//! rebuilds the storage client whenever a setting changes. The settings
//! queue carries no per-key meaning; any event re-derives the client from
//! the current table.

use std::sync::Arc;

use kube::api::PostParams;
use tracing::{info, warn};

use crds::{Setting, SettingName, SettingSpec};
use storage_client::StorageClient;

use crate::error::{is_already_exists, ControllerError};
use crate::reconciler::Reconciler;

impl Reconciler {
    /// Create every missing setting from its default. Runs once per
    /// leadership session before the workers start.
    pub async fn initialize_settings(&self) -> Result<(), ControllerError> {
        for name in SettingName::ALL {
            if self.stores.setting(name).is_some() {
                continue;
            }
            let setting = Setting::new(
                name.as_str(),
                SettingSpec {
                    value: name.default_value().to_string(),
                },
            );
            match self.setting_api.create(&PostParams::default(), &setting).await {
                Ok(_) => info!(setting = name.as_str(), "created setting from default"),
                Err(e) if is_already_exists(&e) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Reconcile one setting key: recompute the storage client.
    pub async fn reconcile_setting(&self, _name: &str) -> Result<(), ControllerError> {
        self.rebuild_storage_client().await
    }

    /// Build a fresh storage client from the storage-related settings.
    pub async fn rebuild_storage_client(&self) -> Result<(), ControllerError> {
        let endpoint = self.stores.setting_value(SettingName::StorageEndpoint);
        let access_key = self.stores.setting_value(SettingName::StorageAccessKey);
        let secret_key = self.stores.setting_value(SettingName::StorageSecretKey);
        let insecure =
            self.stores.setting_value(SettingName::StorageInsecureSkipVerify) == "true";

        match StorageClient::new(endpoint.clone(), access_key, secret_key, insecure) {
            Ok(client) => {
                info!(%endpoint, "storage client configured");
                self.replace_storage_client(Some(Arc::new(client))).await;
                Ok(())
            }
            Err(e) => {
                warn!(%endpoint, error = %e, "storage client not configured");
                self.replace_storage_client(None).await;
                Err(e.into())
            }
        }
    }
}
