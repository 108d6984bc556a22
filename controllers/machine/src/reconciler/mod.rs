//! Reconciliation logic
//!
//! One `Reconciler` serves all five controllers. It reads from the shared
//! caches, writes through the apiserver, and expresses cross-kind causality
//! by enqueuing peer keys. Organized by record kind:
//! - `machine`: the VM state machine (identity, start/stop, finalization)
//! - `migrate`: the live-migration flow
//! - `volume`: networked-volume preparation and teardown
//! - `console`: console sidecar pod and service
//! - `machine_image`: the snapshot/backup/publish/provision pipeline
//! - `setting`: defaults bootstrap and storage client rebuild

pub mod console;
pub mod machine;
pub mod machine_image;
pub mod migrate;
pub mod setting;
pub mod volume;

use std::sync::Arc;

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{
    PersistentVolume, PersistentVolumeClaim, Pod, Service,
};
use kube::api::{DeleteParams, ListParams, Patch, PatchParams};
use kube::{Api, Client};
use serde_json::json;
use tokio::sync::RwLock;
use tracing::debug;

use crds::{
    MachineImage, MachineImageState, MachineImageStatus, Setting, VirtualMachine,
    VirtualMachineStatus, FINALIZER_DELETION,
};
use storage_client::StorageClientTrait;

use crate::config::Options;
use crate::error::{is_not_found, ControllerError};
use crate::labels::{worker_pod_selector, NAMESPACE};
use crate::queue::WorkQueue;
use crate::store::Stores;
use crate::templates::image_pods::PublishConfig;
use crate::templates::TemplateConfig;

/// Result of an idempotent delete: either we removed something this tick,
/// or there was nothing left to remove.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
}

/// Shared reconciler for every record kind.
pub struct Reconciler {
    pub machine_api: Api<VirtualMachine>,
    pub image_api: Api<MachineImage>,
    pub setting_api: Api<Setting>,
    pub pod_api: Api<Pod>,
    pub service_api: Api<Service>,
    pub job_api: Api<Job>,
    pub pv_api: Api<PersistentVolume>,
    pub pvc_api: Api<PersistentVolumeClaim>,

    pub stores: Stores,
    pub machine_queue: Arc<WorkQueue>,
    pub image_queue: Arc<WorkQueue>,
    pub options: Options,

    /// Rebuilt by the settings reconciler whenever storage settings change.
    storage: RwLock<Option<Arc<dyn StorageClientTrait>>>,
}

impl Reconciler {
    pub fn new(
        client: &Client,
        stores: Stores,
        machine_queue: Arc<WorkQueue>,
        image_queue: Arc<WorkQueue>,
        options: Options,
    ) -> Self {
        Self {
            machine_api: Api::all(client.clone()),
            image_api: Api::all(client.clone()),
            setting_api: Api::all(client.clone()),
            pod_api: Api::namespaced(client.clone(), NAMESPACE),
            service_api: Api::namespaced(client.clone(), NAMESPACE),
            job_api: Api::namespaced(client.clone(), NAMESPACE),
            pv_api: Api::all(client.clone()),
            pvc_api: Api::namespaced(client.clone(), NAMESPACE),
            stores,
            machine_queue,
            image_queue,
            options,
            storage: RwLock::new(None),
        }
    }

    /// The configured storage client, or an error that requeues the key
    /// until the settings reconciler has built one.
    pub(crate) async fn storage_client(
        &self,
    ) -> Result<Arc<dyn StorageClientTrait>, ControllerError> {
        self.storage.read().await.clone().ok_or_else(|| {
            ControllerError::InvalidConfig("storage client not initialized".to_string())
        })
    }

    pub(crate) async fn replace_storage_client(
        &self,
        client: Option<Arc<dyn StorageClientTrait>>,
    ) {
        *self.storage.write().await = client;
    }

    pub(crate) fn template_config(&self) -> TemplateConfig {
        TemplateConfig {
            bridge_iface: self.options.bridge_iface.clone(),
            no_resource_limits: self.options.no_resource_limits,
            image_vm: self.options.image_vm.clone(),
            image_console: self.options.image_console.clone(),
            image_tools: self.options.image_tools.clone(),
            pull_secret: self.stores.setting_value(crds::SettingName::RegistrySecret),
        }
    }

    pub(crate) fn publish_config(&self) -> PublishConfig {
        PublishConfig {
            engine_image: self.stores.setting_value(crds::SettingName::ImageEngine),
            builder_image: self.stores.setting_value(crds::SettingName::ImageBuilder),
            registry_insecure: self
                .stores
                .setting_value(crds::SettingName::RegistryInsecure)
                == "true",
            registry_secret: self.stores.setting_value(crds::SettingName::RegistrySecret),
        }
    }

    // ---- status and metadata writes --------------------------------------

    /// Write the machine status if it differs from the cached record.
    pub(crate) async fn sync_machine_status(
        &self,
        machine: &VirtualMachine,
        status: &VirtualMachineStatus,
    ) -> Result<(), ControllerError> {
        if machine.status.as_ref() == Some(status) {
            return Ok(());
        }
        let name = machine
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| ControllerError::InvalidConfig("machine without a name".to_string()))?;
        debug!(machine = name, state = ?status.state, "updating machine status");
        self.machine_api
            .patch_status(
                name,
                &PatchParams::default(),
                &Patch::Merge(json!({ "status": status })),
            )
            .await?;
        Ok(())
    }

    pub(crate) async fn persist_machine_finalizers(
        &self,
        name: &str,
        finalizers: Vec<String>,
    ) -> Result<(), ControllerError> {
        self.machine_api
            .patch(
                name,
                &PatchParams::default(),
                &Patch::Merge(json!({ "metadata": { "finalizers": finalizers } })),
            )
            .await?;
        Ok(())
    }

    pub(crate) async fn persist_machine_action(
        &self,
        name: &str,
        action: crds::MachineAction,
    ) -> Result<(), ControllerError> {
        self.machine_api
            .patch(
                name,
                &PatchParams::default(),
                &Patch::Merge(json!({ "spec": { "action": action } })),
            )
            .await?;
        Ok(())
    }

    /// Write the image status if it differs from the cached record.
    pub(crate) async fn sync_image_status(
        &self,
        image: &MachineImage,
        status: &MachineImageStatus,
    ) -> Result<(), ControllerError> {
        if image.status.as_ref() == Some(status) {
            return Ok(());
        }
        let name = image
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| ControllerError::InvalidConfig("image without a name".to_string()))?;
        debug!(image = name, state = ?status.state, "updating image status");
        self.image_api
            .patch_status(
                name,
                &PatchParams::default(),
                &Patch::Merge(json!({ "status": status })),
            )
            .await?;
        Ok(())
    }

    pub(crate) async fn persist_image_state(
        &self,
        image: &MachineImage,
        state: MachineImageState,
    ) -> Result<(), ControllerError> {
        let mut status = image.status.clone().unwrap_or_default();
        status.state = state;
        self.sync_image_status(image, &status).await
    }

    // ---- idempotent deletes ----------------------------------------------

    pub(crate) async fn delete_pod(&self, name: &str) -> Result<DeleteOutcome, ControllerError> {
        map_delete(self.pod_api.delete(name, &DeleteParams::default()).await)
    }

    pub(crate) async fn delete_service(
        &self,
        name: &str,
    ) -> Result<DeleteOutcome, ControllerError> {
        map_delete(self.service_api.delete(name, &DeleteParams::default()).await)
    }

    pub(crate) async fn delete_job(&self, name: &str) -> Result<DeleteOutcome, ControllerError> {
        map_delete(self.job_api.delete(name, &DeleteParams::default()).await)
    }

    /// Foreground deletion waits for the job's pods before the job goes.
    pub(crate) async fn delete_job_foreground(
        &self,
        name: &str,
    ) -> Result<DeleteOutcome, ControllerError> {
        map_delete(self.job_api.delete(name, &DeleteParams::foreground()).await)
    }

    pub(crate) async fn delete_pv(&self, name: &str) -> Result<DeleteOutcome, ControllerError> {
        map_delete(self.pv_api.delete(name, &DeleteParams::default()).await)
    }

    pub(crate) async fn delete_pvc(&self, name: &str) -> Result<DeleteOutcome, ControllerError> {
        map_delete(self.pvc_api.delete(name, &DeleteParams::default()).await)
    }

    /// Delete every worker pod of a machine through one collection call.
    /// Reports NotFound when the cache shows none left.
    pub(crate) async fn delete_worker_pods(
        &self,
        machine: &str,
    ) -> Result<DeleteOutcome, ControllerError> {
        if self.stores.worker_pods(machine).is_empty() {
            return Ok(DeleteOutcome::NotFound);
        }
        let selector = worker_pod_selector(machine);
        debug!(machine, selector = %selector, "deleting worker pods");
        self.pod_api
            .delete_collection(
                &DeleteParams::default(),
                &ListParams::default().labels(&selector),
            )
            .await?;
        Ok(DeleteOutcome::Deleted)
    }
}

fn map_delete<T>(result: Result<T, kube::Error>) -> Result<DeleteOutcome, ControllerError> {
    match result {
        Ok(_) => Ok(DeleteOutcome::Deleted),
        Err(e) if is_not_found(&e) => Ok(DeleteOutcome::NotFound),
        Err(e) => Err(e.into()),
    }
}

/// Finalizer list of a live machine: existing finalizers plus ours.
pub(crate) fn with_deletion_finalizer(existing: &[String]) -> Vec<String> {
    let mut finalizers = existing.to_vec();
    if !finalizers.iter().any(|f| f == FINALIZER_DELETION) {
        finalizers.push(FINALIZER_DELETION.to_string());
    }
    finalizers
}
