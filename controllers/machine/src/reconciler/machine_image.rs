//! MachineImage pipeline
//!
//! Drives an image to Ready in order: size inheritance, snapshot, backup,
//! publish, then per-node provisioning. Each pipeline mutation is a single
//! reconciliation step; the status write triggers the event that re-enters
//! the next step. Images captured from a machine walk the whole pipeline,
//! pre-packaged images skip straight to provisioning.

use kube::api::{Patch, PatchParams, PostParams};
use kube::ResourceExt;
use serde_json::json;
use tracing::{debug, error, info, warn};

use k8s_openapi::api::core::v1::Node;

use crds::{MachineImage, MachineImageState, MachineImageStatus};

use crate::error::{is_already_exists, ControllerError};
use crate::helpers::{image_nodes_satisfied, validate_backup_url};
use crate::labels::{publish_pod_name, pull_pod_name, BACKUP_LABEL_BASE_IMAGE};
use crate::reconciler::Reconciler;
use crate::templates::{publish_pod, pull_pod};

/// Container of the publish pod whose exit code decides the build outcome.
const BUILDER_CONTAINER: &str = "builder";

fn node_has_image(node: &Node, container_image: &str) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.images.as_ref())
        .map(|images| {
            images.iter().any(|image| {
                image
                    .names
                    .as_ref()
                    .map(|names| names.iter().any(|n| n == container_image))
                    .unwrap_or(false)
            })
        })
        .unwrap_or(false)
}

impl Reconciler {
    /// Reconcile one machine image key.
    pub async fn reconcile_machine_image(&self, name: &str) -> Result<(), ControllerError> {
        let Some(image) = self.stores.image(name) else {
            debug!(image = name, "image gone from cache, nothing to do");
            return Ok(());
        };
        let status = image.status.clone().unwrap_or_default();

        if status.state == MachineImageState::Failed {
            // fatal publish failure; wait for the user to edit the record
            debug!(image = name, "image is Failed, skipping");
            return Ok(());
        }

        if !image.spec.from_virtual_machine.is_empty() {
            if self.capture_from_machine(&image, &status).await? {
                return Ok(());
            }
        } else if !status.published {
            let mut updated = status.clone();
            updated.published = true;
            self.sync_image_status(&image, &updated).await?;
            return Ok(());
        }

        self.provision_nodes(&image).await
    }

    /// Walk the capture pipeline for an image sourced from a machine.
    /// Returns true when a step wrote this tick (the caller stops there).
    async fn capture_from_machine(
        &self,
        image: &MachineImage,
        status: &MachineImageStatus,
    ) -> Result<bool, ControllerError> {
        let name = image.name_any();
        let source = &image.spec.from_virtual_machine;
        let machine = self
            .stores
            .machine(source)
            .ok_or_else(|| ControllerError::RecordNotFound(format!("machine {}", source)))?;

        if image.spec.size_gib == 0 {
            let parent_name = &machine.spec.machine_image;
            let parent = self.stores.image(parent_name).ok_or_else(|| {
                ControllerError::RecordNotFound(format!("machine image {}", parent_name))
            })?;
            info!(
                image = %name,
                size_gib = parent.spec.size_gib,
                "inheriting size from the source machine's image"
            );
            self.image_api
                .patch(
                    &name,
                    &PatchParams::default(),
                    &Patch::Merge(json!({ "spec": { "sizeGiB": parent.spec.size_gib } })),
                )
                .await?;
            return Ok(true);
        }

        if machine.spec.volume.network_block().is_none() {
            return Err(ControllerError::InvalidConfig(format!(
                "machine {} referenced by image {} has no networked volume to capture",
                source, name
            )));
        }

        if status.snapshot_name.is_empty() {
            if status.state != MachineImageState::Snapshot {
                self.persist_image_state(image, MachineImageState::Snapshot)
                    .await?;
                return Ok(true);
            }
            let storage = self.storage_client().await?;
            let snapshot = storage.create_snapshot(source).await?;
            info!(image = %name, snapshot = %snapshot.name, "created source snapshot");
            let mut updated = status.clone();
            updated.snapshot_name = snapshot.name;
            self.sync_image_status(image, &updated).await?;
            return Ok(true);
        }

        if status.backup_url.is_empty() {
            if status.state != MachineImageState::Backup {
                self.persist_image_state(image, MachineImageState::Backup)
                    .await?;
                return Ok(true);
            }
            self.capture_backup(image, status).await?;
            return Ok(true);
        }

        if !status.published {
            if status.state != MachineImageState::Publish {
                self.persist_image_state(image, MachineImageState::Publish)
                    .await?;
                return Ok(true);
            }
            self.publish_image(image).await?;
            return Ok(true);
        }

        Ok(false)
    }

    /// Ensure a backup of the snapshot exists and record its URL, plus the
    /// backing image the backup may be labeled with.
    async fn capture_backup(
        &self,
        image: &MachineImage,
        status: &MachineImageStatus,
    ) -> Result<(), ControllerError> {
        let name = image.name_any();
        let volume = &image.spec.from_virtual_machine;
        let snapshot = &status.snapshot_name;
        let storage = self.storage_client().await?;

        let backup = match storage.get_backup(volume, snapshot).await? {
            Some(backup) => Some(backup),
            None => {
                storage.create_backup(volume, snapshot).await?;
                storage.get_backup(volume, snapshot).await?
            }
        };
        let Some(backup) = backup else {
            // the backup shows up asynchronously in the object store
            debug!(image = %name, "backup not visible yet, polling");
            self.image_queue.add_rate_limited(&name);
            return Ok(());
        };

        validate_backup_url(&backup.url).map_err(ControllerError::InvalidBackupUrl)?;

        let mut updated = status.clone();
        updated.backup_url = backup.url.clone();
        if let Some(base_image) = backup.labels.get(BACKUP_LABEL_BASE_IMAGE) {
            updated.base_image = base_image.clone();
        }
        info!(image = %name, url = %backup.url, "recorded backup");
        self.sync_image_status(image, &updated).await
    }

    /// Run the build pod and track the builder container to completion.
    async fn publish_image(&self, image: &MachineImage) -> Result<(), ControllerError> {
        let name = image.name_any();
        let pod_name = publish_pod_name(&name);

        let pod = match self.stores.pod(&pod_name) {
            Some(pod) => pod,
            None => {
                let rendered = publish_pod(image, &self.publish_config());
                match self.pod_api.create(&PostParams::default(), &rendered).await {
                    Ok(created) => {
                        info!(image = %name, pod = %pod_name, "created publish pod");
                        std::sync::Arc::new(created)
                    }
                    Err(e) if is_already_exists(&e) => return Ok(()),
                    Err(e) => return Err(e.into()),
                }
            }
        };

        let builder_exit = pod
            .status
            .as_ref()
            .and_then(|s| s.container_statuses.as_ref())
            .and_then(|statuses| {
                statuses
                    .iter()
                    .find(|cs| cs.name == BUILDER_CONTAINER)
                    .and_then(|cs| cs.state.as_ref())
                    .and_then(|state| state.terminated.as_ref())
                    .map(|t| t.exit_code)
            });

        match builder_exit {
            None => Ok(()),
            Some(0) => {
                self.delete_pod(&pod_name).await?;
                let mut updated = image.status.clone().unwrap_or_default();
                updated.published = true;
                info!(image = %name, "image published");
                self.sync_image_status(image, &updated).await
            }
            Some(code) => {
                error!(image = %name, exit_code = code, "publish build failed");
                self.persist_image_state(image, MachineImageState::Failed)
                    .await
            }
        }
    }

    /// Pre-pull the image onto nodes until enough hold it, then flip the
    /// image Ready and wake every machine waiting on it.
    async fn provision_nodes(&self, image: &MachineImage) -> Result<(), ControllerError> {
        let name = image.name_any();
        let status = image.status.clone().unwrap_or_default();
        let nodes = self.stores.nodes.state();

        let mut ready = Vec::new();
        for node in &nodes {
            let node_name = node.name_any();
            let pull_name = pull_pod_name(&name, &node_name);

            if status.nodes_ready.contains(&node_name)
                || node_has_image(node, &image.spec.container_image)
            {
                ready.push(node_name);
                if self.stores.pod(&pull_name).is_some() {
                    self.delete_pod(&pull_name).await?;
                }
                continue;
            }

            match self.stores.pod(&pull_name) {
                Some(pod) => {
                    let phase = pod
                        .status
                        .as_ref()
                        .and_then(|s| s.phase.clone())
                        .unwrap_or_else(|| "Unknown".to_string());
                    match phase.as_str() {
                        "Pending" | "Running" => {}
                        "Succeeded" => {
                            ready.push(node_name);
                            self.delete_pod(&pull_name).await?;
                        }
                        _ => {
                            warn!(image = %name, pod = %pull_name, %phase, "pull pod failed, retrying");
                            self.delete_pod(&pull_name).await?;
                        }
                    }
                }
                None => {
                    let rendered = pull_pod(image, &node_name);
                    match self.pod_api.create(&PostParams::default(), &rendered).await {
                        Ok(_) => debug!(image = %name, node = %node_name, "created pull pod"),
                        Err(e) if is_already_exists(&e) => {}
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }
        ready.sort();
        ready.dedup();

        let minimum: usize = self
            .stores
            .setting_value(crds::SettingName::ImageMinimumReplicas)
            .parse()
            .map_err(|_| {
                ControllerError::InvalidConfig(
                    "image-minimum-replicas setting is not an integer".to_string(),
                )
            })?;

        let new_state = if image_nodes_satisfied(ready.len(), nodes.len(), minimum) {
            MachineImageState::Ready
        } else {
            MachineImageState::Provision
        };

        let mut updated = status.clone();
        updated.state = new_state;
        updated.nodes_ready = ready;
        self.sync_image_status(image, &updated).await?;

        if status.state == MachineImageState::Provision && new_state == MachineImageState::Ready {
            let waiting = self.stores.machines_for_image(&name);
            info!(
                image = %name,
                machines = waiting.len(),
                "image became Ready, waking machines"
            );
            for machine in waiting {
                self.machine_queue.add(&machine);
            }
        }
        Ok(())
    }
}
