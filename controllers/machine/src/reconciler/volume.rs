//! Networked-volume preparation and teardown
//!
//! A machine with a networked volume needs three artifacts before its
//! worker pod can start: the storage-side volume, a PV binding it into the
//! cluster, and a PVC the pod claims. Each is ensured independently so a
//! partial failure resumes where it stopped.

use kube::api::PostParams;
use kube::ResourceExt;
use tracing::{debug, info};

use crds::{MachineImageState, NetworkBlockVolume, VirtualMachine};
use storage_client::CreateVolumeRequest;

use crate::error::{is_already_exists, ControllerError};
use crate::reconciler::Reconciler;
use crate::templates::{persistent_volume, persistent_volume_claim};

impl Reconciler {
    pub(crate) async fn ensure_network_volume(
        &self,
        machine: &VirtualMachine,
        block: &NetworkBlockVolume,
    ) -> Result<(), ControllerError> {
        let name = machine.name_any();
        let storage = self.storage_client().await?;

        let image_name = &machine.spec.machine_image;
        let image = self
            .stores
            .image(image_name)
            .ok_or_else(|| ControllerError::RecordNotFound(format!("machine image {}", image_name)))?;
        let image_status = image.status.clone().unwrap_or_default();
        if image_status.state != MachineImageState::Ready {
            // the volume's base image must be pullable before replicas build
            return Err(ControllerError::ImageNotReady(
                image_name.clone(),
                format!("{:?}", image_status.state),
            ));
        }

        match storage.get_volume(&name).await? {
            None => {
                storage
                    .create_volume(CreateVolumeRequest {
                        name: name.clone(),
                        frontend: block.frontend.clone(),
                        size: format!("{}Gi", image.spec.size_gib),
                        base_image: image.spec.container_image.clone(),
                        number_of_replicas: block.replicas,
                        stale_replica_timeout: block.stale_replica_timeout_sec,
                    })
                    .await?;
                info!(machine = %name, size_gib = image.spec.size_gib, "created storage volume");
            }
            Some(volume) => {
                if !machine.spec.node_name.is_empty() && volume.state == "detached" {
                    storage
                        .attach_volume(&name, &machine.spec.node_name)
                        .await?;
                    info!(machine = %name, node = %machine.spec.node_name, "attached storage volume");
                }
            }
        }

        if self.stores.pv(&name).is_none() {
            let pv = persistent_volume(machine, block, image.spec.size_gib);
            match self.pv_api.create(&PostParams::default(), &pv).await {
                Ok(_) => info!(machine = %name, "created persistent volume"),
                Err(e) if is_already_exists(&e) => {}
                Err(e) => return Err(e.into()),
            }
        }

        if self.stores.pvc(&name).is_none() {
            let pvc = persistent_volume_claim(machine, image.spec.size_gib);
            match self.pvc_api.create(&PostParams::default(), &pvc).await {
                Ok(_) => info!(machine = %name, "created persistent volume claim"),
                Err(e) if is_already_exists(&e) => {}
                Err(e) => return Err(e.into()),
            }
        }

        Ok(())
    }

    /// Remove the storage volume, PV and PVC. Safe to call repeatedly;
    /// every step tolerates the artifact being gone already.
    pub(crate) async fn teardown_network_volume(
        &self,
        machine: &VirtualMachine,
    ) -> Result<(), ControllerError> {
        let name = machine.name_any();
        let storage = self.storage_client().await?;

        if storage.get_volume(&name).await?.is_some() {
            storage.delete_volume(&name).await?;
            info!(machine = %name, "deleted storage volume");
        } else {
            debug!(machine = %name, "storage volume already gone");
        }

        self.delete_pv(&name).await?;
        self.delete_pvc(&name).await?;
        Ok(())
    }
}
