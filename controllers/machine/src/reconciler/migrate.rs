//! Live-migration flow
//!
//! Entered from the start path when the pinned node differs from where the
//! running pod sits, or whenever the machine is already Migrating. The flow
//! converges on a second worker pod on the target node, runs the QMP driver
//! job next to the source pod, and on success retires the source pod. A
//! user re-pinning back to the source node rolls the whole thing back.

use kube::api::PostParams;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use k8s_openapi::api::core::v1::Pod;

use crds::{MachineAction, MachineState, VirtualMachine};

use crate::error::{is_already_exists, ControllerError};
use crate::helpers::{
    alive_pods, is_pod_ready, machine_state_for_pod, migration_cancelled, order_migration_pods,
    pod_node_name,
};
use crate::labels::{console_pod_name, migration_job_name, ANNOTATION_MIGRATE_PORT};
use crate::reconciler::Reconciler;
use crate::templates::{ephemeral_worker_pod, migration_job, network_volume_worker_pod};

impl Reconciler {
    pub(crate) async fn migrate_machine(
        &self,
        machine: &VirtualMachine,
    ) -> Result<(), ControllerError> {
        let name = machine.name_any();
        let mut machine = machine.clone();
        let state = machine.status.clone().unwrap_or_default().state;

        match state {
            MachineState::Migrating => {}
            MachineState::Running => {
                let mut status = machine.status.clone().unwrap_or_default();
                status.state = MachineState::Migrating;
                self.sync_machine_status(&machine, &status).await?;
                info!(machine = %name, target = %machine.spec.node_name, "machine entering migration");
                machine.status = Some(status);
            }
            other => {
                return Err(ControllerError::MigrationUnavailable(
                    name,
                    format!("{:?}", other),
                ))
            }
        }

        let alive = alive_pods(self.stores.worker_pods(&name));
        match alive.len() {
            1 => self.start_migration_target(&machine).await,
            2 => {
                let (old_pod, new_pod) =
                    order_migration_pods(alive[0].clone(), alive[1].clone());

                if migration_cancelled(&machine, pod_node_name(&old_pod)) {
                    return self.rollback_migration(&machine, &new_pod).await;
                }

                if !is_pod_ready(&old_pod) || !is_pod_ready(&new_pod) {
                    debug!(machine = %name, "waiting for both migration pods to become ready");
                    return Ok(());
                }

                self.run_migration_job(&machine, &old_pod, &new_pod).await
            }
            n => {
                warn!(machine = %name, pods = n, "unexpected alive pod count during migration");
                Ok(())
            }
        }
    }

    /// Create the second worker pod on the target node. The migrate flag
    /// makes the template allocate a listen port and start QEMU in
    /// incoming mode.
    async fn start_migration_target(
        &self,
        machine: &VirtualMachine,
    ) -> Result<(), ControllerError> {
        let name = machine.name_any();
        let public_keys = self.resolve_public_keys(machine)?;
        let config = self.template_config();

        let rendered = if machine.spec.volume.network_block().is_some() {
            network_volume_worker_pod(machine, &public_keys, &config, true)
        } else {
            let image = self.stores.image(&machine.spec.machine_image).ok_or_else(|| {
                ControllerError::RecordNotFound(format!(
                    "machine image {}",
                    machine.spec.machine_image
                ))
            })?;
            ephemeral_worker_pod(machine, &image, &public_keys, &config, true)
        };

        match self.pod_api.create(&PostParams::default(), &rendered).await {
            Ok(created) => {
                info!(
                    machine = %name,
                    pod = %created.name_any(),
                    target = %machine.spec.node_name,
                    "created migration target pod"
                );
                Ok(())
            }
            Err(e) if is_already_exists(&e) => {
                debug!(machine = %name, "migration target create raced the cache");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Drop the target pod and the job, and return to Running on the
    /// source node.
    async fn rollback_migration(
        &self,
        machine: &VirtualMachine,
        new_pod: &Pod,
    ) -> Result<(), ControllerError> {
        let name = machine.name_any();
        info!(machine = %name, "user cancelled migration, rolling back");

        self.delete_job(&migration_job_name(&name)).await?;
        self.delete_pod(&new_pod.name_any()).await?;

        let mut status = machine.status.clone().unwrap_or_default();
        status.state = MachineState::Running;
        self.sync_machine_status(machine, &status).await
    }

    /// Ensure the migration job exists and, once it has succeeded, retire
    /// the source pod.
    async fn run_migration_job(
        &self,
        machine: &VirtualMachine,
        old_pod: &Pod,
        new_pod: &Pod,
    ) -> Result<(), ControllerError> {
        let name = machine.name_any();

        let job = match self.stores.job(&migration_job_name(&name)) {
            Some(job) => job,
            None => {
                let port = new_pod
                    .metadata
                    .annotations
                    .as_ref()
                    .and_then(|a| a.get(ANNOTATION_MIGRATE_PORT))
                    .ok_or_else(|| ControllerError::MissingMigratePort(name.clone()))?;
                let Some(pod_ip) = new_pod.status.as_ref().and_then(|s| s.pod_ip.clone()) else {
                    debug!(machine = %name, "target pod has no IP yet");
                    return Ok(());
                };
                let target_uri = format!("tcp:{}:{}", pod_ip, port);
                let rendered = migration_job(
                    machine,
                    &old_pod.name_any(),
                    &target_uri,
                    &self.template_config(),
                );
                match self.job_api.create(&PostParams::default(), &rendered).await {
                    Ok(_) => {
                        info!(machine = %name, %target_uri, "created migration job");
                    }
                    Err(e) if is_already_exists(&e) => {}
                    Err(e) => return Err(e.into()),
                }
                return Ok(());
            }
        };

        let succeeded = job
            .status
            .as_ref()
            .and_then(|s| s.succeeded)
            .unwrap_or_default()
            == 1;
        if !succeeded {
            debug!(machine = %name, "migration job still running");
            return Ok(());
        }

        self.finish_migration(machine, old_pod, new_pod).await
    }

    /// The guest now runs in the target pod: point status there, retire the
    /// source pod and the job, and force the console sidecar to re-create
    /// on the new node.
    async fn finish_migration(
        &self,
        machine: &VirtualMachine,
        old_pod: &Pod,
        new_pod: &Pod,
    ) -> Result<(), ControllerError> {
        let name = machine.name_any();

        if machine.spec.action != MachineAction::Start {
            self.persist_machine_action(&name, MachineAction::Start)
                .await?;
        }

        let mut status = machine.status.clone().unwrap_or_default();
        if let Some(node) = pod_node_name(new_pod) {
            status.node_name = node.to_string();
        }
        if let Some(host_ip) = new_pod.status.as_ref().and_then(|s| s.host_ip.clone()) {
            status.node_ip = host_ip;
        }
        status.state = machine_state_for_pod(new_pod);
        self.sync_machine_status(machine, &status).await?;

        self.delete_pod(&old_pod.name_any()).await?;
        self.delete_job_foreground(&migration_job_name(&name)).await?;
        self.delete_pod(&console_pod_name(&name)).await?;

        info!(
            machine = %name,
            node = %status.node_name,
            "migration complete"
        );
        Ok(())
    }
}
