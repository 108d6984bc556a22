//! Machine state machine
//!
//! Entry point for VirtualMachine keys. Preconditions run in order and the
//! first one that writes returns; the next event re-enters. Every step is
//! idempotent, so stale cache reads at worst cost one extra tick.

use kube::api::PostParams;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use crds::{
    instance_id, mac_address, MachineAction, MachineState, VirtualMachine, FINALIZER_DELETION,
};

use crate::error::{is_already_exists, ControllerError};
use crate::helpers::{
    alive_pods, is_pod_unschedulable, machine_state_for_pod, pod_node_name,
    required_affinity_node, should_migrate,
};
use crate::labels::{console_pod_name, console_service_name, migration_job_name};
use crate::reconciler::{with_deletion_finalizer, DeleteOutcome, Reconciler};
use crate::templates::{ephemeral_worker_pod, network_volume_worker_pod};

use k8s_openapi::api::core::v1::Pod;

impl Reconciler {
    /// Reconcile one machine key.
    pub async fn reconcile_machine(&self, name: &str) -> Result<(), ControllerError> {
        let Some(machine) = self.stores.machine(name) else {
            debug!(machine = name, "machine gone from cache, nothing to do");
            return Ok(());
        };

        if machine.metadata.deletion_timestamp.is_some() {
            return self.finalize_machine(&machine).await;
        }

        if self.ensure_identity(&machine).await? {
            // identity written this tick, the update event re-enters
            return Ok(());
        }

        match machine.spec.action {
            MachineAction::Start => self.start_machine(&machine).await,
            MachineAction::Stop => self.stop_machine(&machine).await.map(|_| ()),
            MachineAction::Reboot => self.reboot_machine(&machine).await,
            MachineAction::Unknown => {
                warn!(machine = name, "machine carries an unknown action, ignoring");
                Ok(())
            }
        }
    }

    /// Assign instance id, MAC and the deletion finalizer exactly once.
    async fn ensure_identity(&self, machine: &VirtualMachine) -> Result<bool, ControllerError> {
        let status = machine.status.clone().unwrap_or_default();
        let has_finalizer = machine
            .finalizers()
            .iter()
            .any(|f| f == FINALIZER_DELETION);
        if !status.instance_id.is_empty() && !status.mac.is_empty() && has_finalizer {
            return Ok(false);
        }

        let name = machine.name_any();
        let uid = machine.uid().ok_or_else(|| {
            ControllerError::InvalidConfig(format!("machine {} has no uid", name))
        })?;

        self.persist_machine_finalizers(&name, with_deletion_finalizer(machine.finalizers()))
            .await?;

        let mut status = status;
        if status.instance_id.is_empty() {
            status.instance_id = instance_id(&uid);
        }
        if status.mac.is_empty() {
            status.mac = mac_address(&uid);
        }
        self.sync_machine_status(machine, &status).await?;

        info!(
            machine = %name,
            instance_id = %status.instance_id,
            mac = %status.mac,
            "assigned machine identity"
        );
        Ok(true)
    }

    async fn start_machine(&self, machine: &VirtualMachine) -> Result<(), ControllerError> {
        if let Some(block) = machine.spec.volume.network_block() {
            self.ensure_network_volume(machine, block).await?;
        }

        let (pod, status) = self.converge_worker_pod(machine).await?;

        if let Some(pod) = &pod {
            let pod_name = pod.name_any();
            self.sync_console(machine, &status, &pod_name).await?;

            // The user may fix the pin of a machine stuck Pending on a node
            // that cannot host it; drop the stale pod so the next tick
            // recreates it with corrected affinity.
            if status.state == MachineState::Pending && is_pod_unschedulable(pod) {
                if let Some(required) = required_affinity_node(pod) {
                    if required != machine.spec.node_name {
                        info!(
                            machine = %machine.name_any(),
                            pod = %pod_name,
                            "node selector changed while unschedulable, recreating pod"
                        );
                        self.delete_pod(&pod_name).await?;
                        return Ok(());
                    }
                }
            }
        }

        let mut current = (*machine).clone();
        current.status = Some(status);
        if should_migrate(&current, pod.as_ref().and_then(pod_node_name)) {
            return self.migrate_machine(&current).await;
        }
        Ok(())
    }

    /// Converge on exactly one alive worker pod and derive machine status
    /// from it. Returns no pod while a migration holds two pods alive.
    async fn converge_worker_pod(
        &self,
        machine: &VirtualMachine,
    ) -> Result<(Option<Pod>, crds::VirtualMachineStatus), ControllerError> {
        let name = machine.name_any();
        let image_name = &machine.spec.machine_image;
        let image = self
            .stores
            .image(image_name)
            .ok_or_else(|| ControllerError::RecordNotFound(format!("machine image {}", image_name)))?;
        let image_state = image.status.clone().unwrap_or_default().state;
        if image_state != crds::MachineImageState::Ready {
            return Err(ControllerError::ImageNotReady(
                image_name.clone(),
                format!("{:?}", image_state),
            ));
        }

        let public_keys = self.resolve_public_keys(machine)?;

        let alive = alive_pods(self.stores.worker_pods(&name));
        let pod = match alive.len() {
            0 => {
                let config = self.template_config();
                let rendered = if machine.spec.volume.network_block().is_some() {
                    network_volume_worker_pod(machine, &public_keys, &config, false)
                } else {
                    ephemeral_worker_pod(machine, &image, &public_keys, &config, false)
                };
                match self.pod_api.create(&PostParams::default(), &rendered).await {
                    Ok(created) => {
                        info!(machine = %name, pod = %created.name_any(), "created worker pod");
                        created
                    }
                    Err(e) if is_already_exists(&e) => {
                        debug!(machine = %name, "worker pod create raced the cache");
                        return Ok((None, machine.status.clone().unwrap_or_default()));
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            1 => (*alive[0]).clone(),
            _ => {
                debug!(machine = %name, pods = alive.len(), "migration in flight, not converging");
                return Ok((None, machine.status.clone().unwrap_or_default()));
            }
        };

        let mut status = machine.status.clone().unwrap_or_default();
        if let Some(node) = pod_node_name(&pod) {
            status.node_name = node.to_string();
        }
        if let Some(host_ip) = pod.status.as_ref().and_then(|s| s.host_ip.clone()) {
            status.node_ip = host_ip;
        }
        status.state = machine_state_for_pod(&pod);
        if let Some(ip) = self.stores.arp_ip_for_mac(&status.mac) {
            status.ip = ip;
        }
        self.sync_machine_status(machine, &status).await?;

        Ok((Some(pod), status))
    }

    pub(crate) fn resolve_public_keys(
        &self,
        machine: &VirtualMachine,
    ) -> Result<Vec<std::sync::Arc<crds::Credential>>, ControllerError> {
        machine
            .spec
            .public_keys
            .iter()
            .map(|key_name| {
                self.stores
                    .credential(key_name)
                    .ok_or_else(|| ControllerError::CredentialNotFound(key_name.clone()))
            })
            .collect()
    }

    /// Tear down the machine's workloads. Returns the resulting state so
    /// the reboot path can tell when the stop half has finished.
    async fn stop_machine(
        &self,
        machine: &VirtualMachine,
    ) -> Result<MachineState, ControllerError> {
        let name = machine.name_any();
        let mut status = machine.status.clone().unwrap_or_default();
        let mut failure = None;

        match self.delete_worker_pods(&name).await {
            Ok(DeleteOutcome::Deleted) => status.state = MachineState::Stopping,
            Ok(DeleteOutcome::NotFound) => {
                status.state = MachineState::Stopped;
                status.node_name.clear();
            }
            Err(e) => {
                status.state = MachineState::Error;
                failure = Some(e);
            }
        }

        if failure.is_none() {
            match self.delete_job(&migration_job_name(&name)).await {
                Ok(DeleteOutcome::Deleted) => status.state = MachineState::Stopping,
                Ok(DeleteOutcome::NotFound) => {}
                Err(e) => {
                    status.state = MachineState::Error;
                    failure = Some(e);
                }
            }
        }

        if failure.is_none() {
            match self.delete_pod(&console_pod_name(&name)).await {
                Ok(DeleteOutcome::Deleted) => status.state = MachineState::Stopping,
                Ok(DeleteOutcome::NotFound) => {}
                Err(e) => {
                    status.state = MachineState::Error;
                    failure = Some(e);
                }
            }
        }

        self.sync_machine_status(machine, &status).await?;
        match failure {
            Some(e) => {
                warn!(machine = %name, error = %e, "stop left the machine in Error");
                Err(e)
            }
            None => Ok(status.state),
        }
    }

    /// Reboot is stop-then-start: behave like Stop while pods remain, and
    /// once the machine reports Stopped flip the action back to Start.
    async fn reboot_machine(&self, machine: &VirtualMachine) -> Result<(), ControllerError> {
        let state = self.stop_machine(machine).await?;
        if state == MachineState::Stopped {
            let name = machine.name_any();
            info!(machine = %name, "reboot tear-down complete, starting again");
            self.persist_machine_action(&name, MachineAction::Start)
                .await?;
        }
        Ok(())
    }

    /// Terminating path. Sets the state once, then issues idempotent
    /// deletes until the owned resources are all gone, and finally clears
    /// the finalizer so the apiserver can purge the record.
    async fn finalize_machine(&self, machine: &VirtualMachine) -> Result<(), ControllerError> {
        let name = machine.name_any();
        let mut status = machine.status.clone().unwrap_or_default();

        if status.state != MachineState::Terminating {
            status.state = MachineState::Terminating;
            return self.sync_machine_status(machine, &status).await;
        }

        let pods = self.delete_worker_pods(&name).await?;
        let console = self.delete_pod(&console_pod_name(&name)).await?;
        let service = self.delete_service(&console_service_name(&name)).await?;

        if machine.spec.volume.network_block().is_some() {
            self.teardown_network_volume(machine).await?;
        }

        if pods == DeleteOutcome::NotFound
            && console == DeleteOutcome::NotFound
            && service == DeleteOutcome::NotFound
        {
            let remaining: Vec<String> = machine
                .finalizers()
                .iter()
                .filter(|f| *f != FINALIZER_DELETION)
                .cloned()
                .collect();
            self.persist_machine_finalizers(&name, remaining).await?;
            info!(machine = %name, "cleanup complete, finalizer cleared");
        }
        Ok(())
    }
}
