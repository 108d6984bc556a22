//! Console sidecar convergence
//!
//! When `hostedConsole` is set, a console pod must run next to the adopted
//! worker pod and a NodePort service must front it; the resulting
//! `host:nodePort` pair is published as `status.consoleEndpoint`. When the
//! flag is off both resources are removed and the endpoint cleared.

use k8s_openapi::api::core::v1::Pod;
use kube::api::PostParams;
use kube::ResourceExt;
use tracing::{debug, info};

use crds::{VirtualMachine, VirtualMachineStatus};

use crate::error::{is_already_exists, ControllerError};
use crate::helpers::is_alive;
use crate::labels::{console_pod_name, console_service_name, LABEL_UNIQUE_NAME};
use crate::reconciler::Reconciler;
use crate::templates::{console_pod, console_service};

/// The worker pod a console pod fronts, read from its co-location
/// affinity.
fn console_target(pod: &Pod) -> Option<&str> {
    pod.spec
        .as_ref()?
        .affinity
        .as_ref()?
        .pod_affinity
        .as_ref()?
        .required_during_scheduling_ignored_during_execution
        .as_ref()?
        .first()?
        .label_selector
        .as_ref()?
        .match_labels
        .as_ref()?
        .get(LABEL_UNIQUE_NAME)
        .map(String::as_str)
}

impl Reconciler {
    pub(crate) async fn sync_console(
        &self,
        machine: &VirtualMachine,
        status: &VirtualMachineStatus,
        worker_pod_name: &str,
    ) -> Result<(), ControllerError> {
        let name = machine.name_any();

        if !machine.spec.hosted_console {
            self.delete_pod(&console_pod_name(&name)).await?;
            self.delete_service(&console_service_name(&name)).await?;
            if !status.console_endpoint.is_empty() {
                let mut cleared = status.clone();
                cleared.console_endpoint.clear();
                self.sync_machine_status(machine, &cleared).await?;
            }
            return Ok(());
        }

        // Console pod: present, alive and pointing at the adopted worker.
        match self.stores.pod(&console_pod_name(&name)) {
            Some(pod) if is_alive(&pod) => {
                if console_target(&pod) != Some(worker_pod_name) {
                    info!(
                        machine = %name,
                        worker = worker_pod_name,
                        "console pod fronts a stale worker, recreating"
                    );
                    self.delete_pod(&console_pod_name(&name)).await?;
                    return Ok(());
                }
            }
            _ => {
                let rendered = console_pod(machine, worker_pod_name, &self.template_config());
                match self.pod_api.create(&PostParams::default(), &rendered).await {
                    Ok(_) => info!(machine = %name, "created console pod"),
                    Err(e) if is_already_exists(&e) => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }

        // Console service, created once and left alone afterwards.
        let service = match self.stores.service(&console_service_name(&name)) {
            Some(service) => service,
            None => {
                let rendered = console_service(machine);
                match self
                    .service_api
                    .create(&PostParams::default(), &rendered)
                    .await
                {
                    Ok(created) => {
                        info!(machine = %name, "created console service");
                        std::sync::Arc::new(created)
                    }
                    Err(e) if is_already_exists(&e) => return Ok(()),
                    Err(e) => return Err(e.into()),
                }
            }
        };

        // Publish the endpoint once the service has a node port.
        let node_port = service
            .spec
            .as_ref()
            .and_then(|s| s.ports.as_ref())
            .and_then(|ports| ports.first())
            .and_then(|p| p.node_port)
            .unwrap_or_default();
        if node_port <= 0 || status.node_ip.is_empty() {
            debug!(machine = %name, "console endpoint not derivable yet");
            return Ok(());
        }

        let endpoint = format!("{}:{}", status.node_ip, node_port);
        if status.console_endpoint != endpoint {
            let mut updated = status.clone();
            updated.console_endpoint = endpoint;
            self.sync_machine_status(machine, &updated).await?;
        }
        Ok(())
    }
}
