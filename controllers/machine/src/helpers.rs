//! Pure reconciliation helpers
//!
//! Pod predicates, pod ordering for migration, machine-state mapping,
//! backup URL validation and the image readiness threshold. Everything here
//! is side-effect free so the state-machine decisions stay unit testable.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;

use crds::{MachineState, VirtualMachine};

use crate::labels::{LABEL_NODE_HOSTNAME, LABEL_UNIQUE_NAME};

/// A pod is alive while its deletion timestamp is unset.
pub fn is_alive(pod: &Pod) -> bool {
    pod.metadata.deletion_timestamp.is_none()
}

/// Filter a pod list down to alive pods.
pub fn alive_pods(pods: Vec<Arc<Pod>>) -> Vec<Arc<Pod>> {
    pods.into_iter().filter(|p| is_alive(p)).collect()
}

/// The PodReady condition as a boolean.
pub fn is_pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

/// Whether the scheduler has given up on the pod.
pub fn is_pod_unschedulable(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conds| {
            conds.iter().any(|c| {
                c.type_ == "PodScheduled"
                    && c.status == "False"
                    && c.reason.as_deref() == Some("Unschedulable")
            })
        })
        .unwrap_or(false)
}

/// The node a pod has been bound to, if any.
pub fn pod_node_name(pod: &Pod) -> Option<&str> {
    pod.spec.as_ref().and_then(|s| s.node_name.as_deref())
}

/// The pod's `unique_name` label, falling back to the pod name.
pub fn unique_name(pod: &Pod) -> &str {
    pod.metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(LABEL_UNIQUE_NAME))
        .map(String::as_str)
        .or(pod.metadata.name.as_deref())
        .unwrap_or_default()
}

/// Order two migration pods into (old, new): earliest creation timestamp
/// first, ties broken by a stable compare on `unique_name`.
pub fn order_migration_pods(a: Arc<Pod>, b: Arc<Pod>) -> (Arc<Pod>, Arc<Pod>) {
    let ts_a = a.metadata.creation_timestamp.as_ref().map(|t| t.0);
    let ts_b = b.metadata.creation_timestamp.as_ref().map(|t| t.0);
    match ts_a.cmp(&ts_b) {
        std::cmp::Ordering::Less => (a, b),
        std::cmp::Ordering::Greater => (b, a),
        std::cmp::Ordering::Equal => {
            if unique_name(&a) <= unique_name(&b) {
                (a, b)
            } else {
                (b, a)
            }
        }
    }
}

/// Machine state derived from the adopted worker pod.
pub fn machine_state_for_pod(pod: &Pod) -> MachineState {
    if pod.metadata.deletion_timestamp.is_some() {
        MachineState::Stopping
    } else if is_pod_ready(pod) {
        MachineState::Running
    } else {
        MachineState::Pending
    }
}

/// The single node name an unschedulable pod's node affinity requires, when
/// the affinity has exactly one hostname requirement.
pub fn required_affinity_node(pod: &Pod) -> Option<&str> {
    let terms = pod
        .spec
        .as_ref()?
        .affinity
        .as_ref()?
        .node_affinity
        .as_ref()?
        .required_during_scheduling_ignored_during_execution
        .as_ref()?
        .node_selector_terms
        .as_slice();
    if terms.len() != 1 {
        return None;
    }
    let expressions = terms[0].match_expressions.as_ref()?;
    if expressions.len() != 1 {
        return None;
    }
    let requirement = &expressions[0];
    if requirement.key != LABEL_NODE_HOSTNAME || requirement.operator != "In" {
        return None;
    }
    match requirement.values.as_deref() {
        Some([node]) => Some(node.as_str()),
        _ => None,
    }
}

/// Whether a machine should branch into the migration flow.
///
/// A pinned node that differs from where the running pod sits starts a
/// migration; a machine already migrating stays in the flow regardless of
/// pod placement.
pub fn should_migrate(machine: &VirtualMachine, pod_node: Option<&str>) -> bool {
    let state = machine
        .status
        .as_ref()
        .map(|s| s.state)
        .unwrap_or_default();
    if state == MachineState::Migrating {
        return true;
    }
    if machine.spec.node_name.is_empty() || state != MachineState::Running {
        return false;
    }
    match pod_node {
        Some(node) => machine.spec.node_name != node,
        None => false,
    }
}

/// The user reverted a migration when the pinned node is the one the
/// source pod already runs on; the flow rolls back instead of completing.
pub fn migration_cancelled(machine: &VirtualMachine, source_pod_node: Option<&str>) -> bool {
    source_pod_node == Some(machine.spec.node_name.as_str())
}

/// Validate a backup URL: it must carry exactly one `backup` and exactly
/// one `volume` query parameter.
pub fn validate_backup_url(url: &str) -> Result<(), String> {
    let query = match url.split_once('?') {
        Some((_, query)) => query,
        None => return Err("missing query string".to_string()),
    };
    let mut backups = 0;
    let mut volumes = 0;
    for pair in query.split('&') {
        match pair.split_once('=').map(|(k, _)| k).unwrap_or(pair) {
            "backup" => backups += 1,
            "volume" => volumes += 1,
            _ => {}
        }
    }
    if backups != 1 {
        return Err(format!("expected one 'backup' query param, found {}", backups));
    }
    if volumes != 1 {
        return Err(format!("expected one 'volume' query param, found {}", volumes));
    }
    Ok(())
}

/// An image is Ready once it has been pulled on `minimum` nodes, or on
/// every node of a cluster smaller than that.
pub fn image_nodes_satisfied(ready: usize, total_nodes: usize, minimum: usize) -> bool {
    ready >= minimum || ready == total_nodes
}

#[cfg(test)]
#[path = "helpers_test.rs"]
mod helpers_test;
