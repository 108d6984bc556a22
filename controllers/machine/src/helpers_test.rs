//! Unit tests for the pure reconciliation helpers

use super::*;
use serde_json::json;

use crds::{MachineAction, VirtualMachineSpec, VirtualMachineStatus, VolumeSource};

fn pod(value: serde_json::Value) -> Pod {
    serde_json::from_value(value).expect("valid pod json")
}

fn machine(state: MachineState, node_name: &str) -> VirtualMachine {
    let mut machine = VirtualMachine::new(
        "m1",
        VirtualMachineSpec {
            cpus: 2,
            memory_mb: 1024,
            machine_image: "ubuntu".to_string(),
            action: MachineAction::Start,
            public_keys: Vec::new(),
            hosted_console: false,
            node_name: node_name.to_string(),
            kvm_extra_args: String::new(),
            use_huge_pages: false,
            volume: VolumeSource::Ephemeral,
        },
    );
    machine.status = Some(VirtualMachineStatus {
        state,
        ..Default::default()
    });
    machine
}

#[test]
fn alive_filter_drops_deleting_pods() {
    let live = Arc::new(pod(json!({ "metadata": { "name": "a" } })));
    let deleting = Arc::new(pod(json!({
        "metadata": { "name": "b", "deletionTimestamp": "2024-01-01T00:00:00Z" }
    })));
    let alive = alive_pods(vec![live, deleting]);
    assert_eq!(alive.len(), 1);
    assert_eq!(alive[0].metadata.name.as_deref(), Some("a"));
}

#[test]
fn pod_ready_requires_true_condition() {
    let ready = pod(json!({
        "metadata": { "name": "a" },
        "status": { "conditions": [{ "type": "Ready", "status": "True" }] }
    }));
    let not_ready = pod(json!({
        "metadata": { "name": "b" },
        "status": { "conditions": [{ "type": "Ready", "status": "False" }] }
    }));
    let no_status = pod(json!({ "metadata": { "name": "c" } }));
    assert!(is_pod_ready(&ready));
    assert!(!is_pod_ready(&not_ready));
    assert!(!is_pod_ready(&no_status));
}

#[test]
fn unschedulable_needs_reason() {
    let unschedulable = pod(json!({
        "metadata": { "name": "a" },
        "status": { "conditions": [
            { "type": "PodScheduled", "status": "False", "reason": "Unschedulable" }
        ]}
    }));
    let pending = pod(json!({
        "metadata": { "name": "b" },
        "status": { "conditions": [
            { "type": "PodScheduled", "status": "False", "reason": "SchedulerError" }
        ]}
    }));
    assert!(is_pod_unschedulable(&unschedulable));
    assert!(!is_pod_unschedulable(&pending));
}

#[test]
fn migration_pods_order_by_creation_timestamp() {
    let older = Arc::new(pod(json!({
        "metadata": { "name": "m1-aaaa", "creationTimestamp": "2024-01-01T00:00:00Z" }
    })));
    let newer = Arc::new(pod(json!({
        "metadata": { "name": "m1-bbbb", "creationTimestamp": "2024-01-02T00:00:00Z" }
    })));
    let (old, new) = order_migration_pods(newer.clone(), older.clone());
    assert_eq!(old.metadata.name, older.metadata.name);
    assert_eq!(new.metadata.name, newer.metadata.name);
}

#[test]
fn migration_pod_tie_breaks_on_unique_name() {
    let a = Arc::new(pod(json!({
        "metadata": {
            "name": "m1-00aa",
            "creationTimestamp": "2024-01-01T00:00:00Z",
            "labels": { "unique_name": "m1-00aa" }
        }
    })));
    let b = Arc::new(pod(json!({
        "metadata": {
            "name": "m1-11bb",
            "creationTimestamp": "2024-01-01T00:00:00Z",
            "labels": { "unique_name": "m1-11bb" }
        }
    })));
    let (old1, _) = order_migration_pods(a.clone(), b.clone());
    let (old2, _) = order_migration_pods(b, a);
    // Same winner regardless of argument order.
    assert_eq!(old1.metadata.name, old2.metadata.name);
    assert_eq!(old1.metadata.name.as_deref(), Some("m1-00aa"));
}

#[test]
fn pod_phase_maps_to_machine_state() {
    let deleting = pod(json!({
        "metadata": { "name": "a", "deletionTimestamp": "2024-01-01T00:00:00Z" }
    }));
    let running = pod(json!({
        "metadata": { "name": "b" },
        "status": { "conditions": [{ "type": "Ready", "status": "True" }] }
    }));
    let booting = pod(json!({ "metadata": { "name": "c" } }));
    assert_eq!(machine_state_for_pod(&deleting), MachineState::Stopping);
    assert_eq!(machine_state_for_pod(&running), MachineState::Running);
    assert_eq!(machine_state_for_pod(&booting), MachineState::Pending);
}

#[test]
fn affinity_node_extracted_only_from_single_hostname_requirement() {
    let pinned = pod(json!({
        "metadata": { "name": "a" },
        "spec": {
            "containers": [],
            "affinity": { "nodeAffinity": {
                "requiredDuringSchedulingIgnoredDuringExecution": {
                    "nodeSelectorTerms": [{ "matchExpressions": [{
                        "key": "kubernetes.io/hostname",
                        "operator": "In",
                        "values": ["node-b"]
                    }]}]
                }
            }}
        }
    }));
    assert_eq!(required_affinity_node(&pinned), Some("node-b"));

    let unpinned = pod(json!({ "metadata": { "name": "b" }, "spec": { "containers": [] } }));
    assert_eq!(required_affinity_node(&unpinned), None);
}

#[test]
fn migration_triggers_on_node_mismatch_while_running() {
    let m = machine(MachineState::Running, "node-b");
    assert!(should_migrate(&m, Some("node-a")));
    assert!(!should_migrate(&m, Some("node-b")));
}

#[test]
fn migration_does_not_trigger_without_pinned_node() {
    let m = machine(MachineState::Running, "");
    assert!(!should_migrate(&m, Some("node-a")));
}

#[test]
fn migration_does_not_trigger_while_pending() {
    let m = machine(MachineState::Pending, "node-b");
    assert!(!should_migrate(&m, Some("node-a")));
}

#[test]
fn migrating_state_always_stays_in_the_flow() {
    let m = machine(MachineState::Migrating, "node-b");
    assert!(should_migrate(&m, None));
    assert!(should_migrate(&m, Some("node-b")));
}

#[test]
fn cancel_is_detected_when_pin_returns_to_the_source_node() {
    let m = machine(MachineState::Migrating, "node-a");
    assert!(migration_cancelled(&m, Some("node-a")));
    assert!(!migration_cancelled(&m, Some("node-b")));
    assert!(!migration_cancelled(&m, None));
}

#[test]
fn backup_url_requires_exactly_one_backup_and_volume_param() {
    assert!(validate_backup_url("s3://bk@us/x?backup=b-1&volume=m1").is_ok());
    assert!(validate_backup_url("s3://bk@us/x?volume=m1").is_err());
    assert!(validate_backup_url("s3://bk@us/x?backup=b-1").is_err());
    assert!(validate_backup_url("s3://bk@us/x?backup=b-1&backup=b-2&volume=m1").is_err());
    assert!(validate_backup_url("s3://bk@us/x").is_err());
}

#[test]
fn image_readiness_threshold() {
    // Enough replicas.
    assert!(image_nodes_satisfied(3, 10, 3));
    // Whole cluster covered even if below the minimum.
    assert!(image_nodes_satisfied(2, 2, 3));
    // Not enough yet.
    assert!(!image_nodes_satisfied(2, 10, 3));
    // An empty cluster counts as fully covered.
    assert!(image_nodes_satisfied(0, 0, 3));
}
