//! VirtualMachine CRD
//!
//! A VirtualMachine declares a KVM guest: its sizing, boot image, lifecycle
//! action and placement. The reconciler realizes it as a worker pod (two
//! during live migration) plus optional console sidecar resources.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::MAC_OUI;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "vm.rancher.io",
    version = "v1alpha1",
    kind = "VirtualMachine",
    status = "VirtualMachineStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineSpec {
    /// Guest vCPU count (1..=32)
    pub cpus: i32,

    /// Guest memory in MiB (64..=65536)
    #[serde(rename = "memoryMB")]
    pub memory_mb: i32,

    /// Name of the MachineImage this guest boots from. The machine does not
    /// start until that image reports Ready.
    pub machine_image: String,

    /// Requested lifecycle action
    pub action: MachineAction,

    /// Names of Credential records injected into the guest as authorized keys
    #[serde(default)]
    pub public_keys: Vec<String>,

    /// Run a console sidecar pod and NodePort service next to the guest
    #[serde(default)]
    pub hosted_console: bool,

    /// Target node. Empty lets the scheduler choose. Changing it while the
    /// machine is running triggers live migration.
    #[serde(default)]
    pub node_name: String,

    /// Extra arguments appended to the QEMU command line
    #[serde(default)]
    pub kvm_extra_args: String,

    /// Back guest memory with 2Mi huge pages
    #[serde(default)]
    pub use_huge_pages: bool,

    /// Root disk source
    #[serde(default)]
    pub volume: VolumeSource,
}

/// Root disk source for a machine.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub enum VolumeSource {
    /// Node-local disk that disappears with the worker pod
    #[default]
    Ephemeral,
    /// Replicated network block device provisioned through the storage service
    NetworkBlock(NetworkBlockVolume),
}

impl VolumeSource {
    /// The network block parameters, if this machine uses a networked volume.
    pub fn network_block(&self) -> Option<&NetworkBlockVolume> {
        match self {
            VolumeSource::Ephemeral => None,
            VolumeSource::NetworkBlock(nb) => Some(nb),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkBlockVolume {
    /// Replica count, at least 2
    pub replicas: i32,

    /// Seconds before a stale replica is discarded, positive
    pub stale_replica_timeout_sec: i32,

    /// Storage frontend exposed to the node (e.g. "iscsi")
    pub frontend: String,
}

/// User-requested lifecycle action.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub enum MachineAction {
    Start,
    Stop,
    /// Stop, then start again once all worker pods are gone
    Reboot,
    /// Action from a newer client this controller does not know; logged
    /// and ignored without requeueing
    #[serde(other)]
    Unknown,
}

/// Observed machine state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "PascalCase")]
pub enum MachineState {
    /// The guest is booting or waiting to be scheduled
    #[default]
    Pending,
    /// The worker pod is ready and the monitor socket exists
    Running,
    Stopping,
    Stopped,
    Terminating,
    Terminated,
    Migrating,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineStatus {
    #[serde(default)]
    pub state: MachineState,

    /// External identifier derived from the record uid, assigned once
    #[serde(default)]
    pub instance_id: String,

    /// Guest NIC MAC address derived from the record uid, assigned once
    #[serde(default)]
    pub mac: String,

    /// Guest IP learned from host ARP tables
    #[serde(default)]
    pub ip: String,

    /// Node currently hosting the worker pod
    #[serde(default)]
    pub node_name: String,

    /// Host IP of the node running the worker pod
    #[serde(rename = "nodeIP", default)]
    pub node_ip: String,

    /// `host:nodePort` of the console service, when hosted
    #[serde(default)]
    pub console_endpoint: String,
}

/// External instance identifier for a record uid: `i-` plus the first eight
/// characters of the uid.
pub fn instance_id(uid: &str) -> String {
    format!("i-{}", &uid[..8])
}

/// Guest MAC address for a record uid: the operator OUI followed by the first
/// four uid bytes, e.g. `06:fe:ab:12:cd:34`.
pub fn mac_address(uid: &str) -> String {
    format!(
        "{}:{}:{}:{}:{}",
        MAC_OUI,
        &uid[..2],
        &uid[2..4],
        &uid[4..6],
        &uid[6..8]
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_id_uses_first_eight_uid_chars() {
        assert_eq!(instance_id("ab12cd34-5678-90ef"), "i-ab12cd34");
    }

    #[test]
    fn mac_address_uses_oui_and_first_four_uid_bytes() {
        assert_eq!(mac_address("ab12cd34-5678-90ef"), "06:fe:ab:12:cd:34");
    }

    #[test]
    fn volume_source_defaults_to_ephemeral() {
        assert_eq!(VolumeSource::default(), VolumeSource::Ephemeral);
        assert!(VolumeSource::default().network_block().is_none());
    }

    #[test]
    fn actions_serialize_pascal_case() {
        assert_eq!(
            serde_json::to_value(MachineAction::Start).unwrap(),
            serde_json::json!("Start")
        );
        assert_eq!(
            serde_json::to_value(MachineAction::Reboot).unwrap(),
            serde_json::json!("Reboot")
        );
    }

    #[test]
    fn unknown_actions_deserialize_instead_of_breaking_the_watch() {
        let action: MachineAction = serde_json::from_value(serde_json::json!("Hibernate")).unwrap();
        assert_eq!(action, MachineAction::Unknown);
    }

    #[test]
    fn network_block_round_trips_as_tagged_object() {
        let vol = VolumeSource::NetworkBlock(NetworkBlockVolume {
            replicas: 3,
            stale_replica_timeout_sec: 20,
            frontend: "iscsi".into(),
        });
        let json = serde_json::to_value(&vol).unwrap();
        assert_eq!(json["networkBlock"]["staleReplicaTimeoutSec"], 20);
        let back: VolumeSource = serde_json::from_value(json).unwrap();
        assert_eq!(back, vol);
    }
}
