//! MachineImage CRD
//!
//! A MachineImage is a bootable guest image published as a container image
//! and pre-pulled onto enough nodes. It is either packaged ahead of time or
//! captured from a running machine through the snapshot/backup/publish
//! pipeline. A machine only starts once its image reports Ready.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "vm.rancher.io",
    version = "v1alpha1",
    kind = "MachineImage",
    status = "MachineImageStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct MachineImageSpec {
    /// Container image reference the guest image is published to
    pub container_image: String,

    /// Root disk size. Zero means inherit from the source machine's image.
    #[serde(rename = "sizeGiB", default)]
    pub size_gib: i32,

    /// Name of the VirtualMachine to capture this image from. Empty for
    /// pre-packaged images.
    #[serde(default)]
    pub from_virtual_machine: String,
}

/// Pipeline position of a machine image.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "PascalCase")]
pub enum MachineImageState {
    #[default]
    Unknown,
    /// Taking a snapshot of the source volume
    Snapshot,
    /// Backing the snapshot up to the object store
    Backup,
    /// Building and pushing the container image
    Publish,
    /// Pre-pulling the image onto nodes
    Provision,
    /// Published and pulled on enough nodes to start machines
    Ready,
    /// The publish build failed; user intervention required
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct MachineImageStatus {
    #[serde(default)]
    pub state: MachineImageState,

    /// Name of the storage snapshot taken from the source volume
    #[serde(default)]
    pub snapshot_name: String,

    /// URL of the backup produced from the snapshot
    #[serde(rename = "backupURL", default)]
    pub backup_url: String,

    /// Backing image recorded on the backup, if any
    #[serde(default)]
    pub base_image: String,

    /// The container image has been built and pushed
    #[serde(default)]
    pub published: bool,

    /// Sorted names of nodes that already hold the image
    #[serde(default)]
    pub nodes_ready: Vec<String>,
}
