//! PV/PVC templates for networked machine volumes
//!
//! The storage service owns the actual block volume; these objects bind it
//! into the cluster so the worker pod can claim it. Both carry the
//! machine's name.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    CSIPersistentVolumeSource, PersistentVolume, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PersistentVolumeSpec, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crds::{NetworkBlockVolume, VirtualMachine};
use kube::ResourceExt;

use crate::labels::NAMESPACE;

/// CSI driver serving the block-storage volumes.
const CSI_DRIVER: &str = "driver.longhorn.io";

pub fn persistent_volume(
    machine: &VirtualMachine,
    volume: &NetworkBlockVolume,
    size_gib: i32,
) -> PersistentVolume {
    let name = machine.name_any();
    PersistentVolume {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            capacity: Some(BTreeMap::from([(
                "storage".to_string(),
                Quantity(format!("{}Gi", size_gib)),
            )])),
            persistent_volume_reclaim_policy: Some("Delete".to_string()),
            csi: Some(CSIPersistentVolumeSource {
                driver: CSI_DRIVER.to_string(),
                volume_handle: name,
                volume_attributes: Some(BTreeMap::from([(
                    "frontend".to_string(),
                    volume.frontend.clone(),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn persistent_volume_claim(machine: &VirtualMachine, size_gib: i32) -> PersistentVolumeClaim {
    let name = machine.name_any();
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(NAMESPACE.to_string()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(format!("{}Gi", size_gib)),
                )])),
                ..Default::default()
            }),
            // pin to the pre-created PV, not a storage class
            storage_class_name: Some(String::new()),
            volume_name: Some(name),
            ..Default::default()
        }),
        ..Default::default()
    }
}
