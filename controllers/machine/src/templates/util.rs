//! Small constructors shared by all templates.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    DownwardAPIVolumeFile, DownwardAPIVolumeSource, EmptyDirVolumeSource, EnvVar, EnvVarSource,
    ExecAction, HostPathVolumeSource, LocalObjectReference, ObjectFieldSelector,
    PersistentVolumeClaimVolumeSource, Probe, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::labels::{host_state_dir, NAMESPACE};

pub fn env_var(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        value_from: None,
    }
}

pub fn env_var_field(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: None,
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: field_path.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
    }
}

pub fn vol_empty_dir(name: &str) -> Volume {
    Volume {
        name: name.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    }
}

pub fn vol_empty_dir_huge_pages(name: &str) -> Volume {
    Volume {
        name: name.to_string(),
        empty_dir: Some(EmptyDirVolumeSource {
            medium: Some("HugePages".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn vol_host_path(name: &str, path: impl Into<String>) -> Volume {
    Volume {
        name: name.to_string(),
        host_path: Some(HostPathVolumeSource {
            path: path.into(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Host-path volume under the machine's state directory,
/// e.g. `/var/lib/rancher/vm/{machine}/{vol}`.
pub fn vol_host_state(machine: &str, vol: &str) -> Volume {
    vol_host_path(vol, format!("{}/{}", host_state_dir(machine), vol))
}

pub fn vol_pvc(name: &str, claim: &str) -> Volume {
    Volume {
        name: name.to_string(),
        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
            claim_name: claim.to_string(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Downward-API volume exposing the pod labels as a file.
pub fn vol_pod_labels(name: &str) -> Volume {
    Volume {
        name: name.to_string(),
        downward_api: Some(DownwardAPIVolumeSource {
            items: Some(vec![DownwardAPIVolumeFile {
                path: "labels".to_string(),
                field_ref: Some(ObjectFieldSelector {
                    field_path: "metadata.labels".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn volume_mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        ..Default::default()
    }
}

pub fn volume_mount_sub(name: &str, path: &str, sub_path: &str, read_only: bool) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        sub_path: Some(sub_path.to_string()),
        read_only: Some(read_only),
        ..Default::default()
    }
}

/// Exec probe checking for the VNC monitor socket of this pod. Doubles as
/// liveness and readiness on worker pods.
pub fn console_probe() -> Probe {
    Probe {
        exec: Some(ExecAction {
            command: Some(vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                "[ -S /vm/${MY_POD_NAME}_vnc.sock ]".to_string(),
            ]),
        }),
        initial_delay_seconds: Some(2),
        timeout_seconds: Some(2),
        period_seconds: Some(3),
        success_threshold: Some(1),
        failure_threshold: Some(10),
        ..Default::default()
    }
}

pub fn pull_secrets(pull_secret: &str) -> Option<Vec<LocalObjectReference>> {
    if pull_secret.is_empty() {
        return None;
    }
    Some(vec![LocalObjectReference {
        name: Some(pull_secret.to_string()),
    }])
}

/// Metadata in the child namespace with the given labels.
pub fn child_metadata(name: &str, labels: BTreeMap<String, String>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(NAMESPACE.to_string()),
        labels: Some(labels),
        ..Default::default()
    }
}
