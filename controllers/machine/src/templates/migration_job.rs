//! Migration job template
//!
//! A one-shot job that runs the QMP migration driver against the source
//! worker pod's monitor socket. It must execute on the node hosting that
//! pod, so the pod template carries a hard affinity on the source pod's
//! `unique_name`.

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Affinity, Container, PodAffinity, PodAffinityTerm, PodSpec, PodTemplateSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;

use crds::VirtualMachine;
use kube::ResourceExt;

use crate::labels::*;
use crate::templates::util::*;
use crate::templates::TemplateConfig;

pub fn migration_job(
    machine: &VirtualMachine,
    source_pod_name: &str,
    target_uri: &str,
    config: &TemplateConfig,
) -> Job {
    let name = machine.name_any();
    let labels = BTreeMap::from([
        (LABEL_APP.to_string(), APP.to_string()),
        (LABEL_ROLE.to_string(), ROLE_MIGRATE.to_string()),
        (LABEL_NAME.to_string(), name.clone()),
    ]);
    let metadata = child_metadata(&migration_job_name(&name), labels);

    let command = format!(
        "exec /usr/local/bin/machine-controller --migrate --sock-path {} --target-uri {}",
        monitor_socket_path(source_pod_name),
        target_uri
    );

    Job {
        metadata: metadata.clone(),
        spec: Some(JobSpec {
            template: PodTemplateSpec {
                metadata: Some(metadata),
                spec: Some(PodSpec {
                    volumes: Some(vec![vol_host_path("vm-socket", host_state_dir(&name))]),
                    containers: vec![Container {
                        name: ROLE_MIGRATE.to_string(),
                        image: Some(config.image_vm.clone()),
                        image_pull_policy: Some("Always".to_string()),
                        command: Some(vec!["sh".to_string(), "-c".to_string()]),
                        args: Some(vec![command]),
                        volume_mounts: Some(vec![volume_mount("vm-socket", "/vm")]),
                        ..Default::default()
                    }],
                    restart_policy: Some("Never".to_string()),
                    // run next to the source pod whose socket we drive
                    affinity: Some(Affinity {
                        pod_affinity: Some(PodAffinity {
                            required_during_scheduling_ignored_during_execution: Some(vec![
                                PodAffinityTerm {
                                    label_selector: Some(LabelSelector {
                                        match_labels: Some(BTreeMap::from([(
                                            LABEL_UNIQUE_NAME.to_string(),
                                            source_pod_name.to_string(),
                                        )])),
                                        ..Default::default()
                                    }),
                                    topology_key: LABEL_NODE_HOSTNAME.to_string(),
                                    ..Default::default()
                                },
                            ]),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    image_pull_secrets: pull_secrets(&config.pull_secret),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}
