//! Console sidecar templates
//!
//! The console pod serves the guest's VNC socket over a websocket. It must
//! land on the same node as the worker pod it fronts, so it carries a hard
//! pod affinity on that pod's `unique_name`. The matching NodePort service
//! is what `status.consoleEndpoint` points at.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Affinity, Container, Pod, PodAffinity, PodAffinityTerm, PodSpec, Service, ServicePort,
    ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;

use crds::VirtualMachine;
use kube::ResourceExt;

use crate::labels::*;
use crate::templates::util::*;
use crate::templates::TemplateConfig;

/// Port the console container listens on inside the pod.
pub const CONSOLE_PORT: i32 = 6080;

pub fn console_pod(
    machine: &VirtualMachine,
    worker_pod_name: &str,
    config: &TemplateConfig,
) -> Pod {
    let name = machine.name_any();

    let labels = BTreeMap::from([
        (LABEL_APP.to_string(), APP.to_string()),
        (LABEL_ROLE.to_string(), ROLE_CONSOLE.to_string()),
        (LABEL_NAME.to_string(), name.clone()),
    ]);

    Pod {
        metadata: child_metadata(&console_pod_name(&name), labels),
        spec: Some(PodSpec {
            volumes: Some(vec![
                vol_host_path("vm-socket", host_state_dir(&name)),
                vol_pod_labels("podinfo"),
            ]),
            containers: vec![Container {
                name: ROLE_CONSOLE.to_string(),
                image: Some(config.image_console.clone()),
                image_pull_policy: Some("Always".to_string()),
                command: Some(vec!["console".to_string()]),
                env: Some(vec![env_var("VM_POD_NAME", worker_pod_name)]),
                volume_mounts: Some(vec![
                    volume_mount("vm-socket", "/vm"),
                    volume_mount("podinfo", "/podinfo"),
                ]),
                ..Default::default()
            }],
            termination_grace_period_seconds: Some(0),
            // co-locate with the worker pod whose socket we proxy
            affinity: Some(Affinity {
                pod_affinity: Some(PodAffinity {
                    required_during_scheduling_ignored_during_execution: Some(vec![
                        PodAffinityTerm {
                            label_selector: Some(LabelSelector {
                                match_labels: Some(BTreeMap::from([
                                    (LABEL_APP.to_string(), APP.to_string()),
                                    (LABEL_ROLE.to_string(), ROLE_WORKER.to_string()),
                                    (LABEL_NAME.to_string(), name.clone()),
                                    (
                                        LABEL_UNIQUE_NAME.to_string(),
                                        worker_pod_name.to_string(),
                                    ),
                                ])),
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
        ..Default::default()
    }
}

pub fn console_service(machine: &VirtualMachine) -> Service {
    let name = machine.name_any();

    Service {
        metadata: child_metadata(&console_service_name(&name), BTreeMap::new()),
        spec: Some(ServiceSpec {
            ports: Some(vec![ServicePort {
                name: Some(ROLE_CONSOLE.to_string()),
                port: CONSOLE_PORT,
                ..Default::default()
            }]),
            selector: Some(BTreeMap::from([
                (LABEL_APP.to_string(), APP.to_string()),
                (LABEL_ROLE.to_string(), ROLE_CONSOLE.to_string()),
                (LABEL_NAME.to_string(), name),
            ])),
            type_: Some("NodePort".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}
