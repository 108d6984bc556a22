//! Worker pod templates
//!
//! A worker pod hosts the QEMU process of one machine. Two variants exist:
//! the ephemeral variant boots from the machine image baked into a
//! container image, the networked variant boots from a PVC backed by the
//! block-storage service. Both share identity labels, env propagation, the
//! monitor-socket probe, anti-affinity against sibling worker pods, and
//! optional node pinning.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Affinity, Container, NodeAffinity, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm,
    Pod, PodAffinityTerm, PodAntiAffinity, PodSpec, ResourceRequirements, SecurityContext,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;

use crds::{Credential, MachineImage, VirtualMachine};
use kube::ResourceExt;

use crate::labels::*;
use crate::templates::util::*;
use crate::templates::TemplateConfig;

/// Mint a unique worker pod name: the machine name plus eight hex digits.
/// The same value lands in the `unique_name` label so one specific pod can
/// be targeted by selector.
pub fn worker_pod_name(machine: &str) -> String {
    format!("{}-{:08x}", machine, rand::random::<u32>())
}

/// Worker pod booting from the image baked into the machine image's
/// container image. A tools init container populates the shared `vm-fs`
/// host volume the VM container bind-mounts its userland from.
pub fn ephemeral_worker_pod(
    machine: &VirtualMachine,
    image: &MachineImage,
    public_keys: &[std::sync::Arc<Credential>],
    config: &TemplateConfig,
    migrate: bool,
) -> Pod {
    let name = machine.name_any();
    let pod_name = worker_pod_name(&name);

    let hugepages = if machine.spec.use_huge_pages {
        vol_empty_dir_huge_pages("hugepages")
    } else {
        vol_empty_dir("hugepages")
    };

    let mut container = Container {
        name: ROLE_WORKER.to_string(),
        image: Some(image.spec.container_image.clone()),
        image_pull_policy: Some("Always".to_string()),
        command: Some(vec!["/usr/bin/startvm".to_string()]),
        env: Some(worker_env(machine, config, migrate)),
        volume_mounts: Some(vec![
            volume_mount("vm-image", "/image"),
            volume_mount("dev-kvm", "/dev/kvm"),
            volume_mount("hugepages", "/hugepages"),
            volume_mount("vm-socket", "/vm"),
            volume_mount_sub("vm-fs", "/bin", "bin", true),
            // the kubelet mounts /etc/hosts and friends, so /etc stays writable
            volume_mount_sub("vm-fs", "/etc", "etc", false),
            volume_mount_sub("vm-fs", "/lib", "lib", true),
            volume_mount_sub("vm-fs", "/lib64", "lib64", true),
            volume_mount_sub("vm-fs", "/sbin", "sbin", true),
            volume_mount_sub("vm-fs", "/usr", "usr", true),
            volume_mount_sub("vm-fs", "/var", "var", true),
        ]),
        liveness_probe: Some(console_probe()),
        readiness_probe: Some(console_probe()),
        security_context: Some(SecurityContext {
            privileged: Some(true),
            ..Default::default()
        }),
        ..Default::default()
    };
    apply_resource_limits(&mut container, machine, config);
    add_public_keys(&mut container, public_keys);

    let bootstrap = Container {
        name: "bootstrap".to_string(),
        image: Some(config.image_tools.clone()),
        image_pull_policy: Some("Always".to_string()),
        volume_mounts: Some(vec![volume_mount("vm-fs", "/vm-tools")]),
        ..Default::default()
    };

    let mut pod = Pod {
        metadata: worker_metadata(machine, &pod_name),
        spec: Some(PodSpec {
            volumes: Some(vec![
                vol_host_state(&name, "vm-fs"),
                vol_host_state(&name, "vm-image"),
                vol_host_path("vm-socket", host_state_dir(&name)),
                vol_host_path("dev-kvm", "/dev/kvm"),
                hugepages,
            ]),
            init_containers: Some(vec![bootstrap]),
            containers: vec![container],
            host_network: Some(true),
            image_pull_secrets: pull_secrets(&config.pull_secret),
            ..Default::default()
        }),
        ..Default::default()
    };

    apply_worker_affinity(&mut pod, machine);
    if migrate {
        add_migrate_port(&mut pod);
    }
    pod
}

/// Worker pod booting from the machine's networked block volume, mounted
/// through the PVC that carries the machine's name.
pub fn network_volume_worker_pod(
    machine: &VirtualMachine,
    public_keys: &[std::sync::Arc<Credential>],
    config: &TemplateConfig,
    migrate: bool,
) -> Pod {
    let name = machine.name_any();
    let pod_name = worker_pod_name(&name);

    let mut container = Container {
        name: ROLE_WORKER.to_string(),
        image: Some(config.image_tools.clone()),
        image_pull_policy: Some("Always".to_string()),
        command: Some(vec!["/opt/rancher/vm-tools/startvm".to_string()]),
        env: Some(worker_env(machine, config, migrate)),
        volume_mounts: Some(vec![
            volume_mount("dev-kvm", "/dev/kvm"),
            volume_mount("vm-socket", "/vm"),
            volume_mount("vm-disk", "/disk"),
        ]),
        liveness_probe: Some(console_probe()),
        readiness_probe: Some(console_probe()),
        security_context: Some(SecurityContext {
            privileged: Some(true),
            ..Default::default()
        }),
        ..Default::default()
    };
    apply_resource_limits(&mut container, machine, config);
    add_public_keys(&mut container, public_keys);

    let mut pod = Pod {
        metadata: worker_metadata(machine, &pod_name),
        spec: Some(PodSpec {
            volumes: Some(vec![
                vol_host_path("vm-socket", host_state_dir(&name)),
                vol_host_path("dev-kvm", "/dev/kvm"),
                vol_pvc("vm-disk", &name),
            ]),
            containers: vec![container],
            host_network: Some(true),
            image_pull_secrets: pull_secrets(&config.pull_secret),
            ..Default::default()
        }),
        ..Default::default()
    };

    apply_worker_affinity(&mut pod, machine);
    if migrate {
        add_migrate_port(&mut pod);
    }
    pod
}

fn worker_metadata(
    machine: &VirtualMachine,
    pod_name: &str,
) -> k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
    let name = machine.name_any();
    let status = machine.status.clone().unwrap_or_default();

    let labels = BTreeMap::from([
        (LABEL_APP.to_string(), APP.to_string()),
        (LABEL_ROLE.to_string(), ROLE_WORKER.to_string()),
        (LABEL_NAME.to_string(), name),
        (LABEL_UNIQUE_NAME.to_string(), pod_name.to_string()),
    ]);
    let mut meta = child_metadata(pod_name, labels);
    meta.annotations = Some(BTreeMap::from([
        (ANNOTATION_CPUS.to_string(), machine.spec.cpus.to_string()),
        (
            ANNOTATION_MEMORY_MB.to_string(),
            machine.spec.memory_mb.to_string(),
        ),
        (ANNOTATION_INSTANCE_ID.to_string(), status.instance_id),
        (ANNOTATION_MAC.to_string(), status.mac),
    ]));
    meta
}

fn worker_env(
    machine: &VirtualMachine,
    config: &TemplateConfig,
    migrate: bool,
) -> Vec<k8s_openapi::api::core::v1::EnvVar> {
    let status = machine.status.clone().unwrap_or_default();
    vec![
        env_var_field("MY_POD_NAME", "metadata.name"),
        env_var_field("MY_POD_NAMESPACE", "metadata.namespace"),
        env_var("IFACE", config.bridge_iface.clone()),
        env_var("KVM_EXTRA_ARGS", machine.spec.kvm_extra_args.clone()),
        env_var("MEMORY_MB", machine.spec.memory_mb.to_string()),
        env_var("CPUS", machine.spec.cpus.to_string()),
        env_var("MAC", status.mac),
        env_var("INSTANCE_ID", status.instance_id),
        env_var("MIGRATE", migrate.to_string()),
        env_var("MY_VM_NAME", machine.name_any()),
    ]
}

/// CPU, memory and optional hugepages limits sized from the machine spec.
fn apply_resource_limits(
    container: &mut Container,
    machine: &VirtualMachine,
    config: &TemplateConfig,
) {
    if config.no_resource_limits {
        return;
    }
    let mut limits = BTreeMap::from([
        ("cpu".to_string(), Quantity(machine.spec.cpus.to_string())),
        (
            "memory".to_string(),
            Quantity(format!("{}Mi", machine.spec.memory_mb)),
        ),
    ]);
    if machine.spec.use_huge_pages {
        limits.insert(
            "hugepages-2Mi".to_string(),
            Quantity(format!("{}Mi", machine.spec.memory_mb)),
        );
    }
    container.resources = Some(ResourceRequirements {
        limits: Some(limits),
        ..Default::default()
    });
}

fn add_public_keys(container: &mut Container, public_keys: &[std::sync::Arc<Credential>]) {
    let env = container.env.get_or_insert_with(Vec::new);
    env.push(env_var("PUBLIC_KEY_COUNT", public_keys.len().to_string()));
    for (i, key) in public_keys.iter().enumerate() {
        env.push(env_var(
            &format!("PUBLIC_KEY_{}", i + 1),
            key.spec.public_key.clone(),
        ));
    }
}

/// Pseudo-random migration listen port in [32768, 65536), injected as env
/// and recorded as an annotation for the source side to dial. A collision
/// surfaces as a failed bind and is retried with a fresh port next tick.
fn add_migrate_port(pod: &mut Pod) {
    let port = 32768 + (rand::random::<u32>() % 32768);

    if let Some(spec) = pod.spec.as_mut() {
        if let Some(container) = spec.containers.first_mut() {
            container
                .env
                .get_or_insert_with(Vec::new)
                .push(env_var("MIGRATE_PORT", port.to_string()));
        }
    }
    pod.metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(ANNOTATION_MIGRATE_PORT.to_string(), port.to_string());
}

/// Hard anti-affinity against other worker pods of the same machine (so a
/// migration target lands on a different node), plus node pinning when the
/// machine requests one. A node name that does not exist is allowed; the
/// pod stays Pending until such a node appears.
fn apply_worker_affinity(pod: &mut Pod, machine: &VirtualMachine) {
    let mut affinity = Affinity {
        pod_anti_affinity: Some(PodAntiAffinity {
            required_during_scheduling_ignored_during_execution: Some(vec![PodAffinityTerm {
                label_selector: Some(LabelSelector {
                    match_labels: Some(BTreeMap::from([
                        (LABEL_APP.to_string(), APP.to_string()),
                        (LABEL_ROLE.to_string(), ROLE_WORKER.to_string()),
                        (LABEL_NAME.to_string(), machine.name_any()),
                    ])),
                    ..Default::default()
                }),
                topology_key: LABEL_NODE_HOSTNAME.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    };

    if !machine.spec.node_name.is_empty() {
        affinity.node_affinity = Some(NodeAffinity {
            required_during_scheduling_ignored_during_execution: Some(NodeSelector {
                node_selector_terms: vec![NodeSelectorTerm {
                    match_expressions: Some(vec![NodeSelectorRequirement {
                        key: LABEL_NODE_HOSTNAME.to_string(),
                        operator: "In".to_string(),
                        values: Some(vec![machine.spec.node_name.clone()]),
                    }]),
                    ..Default::default()
                }],
            }),
            ..Default::default()
        });
    }

    if let Some(spec) = pod.spec.as_mut() {
        spec.affinity = Some(affinity);
    }
}
