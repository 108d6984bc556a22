//! Unit tests for the workload templates

use std::sync::Arc;

use super::image_pods::PublishConfig;
use super::*;
use crate::labels::*;

use crds::{
    Credential, CredentialSpec, MachineAction, MachineImage, MachineImageSpec,
    MachineImageStatus, NetworkBlockVolume, VirtualMachine, VirtualMachineSpec,
    VirtualMachineStatus, VolumeSource,
};

fn test_machine() -> VirtualMachine {
    let mut machine = VirtualMachine::new(
        "m1",
        VirtualMachineSpec {
            cpus: 2,
            memory_mb: 1024,
            machine_image: "ubuntu".to_string(),
            action: MachineAction::Start,
            public_keys: vec!["alice".to_string()],
            hosted_console: true,
            node_name: String::new(),
            kvm_extra_args: "-cpu host".to_string(),
            use_huge_pages: false,
            volume: VolumeSource::Ephemeral,
        },
    );
    machine.status = Some(VirtualMachineStatus {
        instance_id: "i-ab12cd34".to_string(),
        mac: "06:fe:ab:12:cd:34".to_string(),
        ..Default::default()
    });
    machine
}

fn test_image() -> MachineImage {
    let mut image = MachineImage::new(
        "ubuntu",
        MachineImageSpec {
            container_image: "registry.local/vm/ubuntu:16.04".to_string(),
            size_gib: 10,
            from_virtual_machine: String::new(),
        },
    );
    image.status = Some(MachineImageStatus {
        backup_url: "s3://bk@us/x?backup=b-1&volume=m1".to_string(),
        ..Default::default()
    });
    image
}

fn test_keys() -> Vec<Arc<Credential>> {
    vec![Arc::new(Credential::new(
        "alice",
        CredentialSpec {
            public_key: "ssh-rsa AAAA alice".to_string(),
        },
    ))]
}

fn test_config() -> TemplateConfig {
    TemplateConfig {
        bridge_iface: "br0".to_string(),
        no_resource_limits: false,
        image_vm: "registry.local/vm/operator:latest".to_string(),
        image_console: "registry.local/vm/console:latest".to_string(),
        image_tools: "registry.local/vm/tools:latest".to_string(),
        pull_secret: String::new(),
    }
}

fn env_value(pod: &k8s_openapi::api::core::v1::Pod, name: &str) -> Option<String> {
    pod.spec.as_ref()?.containers[0]
        .env
        .as_ref()?
        .iter()
        .find(|e| e.name == name)?
        .value
        .clone()
}

#[test]
fn worker_pod_names_are_unique_per_render() {
    let a = worker_pod_name("m1");
    let b = worker_pod_name("m1");
    assert!(a.starts_with("m1-"));
    assert_eq!(a.len(), "m1-".len() + 8);
    assert!(a[3..].chars().all(|c| c.is_ascii_hexdigit()));
    assert_ne!(a, b);
}

#[test]
fn worker_pod_labels_carry_unique_name() {
    let pod = ephemeral_worker_pod(&test_machine(), &test_image(), &test_keys(), &test_config(), false);
    let labels = pod.metadata.labels.as_ref().unwrap();
    let pod_name = pod.metadata.name.as_deref().unwrap();
    assert_eq!(labels[LABEL_APP], APP);
    assert_eq!(labels[LABEL_ROLE], ROLE_WORKER);
    assert_eq!(labels[LABEL_NAME], "m1");
    assert_eq!(labels[LABEL_UNIQUE_NAME], pod_name);
}

#[test]
fn worker_pod_env_propagates_identity() {
    let pod = ephemeral_worker_pod(&test_machine(), &test_image(), &test_keys(), &test_config(), false);
    assert_eq!(env_value(&pod, "MAC").as_deref(), Some("06:fe:ab:12:cd:34"));
    assert_eq!(env_value(&pod, "INSTANCE_ID").as_deref(), Some("i-ab12cd34"));
    assert_eq!(env_value(&pod, "CPUS").as_deref(), Some("2"));
    assert_eq!(env_value(&pod, "MEMORY_MB").as_deref(), Some("1024"));
    assert_eq!(env_value(&pod, "IFACE").as_deref(), Some("br0"));
    assert_eq!(env_value(&pod, "MIGRATE").as_deref(), Some("false"));
    assert_eq!(env_value(&pod, "MY_VM_NAME").as_deref(), Some("m1"));
}

#[test]
fn worker_pod_enumerates_public_keys() {
    let pod = ephemeral_worker_pod(&test_machine(), &test_image(), &test_keys(), &test_config(), false);
    assert_eq!(env_value(&pod, "PUBLIC_KEY_COUNT").as_deref(), Some("1"));
    assert_eq!(
        env_value(&pod, "PUBLIC_KEY_1").as_deref(),
        Some("ssh-rsa AAAA alice")
    );
}

#[test]
fn worker_pod_anti_affinity_targets_sibling_workers() {
    let pod = ephemeral_worker_pod(&test_machine(), &test_image(), &test_keys(), &test_config(), false);
    let term = &pod
        .spec
        .as_ref()
        .unwrap()
        .affinity
        .as_ref()
        .unwrap()
        .pod_anti_affinity
        .as_ref()
        .unwrap()
        .required_during_scheduling_ignored_during_execution
        .as_ref()
        .unwrap()[0];
    assert_eq!(term.topology_key, LABEL_NODE_HOSTNAME);
    let labels = term
        .label_selector
        .as_ref()
        .unwrap()
        .match_labels
        .as_ref()
        .unwrap();
    assert_eq!(labels[LABEL_NAME], "m1");
    assert_eq!(labels[LABEL_ROLE], ROLE_WORKER);
    // unique_name must NOT be part of the anti-affinity, or two pods of the
    // same machine could land on one node during migration.
    assert!(!labels.contains_key(LABEL_UNIQUE_NAME));
}

#[test]
fn node_affinity_present_only_when_node_is_pinned() {
    let unpinned = ephemeral_worker_pod(&test_machine(), &test_image(), &test_keys(), &test_config(), false);
    assert!(unpinned
        .spec
        .as_ref()
        .unwrap()
        .affinity
        .as_ref()
        .unwrap()
        .node_affinity
        .is_none());

    let mut machine = test_machine();
    machine.spec.node_name = "node-b".to_string();
    let pinned = ephemeral_worker_pod(&machine, &test_image(), &test_keys(), &test_config(), false);
    let requirement = &pinned
        .spec
        .as_ref()
        .unwrap()
        .affinity
        .as_ref()
        .unwrap()
        .node_affinity
        .as_ref()
        .unwrap()
        .required_during_scheduling_ignored_during_execution
        .as_ref()
        .unwrap()
        .node_selector_terms[0]
        .match_expressions
        .as_ref()
        .unwrap()[0];
    assert_eq!(requirement.key, LABEL_NODE_HOSTNAME);
    assert_eq!(requirement.values.as_deref(), Some(&["node-b".to_string()][..]));
}

#[test]
fn resource_limits_follow_the_spec() {
    let pod = ephemeral_worker_pod(&test_machine(), &test_image(), &test_keys(), &test_config(), false);
    let limits = pod.spec.as_ref().unwrap().containers[0]
        .resources
        .as_ref()
        .unwrap()
        .limits
        .as_ref()
        .unwrap();
    assert_eq!(limits["cpu"].0, "2");
    assert_eq!(limits["memory"].0, "1024Mi");
    assert!(!limits.contains_key("hugepages-2Mi"));
}

#[test]
fn hugepages_adds_matching_limit_and_medium() {
    let mut machine = test_machine();
    machine.spec.use_huge_pages = true;
    let pod = ephemeral_worker_pod(&machine, &test_image(), &test_keys(), &test_config(), false);
    let limits = pod.spec.as_ref().unwrap().containers[0]
        .resources
        .as_ref()
        .unwrap()
        .limits
        .as_ref()
        .unwrap();
    assert_eq!(limits["hugepages-2Mi"].0, "1024Mi");

    let hugepages_vol = pod
        .spec
        .as_ref()
        .unwrap()
        .volumes
        .as_ref()
        .unwrap()
        .iter()
        .find(|v| v.name == "hugepages")
        .unwrap();
    assert_eq!(
        hugepages_vol.empty_dir.as_ref().unwrap().medium.as_deref(),
        Some("HugePages")
    );
}

#[test]
fn limits_can_be_disabled() {
    let mut config = test_config();
    config.no_resource_limits = true;
    let pod = ephemeral_worker_pod(&test_machine(), &test_image(), &test_keys(), &config, false);
    assert!(pod.spec.as_ref().unwrap().containers[0].resources.is_none());
}

#[test]
fn migrate_target_pod_gets_a_port_in_range() {
    let pod = ephemeral_worker_pod(&test_machine(), &test_image(), &test_keys(), &test_config(), true);
    let annotation = pod.metadata.annotations.as_ref().unwrap()[ANNOTATION_MIGRATE_PORT].clone();
    let port: u32 = annotation.parse().unwrap();
    assert!((32768..65536).contains(&port));
    assert_eq!(env_value(&pod, "MIGRATE_PORT"), Some(annotation));
    assert_eq!(env_value(&pod, "MIGRATE").as_deref(), Some("true"));
}

#[test]
fn non_migrate_pod_has_no_port() {
    let pod = ephemeral_worker_pod(&test_machine(), &test_image(), &test_keys(), &test_config(), false);
    assert!(!pod
        .metadata
        .annotations
        .as_ref()
        .unwrap()
        .contains_key(ANNOTATION_MIGRATE_PORT));
}

#[test]
fn network_volume_pod_claims_the_machine_volume() {
    let mut machine = test_machine();
    machine.spec.volume = VolumeSource::NetworkBlock(NetworkBlockVolume {
        replicas: 3,
        stale_replica_timeout_sec: 20,
        frontend: "iscsi".to_string(),
    });
    let pod = network_volume_worker_pod(&machine, &test_keys(), &test_config(), false);
    let claim = pod
        .spec
        .as_ref()
        .unwrap()
        .volumes
        .as_ref()
        .unwrap()
        .iter()
        .find_map(|v| v.persistent_volume_claim.as_ref())
        .unwrap();
    assert_eq!(claim.claim_name, "m1");
}

#[test]
fn console_pod_co_locates_with_its_worker() {
    let pod = console_pod(&test_machine(), "m1-00c0ffee", &test_config());
    assert_eq!(pod.metadata.name.as_deref(), Some("m1-console"));
    assert_eq!(
        pod.spec
            .as_ref()
            .unwrap()
            .termination_grace_period_seconds,
        Some(0)
    );
    let term = &pod
        .spec
        .as_ref()
        .unwrap()
        .affinity
        .as_ref()
        .unwrap()
        .pod_affinity
        .as_ref()
        .unwrap()
        .required_during_scheduling_ignored_during_execution
        .as_ref()
        .unwrap()[0];
    let labels = term
        .label_selector
        .as_ref()
        .unwrap()
        .match_labels
        .as_ref()
        .unwrap();
    assert_eq!(labels[LABEL_UNIQUE_NAME], "m1-00c0ffee");
    assert_eq!(labels[LABEL_ROLE], ROLE_WORKER);
    assert_eq!(env_value(&pod, "VM_POD_NAME").as_deref(), Some("m1-00c0ffee"));
}

#[test]
fn console_service_is_node_port_on_console_pods() {
    let service = console_service(&test_machine());
    assert_eq!(service.metadata.name.as_deref(), Some("m1-console"));
    let spec = service.spec.as_ref().unwrap();
    assert_eq!(spec.type_.as_deref(), Some("NodePort"));
    assert_eq!(spec.ports.as_ref().unwrap()[0].port, 6080);
    assert_eq!(
        spec.selector.as_ref().unwrap()[LABEL_ROLE],
        ROLE_CONSOLE.to_string()
    );
}

#[test]
fn migration_job_drives_the_source_socket() {
    let job = migration_job(
        &test_machine(),
        "m1-00c0ffee",
        "tcp:10.42.1.9:44123",
        &test_config(),
    );
    assert_eq!(job.metadata.name.as_deref(), Some("m1-migrate"));
    let pod_spec = job
        .spec
        .as_ref()
        .unwrap()
        .template
        .spec
        .as_ref()
        .unwrap();
    assert_eq!(pod_spec.restart_policy.as_deref(), Some("Never"));

    let args = pod_spec.containers[0].args.as_ref().unwrap()[0].clone();
    assert!(args.contains("--migrate"));
    assert!(args.contains("--sock-path /vm/m1-00c0ffee_monitor.sock"));
    assert!(args.contains("--target-uri tcp:10.42.1.9:44123"));

    let affinity_labels = pod_spec
        .affinity
        .as_ref()
        .unwrap()
        .pod_affinity
        .as_ref()
        .unwrap()
        .required_during_scheduling_ignored_during_execution
        .as_ref()
        .unwrap()[0]
        .label_selector
        .as_ref()
        .unwrap()
        .match_labels
        .as_ref()
        .unwrap();
    assert_eq!(affinity_labels[LABEL_UNIQUE_NAME], "m1-00c0ffee");
}

#[test]
fn pull_pod_is_pinned_to_its_node() {
    let pod = pull_pod(&test_image(), "node-a");
    assert_eq!(pod.metadata.name.as_deref(), Some("pull-ubuntu-node-a"));
    let spec = pod.spec.as_ref().unwrap();
    assert_eq!(spec.node_name.as_deref(), Some("node-a"));
    assert_eq!(spec.restart_policy.as_deref(), Some("Never"));
    assert_eq!(
        spec.containers[0].image.as_deref(),
        Some("registry.local/vm/ubuntu:16.04")
    );
}

#[test]
fn publish_pod_wires_engine_and_builder() {
    let config = PublishConfig {
        engine_image: "registry.local/storage/engine:v1".to_string(),
        builder_image: "registry.local/build/builder:v1".to_string(),
        registry_insecure: false,
        registry_secret: String::new(),
    };
    let pod = publish_pod(&test_image(), &config);
    assert_eq!(pod.metadata.name.as_deref(), Some("publish-ubuntu"));

    let spec = pod.spec.as_ref().unwrap();
    let engine = &spec.containers[0];
    let builder = &spec.containers[1];
    assert_eq!(engine.name, "engine");
    assert_eq!(builder.name, "builder");
    assert!(engine.command.as_ref().unwrap()[2].contains("s3://bk@us/x?backup=b-1&volume=m1"));
    assert!(builder.command.as_ref().unwrap()[2].contains("--destination=registry.local/vm/ubuntu:16.04"));
    assert!(!builder.command.as_ref().unwrap()[2].contains("--insecure"));
}

#[test]
fn publish_pod_honors_insecure_registry_and_secret() {
    let config = PublishConfig {
        engine_image: "e".to_string(),
        builder_image: "b".to_string(),
        registry_insecure: true,
        registry_secret: "registry-auth".to_string(),
    };
    let pod = publish_pod(&test_image(), &config);
    let spec = pod.spec.as_ref().unwrap();
    let builder = &spec.containers[1];
    assert!(builder.command.as_ref().unwrap()[2].ends_with("--insecure"));
    assert!(builder
        .volume_mounts
        .as_ref()
        .unwrap()
        .iter()
        .any(|m| m.name == "docker-config" && m.mount_path == "/root"));
    assert!(spec
        .volumes
        .as_ref()
        .unwrap()
        .iter()
        .any(|v| v.name == "docker-config"));
}

#[test]
fn publish_pod_adds_base_image_plumbing() {
    let mut image = test_image();
    image.status.as_mut().unwrap().base_image = "registry.local/vm/base:1".to_string();
    let config = PublishConfig {
        engine_image: "e".to_string(),
        builder_image: "b".to_string(),
        registry_insecure: false,
        registry_secret: String::new(),
    };
    let pod = publish_pod(&image, &config);
    let spec = pod.spec.as_ref().unwrap();

    assert!(spec
        .init_containers
        .as_ref()
        .unwrap()
        .iter()
        .any(|c| c.name == "prime-base-image"));
    assert!(spec.containers.iter().any(|c| c.name == "base-image"));
    assert!(spec.containers[0]
        .command
        .as_ref()
        .unwrap()[2]
        .contains("--backing-file /share/base_image"));
}

#[test]
fn persistent_volume_and_claim_bind_by_name() {
    let mut machine = test_machine();
    let block = NetworkBlockVolume {
        replicas: 3,
        stale_replica_timeout_sec: 20,
        frontend: "iscsi".to_string(),
    };
    machine.spec.volume = VolumeSource::NetworkBlock(block.clone());

    let pv = persistent_volume(&machine, &block, 10);
    assert_eq!(pv.metadata.name.as_deref(), Some("m1"));
    let pv_spec = pv.spec.as_ref().unwrap();
    assert_eq!(pv_spec.capacity.as_ref().unwrap()["storage"].0, "10Gi");
    assert_eq!(
        pv_spec.csi.as_ref().unwrap().volume_attributes.as_ref().unwrap()["frontend"],
        "iscsi"
    );

    let pvc = persistent_volume_claim(&machine, 10);
    let pvc_spec = pvc.spec.as_ref().unwrap();
    assert_eq!(pvc_spec.volume_name.as_deref(), Some("m1"));
    assert_eq!(pvc_spec.storage_class_name.as_deref(), Some(""));
    assert_eq!(
        pvc_spec.resources.as_ref().unwrap().requests.as_ref().unwrap()["storage"].0,
        "10Gi"
    );
}
