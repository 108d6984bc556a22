//! Image pipeline pod templates
//!
//! `pull_pod` pre-pulls a machine image onto one node: it is pinned there
//! and its only job is to exist long enough for the kubelet to fetch the
//! image. `publish_pod` turns a volume backup into a pushed container
//! image: an engine container restores the backup to a qcow2 file on a
//! shared workspace, and a builder container waits for the `.ready`
//! sentinel before building and pushing the image.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Container, KeyToPath, Pod, PodSpec, ProjectedVolumeSource, SecretProjection,
    SecurityContext, Volume, VolumeMount, VolumeProjection,
};

use crds::MachineImage;
use kube::ResourceExt;

use crate::labels::*;
use crate::templates::util::*;

/// Directory the publish containers share.
const WORKSPACE_DIR: &str = "/workspace";

/// File name of the restored disk inside the workspace.
const DISK_FILE: &str = "base.qcow2";

/// Knobs of the publish pod, resolved from settings by the reconciler.
#[derive(Debug, Clone, Default)]
pub struct PublishConfig {
    /// Storage engine image able to restore backups
    pub engine_image: String,
    /// Image builder (runs the Dockerfile build and push)
    pub builder_image: String,
    /// Pass `--insecure` to the builder push
    pub registry_insecure: bool,
    /// Docker-config secret mounted for registry auth; empty disables it
    pub registry_secret: String,
}

fn image_labels(image: &MachineImage) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_APP.to_string(), APP.to_string()),
        (LABEL_ROLE.to_string(), ROLE_IMAGE.to_string()),
        (LABEL_NAME.to_string(), image.name_any()),
    ])
}

/// Node-pinned pod that pulls the image and exits.
pub fn pull_pod(image: &MachineImage, node: &str) -> Pod {
    Pod {
        metadata: child_metadata(&pull_pod_name(&image.name_any(), node), image_labels(image)),
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "pull".to_string(),
                image: Some(image.spec.container_image.clone()),
                image_pull_policy: Some("Always".to_string()),
                command: Some(vec![
                    "/bin/sh".to_string(),
                    "-c".to_string(),
                    "echo pulled".to_string(),
                ]),
                ..Default::default()
            }],
            node_name: Some(node.to_string()),
            restart_policy: Some("Never".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Build pod that restores the image's backup and pushes the result.
pub fn publish_pod(image: &MachineImage, config: &PublishConfig) -> Pod {
    let status = image.status.clone().unwrap_or_default();
    let output_file = format!("{}/{}", WORKSPACE_DIR, DISK_FILE);

    let create_dockerfile = format!(
        "echo -e 'FROM busybox\\nCOPY {} /base_image/' > {}/Dockerfile",
        DISK_FILE, WORKSPACE_DIR
    );

    let restore = format!(
        "longhorn restore-to --backup-url '{}' --output-file '{}'; touch {}/.ready",
        status.backup_url, output_file, WORKSPACE_DIR
    );

    let mut build_and_push = format!(
        "while true; do if [ -f {}/.ready ]; then break; else sleep 1; fi; done; \
         /kaniko/executor --dockerfile=Dockerfile --destination={}",
        WORKSPACE_DIR, image.spec.container_image
    );
    if config.registry_insecure {
        build_and_push.push_str(" --insecure");
    }

    let engine = Container {
        name: "engine".to_string(),
        image: Some(config.engine_image.clone()),
        command: Some(vec!["/bin/sh".to_string(), "-c".to_string(), restore]),
        volume_mounts: Some(vec![volume_mount("build-context", WORKSPACE_DIR)]),
        security_context: Some(SecurityContext {
            privileged: Some(true),
            ..Default::default()
        }),
        ..Default::default()
    };

    let mut builder = Container {
        name: "builder".to_string(),
        image: Some(config.builder_image.clone()),
        command: Some(vec![
            "/busybox/sh".to_string(),
            "-c".to_string(),
            build_and_push,
        ]),
        volume_mounts: Some(vec![volume_mount("build-context", WORKSPACE_DIR)]),
        ..Default::default()
    };

    let mut volumes = vec![vol_empty_dir("build-context")];
    let mut init_containers = vec![Container {
        name: "create-dockerfile".to_string(),
        image: Some(config.builder_image.clone()),
        command: Some(vec![
            "/busybox/sh".to_string(),
            "-c".to_string(),
            create_dockerfile,
        ]),
        volume_mounts: Some(vec![volume_mount("build-context", WORKSPACE_DIR)]),
        ..Default::default()
    }];

    if !config.registry_secret.is_empty() {
        volumes.push(Volume {
            name: "docker-config".to_string(),
            projected: Some(ProjectedVolumeSource {
                sources: Some(vec![VolumeProjection {
                    secret: Some(SecretProjection {
                        name: Some(config.registry_secret.clone()),
                        items: Some(vec![KeyToPath {
                            key: ".dockerconfigjson".to_string(),
                            path: ".docker/config.json".to_string(),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        });
        builder
            .volume_mounts
            .get_or_insert_with(Vec::new)
            .push(volume_mount("docker-config", "/root"));
    }

    let mut containers = vec![engine, builder];
    if !status.base_image.is_empty() {
        add_base_image(
            &mut init_containers,
            &mut containers,
            &mut volumes,
            &status.base_image,
            &status.backup_url,
            &output_file,
        );
    }

    Pod {
        metadata: child_metadata(&publish_pod_name(&image.name_any()), image_labels(image)),
        spec: Some(PodSpec {
            volumes: Some(volumes),
            init_containers: Some(init_containers),
            containers,
            restart_policy: Some("Never".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Wire the backing image through the publish pod: an init container primes
/// it onto the node, a side container bind-mounts its payload into the
/// shared `share` volume, and the engine restore switches to
/// `--backing-file` once the mount shows up.
fn add_base_image(
    init_containers: &mut Vec<Container>,
    containers: &mut Vec<Container>,
    volumes: &mut Vec<Volume>,
    base_image: &str,
    backup_url: &str,
    output_file: &str,
) {
    init_containers.push(Container {
        name: "prime-base-image".to_string(),
        image: Some(base_image.to_string()),
        image_pull_policy: Some("Always".to_string()),
        command: Some(vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            format!("echo primed {}", base_image),
        ]),
        ..Default::default()
    });

    volumes.push(vol_empty_dir("share"));

    // engine waits for the bind mount, then restores on top of it
    let engine = &mut containers[0];
    engine
        .volume_mounts
        .get_or_insert_with(Vec::new)
        .push(VolumeMount {
            name: "share".to_string(),
            mount_path: "/share".to_string(),
            read_only: Some(true),
            mount_propagation: Some("HostToContainer".to_string()),
            ..Default::default()
        });
    if let Some(command) = engine.command.as_mut() {
        command[2] = format!(
            "while true; do list=$(ls /share/base_image/* 2>&1); if [ $? -eq 0 ]; \
             then break; fi; echo waiting; sleep 1; done; echo Directory found $list; \
             longhorn restore-to --backing-file /share/base_image \
             --backup-url '{}' --output-file '{}'; touch {}/.ready",
            backup_url, output_file, WORKSPACE_DIR
        );
    }

    containers.push(Container {
        name: "base-image".to_string(),
        image: Some(base_image.to_string()),
        image_pull_policy: Some("Never".to_string()),
        command: Some(vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            "function cleanup() { while true; do umount /share/base_image; \
             if [ $? -eq 0 ]; then echo unmounted && kill $tpid && break; fi; \
             echo waiting && sleep 1; done }; \
             mkdir -p /share/base_image && mount --bind /base_image/ /share/base_image && \
             echo base image mounted at /share/base_image && trap cleanup TERM && \
             mkfifo noop && tail -f noop & tpid=$! && trap cleanup TERM && wait $tpid"
                .to_string(),
        ]),
        security_context: Some(SecurityContext {
            privileged: Some(true),
            ..Default::default()
        }),
        volume_mounts: Some(vec![VolumeMount {
            name: "share".to_string(),
            mount_path: "/share".to_string(),
            mount_propagation: Some("Bidirectional".to_string()),
            ..Default::default()
        }]),
        ..Default::default()
    });
}
