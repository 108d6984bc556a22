//! Labels, annotations and derived resource names
//!
//! Every artifact owned by a machine or image derives its name from the
//! owning record, and carries the `app`/`role`/`name` label triple the
//! selectors and routers key on. Worker pods additionally carry a
//! `unique_name` label equal to their own pod name so one specific pod can
//! be targeted by selector during migration.

/// Namespace all child pods, services and jobs live in.
pub const NAMESPACE: &str = "default";

pub const LABEL_APP: &str = "app";
pub const LABEL_ROLE: &str = "role";
pub const LABEL_NAME: &str = "name";
pub const LABEL_UNIQUE_NAME: &str = "unique_name";

/// Value of the `app` label on everything this operator creates.
pub const APP: &str = "vm-operator";

pub const ROLE_WORKER: &str = "worker";
pub const ROLE_CONSOLE: &str = "console";
pub const ROLE_IMAGE: &str = "image";
pub const ROLE_MIGRATE: &str = "migrate";

pub const ANNOTATION_CPUS: &str = "cpus";
pub const ANNOTATION_MEMORY_MB: &str = "memory_mb";
pub const ANNOTATION_INSTANCE_ID: &str = "instance_id";
pub const ANNOTATION_MAC: &str = "mac";
pub const ANNOTATION_MIGRATE_PORT: &str = "migrate_port";

/// Node label carrying the hostname, used for node affinity pinning.
pub const LABEL_NODE_HOSTNAME: &str = "kubernetes.io/hostname";

/// Host directory under which each machine keeps its state
/// (`vm-fs/`, `vm-image/`, and the monitor/VNC sockets).
pub const HOST_STATE_DIR: &str = "/var/lib/rancher/vm";

/// Backup label the publish pipeline reads the backing image from.
pub const BACKUP_LABEL_BASE_IMAGE: &str = "base-image";

/// Host state directory of one machine.
pub fn host_state_dir(machine: &str) -> String {
    format!("{}/{}", HOST_STATE_DIR, machine)
}

/// Monitor socket path of a worker pod, as seen inside containers that
/// mount the machine's state directory at `/vm`.
pub fn monitor_socket_path(pod_name: &str) -> String {
    format!("/vm/{}_monitor.sock", pod_name)
}

pub fn console_pod_name(machine: &str) -> String {
    format!("{}-console", machine)
}

pub fn console_service_name(machine: &str) -> String {
    format!("{}-console", machine)
}

pub fn migration_job_name(machine: &str) -> String {
    format!("{}-migrate", machine)
}

pub fn publish_pod_name(image: &str) -> String {
    format!("publish-{}", image)
}

pub fn pull_pod_name(image: &str, node: &str) -> String {
    format!("pull-{}-{}", image, node)
}

/// Label selector string matching the worker pods of one machine.
pub fn worker_pod_selector(machine: &str) -> String {
    format!(
        "{}={},{}={},{}={}",
        LABEL_APP, APP, LABEL_ROLE, ROLE_WORKER, LABEL_NAME, machine
    )
}
