//! Workload templates
//!
//! Pure constructors that materialize the pods, services, jobs and volumes
//! realizing a machine or image. Nothing in here talks to the apiserver;
//! the reconcilers render a spec and create it.

pub mod console;
pub mod image_pods;
pub mod migration_job;
pub mod util;
pub mod volumes;
pub mod worker_pod;

pub use console::{console_pod, console_service};
pub use image_pods::{publish_pod, pull_pod};
pub use migration_job::migration_job;
pub use volumes::{persistent_volume, persistent_volume_claim};
pub use worker_pod::{ephemeral_worker_pod, network_volume_worker_pod, worker_pod_name};

/// Image references and knobs the templates need beyond the records
/// themselves. Assembled by the reconciler from CLI flags and settings.
#[derive(Debug, Clone, Default)]
pub struct TemplateConfig {
    /// Host interface the guest NIC bridges onto
    pub bridge_iface: String,
    /// Skip CPU/memory limits on worker pods
    pub no_resource_limits: bool,
    /// Controller image; runs the migration driver sub-mode in jobs
    pub image_vm: String,
    /// Console sidecar image
    pub image_console: String,
    /// Tools image used to bootstrap worker pod filesystems
    pub image_tools: String,
    /// Registry pull secret name; empty disables pull secrets
    pub pull_secret: String,
}

#[cfg(test)]
#[path = "templates_test.rs"]
mod templates_test;
