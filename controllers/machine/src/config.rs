//! Command line surface and controller options.

use clap::Parser;

/// Kubernetes operator managing KVM virtual machines.
#[derive(Parser, Debug)]
#[command(name = "machine-controller")]
pub struct Cli {
    /// Concurrent machine resource syncs
    #[arg(long, default_value_t = 5)]
    pub workers: usize,

    /// Run the machine controllers
    #[arg(long)]
    pub vm: bool,

    /// Target network interface to bridge guest NICs onto
    #[arg(long, default_value = "ens33")]
    pub bridge_iface: String,

    /// Disable CPU/memory limits on worker pods
    #[arg(long)]
    pub no_resource_limits: bool,

    /// Controller image, used by migration jobs to run the driver sub-mode
    #[arg(long, default_value = "rancher/vm-operator:latest")]
    pub image_vm: String,

    /// Console sidecar image
    #[arg(long, default_value = "rancher/vm-console:latest")]
    pub image_console: String,

    /// Tools image used to bootstrap worker pod filesystems
    #[arg(long, default_value = "rancher/vm-tools:latest")]
    pub image_tools: String,

    /// Run the live-migration driver instead of the controllers
    #[arg(long)]
    pub migrate: bool,

    /// Path to the VM monitor unix socket (with --migrate)
    #[arg(long)]
    pub sock_path: Option<String>,

    /// URI the guest migrates to, e.g. tcp:10.42.1.9:44123 (with --migrate)
    #[arg(long)]
    pub target_uri: Option<String>,
}

/// Controller options carried into the reconcilers.
#[derive(Debug, Clone, Default)]
pub struct Options {
    pub workers: usize,
    pub bridge_iface: String,
    pub no_resource_limits: bool,
    pub image_vm: String,
    pub image_console: String,
    pub image_tools: String,
}

impl Cli {
    pub fn options(&self) -> Options {
        Options {
            workers: self.workers.max(1),
            bridge_iface: self.bridge_iface.clone(),
            no_resource_limits: self.no_resource_limits,
            image_vm: self.image_vm.clone(),
            image_console: self.image_console.clone(),
            image_tools: self.image_tools.clone(),
        }
    }
}
