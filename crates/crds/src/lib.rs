//! Custom resource definitions for the VM operator.
//!
//! All records are cluster scoped and served from the `vm.rancher.io/v1alpha1`
//! API group. Child pods, services and jobs created for these records live in
//! the fixed `default` namespace and are not part of this crate.

pub mod arp_table;
pub mod credential;
pub mod machine_image;
pub mod setting;
pub mod virtual_machine;

pub use arp_table::*;
pub use credential::*;
pub use machine_image::*;
pub use setting::*;
pub use virtual_machine::*;

/// Finalizer present on every live VirtualMachine. Its removal permits the
/// apiserver to purge the record.
pub const FINALIZER_DELETION: &str = "deletion.vm.rancher.io";

/// Locally administered OUI prefixed to every guest MAC address.
pub const MAC_OUI: &str = "06:fe";
