//! ARPTable CRD
//!
//! Per-node map of MAC to IP correlations scraped from the host bridge by a
//! side controller. The machine reconciler reads these to learn guest IPs
//! without touching the DHCP server or instrumenting guests.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "vm.rancher.io",
    version = "v1alpha1",
    kind = "ARPTable"
)]
#[serde(rename_all = "camelCase")]
pub struct ARPTableSpec {
    /// MAC address to discovered entry
    #[serde(default)]
    pub table: BTreeMap<String, ArpEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ArpEntry {
    pub ip: String,
    #[serde(default)]
    pub hw_type: String,
    #[serde(default)]
    pub flags: String,
    #[serde(default)]
    pub hw_addr: String,
    #[serde(default)]
    pub mask: String,
    #[serde(default)]
    pub device: String,
}
