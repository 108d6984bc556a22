//! Credential CRD
//!
//! A named public key that machines reference to seed guest SSH access.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "vm.rancher.io",
    version = "v1alpha1",
    kind = "Credential"
)]
#[serde(rename_all = "camelCase")]
pub struct CredentialSpec {
    /// The public key material, verbatim
    pub public_key: String,
}
