//! Setting CRD
//!
//! String-valued configuration keys from a closed enumeration. Missing
//! settings are created from built-in defaults when the controller starts,
//! and changes to the storage-related keys rebuild the storage client.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "vm.rancher.io",
    version = "v1alpha1",
    kind = "Setting"
)]
#[serde(rename_all = "camelCase")]
pub struct SettingSpec {
    pub value: String,
}

/// The closed set of setting keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingName {
    /// Base URL of the block-storage REST API
    StorageEndpoint,
    StorageAccessKey,
    StorageSecretKey,
    /// Skip TLS verification when talking to the storage endpoint
    StorageInsecureSkipVerify,
    /// Registry the publish pipeline pushes to
    RegistryAddress,
    /// Name of the docker-config secret used for registry auth
    RegistrySecret,
    /// Pass `--insecure` to the image builder
    RegistryInsecure,
    /// Image of the builder container used by the publish pod
    ImageBuilder,
    /// Image of the storage engine container used by the publish pod
    ImageEngine,
    /// Minimum node count an image must be pulled on to report Ready
    ImageMinimumReplicas,
}

impl SettingName {
    pub const ALL: [SettingName; 10] = [
        SettingName::StorageEndpoint,
        SettingName::StorageAccessKey,
        SettingName::StorageSecretKey,
        SettingName::StorageInsecureSkipVerify,
        SettingName::RegistryAddress,
        SettingName::RegistrySecret,
        SettingName::RegistryInsecure,
        SettingName::ImageBuilder,
        SettingName::ImageEngine,
        SettingName::ImageMinimumReplicas,
    ];

    /// The record name this key is stored under.
    pub fn as_str(&self) -> &'static str {
        match self {
            SettingName::StorageEndpoint => "storage-endpoint",
            SettingName::StorageAccessKey => "storage-access-key",
            SettingName::StorageSecretKey => "storage-secret-key",
            SettingName::StorageInsecureSkipVerify => "storage-insecure-skip-verify",
            SettingName::RegistryAddress => "registry-address",
            SettingName::RegistrySecret => "registry-secret",
            SettingName::RegistryInsecure => "registry-insecure",
            SettingName::ImageBuilder => "image-builder",
            SettingName::ImageEngine => "image-engine",
            SettingName::ImageMinimumReplicas => "image-minimum-replicas",
        }
    }

    /// Bundled default value, used to create the record when absent.
    pub fn default_value(&self) -> &'static str {
        match self {
            SettingName::StorageEndpoint => "http://longhorn-backend:9500",
            SettingName::StorageAccessKey => "",
            SettingName::StorageSecretKey => "",
            SettingName::StorageInsecureSkipVerify => "false",
            SettingName::RegistryAddress => "",
            SettingName::RegistrySecret => "",
            SettingName::RegistryInsecure => "false",
            SettingName::ImageBuilder => "gcr.io/kaniko-project/executor:latest",
            SettingName::ImageEngine => "longhornio/longhorn-engine:v1.5.1",
            SettingName::ImageMinimumReplicas => "3",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn setting_names_are_unique() {
        let names: HashSet<&str> = SettingName::ALL.iter().map(|s| s.as_str()).collect();
        assert_eq!(names.len(), SettingName::ALL.len());
    }

    #[test]
    fn minimum_replicas_default_parses() {
        let min: usize = SettingName::ImageMinimumReplicas
            .default_value()
            .parse()
            .unwrap();
        assert_eq!(min, 3);
    }
}
