//! WutongVolume custom resource
//!
//! Storage backing the platform. One volume is created per access mode.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{CsiPluginSource, StorageClassParameters};

/// Storage description for one access mode
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[kube(
    group = "wutong.io",
    version = "v1alpha1",
    kind = "WutongVolume",
    plural = "wutongvolumes",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct WutongVolumeSpec {
    /// Existing storage class to use
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub storage_class_name: String,

    /// Parameters for a storage class the operator creates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_parameters: Option<StorageClassParameters>,

    /// CSI plugin the operator deploys
    #[serde(default, rename = "csiPlugin", skip_serializing_if = "Option::is_none")]
    pub csi_plugin: Option<CsiPluginSource>,

    /// Repository for plugin images
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image_repository: String,
}

impl WutongVolumeSpec {
    /// Has neither a storage class nor a plugin
    pub fn is_unset(&self) -> bool {
        self.storage_class_name.is_empty()
            && self.csi_plugin.as_ref().map(|p| p.is_empty()).unwrap_or(true)
    }
}
