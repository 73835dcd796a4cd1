//! WutongComponent custom resource

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// One platform component the operator runs
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[kube(
    group = "wutong.io",
    version = "v1alpha1",
    kind = "WutongComponent",
    plural = "wutongcomponents",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct WutongComponentSpec {
    /// Fully qualified image reference
    #[serde(default)]
    pub image: String,
    /// Kubernetes image pull policy
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image_pull_policy: String,
    /// Desired replicas; the operator picks when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    /// Started before everything else
    #[serde(default)]
    pub priority_component: bool,
}
