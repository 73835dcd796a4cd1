//! WutongCluster custom resource
//!
//! The top-level resource the platform operator reconciles. The adaptor
//! creates it once per cluster and updates it on re-install.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{
    condition_is_true, Condition, Database, EtcdConfig, ImageHub, K8sNode,
};
use super::volume::WutongVolumeSpec;

/// Condition type set once the image repository is usable
pub const CONDITION_IMAGE_REPOSITORY: &str = "ImageRepositoryInstalled";
/// Condition type set once the platform is serving
pub const CONDITION_RUNNING: &str = "Running";

/// Desired state of the platform on one cluster
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "wutong.io",
    version = "v1alpha1",
    kind = "WutongCluster",
    plural = "wutongclusters",
    status = "WutongClusterStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct WutongClusterSpec {
    /// Every required field has been filled in
    #[serde(default)]
    pub config_completed: bool,

    /// Run components with more than one replica
    #[serde(default, rename = "enableHA")]
    pub enable_ha: bool,

    /// Installation mode understood by the operator
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub install_mode: String,

    /// Build cache mode
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cache_mode: String,

    /// Platform release to install
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub install_version: String,

    /// CI tooling release
    #[serde(default, rename = "ciVersion", skip_serializing_if = "String::is_empty")]
    pub ci_version: String,

    /// CPU architecture of the nodes
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub arch: String,

    /// Repository the component images are pulled from
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub wutong_image_repository: String,

    /// Wildcard domain suffix for HTTP routes
    #[serde(default, rename = "suffixHTTPHost", skip_serializing_if = "String::is_empty")]
    pub suffix_http_host: String,

    /// Externally reachable gateway addresses
    #[serde(default, rename = "gatewayIngressIPs", skip_serializing_if = "Vec::is_empty")]
    pub gateway_ingress_ips: Vec<String>,

    /// Nodes running the gateway
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes_for_gateway: Vec<K8sNode>,

    /// Nodes running builds
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes_for_chaos: Vec<K8sNode>,

    /// External image registry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_hub: Option<ImageHub>,

    /// External region database
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region_database: Option<Database>,

    /// External UI database
    #[serde(default, rename = "uiDatabase", skip_serializing_if = "Option::is_none")]
    pub ui_database: Option<Database>,

    /// External etcd
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etcd_config: Option<EtcdConfig>,

    /// Read-write-many storage
    #[serde(default, rename = "wutongVolumeSpecRWX", skip_serializing_if = "Option::is_none")]
    pub wutong_volume_spec_rwx: Option<WutongVolumeSpec>,

    /// Read-write-once storage
    #[serde(default, rename = "wutongVolumeSpecRWO", skip_serializing_if = "Option::is_none")]
    pub wutong_volume_spec_rwo: Option<WutongVolumeSpec>,
}

/// Observed state reported by the operator
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WutongClusterStatus {
    /// Conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl WutongCluster {
    /// True when the operator reports the given condition as `True`
    pub fn condition_true(&self, type_: &str) -> bool {
        self.status
            .as_ref()
            .map(|s| condition_is_true(&s.conditions, type_))
            .unwrap_or(false)
    }

    /// Image repository is usable
    pub fn image_hub_ready(&self) -> bool {
        self.condition_true(CONDITION_IMAGE_REPOSITORY)
    }

    /// Platform is serving
    pub fn running(&self) -> bool {
        self.condition_true(CONDITION_RUNNING)
    }

    /// One-line summary of every condition, used for progress logging
    pub fn condition_summary(&self) -> String {
        let Some(status) = &self.status else {
            return String::new();
        };
        status
            .conditions
            .iter()
            .map(|c| {
                if c.status == super::types::ConditionStatus::True {
                    format!("{}=>{}", c.type_, c.status)
                } else {
                    format!("{}=>{}=>{}=>{}", c.type_, c.status, c.reason, c.message)
                }
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}
