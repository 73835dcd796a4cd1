//! JSON bodies carried on the task topics

use serde::{Deserialize, Serialize};

use crate::provider::{ExpansionNode, KubernetesClusterConfig};
use crate::task::StepMessage;

/// Body of a `cluster.create` message
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct KubernetesConfigMessage {
    /// Enterprise that requested the task
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enterprise_id: Option<String>,
    /// Task id
    #[serde(default)]
    pub task_id: String,
    /// Cluster to provision
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubernetes_config: Option<KubernetesClusterConfig>,
}

/// Request to install the platform onto one cluster
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitPlatformRequest {
    /// Enterprise that requested the task
    #[serde(default)]
    pub enterprise_id: String,
    /// Target cluster
    pub cluster_id: String,
    /// Provider access key, empty for self-hosted providers
    #[serde(default)]
    pub access_key: String,
    /// Provider secret key
    #[serde(default)]
    pub secret_key: String,
    /// Provider name
    pub provider: String,
}

/// Body of a `platform.init` message
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitPlatformConfigMessage {
    /// Enterprise that requested the task
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enterprise_id: Option<String>,
    /// Task id
    #[serde(default)]
    pub task_id: String,
    /// Installation request
    #[serde(
        default,
        rename = "init_wutong_config",
        skip_serializing_if = "Option::is_none"
    )]
    pub init_config: Option<InitPlatformRequest>,
}

/// Body of a `cluster.update` message
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateKubernetesConfigMessage {
    /// Enterprise that requested the task
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enterprise_id: Option<String>,
    /// Task id
    #[serde(default)]
    pub task_id: String,
    /// Node change
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<ExpansionNode>,
}

/// A progress event bound to its task
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMessage {
    /// Task id
    #[serde(rename = "taskID")]
    pub task_id: String,
    /// Enterprise that requested the task
    #[serde(rename = "enterpriseID", default, skip_serializing_if = "Option::is_none")]
    pub enterprise_id: Option<String>,
    /// Progress report
    pub message: StepMessage,
}
