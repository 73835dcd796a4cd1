//! Request and response shapes of the facade

use k8s_openapi::api::core::v1::Pod;
use serde::{Deserialize, Serialize};

use crate::provider::ClusterState;
use crate::store::CreateKubernetesTask;

/// Request to provision, or register, a Kubernetes cluster
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateKubernetesRequest {
    /// Provider name
    #[serde(rename = "providerName")]
    pub provider: String,
    /// Cluster name
    pub name: String,
    /// Worker instance type for managed providers
    #[serde(default, rename = "resourceType")]
    pub worker_resource_type: String,
    /// Worker count for managed providers
    #[serde(default)]
    pub worker_num: i32,
    /// Provider region
    #[serde(default)]
    pub region: String,
    /// Public addresses of a custom cluster
    #[serde(default)]
    pub eip: Vec<String>,
    /// Kubeconfig of a custom cluster
    #[serde(default)]
    pub kubeconfig: String,
    /// Base64 rke bootstrap configuration
    #[serde(default, rename = "encodedRKEConfig")]
    pub encoded_rke_config: String,
}

/// Outcome of a provisioning request
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CreatedCluster {
    /// The task that was queued
    pub task: CreateKubernetesTask,
    /// State of the cluster when the request was accepted
    pub state: ClusterState,
}

/// Request to install the platform
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitPlatformReq {
    /// Target cluster
    #[serde(rename = "clusterID")]
    pub cluster_id: String,
    /// Provider name
    #[serde(rename = "providerName")]
    pub provider: String,
    /// Enterprise that asked
    #[serde(default, rename = "enterpriseID")]
    pub enterprise_id: String,
    /// Start over even though an earlier task exists
    #[serde(default)]
    pub retry: bool,
}

/// Request to change the nodes of an rke cluster
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateKubernetesRequest {
    /// Target cluster
    #[serde(rename = "clusterID")]
    pub cluster_id: String,
    /// Provider name; only `rke` is accepted
    #[serde(rename = "providerName")]
    pub provider: String,
    /// Base64 rke bootstrap configuration with the new node list
    #[serde(rename = "encodedRKEConfig")]
    pub encoded_rke_config: String,
}

/// Credentials to store for a provider
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddAccessKey {
    /// Provider name
    #[serde(rename = "providerName")]
    pub provider: String,
    /// Access key
    pub access_key: String,
    /// Secret key
    pub secret_key: String,
}

/// A platform component and its pods
#[derive(Clone, Debug, Default, Serialize)]
pub struct PlatformComponent {
    /// Component name
    pub app: String,
    /// Pods carrying the component's `name` label
    pub pods: Vec<Pod>,
}

impl PlatformComponent {
    /// Higher is less healthy
    pub(crate) fn phase_score(&self) -> u32 {
        self.pods
            .iter()
            .map(|pod| {
                match pod.status.as_ref().and_then(|s| s.phase.as_deref()) {
                    Some("Succeeded") => 0,
                    Some("Running") => 1,
                    Some("Pending") => 3,
                    Some("Failed") => 4,
                    _ => 2,
                }
            })
            .sum()
    }
}
