//! Cluster provider abstraction layer
//!
//! Every provider family implements [`ClusterAdaptor`], a uniform lifecycle
//! interface over clusters: list, describe, fetch credentials, create, grow
//! and delete. Implementations are dispatched through the closed [`Adaptor`]
//! enum, built by the [`ProviderRegistry`] constructed once at startup.
//!
//! # Supported Providers
//!
//! - [`CustomAdaptor`] - clusters the customer supplies a kubeconfig for
//! - [`RkeAdaptor`] - clusters built by invoking the `rke` bootstrap tool
//!
//! Cloud-managed providers are recognised by name but have no adaptor here.

mod custom;
mod rke;

pub use custom::CustomAdaptor;
pub use rke::{RkeAdaptor, RkeConfig, RkeNode, RkeSettings};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Node;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::client::{api_server_endpoint, ClusterConnector};
use crate::crd::{Database, EtcdConfig, K8sNode};
use crate::exec::CommandRunner;
use crate::operator::{NAMESPACE, REGION_CONFIG_MAP};
use crate::store::TaskStore;
use crate::task::Progress;
use crate::{Error, Result};

/// Deadline for the API server version probe
pub const VERSION_PROBE_TIMEOUT: Duration = Duration::from_secs(3);
/// Deadline for node and marker lookups
pub const NODE_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Lowest supported Kubernetes minor version
pub const MIN_SUPPORTED_MINOR: u32 = 16;
/// Highest supported Kubernetes minor version
pub const MAX_SUPPORTED_MINOR: u32 = 22;

/// Node annotation that pins a node to gateway duty
pub const GATEWAY_NODE_ANNOTATION: &str = "wutong.io/gateway-node";
/// Node annotation that pins a node to build duty
pub const CHAOS_NODE_ANNOTATION: &str = "wutong.io/chaos-node";
/// Node annotation carrying the externally reachable address
pub const EXTERNAL_ADDRESS_ANNOTATION: &str = "rke.cattle.io/external-ip";

const MSG_CLIENT_FAILED: &str = "unable to create a client for the cluster";
const MSG_API_UNREACHABLE: &str = "unable to reach the cluster API server";
const MSG_NODES_FAILED: &str = "unable to list cluster nodes";

// =============================================================================
// Cluster model
// =============================================================================

/// Observed cluster state
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterState {
    /// Not reachable, or not yet provisioned
    #[default]
    Offline,
    /// API server and nodes answered
    Running,
    /// Probe failed while listing
    Unknown,
}

impl fmt::Display for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Offline => write!(f, "offline"),
            Self::Running => write!(f, "running"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// A Kubernetes cluster as observed through its adaptor
///
/// Built fresh on every describe and never cached.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Cluster {
    /// Display name
    pub name: String,
    /// Cluster id
    pub cluster_id: String,
    /// Provider name
    pub cluster_type: String,
    /// Creation time of the record
    pub created: DateTime<Utc>,
    /// Observed state
    pub state: ClusterState,
    /// Kubernetes git version, e.g. `v1.20.4`
    pub kubernetes_version: String,
    /// API server URL from the kubeconfig
    pub api_server_endpoint: String,
    /// Public addresses registered for the cluster
    pub eip: Vec<String>,
    /// Node count
    pub size: usize,
    /// The platform marker config map exists
    pub platform_installed: bool,
    /// Why the cluster is not usable, when it is not
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Platform installation must not be offered
    pub disable_platform_init: bool,
}

impl Cluster {
    fn degrade(&mut self, message: impl Into<String>) {
        self.disable_platform_init = true;
        self.message = Some(message.into());
    }
}

/// Payload of a cluster provisioning task
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct KubernetesClusterConfig {
    /// Cluster id assigned when the request was accepted
    #[serde(default)]
    pub cluster_id: String,
    /// Cluster name
    #[serde(default)]
    pub cluster_name: String,
    /// Instance type for managed workers
    #[serde(default)]
    pub worker_resource_type: String,
    /// Number of managed workers
    #[serde(default)]
    pub worker_node_num: i32,
    /// Provider name
    #[serde(default)]
    pub provider: String,
    /// Provider region
    #[serde(default)]
    pub region: String,
    /// Provider access key
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub access_key: String,
    /// Provider secret key
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub secret_key: String,
    /// Bootstrap configuration for rke clusters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rke_config: Option<RkeConfig>,
}

/// Payload of a node update task
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpansionNode {
    /// Provider name
    #[serde(default)]
    pub provider: String,
    /// Cluster to update
    #[serde(default)]
    pub cluster_id: String,
    /// Full bootstrap configuration including the new node list
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rke_config: Option<RkeConfig>,
}

/// Registration request for a cluster record
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CreateClusterConfig {
    /// Id to register the cluster under
    pub cluster_id: String,
    /// Display name
    pub name: String,
    /// Public addresses
    pub eip: Vec<String>,
    /// Kubeconfig text, custom clusters only
    pub kubeconfig: String,
    /// Bootstrap configuration YAML, rke clusters only
    pub create_config: String,
}

/// Inputs the reconciler needs to install the platform
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InitConfig {
    /// Target cluster
    pub cluster_id: String,
    /// Enterprise that requested the install
    pub enterprise_id: String,
    /// Platform version
    pub wutong_version: String,
    /// Build tooling version
    pub wutong_ci_version: String,
    /// Run the platform highly available
    pub enable_ha: bool,
    /// HTTP domain suffix; derived when empty
    pub suffix_http_host: String,
    /// Nodes that run the gateway
    pub gateway_nodes: Vec<K8sNode>,
    /// Nodes that run builds
    pub chaos_nodes: Vec<K8sNode>,
    /// Externally reachable ingress addresses
    pub eips: Vec<String>,
    /// External etcd
    pub etcd_config: Option<EtcdConfig>,
    /// External region database
    pub region_database: Option<Database>,
    /// NAS server address for shared storage
    pub nas_server: String,
}

// =============================================================================
// Adaptor trait
// =============================================================================

/// Uniform lifecycle interface over clusters of one provider family
#[async_trait]
pub trait ClusterAdaptor: Send + Sync {
    /// Describe every known cluster; unreachable ones come back degraded
    async fn cluster_list(&self) -> Result<Vec<Cluster>>;

    /// Probe one cluster
    ///
    /// On failure the error is [`Error::ClusterUnreachable`] carrying the
    /// partial cluster with its diagnostic message set.
    async fn describe_cluster(&self, cluster_id: &str) -> Result<Cluster>;

    /// Kubeconfig text for the cluster
    async fn get_kube_config(&self, cluster_id: &str) -> Result<String>;

    /// Forget the cluster; refused while the platform is installed
    async fn delete_cluster(&self, cluster_id: &str) -> Result<()>;

    /// Register a cluster record
    async fn create_cluster(&self, config: CreateClusterConfig) -> Result<Option<Cluster>>;

    /// Provision Kubernetes, reporting progress as it goes
    async fn create_kubernetes(
        &self,
        cancel: CancellationToken,
        config: &KubernetesClusterConfig,
        progress: &Progress,
    ) -> Option<Cluster>;

    /// Change the node set of an existing cluster
    async fn expansion_node(
        &self,
        cancel: CancellationToken,
        node: &ExpansionNode,
        progress: &Progress,
    ) -> Option<Cluster>;

    /// Networking section of the platform install for this cluster
    async fn get_init_config(
        &self,
        cluster: &Cluster,
        gateway_nodes: &[K8sNode],
        chaos_nodes: &[K8sNode],
        progress: &Progress,
    ) -> InitConfig;
}

/// Closed set of adaptor implementations
pub enum Adaptor {
    /// Customer-supplied clusters
    Custom(CustomAdaptor),
    /// rke-built clusters
    Rke(RkeAdaptor),
}

macro_rules! dispatch {
    ($self:ident, $a:ident => $body:expr) => {
        match $self {
            Adaptor::Custom($a) => $body,
            Adaptor::Rke($a) => $body,
        }
    };
}

#[async_trait]
impl ClusterAdaptor for Adaptor {
    async fn cluster_list(&self) -> Result<Vec<Cluster>> {
        dispatch!(self, a => a.cluster_list().await)
    }

    async fn describe_cluster(&self, cluster_id: &str) -> Result<Cluster> {
        dispatch!(self, a => a.describe_cluster(cluster_id).await)
    }

    async fn get_kube_config(&self, cluster_id: &str) -> Result<String> {
        dispatch!(self, a => a.get_kube_config(cluster_id).await)
    }

    async fn delete_cluster(&self, cluster_id: &str) -> Result<()> {
        dispatch!(self, a => a.delete_cluster(cluster_id).await)
    }

    async fn create_cluster(&self, config: CreateClusterConfig) -> Result<Option<Cluster>> {
        dispatch!(self, a => a.create_cluster(config).await)
    }

    async fn create_kubernetes(
        &self,
        cancel: CancellationToken,
        config: &KubernetesClusterConfig,
        progress: &Progress,
    ) -> Option<Cluster> {
        dispatch!(self, a => a.create_kubernetes(cancel, config, progress).await)
    }

    async fn expansion_node(
        &self,
        cancel: CancellationToken,
        node: &ExpansionNode,
        progress: &Progress,
    ) -> Option<Cluster> {
        dispatch!(self, a => a.expansion_node(cancel, node, progress).await)
    }

    async fn get_init_config(
        &self,
        cluster: &Cluster,
        gateway_nodes: &[K8sNode],
        chaos_nodes: &[K8sNode],
        progress: &Progress,
    ) -> InitConfig {
        dispatch!(self, a => a.get_init_config(cluster, gateway_nodes, chaos_nodes, progress).await)
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Provider families
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    /// Customer-supplied kubeconfig
    Custom,
    /// Built with rke
    Rke,
    /// A cloud-managed provider, named
    Managed(String),
}

impl ProviderKind {
    /// Classify a provider name
    pub fn parse(name: &str) -> Self {
        match name {
            "custom" => Self::Custom,
            "rke" => Self::Rke,
            other => Self::Managed(other.to_string()),
        }
    }

    /// Provider name
    pub fn as_str(&self) -> &str {
        match self {
            Self::Custom => "custom",
            Self::Rke => "rke",
            Self::Managed(name) => name,
        }
    }

    /// Managed providers need stored credentials
    pub fn needs_access_key(&self) -> bool {
        matches!(self, Self::Managed(_))
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provider credentials carried in task payloads
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Credentials {
    /// Access key
    pub access_key: String,
    /// Secret key
    pub secret_key: String,
}

/// Builds adaptors; constructed once and shared by `Arc`
pub struct ProviderRegistry {
    store: TaskStore,
    connector: Arc<dyn ClusterConnector>,
    runner: Arc<dyn CommandRunner>,
    rke: RkeSettings,
}

impl ProviderRegistry {
    /// Create a registry over shared collaborators
    pub fn new(
        store: TaskStore,
        connector: Arc<dyn ClusterConnector>,
        runner: Arc<dyn CommandRunner>,
        rke: RkeSettings,
    ) -> Self {
        Self {
            store,
            connector,
            runner,
            rke,
        }
    }

    /// Connector used for workload cluster access
    pub fn connector(&self) -> Arc<dyn ClusterConnector> {
        self.connector.clone()
    }

    /// Build the adaptor for `provider`
    pub fn adaptor(&self, provider: &str, credentials: Option<Credentials>) -> Result<Adaptor> {
        match ProviderKind::parse(provider) {
            ProviderKind::Custom => Ok(Adaptor::Custom(CustomAdaptor::new(
                self.store.clone(),
                self.connector.clone(),
            ))),
            ProviderKind::Rke => Ok(Adaptor::Rke(RkeAdaptor::new(
                self.store.clone(),
                self.connector.clone(),
                self.runner.clone(),
                self.rke.clone(),
            ))),
            ProviderKind::Managed(name) => {
                if credentials.map_or(true, |c| c.access_key.is_empty()) {
                    return Err(Error::AccessKeyNotFound(name));
                }
                Err(Error::ProviderNotSupported(name))
            }
        }
    }
}

// =============================================================================
// Shared helpers
// =============================================================================

/// Whether a Kubernetes version string lies in the supported range
///
/// Accepts `v1.20.4`, `1.20` and vendor suffixes such as `v1.21.2-eks-0389ca3`.
pub fn version_supported(version: &str) -> bool {
    let mut parts = version.trim().trim_start_matches('v').split('.');
    let major = parts.next().and_then(|p| p.parse::<u32>().ok());
    let minor = parts.next().and_then(|p| {
        let digits: String = p.chars().take_while(|c| c.is_ascii_digit()).collect();
        digits.parse::<u32>().ok()
    });
    matches!((major, minor), (Some(1), Some(m)) if (MIN_SUPPORTED_MINOR..=MAX_SUPPORTED_MINOR).contains(&m))
}

fn unreachable(cluster: Cluster, reason: impl fmt::Display) -> Error {
    Error::ClusterUnreachable {
        reason: reason.to_string(),
        cluster: Box::new(cluster),
    }
}

/// Run the ordered connectivity probes against a cluster
///
/// Stops at the first failing check and returns the partial cluster inside
/// [`Error::ClusterUnreachable`].
pub(crate) async fn probe_cluster(
    connector: &dyn ClusterConnector,
    mut cluster: Cluster,
    kubeconfig: &str,
) -> Result<Cluster> {
    let api = match connector.connect(kubeconfig).await {
        Ok(api) => api,
        Err(e) => {
            cluster.degrade(MSG_CLIENT_FAILED);
            return Err(unreachable(cluster, e));
        }
    };

    let version = match tokio::time::timeout(VERSION_PROBE_TIMEOUT, api.server_version()).await {
        Ok(Ok(v)) => v,
        Ok(Err(e)) => {
            cluster.degrade(MSG_API_UNREACHABLE);
            return Err(unreachable(cluster, e));
        }
        Err(_) => {
            cluster.degrade(MSG_API_UNREACHABLE);
            return Err(unreachable(
                cluster,
                Error::timeout("get server version", VERSION_PROBE_TIMEOUT),
            ));
        }
    };
    cluster.kubernetes_version = version.git_version;
    if !version_supported(&cluster.kubernetes_version) {
        let message = format!(
            "cluster version {} is not supported, supported versions are 1.{}.x-1.{}.x",
            cluster.kubernetes_version, MIN_SUPPORTED_MINOR, MAX_SUPPORTED_MINOR
        );
        cluster.degrade(message);
    }
    cluster.api_server_endpoint = api_server_endpoint(kubeconfig).unwrap_or_default();

    let nodes = match tokio::time::timeout(NODE_PROBE_TIMEOUT, api.list_nodes()).await {
        Ok(Ok(nodes)) => nodes,
        Ok(Err(e)) => {
            cluster.degrade(MSG_NODES_FAILED);
            return Err(unreachable(cluster, e));
        }
        Err(_) => {
            cluster.degrade(MSG_NODES_FAILED);
            return Err(unreachable(
                cluster,
                Error::timeout("list nodes", NODE_PROBE_TIMEOUT),
            ));
        }
    };
    cluster.state = ClusterState::Running;
    cluster.size = nodes.len();

    if let Ok(Ok(Some(_))) = tokio::time::timeout(
        NODE_PROBE_TIMEOUT,
        api.get_config_map(NAMESPACE, REGION_CONFIG_MAP),
    )
    .await
    {
        cluster.platform_installed = true;
    }

    Ok(cluster)
}

/// Turn a failed describe into the degraded list entry
pub(crate) fn degraded_entry(cluster_id: &str, err: Error) -> Cluster {
    warn!(cluster = %cluster_id, error = %err, "cluster probe failed");
    let mut cluster = err.partial_cluster().cloned().unwrap_or_else(|| Cluster {
        cluster_id: cluster_id.to_string(),
        ..Default::default()
    });
    cluster.state = ClusterState::Unknown;
    if cluster.message.is_none() {
        cluster.message = Some(err.to_string());
    }
    cluster
}

/// Derive the networking inputs of a platform install
pub(crate) fn init_config_for(
    cluster: &Cluster,
    gateway_nodes: &[K8sNode],
    chaos_nodes: &[K8sNode],
) -> InitConfig {
    InitConfig {
        cluster_id: cluster.cluster_id.clone(),
        enable_ha: cluster.size > 3,
        gateway_nodes: gateway_nodes.to_vec(),
        chaos_nodes: chaos_nodes.to_vec(),
        eips: select_eips(&cluster.eip, gateway_nodes),
        ..Default::default()
    }
}

/// Ingress addresses: explicit EIPs, else gateway external IPs, else internal IPs
pub fn select_eips(explicit: &[String], gateway_nodes: &[K8sNode]) -> Vec<String> {
    if !explicit.is_empty() {
        return explicit.to_vec();
    }
    let external: Vec<String> = gateway_nodes
        .iter()
        .filter(|n| !n.external_ip.is_empty())
        .map(|n| n.external_ip.clone())
        .collect();
    if !external.is_empty() {
        return external;
    }
    gateway_nodes
        .iter()
        .filter(|n| !n.internal_ip.is_empty())
        .map(|n| n.internal_ip.clone())
        .collect()
}

/// Addresses of a Kubernetes node
pub fn k8s_node(node: &Node) -> K8sNode {
    let mut out = K8sNode::default();
    let addresses = node
        .status
        .as_ref()
        .and_then(|s| s.addresses.as_ref())
        .map(Vec::as_slice)
        .unwrap_or_default();
    for address in addresses {
        match address.type_.as_str() {
            "InternalIP" => out.internal_ip = address.address.clone(),
            "ExternalIP" => out.external_ip = address.address.clone(),
            "Hostname" => out.name = address.address.clone(),
            _ => {}
        }
    }
    if let Some(external) = annotation(node, EXTERNAL_ADDRESS_ANNOTATION).filter(|v| !v.is_empty()) {
        info!(node = ?node.metadata.name, external_ip = %external, "external address set by annotation");
        out.external_ip = external.to_string();
    }
    out
}

fn annotation<'a>(node: &'a Node, key: &str) -> Option<&'a str> {
    node.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(String::as_str)
}

/// Pick gateway and chaos nodes
///
/// Annotated nodes win; otherwise the first one or two nodes serve both.
/// `nodes` must not be empty.
pub fn select_gateway_and_chaos_nodes(nodes: &[Node]) -> (Vec<K8sNode>, Vec<K8sNode>) {
    let annotated = |key: &str| -> Vec<K8sNode> {
        nodes
            .iter()
            .filter(|n| annotation(n, key) == Some("true"))
            .map(k8s_node)
            .collect()
    };
    let fallback = || nodes.iter().take(2).map(k8s_node).collect::<Vec<_>>();

    let mut gateway = annotated(GATEWAY_NODE_ANNOTATION);
    if gateway.is_empty() {
        gateway = fallback();
    }
    let mut chaos = annotated(CHAOS_NODE_ANNOTATION);
    if chaos.is_empty() {
        chaos = fallback();
    }
    (gateway, chaos)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::client::{MockClusterApi, MockClusterConnector, ServerVersion};
    use k8s_openapi::api::core::v1::{ConfigMap, NodeAddress, NodeStatus};
    use kube::api::ObjectMeta;
    use rstest::rstest;
    use std::collections::BTreeMap;

    pub(crate) const KUBECONFIG: &str = r#"
apiVersion: v1
kind: Config
clusters:
- name: c
  cluster:
    server: https://10.0.0.1:6443
contexts:
- name: c
  context:
    cluster: c
    user: u
current-context: c
users:
- name: u
  user:
    token: abc
"#;

    pub(crate) fn node(name: &str, internal: &str, annotations: &[(&str, &str)]) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                annotations: Some(
                    annotations
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect::<BTreeMap<_, _>>(),
                ),
                ..Default::default()
            },
            status: Some(NodeStatus {
                addresses: Some(vec![
                    NodeAddress {
                        type_: "InternalIP".to_string(),
                        address: internal.to_string(),
                    },
                    NodeAddress {
                        type_: "Hostname".to_string(),
                        address: name.to_string(),
                    },
                ]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// A connector whose cluster answers every probe
    pub(crate) fn healthy_connector(version: &'static str, nodes: usize, installed: bool) -> MockClusterConnector {
        let mut connector = MockClusterConnector::new();
        connector.expect_connect().returning(move |_| {
            let mut api = MockClusterApi::new();
            api.expect_server_version().returning(move || {
                Ok(ServerVersion {
                    major: "1".to_string(),
                    minor: "20".to_string(),
                    git_version: version.to_string(),
                })
            });
            api.expect_list_nodes().returning(move || {
                Ok((0..nodes)
                    .map(|i| node(&format!("n{}", i), &format!("10.0.0.{}", i + 10), &[]))
                    .collect())
            });
            api.expect_get_config_map().returning(move |_, _| {
                Ok(installed.then(ConfigMap::default))
            });
            Ok(Arc::new(api) as Arc<dyn crate::client::ClusterApi>)
        });
        connector
    }

    // ==========================================================================
    // Story Tests: probing clusters
    // ==========================================================================

    /// Story: a healthy cluster reports Running with its node count, and the
    /// marker config map flags the platform as installed.
    #[tokio::test]
    async fn story_healthy_cluster_is_running() {
        let connector = healthy_connector("v1.20.4", 4, true);
        let cluster = probe_cluster(&connector, Cluster::default(), KUBECONFIG)
            .await
            .unwrap();

        assert_eq!(cluster.state, ClusterState::Running);
        assert_eq!(cluster.size, 4);
        assert!(cluster.platform_installed);
        assert_eq!(cluster.api_server_endpoint, "https://10.0.0.1:6443");
        assert!(!cluster.disable_platform_init);
    }

    /// Story: an API server that does not answer still yields a partial
    /// cluster explaining why it is unusable.
    #[tokio::test]
    async fn story_unreachable_api_keeps_partial_cluster() {
        let mut connector = MockClusterConnector::new();
        connector.expect_connect().returning(|_| {
            let mut api = MockClusterApi::new();
            api.expect_server_version()
                .returning(|| Err(Error::provider("connection refused")));
            Ok(Arc::new(api) as Arc<dyn crate::client::ClusterApi>)
        });

        let start = Cluster {
            cluster_id: "c-1".to_string(),
            ..Default::default()
        };
        let err = probe_cluster(&connector, start, KUBECONFIG).await.unwrap_err();
        let partial = err.partial_cluster().expect("partial cluster");
        assert_eq!(partial.cluster_id, "c-1");
        assert_eq!(partial.state, ClusterState::Offline);
        assert_eq!(partial.message.as_deref(), Some(MSG_API_UNREACHABLE));
        assert!(partial.disable_platform_init);
    }

    /// Story: an unsupported version is a warning, not an error
    #[tokio::test]
    async fn story_unsupported_version_disables_init() {
        let connector = healthy_connector("v1.26.1", 1, false);
        let cluster = probe_cluster(&connector, Cluster::default(), KUBECONFIG)
            .await
            .unwrap();
        assert_eq!(cluster.state, ClusterState::Running);
        assert!(cluster.disable_platform_init);
        assert!(cluster.message.unwrap().contains("v1.26.1"));
    }

    #[tokio::test]
    async fn test_client_failure_is_first_check() {
        let mut connector = MockClusterConnector::new();
        connector
            .expect_connect()
            .returning(|_| Err(Error::validation("bad kubeconfig")));
        let err = probe_cluster(&connector, Cluster::default(), "garbage")
            .await
            .unwrap_err();
        assert_eq!(
            err.partial_cluster().unwrap().message.as_deref(),
            Some(MSG_CLIENT_FAILED)
        );
    }

    #[test]
    fn test_degraded_entry_is_unknown_with_message() {
        let entry = degraded_entry("c-9", Error::provider("store down"));
        assert_eq!(entry.cluster_id, "c-9");
        assert_eq!(entry.state, ClusterState::Unknown);
        assert!(entry.message.unwrap().contains("store down"));
    }

    // ==========================================================================
    // Version and node selection
    // ==========================================================================

    #[rstest]
    #[case("v1.16.0", true)]
    #[case("v1.22.3", true)]
    #[case("1.20", true)]
    #[case("v1.21.2-eks-0389ca3", true)]
    #[case("v1.15.12", false)]
    #[case("v1.23.0", false)]
    #[case("v2.18.0", false)]
    #[case("", false)]
    fn test_version_supported(#[case] version: &str, #[case] expected: bool) {
        assert_eq!(version_supported(version), expected);
    }

    /// Story: annotated nodes are chosen; otherwise the first two nodes
    /// do both jobs.
    #[test]
    fn story_gateway_and_chaos_selection() {
        let nodes = vec![
            node("a", "10.0.0.1", &[]),
            node("b", "10.0.0.2", &[(CHAOS_NODE_ANNOTATION, "true")]),
            node("c", "10.0.0.3", &[]),
        ];
        let (gateway, chaos) = select_gateway_and_chaos_nodes(&nodes);
        let names = |v: &[K8sNode]| v.iter().map(|n| n.name.clone()).collect::<Vec<_>>();
        assert_eq!(names(&gateway), vec!["a", "b"]);
        assert_eq!(names(&chaos), vec!["b"]);

        let single = vec![node("only", "10.0.0.9", &[])];
        let (gateway, chaos) = select_gateway_and_chaos_nodes(&single);
        assert_eq!(gateway.len(), 1);
        assert_eq!(chaos.len(), 1);
    }

    #[test]
    fn test_external_address_annotation_overrides() {
        let n = node("a", "10.0.0.1", &[(EXTERNAL_ADDRESS_ANNOTATION, "1.2.3.4")]);
        let k = k8s_node(&n);
        assert_eq!(k.internal_ip, "10.0.0.1");
        assert_eq!(k.external_ip, "1.2.3.4");
        assert_eq!(k.name, "a");
    }

    #[test]
    fn test_eip_priority() {
        let gateway = vec![
            K8sNode {
                name: "a".into(),
                internal_ip: "10.0.0.1".into(),
                external_ip: String::new(),
            },
            K8sNode {
                name: "b".into(),
                internal_ip: "10.0.0.2".into(),
                external_ip: "5.5.5.5".into(),
            },
        ];
        assert_eq!(select_eips(&["9.9.9.9".to_string()], &gateway), vec!["9.9.9.9"]);
        assert_eq!(select_eips(&[], &gateway), vec!["5.5.5.5"]);
        assert_eq!(
            select_eips(&[], &gateway[..1]),
            vec!["10.0.0.1".to_string()]
        );
    }

    #[test]
    fn test_init_config_enables_ha_above_three_nodes() {
        let small = Cluster {
            size: 3,
            ..Default::default()
        };
        let large = Cluster {
            size: 4,
            ..Default::default()
        };
        assert!(!init_config_for(&small, &[], &[]).enable_ha);
        assert!(init_config_for(&large, &[], &[]).enable_ha);
    }

    #[test]
    fn test_provider_kind_parse() {
        assert_eq!(ProviderKind::parse("custom"), ProviderKind::Custom);
        assert_eq!(ProviderKind::parse("rke"), ProviderKind::Rke);
        let ack = ProviderKind::parse("ack");
        assert!(ack.needs_access_key());
        assert_eq!(ack.to_string(), "ack");
    }

    #[test]
    fn test_registry_rejects_managed_providers() {
        let registry = ProviderRegistry::new(
            TaskStore::in_memory().unwrap(),
            Arc::new(MockClusterConnector::new()),
            Arc::new(crate::exec::MockCommandRunner::new()),
            RkeSettings::default(),
        );
        assert!(matches!(
            registry.adaptor("ack", None),
            Err(Error::AccessKeyNotFound(_))
        ));
        let creds = Credentials {
            access_key: "ak".into(),
            secret_key: "sk".into(),
        };
        assert!(matches!(
            registry.adaptor("ack", Some(creds)),
            Err(Error::ProviderNotSupported(_))
        ));
        assert!(matches!(registry.adaptor("custom", None), Ok(Adaptor::Custom(_))));
        assert!(matches!(registry.adaptor("rke", None), Ok(Adaptor::Rke(_))));
    }
}
