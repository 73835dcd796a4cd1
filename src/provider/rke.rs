//! Clusters built with the rke bootstrap tool
//!
//! The bootstrap configuration is written to
//! `<work_dir>/rke/<cluster name>/cluster.yml` and `rke up --config` is run
//! against it. rke drops `kube_config_cluster.yml` next to the config on
//! success; that kubeconfig is stored with the cluster record.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{
    degraded_entry, init_config_for, probe_cluster, Cluster, ClusterAdaptor, ClusterState,
    CreateClusterConfig, ExpansionNode, InitConfig, KubernetesClusterConfig,
};
use crate::client::ClusterConnector;
use crate::crd::K8sNode;
use crate::exec::CommandRunner;
use crate::store::{RkeClusterRecord, TaskStore};
use crate::task::{Progress, StepType};
use crate::{Error, Result};

/// Record state before provisioning starts
pub const STATE_INITIAL: &str = "initial";
/// Record state while `rke up` runs
pub const STATE_INSTALLING: &str = "installing";
/// Record state after a successful `rke up`
pub const STATE_RUNNING: &str = "running";
/// Record state after a failed `rke up`
pub const STATE_FAILED: &str = "failed";

const CONFIG_FILE: &str = "cluster.yml";
const KUBECONFIG_FILE: &str = "kube_config_cluster.yml";

/// Where and how rke runs
#[derive(Clone, Debug)]
pub struct RkeSettings {
    /// Path of the rke binary
    pub binary: String,
    /// Root of per-cluster work directories
    pub work_dir: PathBuf,
    /// Deadline for one `rke up`
    pub timeout: Duration,
}

impl Default for RkeSettings {
    fn default() -> Self {
        Self {
            binary: "/usr/local/bin/rke".to_string(),
            work_dir: PathBuf::from("/tmp"),
            timeout: Duration::from_secs(60 * 60),
        }
    }
}

/// One node of the bootstrap configuration
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RkeNode {
    /// SSH-reachable address
    pub address: String,
    /// SSH port
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub port: String,
    /// Address used inside the cluster
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub internal_address: String,
    /// SSH user
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user: String,
    /// Roles: `controlplane`, `etcd`, `worker`
    #[serde(default)]
    pub role: Vec<String>,
    /// Docker socket path
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub docker_socket: String,
    /// Fields passed through to rke untouched
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

/// rke bootstrap configuration
///
/// Only the node list is interpreted; everything else is carried through to
/// `cluster.yml` as given.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RkeConfig {
    /// Cluster nodes
    #[serde(default)]
    pub nodes: Vec<RkeNode>,
    /// Fields passed through to rke untouched
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

impl RkeConfig {
    /// Parse the YAML form
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| Error::ConfigInvalid(format!("unmarshal rke config: {}", e)))
    }

    /// Decode a base64-encoded YAML document
    pub fn decode(encoded: &str) -> Result<Self> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| Error::ConfigInvalid(format!("decode encoded rke config: {}", e)))?;
        let yaml = String::from_utf8(bytes)
            .map_err(|e| Error::ConfigInvalid(format!("decode encoded rke config: {}", e)))?;
        Self::from_yaml(&yaml)
    }

    /// YAML form written to `cluster.yml`
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Check the node list is usable
    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(Error::ConfigInvalid("rke config has no nodes".to_string()));
        }
        for node in &self.nodes {
            if node.address.is_empty() {
                return Err(Error::ConfigInvalid("node address is required".to_string()));
            }
            if !node.port.is_empty() && node.port.parse::<u16>().is_err() {
                return Err(Error::ConfigInvalid(format!(
                    "invalid node port {}",
                    node.port
                )));
            }
        }
        let has_role = |role: &str| self.nodes.iter().any(|n| n.role.iter().any(|r| r == role));
        if !has_role("controlplane") || !has_role("etcd") {
            return Err(Error::ConfigInvalid(
                "at least one controlplane and one etcd node are required".to_string(),
            ));
        }
        Ok(())
    }
}

/// Adaptor for rke-built clusters
pub struct RkeAdaptor {
    store: TaskStore,
    connector: Arc<dyn ClusterConnector>,
    runner: Arc<dyn CommandRunner>,
    settings: RkeSettings,
}

impl RkeAdaptor {
    /// Create an adaptor over the rke cluster records in `store`
    pub fn new(
        store: TaskStore,
        connector: Arc<dyn ClusterConnector>,
        runner: Arc<dyn CommandRunner>,
        settings: RkeSettings,
    ) -> Self {
        Self {
            store,
            connector,
            runner,
            settings,
        }
    }

    fn record(&self, cluster_id: &str) -> Result<RkeClusterRecord> {
        self.store
            .get_rke_cluster(cluster_id)?
            .ok_or_else(|| Error::not_found(format!("rke cluster {}", cluster_id)))
    }

    fn cluster_dir(&self, name: &str) -> PathBuf {
        self.settings.work_dir.join("rke").join(name)
    }

    fn base_cluster(record: &RkeClusterRecord) -> Cluster {
        Cluster {
            name: record.name.clone(),
            cluster_id: record.cluster_id.clone(),
            cluster_type: "rke".to_string(),
            created: record.created_at,
            state: ClusterState::Offline,
            ..Default::default()
        }
    }

    /// Write the config, run `rke up` and store the result
    async fn provision(
        &self,
        cancel: CancellationToken,
        mut record: RkeClusterRecord,
        config: &RkeConfig,
        step: StepType,
        progress: &Progress,
    ) -> Option<Cluster> {
        match self.run_rke_up(cancel, &mut record, config).await {
            Ok(()) => {
                info!(cluster = %record.cluster_id, "rke up finished");
                progress.success(step, record.cluster_id.clone()).await;
                match self.describe_cluster(&record.cluster_id).await {
                    Ok(cluster) => Some(cluster),
                    Err(e) => e.partial_cluster().cloned(),
                }
            }
            Err(e) => {
                error!(cluster = %record.cluster_id, error = %e, "rke up failed");
                record.state = STATE_FAILED.to_string();
                if let Err(e) = self.store.update_rke_cluster(&record) {
                    warn!(cluster = %record.cluster_id, error = %e, "failed to record rke failure");
                }
                progress.failure(step, e.to_string()).await;
                None
            }
        }
    }

    async fn run_rke_up(
        &self,
        cancel: CancellationToken,
        record: &mut RkeClusterRecord,
        config: &RkeConfig,
    ) -> Result<()> {
        config.validate()?;
        let yaml = config.to_yaml()?;
        let dir = self.cluster_dir(&record.name);
        tokio::fs::create_dir_all(&dir).await?;
        let config_path = dir.join(CONFIG_FILE);
        tokio::fs::write(&config_path, &yaml).await?;

        record.state = STATE_INSTALLING.to_string();
        record.create_config = yaml;
        self.store.update_rke_cluster(record)?;

        let args = vec![
            "up".to_string(),
            "--config".to_string(),
            config_path.to_string_lossy().to_string(),
        ];
        let output = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled("context cancel".to_string())),
            output = self.runner.run(&self.settings.binary, args, self.settings.timeout) => output?,
        };
        if !output.success {
            return Err(Error::provider(format!(
                "rke up failed: {}",
                output.tail(5)
            )));
        }

        record.kubeconfig = read_kubeconfig(&dir).await?;
        record.state = STATE_RUNNING.to_string();
        self.store.update_rke_cluster(record)?;
        Ok(())
    }
}

async fn read_kubeconfig(dir: &Path) -> Result<String> {
    let path = dir.join(KUBECONFIG_FILE);
    let kubeconfig = tokio::fs::read_to_string(&path).await.map_err(|e| {
        Error::provider(format!("rke produced no kubeconfig at {}: {}", path.display(), e))
    })?;
    Ok(kubeconfig)
}

#[async_trait]
impl ClusterAdaptor for RkeAdaptor {
    async fn cluster_list(&self) -> Result<Vec<Cluster>> {
        let records = self.store.list_rke_clusters()?;
        let probes = records.iter().map(|record| async move {
            match self.describe_cluster(&record.cluster_id).await {
                Ok(cluster) => cluster,
                Err(e) => degraded_entry(&record.cluster_id, e),
            }
        });
        Ok(join_all(probes).await)
    }

    async fn describe_cluster(&self, cluster_id: &str) -> Result<Cluster> {
        let record = self.record(cluster_id)?;
        let mut cluster = Self::base_cluster(&record);
        if record.kubeconfig.is_empty() {
            cluster.disable_platform_init = true;
            cluster.message = Some(format!("cluster is {}", record.state));
            return Ok(cluster);
        }
        probe_cluster(self.connector.as_ref(), cluster, &record.kubeconfig).await
    }

    async fn get_kube_config(&self, cluster_id: &str) -> Result<String> {
        let record = self.record(cluster_id)?;
        if record.kubeconfig.is_empty() {
            return Err(Error::not_found(format!(
                "kubeconfig of cluster {}",
                cluster_id
            )));
        }
        Ok(record.kubeconfig)
    }

    async fn delete_cluster(&self, cluster_id: &str) -> Result<()> {
        let record = self.record(cluster_id)?;
        let installed = match self.describe_cluster(cluster_id).await {
            Ok(cluster) => cluster.platform_installed,
            Err(e) => e.partial_cluster().is_some_and(|c| c.platform_installed),
        };
        if installed {
            return Err(Error::ClusterNotAllowDelete(cluster_id.to_string()));
        }
        self.store.delete_rke_cluster(cluster_id)?;
        if let Err(e) = tokio::fs::remove_dir_all(self.cluster_dir(&record.name)).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(cluster = %cluster_id, error = %e, "failed to remove rke work directory");
            }
        }
        info!(cluster = %cluster_id, "rke cluster deleted");
        Ok(())
    }

    async fn create_cluster(&self, config: CreateClusterConfig) -> Result<Option<Cluster>> {
        let record = RkeClusterRecord {
            cluster_id: config.cluster_id,
            name: config.name,
            state: STATE_INITIAL.to_string(),
            kubeconfig: String::new(),
            create_config: config.create_config,
            created_at: Utc::now(),
        };
        self.store.create_rke_cluster(&record)?;
        Ok(Some(Self::base_cluster(&record)))
    }

    async fn create_kubernetes(
        &self,
        cancel: CancellationToken,
        config: &KubernetesClusterConfig,
        progress: &Progress,
    ) -> Option<Cluster> {
        progress.start(StepType::InstallKubernetes, "").await;
        let Some(rke_config) = config.rke_config.as_ref() else {
            progress
                .failure(StepType::InstallKubernetes, "rke config is required")
                .await;
            return None;
        };
        let key = if config.cluster_id.is_empty() {
            &config.cluster_name
        } else {
            &config.cluster_id
        };
        let record = match self.record(key) {
            Ok(record) => record,
            Err(e) => {
                progress.failure(StepType::InstallKubernetes, e.to_string()).await;
                return None;
            }
        };
        self.provision(cancel, record, rke_config, StepType::InstallKubernetes, progress)
            .await
    }

    async fn expansion_node(
        &self,
        cancel: CancellationToken,
        node: &ExpansionNode,
        progress: &Progress,
    ) -> Option<Cluster> {
        progress.start(StepType::UpdateKubernetes, "").await;
        let Some(rke_config) = node.rke_config.as_ref() else {
            progress
                .failure(StepType::UpdateKubernetes, "rke config is required")
                .await;
            return None;
        };
        let record = match self.record(&node.cluster_id) {
            Ok(record) => record,
            Err(e) => {
                progress.failure(StepType::UpdateKubernetes, e.to_string()).await;
                return None;
            }
        };
        self.provision(cancel, record, rke_config, StepType::UpdateKubernetes, progress)
            .await
    }

    async fn get_init_config(
        &self,
        cluster: &Cluster,
        gateway_nodes: &[K8sNode],
        chaos_nodes: &[K8sNode],
        _progress: &Progress,
    ) -> InitConfig {
        init_config_for(cluster, gateway_nodes, chaos_nodes)
    }
}
