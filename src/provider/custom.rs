//! Customer-supplied clusters
//!
//! The customer hands over a kubeconfig; the adaptor stores it and probes
//! the cluster through it. Provisioning and node changes are the
//! customer's business, so those operations are no-ops.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{
    degraded_entry, init_config_for, probe_cluster, Cluster, ClusterAdaptor, ClusterState,
    CreateClusterConfig, ExpansionNode, InitConfig, KubernetesClusterConfig, VERSION_PROBE_TIMEOUT,
};
use crate::client::ClusterConnector;
use crate::crd::K8sNode;
use crate::store::{CustomClusterRecord, TaskStore};
use crate::task::{Progress, StepType};
use crate::{Error, Result};

/// Adaptor for customer-supplied clusters
pub struct CustomAdaptor {
    store: TaskStore,
    connector: Arc<dyn ClusterConnector>,
}

impl CustomAdaptor {
    /// Create an adaptor over the cluster records in `store`
    pub fn new(store: TaskStore, connector: Arc<dyn ClusterConnector>) -> Self {
        Self { store, connector }
    }

    fn record(&self, cluster_id: &str) -> Result<CustomClusterRecord> {
        self.store
            .get_custom_cluster(cluster_id)?
            .ok_or_else(|| Error::not_found(format!("custom cluster {}", cluster_id)))
    }

    fn base_cluster(record: &CustomClusterRecord) -> Cluster {
        Cluster {
            name: record.name.clone(),
            cluster_id: record.cluster_id.clone(),
            cluster_type: "custom".to_string(),
            created: record.created_at,
            state: ClusterState::Offline,
            eip: record.eip.clone(),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ClusterAdaptor for CustomAdaptor {
    async fn cluster_list(&self) -> Result<Vec<Cluster>> {
        let records = self.store.list_custom_clusters()?;
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
        probe_cluster(
            self.connector.as_ref(),
            Self::base_cluster(&record),
            &record.kubeconfig,
        )
        .await
    }

    async fn get_kube_config(&self, cluster_id: &str) -> Result<String> {
        Ok(self.record(cluster_id)?.kubeconfig)
    }

    async fn delete_cluster(&self, cluster_id: &str) -> Result<()> {
        let installed = match self.describe_cluster(cluster_id).await {
            Ok(cluster) => cluster.platform_installed,
            Err(e) => e.partial_cluster().is_some_and(|c| c.platform_installed),
        };
        if installed {
            return Err(Error::ClusterNotAllowDelete(cluster_id.to_string()));
        }
        self.store.delete_custom_cluster(cluster_id)?;
        info!(cluster = %cluster_id, "custom cluster deleted");
        Ok(())
    }

    async fn create_cluster(&self, config: CreateClusterConfig) -> Result<Option<Cluster>> {
        let record = CustomClusterRecord {
            cluster_id: config.cluster_id,
            name: config.name,
            eip: config.eip,
            kubeconfig: config.kubeconfig,
            created_at: Utc::now(),
        };
        self.store.create_custom_cluster(&record)?;

        let mut cluster = Self::base_cluster(&record);
        let reachable = match self.connector.connect(&record.kubeconfig).await {
            Ok(api) => matches!(
                tokio::time::timeout(VERSION_PROBE_TIMEOUT, api.server_version()).await,
                Ok(Ok(_))
            ),
            Err(e) => {
                debug!(cluster = %record.cluster_id, error = %e, "kubeconfig does not build a client");
                false
            }
        };
        if reachable {
            cluster.state = ClusterState::Running;
        }
        info!(cluster = %record.cluster_id, state = %cluster.state, "custom cluster registered");
        Ok(Some(cluster))
    }

    async fn create_kubernetes(
        &self,
        _cancel: CancellationToken,
        _config: &KubernetesClusterConfig,
        progress: &Progress,
    ) -> Option<Cluster> {
        progress.success(StepType::CreateCluster, "").await;
        None
    }

    async fn expansion_node(
        &self,
        _cancel: CancellationToken,
        _node: &ExpansionNode,
        _progress: &Progress,
    ) -> Option<Cluster> {
        None
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
