//! Kubernetes access seam
//!
//! Everything the adaptor, reconciler and facade do against a workload
//! cluster goes through [`ClusterApi`], so the orchestration logic can be
//! exercised with mocks. [`ClusterConnector`] turns a kubeconfig into a
//! connected [`ClusterApi`].

mod kube_utils;

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{
    ConfigMap, Event, Namespace, Node, PersistentVolume, PersistentVolumeClaim, Pod,
};
use k8s_openapi::api::rbac::v1::ClusterRoleBinding;
use k8s_openapi::api::storage::v1::{CSIDriver, StorageClass};
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::Client;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

pub use kube_utils::{
    api_server_endpoint, create_client_from_kubeconfig, poll_until, DEFAULT_CONNECT_TIMEOUT,
    DEFAULT_READ_TIMEOUT,
};

use crate::crd::{WutongCluster, WutongComponent, WutongPackage, WutongVolume};
use crate::Result;

/// Version reported by the API server
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ServerVersion {
    /// Major version, e.g. "1"
    pub major: String,
    /// Minor version, may carry a suffix such as "20+"
    pub minor: String,
    /// Full git version, e.g. "v1.20.4"
    pub git_version: String,
}

/// Trait abstracting Kubernetes operations on one workload cluster
///
/// Getters return `Ok(None)` for absent objects. Deletes treat absent
/// objects as success. Creates return `Ok(false)` when the object already
/// exists.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// API server version
    async fn server_version(&self) -> Result<ServerVersion>;

    /// All nodes
    async fn list_nodes(&self) -> Result<Vec<Node>>;

    /// Whether the namespace exists
    async fn namespace_exists(&self, name: &str) -> Result<bool>;

    /// Create the namespace if absent
    async fn ensure_namespace(&self, name: &str) -> Result<()>;

    /// Delete the namespace
    async fn delete_namespace(&self, name: &str) -> Result<()>;

    /// Get a config map
    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>>;

    /// Create a config map; `Ok(false)` if it already exists
    async fn create_config_map(&self, namespace: &str, config_map: &ConfigMap) -> Result<bool>;

    /// Get a deployment
    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>>;

    /// Get a cluster role binding
    async fn get_cluster_role_binding(&self, name: &str) -> Result<Option<ClusterRoleBinding>>;

    /// Delete a cluster role binding
    async fn delete_cluster_role_binding(&self, name: &str) -> Result<()>;

    /// Create the platform cluster resource
    async fn create_cluster_resource(&self, namespace: &str, cluster: &WutongCluster)
        -> Result<bool>;

    /// Get the platform cluster resource
    async fn get_cluster_resource(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<WutongCluster>>;

    /// Replace the platform cluster resource; the resource version must be set
    async fn replace_cluster_resource(&self, namespace: &str, cluster: &WutongCluster)
        -> Result<()>;

    /// Create a package
    async fn create_package(&self, namespace: &str, package: &WutongPackage) -> Result<bool>;

    /// Get a package
    async fn get_package(&self, namespace: &str, name: &str) -> Result<Option<WutongPackage>>;

    /// Create a volume
    async fn create_volume(&self, namespace: &str, volume: &WutongVolume) -> Result<bool>;

    /// Get a volume
    async fn get_volume(&self, namespace: &str, name: &str) -> Result<Option<WutongVolume>>;

    /// Create a component
    async fn create_component(&self, namespace: &str, component: &WutongComponent)
        -> Result<bool>;

    /// List components
    async fn list_components(&self, namespace: &str) -> Result<Vec<WutongComponent>>;

    /// Delete every component in the namespace
    async fn delete_all_components(&self, namespace: &str) -> Result<()>;

    /// Delete every package in the namespace
    async fn delete_all_packages(&self, namespace: &str) -> Result<()>;

    /// Delete every volume in the namespace
    async fn delete_all_volumes(&self, namespace: &str) -> Result<()>;

    /// Delete every platform cluster resource in the namespace
    async fn delete_all_cluster_resources(&self, namespace: &str) -> Result<()>;

    /// List persistent volume claims
    async fn list_pvcs(&self, namespace: &str) -> Result<Vec<PersistentVolumeClaim>>;

    /// Delete a persistent volume
    async fn delete_pv(&self, name: &str) -> Result<()>;

    /// Delete every persistent volume claim in the namespace
    async fn delete_all_pvcs(&self, namespace: &str) -> Result<()>;

    /// Delete persistent volumes matching a label selector
    async fn delete_pvs_by_label(&self, selector: &str) -> Result<()>;

    /// Delete storage classes matching a label selector
    async fn delete_storage_classes_by_label(&self, selector: &str) -> Result<()>;

    /// Delete one storage class
    async fn delete_storage_class(&self, name: &str) -> Result<()>;

    /// Delete CSI drivers matching a label selector
    async fn delete_csi_drivers_by_label(&self, selector: &str) -> Result<()>;

    /// List pods matching a label selector
    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>>;

    /// List events matching a field selector
    async fn list_events(&self, namespace: &str, field_selector: &str) -> Result<Vec<Event>>;
}

/// Builds a [`ClusterApi`] from kubeconfig text
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterConnector: Send + Sync {
    /// Connect to the cluster the kubeconfig points at
    async fn connect(&self, kubeconfig: &str) -> Result<Arc<dyn ClusterApi>>;
}

/// Connector that builds real kube clients
#[derive(Clone, Debug, Default)]
pub struct KubeconfigConnector;

#[async_trait]
impl ClusterConnector for KubeconfigConnector {
    async fn connect(&self, kubeconfig: &str) -> Result<Arc<dyn ClusterApi>> {
        let client =
            create_client_from_kubeconfig(kubeconfig, DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT)
                .await?;
        Ok(Arc::new(KubeClusterApi::new(client)))
    }
}

/// Real Kubernetes implementation of [`ClusterApi`]
pub struct KubeClusterApi {
    client: Client,
}

impl KubeClusterApi {
    /// Create a new KubeClusterApi wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn not_found_as_none<T>(result: std::result::Result<T, kube::Error>) -> Result<Option<T>> {
    match result {
        Ok(obj) => Ok(Some(obj)),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn conflict_as_false<T>(result: std::result::Result<T, kube::Error>) -> Result<bool> {
    match result {
        Ok(_) => Ok(true),
        Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(false),
        Err(e) => Err(e.into()),
    }
}

fn not_found_ok<T>(result: std::result::Result<T, kube::Error>) -> Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn delete_collection<K>(api: Api<K>, lp: &ListParams) -> Result<()>
where
    K: kube::Resource + Clone + serde::de::DeserializeOwned + std::fmt::Debug,
{
    not_found_ok(api.delete_collection(&DeleteParams::default(), lp).await)
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn server_version(&self) -> Result<ServerVersion> {
        let info = self.client.apiserver_version().await?;
        Ok(ServerVersion {
            major: info.major,
            minor: info.minor,
            git_version: info.git_version,
        })
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn namespace_exists(&self, name: &str) -> Result<bool> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        Ok(not_found_as_none(api.get(name).await)?.is_some())
    }

    async fn ensure_namespace(&self, name: &str) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let ns = Namespace {
            metadata: kube::api::ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        if !conflict_as_false(api.create(&PostParams::default(), &ns).await)? {
            debug!(namespace = %name, "namespace already exists");
        }
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        not_found_ok(api.delete(name, &DeleteParams::default()).await)
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        not_found_as_none(api.get(name).await)
    }

    async fn create_config_map(&self, namespace: &str, config_map: &ConfigMap) -> Result<bool> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        conflict_as_false(api.create(&PostParams::default(), config_map).await)
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        not_found_as_none(api.get(name).await)
    }

    async fn get_cluster_role_binding(&self, name: &str) -> Result<Option<ClusterRoleBinding>> {
        let api: Api<ClusterRoleBinding> = Api::all(self.client.clone());
        not_found_as_none(api.get(name).await)
    }

    async fn delete_cluster_role_binding(&self, name: &str) -> Result<()> {
        let api: Api<ClusterRoleBinding> = Api::all(self.client.clone());
        not_found_ok(api.delete(name, &DeleteParams::default()).await)
    }

    async fn create_cluster_resource(
        &self,
        namespace: &str,
        cluster: &WutongCluster,
    ) -> Result<bool> {
        let api: Api<WutongCluster> = Api::namespaced(self.client.clone(), namespace);
        conflict_as_false(api.create(&PostParams::default(), cluster).await)
    }

    async fn get_cluster_resource(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<WutongCluster>> {
        let api: Api<WutongCluster> = Api::namespaced(self.client.clone(), namespace);
        not_found_as_none(api.get(name).await)
    }

    async fn replace_cluster_resource(
        &self,
        namespace: &str,
        cluster: &WutongCluster,
    ) -> Result<()> {
        let api: Api<WutongCluster> = Api::namespaced(self.client.clone(), namespace);
        let name = cluster.metadata.name.clone().unwrap_or_default();
        api.replace(&name, &PostParams::default(), cluster).await?;
        Ok(())
    }

    async fn create_package(&self, namespace: &str, package: &WutongPackage) -> Result<bool> {
        let api: Api<WutongPackage> = Api::namespaced(self.client.clone(), namespace);
        conflict_as_false(api.create(&PostParams::default(), package).await)
    }

    async fn get_package(&self, namespace: &str, name: &str) -> Result<Option<WutongPackage>> {
        let api: Api<WutongPackage> = Api::namespaced(self.client.clone(), namespace);
        not_found_as_none(api.get(name).await)
    }

    async fn create_volume(&self, namespace: &str, volume: &WutongVolume) -> Result<bool> {
        let api: Api<WutongVolume> = Api::namespaced(self.client.clone(), namespace);
        conflict_as_false(api.create(&PostParams::default(), volume).await)
    }

    async fn get_volume(&self, namespace: &str, name: &str) -> Result<Option<WutongVolume>> {
        let api: Api<WutongVolume> = Api::namespaced(self.client.clone(), namespace);
        not_found_as_none(api.get(name).await)
    }

    async fn create_component(
        &self,
        namespace: &str,
        component: &WutongComponent,
    ) -> Result<bool> {
        let api: Api<WutongComponent> = Api::namespaced(self.client.clone(), namespace);
        conflict_as_false(api.create(&PostParams::default(), component).await)
    }

    async fn list_components(&self, namespace: &str) -> Result<Vec<WutongComponent>> {
        let api: Api<WutongComponent> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn delete_all_components(&self, namespace: &str) -> Result<()> {
        let api: Api<WutongComponent> = Api::namespaced(self.client.clone(), namespace);
        delete_collection(api, &ListParams::default()).await
    }

    async fn delete_all_packages(&self, namespace: &str) -> Result<()> {
        let api: Api<WutongPackage> = Api::namespaced(self.client.clone(), namespace);
        delete_collection(api, &ListParams::default()).await
    }

    async fn delete_all_volumes(&self, namespace: &str) -> Result<()> {
        let api: Api<WutongVolume> = Api::namespaced(self.client.clone(), namespace);
        delete_collection(api, &ListParams::default()).await
    }

    async fn delete_all_cluster_resources(&self, namespace: &str) -> Result<()> {
        let api: Api<WutongCluster> = Api::namespaced(self.client.clone(), namespace);
        delete_collection(api, &ListParams::default()).await
    }

    async fn list_pvcs(&self, namespace: &str) -> Result<Vec<PersistentVolumeClaim>> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn delete_pv(&self, name: &str) -> Result<()> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        not_found_ok(api.delete(name, &DeleteParams::default()).await)
    }

    async fn delete_all_pvcs(&self, namespace: &str) -> Result<()> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        delete_collection(api, &ListParams::default()).await
    }

    async fn delete_pvs_by_label(&self, selector: &str) -> Result<()> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        delete_collection(api, &ListParams::default().labels(selector)).await
    }

    async fn delete_storage_classes_by_label(&self, selector: &str) -> Result<()> {
        let api: Api<StorageClass> = Api::all(self.client.clone());
        delete_collection(api, &ListParams::default().labels(selector)).await
    }

    async fn delete_storage_class(&self, name: &str) -> Result<()> {
        let api: Api<StorageClass> = Api::all(self.client.clone());
        not_found_ok(api.delete(name, &DeleteParams::default()).await)
    }

    async fn delete_csi_drivers_by_label(&self, selector: &str) -> Result<()> {
        let api: Api<CSIDriver> = Api::all(self.client.clone());
        delete_collection(api, &ListParams::default().labels(selector)).await
    }

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let lp = if selector.is_empty() {
            ListParams::default()
        } else {
            ListParams::default().labels(selector)
        };
        Ok(api.list(&lp).await?.items)
    }

    async fn list_events(&self, namespace: &str, field_selector: &str) -> Result<Vec<Event>> {
        let api: Api<Event> = Api::namespaced(self.client.clone(), namespace);
        let lp = ListParams::default().fields(field_selector);
        Ok(api.list(&lp).await?.items)
    }
}
