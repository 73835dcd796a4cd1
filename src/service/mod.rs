//! Orchestration facade
//!
//! [`ClusterService`] is what callers talk to. It checks preconditions,
//! records a task, publishes it and answers the status queries callers
//! poll; the slow work happens in the task engine on the other side of the
//! transport.
//!
//! Precondition failures are returned before any task record exists.

mod requests;

pub use requests::{
    AddAccessKey, CreateKubernetesRequest, CreatedCluster, InitPlatformReq, PlatformComponent,
    UpdateKubernetesRequest,
};

use std::collections::BTreeMap;
use std::future::Future;
use std::iter;
use std::sync::Arc;

use chrono::Utc;
use k8s_openapi::api::core::v1::{ConfigMap, Event, Pod};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::client::ClusterApi;
use crate::crd::{platform_label_selector, WutongClusterSpec};
use crate::operator::{
    bounded, overlay_spec, PlatformRegion, RegionStatus, NAMESPACE, OPERATOR_NAME,
};
use crate::provider::{
    Adaptor, Cluster, ClusterAdaptor, ClusterState, CreateClusterConfig, Credentials,
    ExpansionNode, KubernetesClusterConfig, ProviderKind, RkeConfig,
};
use crate::store::{
    AccessKey, CreateKubernetesTask, InitPlatformTask, TaskEvent, TaskRecord, TaskStatus,
    UpdateKubernetesTask,
};
use crate::task::{StepStatus, StepType, TaskContext, TaskKind};
use crate::transport::{
    InitPlatformConfigMessage, InitPlatformRequest, KubernetesConfigMessage, TaskProducer,
    UpdateKubernetesConfigMessage,
};
use crate::{Error, Result};

const OPERATOR_RELEASE_SELECTOR: &str = "release=wutong-operator";
const REGION_CONFIG_BINARY_KEYS: [&str; 3] = ["client.pem", "client.key.pem", "ca.pem"];
const REGION_CONFIG_DATA_KEYS: [&str; 4] = [
    "apiAddress",
    "websocketAddress",
    "defaultDomainSuffix",
    "defaultTCPHost",
];

/// Entry point for every cluster operation
pub struct ClusterService {
    ctx: TaskContext,
    producer: TaskProducer,
    cancel: CancellationToken,
    disable_uninstall: bool,
}

impl ClusterService {
    /// Create a facade sharing the task engine's collaborators
    pub fn new(ctx: TaskContext, producer: TaskProducer, cancel: CancellationToken) -> Self {
        Self {
            ctx,
            producer,
            cancel,
            disable_uninstall: false,
        }
    }

    /// Turn [`ClusterService::uninstall_platform`] into a no-op
    pub fn with_uninstall_disabled(mut self, disabled: bool) -> Self {
        self.disable_uninstall = disabled;
        self
    }

    // =========================================================================
    // Collaborators
    // =========================================================================

    fn credentials(&self, provider: &str) -> Result<Option<Credentials>> {
        if !ProviderKind::parse(provider).needs_access_key() {
            return Ok(None);
        }
        let key = self
            .ctx
            .store
            .get_access_key(provider)?
            .ok_or_else(|| Error::AccessKeyNotFound(provider.to_string()))?;
        Ok(Some(Credentials {
            access_key: key.access_key,
            secret_key: key.secret_key,
        }))
    }

    fn adaptor(&self, provider: &str) -> Result<Adaptor> {
        let credentials = self.credentials(provider)?;
        self.ctx.registry.adaptor(provider, credentials)
    }

    async fn connect(&self, provider: &str, cluster_id: &str) -> Result<(String, Arc<dyn ClusterApi>)> {
        let kubeconfig = self.adaptor(provider)?.get_kube_config(cluster_id).await?;
        let api = self.ctx.registry.connector().connect(&kubeconfig).await?;
        Ok((kubeconfig, api))
    }

    async fn region(&self, provider: &str, cluster_id: &str) -> Result<PlatformRegion> {
        let (kubeconfig, api) = self.connect(provider, cluster_id).await?;
        Ok(PlatformRegion::new(
            api,
            self.ctx.runner.clone(),
            self.ctx.store.clone(),
            self.ctx.settings.clone(),
            kubeconfig,
        )
        .with_work_dir(self.ctx.work_dir.clone()))
    }

    /// Mark the task started and publish it; a failed publish puts it back
    /// to pending
    async fn publish<F>(&self, kind: TaskKind, task_id: &str, publish: F) -> TaskStatus
    where
        F: Future<Output = Result<()>>,
    {
        if let Err(e) = self.ctx.store.set_task_status(kind, task_id, TaskStatus::Start) {
            error!(task_id = %task_id, error = %e, "update task status failure");
        }
        match publish.await {
            Ok(()) => {
                info!(task_id = %task_id, kind = %kind, "task sent to queue");
                TaskStatus::Start
            }
            Err(e) => {
                error!(task_id = %task_id, kind = %kind, error = %e, "send task failure");
                if let Err(e) = self.ctx.store.set_task_status(kind, task_id, TaskStatus::Pending) {
                    error!(task_id = %task_id, error = %e, "update task status failure");
                }
                TaskStatus::Pending
            }
        }
    }

    /// Version of the latest update task, refusing while any task on the
    /// cluster is unfinished
    fn last_task_version(&self, cluster_id: &str) -> Result<i64> {
        let not_complete = |task: TaskRecord| Error::LastTaskNotComplete {
            cluster_id: cluster_id.to_string(),
            task: Some(Box::new(task)),
        };

        let update = self.ctx.store.last_update_task_for_cluster(cluster_id)?;
        if let Some(task) = update.as_ref().filter(|t| t.status != TaskStatus::Complete) {
            return Err(not_complete(TaskRecord::UpdateKubernetes(task.clone())));
        }
        if let Some(task) = self
            .ctx
            .store
            .last_create_kubernetes_task_for_cluster(cluster_id)?
            .filter(|t| t.status != TaskStatus::Complete)
        {
            return Err(not_complete(TaskRecord::CreateKubernetes(task)));
        }
        Ok(update.map_or(0, |t| t.version))
    }

    // =========================================================================
    // Task requests
    // =========================================================================

    /// Register or provision a cluster and queue its provisioning task
    pub async fn create_kubernetes_cluster(&self, req: CreateKubernetesRequest) -> Result<CreatedCluster> {
        let cluster_id = Uuid::new_v4().to_string();
        let mut state = ClusterState::Offline;
        let mut rke_config = None;
        let mut credentials = None;

        match ProviderKind::parse(&req.provider) {
            ProviderKind::Custom => {
                let registered = self
                    .adaptor(&req.provider)?
                    .create_cluster(CreateClusterConfig {
                        cluster_id: cluster_id.clone(),
                        name: req.name.clone(),
                        eip: req.eip.clone(),
                        kubeconfig: req.kubeconfig.clone(),
                        ..Default::default()
                    })
                    .await?;
                if let Some(cluster) = registered {
                    state = cluster.state;
                }
            }
            ProviderKind::Rke => {
                let config = RkeConfig::decode(&req.encoded_rke_config)?;
                config.validate()?;
                self.adaptor(&req.provider)?
                    .create_cluster(CreateClusterConfig {
                        cluster_id: cluster_id.clone(),
                        name: req.name.clone(),
                        create_config: config.to_yaml()?,
                        ..Default::default()
                    })
                    .await?;
                rke_config = Some(config);
            }
            ProviderKind::Managed(_) => credentials = self.credentials(&req.provider)?,
        }

        let mut task = CreateKubernetesTask {
            task_id: Uuid::new_v4().to_string(),
            name: req.name.clone(),
            worker_resource_type: req.worker_resource_type.clone(),
            worker_num: req.worker_num,
            provider: req.provider.clone(),
            region: req.region.clone(),
            status: TaskStatus::Pending,
            cluster_id: cluster_id.clone(),
            created_at: Utc::now(),
        };
        self.ctx.store.create_create_kubernetes_task(&task)?;

        let credentials = credentials.unwrap_or_default();
        let message = KubernetesConfigMessage {
            enterprise_id: None,
            task_id: task.task_id.clone(),
            kubernetes_config: Some(KubernetesClusterConfig {
                cluster_id,
                cluster_name: req.name,
                worker_resource_type: req.worker_resource_type,
                worker_node_num: req.worker_num,
                provider: req.provider,
                region: req.region,
                access_key: credentials.access_key,
                secret_key: credentials.secret_key,
                rke_config,
            }),
        };
        task.status = self
            .publish(
                TaskKind::CreateKubernetes,
                &task.task_id,
                self.producer.send_create_kubernetes_task(&message),
            )
            .await;
        Ok(CreatedCluster { task, state })
    }

    /// Re-run provisioning of a stored rke cluster
    pub async fn install_cluster(&self, cluster_id: &str) -> Result<CreateKubernetesTask> {
        let record = self
            .ctx
            .store
            .get_rke_cluster(cluster_id)?
            .ok_or_else(|| Error::not_found(format!("rke cluster {}", cluster_id)))?;
        self.last_task_version(&record.cluster_id)?;
        let config = RkeConfig::from_yaml(&record.create_config)?;
        config.validate()?;

        let mut task = CreateKubernetesTask {
            task_id: Uuid::new_v4().to_string(),
            name: record.name.clone(),
            provider: ProviderKind::Rke.to_string(),
            status: TaskStatus::Pending,
            cluster_id: record.cluster_id.clone(),
            created_at: Utc::now(),
            ..Default::default()
        };
        self.ctx.store.create_create_kubernetes_task(&task)?;

        let message = KubernetesConfigMessage {
            enterprise_id: None,
            task_id: task.task_id.clone(),
            kubernetes_config: Some(KubernetesClusterConfig {
                cluster_id: record.cluster_id,
                cluster_name: record.name,
                provider: task.provider.clone(),
                rke_config: Some(config),
                ..Default::default()
            }),
        };
        task.status = self
            .publish(
                TaskKind::CreateKubernetes,
                &task.task_id,
                self.producer.send_create_kubernetes_task(&message),
            )
            .await;
        Ok(task)
    }

    /// Queue a platform installation
    ///
    /// An earlier task for the same (provider, cluster) is handed back inside
    /// [`Error::LastTaskNotComplete`] unless `retry` is set.
    pub async fn init_platform(&self, req: InitPlatformReq) -> Result<InitPlatformTask> {
        if let Some(old) = self
            .ctx
            .store
            .init_task_for_cluster(&req.cluster_id, &req.provider)?
        {
            if !req.retry {
                return Err(Error::LastTaskNotComplete {
                    cluster_id: req.cluster_id,
                    task: Some(Box::new(TaskRecord::InitPlatform(old))),
                });
            }
        }
        self.ensure_not_installed(&req.cluster_id, &req.provider).await?;
        let credentials = self.credentials(&req.provider)?.unwrap_or_default();

        let mut task = InitPlatformTask {
            task_id: Uuid::new_v4().to_string(),
            cluster_id: req.cluster_id.clone(),
            provider: req.provider.clone(),
            status: TaskStatus::Pending,
            created_at: Utc::now(),
        };
        self.ctx.store.create_init_task(&task)?;

        let message = InitPlatformConfigMessage {
            enterprise_id: (!req.enterprise_id.is_empty()).then(|| req.enterprise_id.clone()),
            task_id: task.task_id.clone(),
            init_config: Some(InitPlatformRequest {
                enterprise_id: req.enterprise_id,
                cluster_id: req.cluster_id,
                access_key: credentials.access_key,
                secret_key: credentials.secret_key,
                provider: req.provider,
            }),
        };
        task.status = self
            .publish(
                TaskKind::InitPlatform,
                &task.task_id,
                self.producer.send_init_platform_task(&message),
            )
            .await;
        Ok(task)
    }

    /// Refuse when the operator deployment already exists
    ///
    /// A cluster without a kubeconfig, or one that cannot be reached, is
    /// treated as not installed.
    async fn ensure_not_installed(&self, cluster_id: &str, provider: &str) -> Result<()> {
        let kubeconfig = match self.adaptor(provider)?.get_kube_config(cluster_id).await {
            Ok(kubeconfig) => kubeconfig,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };
        if kubeconfig.is_empty() {
            return Ok(());
        }
        let api = match self.ctx.registry.connector().connect(&kubeconfig).await {
            Ok(api) => api,
            Err(e) => {
                warn!(cluster = %cluster_id, error = %e, "get kube client failure");
                return Ok(());
            }
        };
        match bounded("get operator", api.get_deployment(NAMESPACE, OPERATOR_NAME)).await {
            Ok(Some(_)) => Err(Error::PlatformInstalled(cluster_id.to_string())),
            Ok(None) => Ok(()),
            Err(e) => {
                warn!(cluster = %cluster_id, error = %e, "get operator failure");
                Ok(())
            }
        }
    }

    /// Queue a node change for an rke cluster
    pub async fn update_kubernetes_cluster(
        &self,
        req: UpdateKubernetesRequest,
    ) -> Result<UpdateKubernetesTask> {
        if ProviderKind::parse(&req.provider) != ProviderKind::Rke {
            return Err(Error::validation(format!(
                "provider {} does not support updating kubernetes",
                req.provider
            )));
        }
        let config = RkeConfig::decode(&req.encoded_rke_config)?;
        config.validate()?;
        let version = self.last_task_version(&req.cluster_id)?;

        let mut task = UpdateKubernetesTask {
            task_id: Uuid::new_v4().to_string(),
            cluster_id: req.cluster_id.clone(),
            version: version + 1,
            provider: req.provider.clone(),
            node_number: i32::try_from(config.nodes.len()).unwrap_or(i32::MAX),
            status: TaskStatus::Pending,
            created_at: Utc::now(),
        };
        self.ctx.store.create_update_task(&task)?;

        let message = UpdateKubernetesConfigMessage {
            enterprise_id: None,
            task_id: task.task_id.clone(),
            config: Some(ExpansionNode {
                provider: req.provider,
                cluster_id: req.cluster_id,
                rke_config: Some(config),
            }),
        };
        task.status = self
            .publish(
                TaskKind::UpdateKubernetes,
                &task.task_id,
                self.producer.send_update_kubernetes_task(&message),
            )
            .await;
        Ok(task)
    }

    /// Tear the platform down in the background and forget its install tasks
    ///
    /// Returns `None` when uninstalling is disabled.
    pub async fn uninstall_platform(
        &self,
        cluster_id: &str,
        provider: &str,
    ) -> Result<Option<JoinHandle<()>>> {
        if self.disable_uninstall {
            info!(cluster = %cluster_id, "uninstall platform is disabled");
            return Ok(None);
        }
        let region = self.region(provider, cluster_id).await?;
        let store = self.ctx.store.clone();
        let cancel = self.cancel.child_token();
        let cluster_id = cluster_id.to_string();
        let provider = provider.to_string();

        Ok(Some(tokio::spawn(async move {
            info!(cluster = %cluster_id, provider = %provider, "start uninstall platform");
            if let Err(e) = region.uninstall(&cancel).await {
                error!(cluster = %cluster_id, error = %e, "uninstall platform failure");
            }
            match store.delete_init_tasks(&cluster_id, &provider) {
                Ok(deleted) => {
                    info!(cluster = %cluster_id, provider = %provider, deleted, "complete uninstall platform")
                }
                Err(e) => error!(cluster = %cluster_id, error = %e, "delete init tasks failure"),
            }
        })))
    }

    // =========================================================================
    // Task queries
    // =========================================================================

    /// Any task by id
    pub fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        self.ctx.store.get_task(task_id)
    }

    /// Latest provisioning activity for the provider
    ///
    /// A node update newer than the last provisioning task is reported in
    /// its place.
    pub fn get_last_create_kubernetes_task(&self, provider: &str) -> Result<Option<CreateKubernetesTask>> {
        let store = &self.ctx.store;
        let Some(task) = store.last_create_kubernetes_task(provider)? else {
            return Ok(None);
        };
        let Some(update) = store.last_update_task(provider)? else {
            return Ok(Some(task));
        };
        if task.created_at > update.created_at {
            return Ok(Some(task));
        }
        Ok(Some(match store.get_rke_cluster(&update.cluster_id)? {
            Some(cluster) => CreateKubernetesTask {
                task_id: update.task_id,
                name: cluster.name,
                provider: provider.to_string(),
                status: update.status,
                cluster_id: update.cluster_id,
                created_at: update.created_at,
                ..Default::default()
            },
            None => task,
        }))
    }

    /// Latest installation task of (provider, cluster)
    ///
    /// Events are synced first. While the operator is installed but the
    /// platform is not yet running the status reads `installing`.
    pub async fn get_init_task(&self, cluster_id: &str, provider: &str) -> Result<Option<InitPlatformTask>> {
        let Some(task) = self.ctx.store.init_task_for_cluster(cluster_id, provider)? else {
            return Ok(None);
        };
        if let Err(e) = self.list_task_events(&task.task_id).await {
            warn!(task_id = %task.task_id, error = %e, "sync task events failure");
        }
        let mut task = self.ctx.store.get_init_task(&task.task_id)?.unwrap_or(task);

        if ProviderKind::parse(provider).needs_access_key() {
            return Ok(Some(task));
        }
        match self.region(provider, cluster_id).await {
            Ok(region) => match region.status().await {
                Ok(status) if installing(&status) => task.status = TaskStatus::Installing,
                Ok(_) => {}
                Err(e) => warn!(cluster = %cluster_id, error = %e, "get task cluster status failure"),
            },
            Err(e) => warn!(cluster = %cluster_id, error = %e, "get task cluster status failure"),
        }
        Ok(Some(task))
    }

    /// Installation tasks not yet complete
    pub fn running_init_tasks(&self) -> Result<Vec<InitPlatformTask>> {
        self.ctx.store.running_init_tasks()
    }

    /// Set the status of an installation task
    pub fn update_init_task_status(&self, task_id: &str, status: TaskStatus) -> Result<InitPlatformTask> {
        self.ctx.store.set_task_status(TaskKind::InitPlatform, task_id, status)?;
        self.ctx
            .store
            .get_init_task(task_id)?
            .ok_or_else(|| Error::not_found(format!("init task {}", task_id)))
    }

    /// Event history of a task; empty for unknown tasks
    ///
    /// When the history holds a failure, steps of a self-hosted installation
    /// that the cluster has since reached are rewritten to success.
    pub async fn list_task_events(&self, task_id: &str) -> Result<Vec<TaskEvent>> {
        let Some(task) = self.ctx.store.get_task(task_id)? else {
            return Ok(Vec::new());
        };
        let mut events = self.ctx.store.list_task_events(task_id)?;
        if events.iter().any(|e| e.status == StepStatus::Failure) {
            if let Err(e) = self.sync_task_events(&task, &mut events).await {
                warn!(task_id = %task_id, error = %e, "sync task events failure");
            }
        }
        Ok(events)
    }

    async fn sync_task_events(&self, task: &TaskRecord, events: &mut [TaskEvent]) -> Result<()> {
        let TaskRecord::InitPlatform(init) = task else {
            return Ok(());
        };
        if ProviderKind::parse(&init.provider).needs_access_key() {
            return Ok(());
        }
        let status = self
            .region(&init.provider, &init.cluster_id)
            .await?
            .status()
            .await?;
        let reached = reached_steps(&status);

        let healed: Vec<String> = events
            .iter_mut()
            .filter(|e| e.status == StepStatus::Failure && reached.contains(&e.step_type))
            .map(|e| {
                e.status = StepStatus::Success;
                e.event_id.clone()
            })
            .collect();
        if healed.is_empty() {
            return Ok(());
        }
        info!(task_id = %init.task_id, count = healed.len(), "failed steps since reached, marking success");
        self.ctx
            .store
            .update_event_status_in_batch(&healed, StepStatus::Success)
    }

    // =========================================================================
    // Clusters
    // =========================================================================

    /// Every cluster of the provider
    pub async fn list_clusters(&self, provider: &str) -> Result<Vec<Cluster>> {
        self.adaptor(provider)?.cluster_list().await
    }

    /// Probe one cluster
    pub async fn get_cluster(&self, provider: &str, cluster_id: &str) -> Result<Cluster> {
        self.adaptor(provider)?.describe_cluster(cluster_id).await
    }

    /// Forget a cluster; refused while the platform runs on it
    pub async fn delete_cluster(&self, provider: &str, cluster_id: &str) -> Result<()> {
        self.adaptor(provider)?.delete_cluster(cluster_id).await
    }

    /// Kubeconfig of a cluster
    pub async fn get_kube_config(&self, provider: &str, cluster_id: &str) -> Result<String> {
        self.adaptor(provider)?.get_kube_config(cluster_id).await
    }

    /// Connection details the platform published, once it has
    pub async fn get_region_config(
        &self,
        provider: &str,
        cluster_id: &str,
    ) -> Result<Option<BTreeMap<String, String>>> {
        let status = self.region(provider, cluster_id).await?.status().await?;
        Ok(status.region_config.as_ref().map(region_config_entries))
    }

    /// Components and their pods, least healthy first
    pub async fn list_components(&self, provider: &str, cluster_id: &str) -> Result<Vec<PlatformComponent>> {
        let (_, api) = self.connect(provider, cluster_id).await?;
        let components = bounded("list components", api.list_components(NAMESPACE)).await?;
        let pods = bounded("list pods", api.list_pods(NAMESPACE, &platform_label_selector())).await?;
        let operator_pods = bounded(
            "list operator pods",
            api.list_pods(NAMESPACE, OPERATOR_RELEASE_SELECTOR),
        )
        .await?;

        let mut grouped = group_by_name_label(pods);
        grouped.insert(OPERATOR_NAME.to_string(), operator_pods);

        let mut out: Vec<PlatformComponent> = components
            .iter()
            .filter_map(|c| c.metadata.name.clone())
            .chain(iter::once(OPERATOR_NAME.to_string()))
            .map(|app| PlatformComponent {
                pods: grouped.remove(&app).unwrap_or_default(),
                app,
            })
            .collect();
        out.sort_by_key(|c| std::cmp::Reverse(c.phase_score()));
        Ok(out)
    }

    /// Kubernetes events of one platform pod
    pub async fn list_pod_events(&self, provider: &str, cluster_id: &str, pod: &str) -> Result<Vec<Event>> {
        let (_, api) = self.connect(provider, cluster_id).await?;
        bounded(
            "list pod events",
            api.list_events(NAMESPACE, &format!("involvedObject.name={}", pod)),
        )
        .await
    }

    // =========================================================================
    // Configuration
    // =========================================================================

    /// Store the override document applied on the next installation
    pub fn set_cluster_config(&self, cluster_id: &str, config: &str) -> Result<()> {
        overlay_spec(&WutongClusterSpec::default(), config)
            .map_err(|e| Error::ConfigInvalid(e.to_string()))?;
        self.ctx.store.set_cluster_config(cluster_id, config)
    }

    /// Stored override document
    pub fn get_cluster_config(&self, cluster_id: &str) -> Result<Option<String>> {
        self.ctx.store.get_cluster_config(cluster_id)
    }

    /// Store credentials for a provider
    pub fn add_access_key(&self, req: AddAccessKey) -> Result<AccessKey> {
        let key = AccessKey {
            provider: req.provider,
            access_key: req.access_key,
            secret_key: req.secret_key,
        };
        self.ctx.store.put_access_key(&key)?;
        Ok(key)
    }

    /// Stored credentials of a provider
    pub fn get_access_key(&self, provider: &str) -> Result<Option<AccessKey>> {
        self.ctx.store.get_access_key(provider)
    }
}

fn installing(status: &RegionStatus) -> bool {
    let running = status.cluster.as_ref().is_some_and(|c| c.running());
    !running && status.operator_installed
}

/// Installation steps the cluster shows as done
fn reached_steps(status: &RegionStatus) -> Vec<StepType> {
    let cluster = status.cluster.as_ref();
    let mut steps = Vec::new();
    if status.operator_ready {
        steps.push(StepType::InitWutongRegionOperator);
    }
    if cluster.is_some_and(|c| c.image_hub_ready()) {
        steps.push(StepType::InitWutongRegionImageHub);
    }
    if status.package.as_ref().is_some_and(|p| p.ready()) {
        steps.push(StepType::InitWutongRegionPackage);
    }
    if cluster.is_some_and(|c| c.running()) {
        steps.push(StepType::InitWutongRegion);
    }
    steps
}

fn region_config_entries(config_map: &ConfigMap) -> BTreeMap<String, String> {
    let binary = REGION_CONFIG_BINARY_KEYS.iter().map(|key| {
        let value = config_map
            .binary_data
            .as_ref()
            .and_then(|d| d.get(*key))
            .map(|b| String::from_utf8_lossy(&b.0).into_owned())
            .unwrap_or_default();
        (key.to_string(), value)
    });
    let data = REGION_CONFIG_DATA_KEYS.iter().map(|key| {
        let value = config_map
            .data
            .as_ref()
            .and_then(|d| d.get(*key))
            .cloned()
            .unwrap_or_default();
        (key.to_string(), value)
    });
    binary.chain(data).collect()
}

fn group_by_name_label(pods: Vec<Pod>) -> BTreeMap<String, Vec<Pod>> {
    let mut grouped: BTreeMap<String, Vec<Pod>> = BTreeMap::new();
    for pod in pods {
        let name = pod
            .metadata
            .labels
            .as_ref()
            .and_then(|l| l.get("name"))
            .filter(|n| !n.is_empty())
            .cloned();
        match name {
            Some(name) => grouped.entry(name).or_default().push(pod),
            None => warn!(pod = ?pod.metadata.name, "platform pod without name label"),
        }
    }
    grouped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{MockClusterApi, MockClusterConnector};
    use crate::crd::{
        Condition, ConditionStatus, WutongCluster, WutongClusterStatus, WutongComponent,
        WutongComponentSpec, WutongPackage, CONDITION_IMAGE_REPOSITORY, CONDITION_RUNNING,
    };
    use crate::provider::tests::{healthy_connector, KUBECONFIG};
    use crate::store::{CustomClusterRecord, RkeClusterRecord, TaskStore};
    use crate::task::tests::context;
    use crate::task::StepMessage;
    use crate::transport::{MockProducer, Topic};
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use k8s_openapi::api::apps::v1::{Deployment, DeploymentStatus};
    use k8s_openapi::api::core::v1::PodStatus;
    use k8s_openapi::ByteString;
    use kube::api::ObjectMeta;
    use std::sync::Mutex;

    const RKE_YAML: &str = "nodes:\n- address: 10.0.0.1\n  role: [controlplane, etcd, worker]\n";

    fn service(store: TaskStore, connector: MockClusterConnector, producer: MockProducer) -> ClusterService {
        ClusterService::new(
            context(store, connector),
            TaskProducer::new(Arc::new(producer)),
            CancellationToken::new(),
        )
    }

    fn accepting(topic: Topic) -> MockProducer {
        let mut producer = MockProducer::new();
        producer
            .expect_publish()
            .withf(move |t, _| *t == topic)
            .returning(|_, _| Ok(()));
        producer
    }

    fn silent() -> MockProducer {
        let mut producer = MockProducer::new();
        producer.expect_publish().never();
        producer
    }

    fn store_with_custom_cluster() -> TaskStore {
        let store = TaskStore::in_memory().unwrap();
        store
            .create_custom_cluster(&CustomClusterRecord {
                cluster_id: "c-1".into(),
                name: "prod".into(),
                eip: vec!["47.1.2.3".into()],
                kubeconfig: KUBECONFIG.into(),
                created_at: Utc::now(),
            })
            .unwrap();
        store
    }

    fn store_with_rke_cluster() -> TaskStore {
        let store = TaskStore::in_memory().unwrap();
        store
            .create_rke_cluster(&RkeClusterRecord {
                cluster_id: "r-1".into(),
                name: "edge".into(),
                state: "running".into(),
                create_config: RKE_YAML.into(),
                created_at: Utc::now(),
                ..Default::default()
            })
            .unwrap();
        store
    }

    fn connector_with(api: impl Fn() -> MockClusterApi + Send + Sync + 'static) -> MockClusterConnector {
        let mut connector = MockClusterConnector::new();
        connector
            .expect_connect()
            .returning(move |_| Ok(Arc::new(api()) as Arc<dyn ClusterApi>));
        connector
    }

    fn deployment(ready: i32) -> Deployment {
        Deployment {
            status: Some(DeploymentStatus {
                ready_replicas: Some(ready),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn cluster_with(conditions: &[&str]) -> WutongCluster {
        let mut cluster = WutongCluster::new("wutongcluster", WutongClusterSpec::default());
        cluster.status = Some(WutongClusterStatus {
            conditions: conditions
                .iter()
                .map(|c| Condition::new(*c, ConditionStatus::True))
                .collect(),
        });
        cluster
    }

    /// Status reads against a cluster whose operator has `ready` replicas
    fn status_api(
        ready: i32,
        conditions: &'static [&'static str],
        region_config: Option<ConfigMap>,
    ) -> MockClusterApi {
        let mut api = MockClusterApi::new();
        api.expect_get_deployment()
            .returning(move |_, _| Ok(Some(deployment(ready))));
        api.expect_get_cluster_resource()
            .returning(move |_, _| Ok(Some(cluster_with(conditions))));
        api.expect_get_package()
            .returning(|_, _| Ok(Some(WutongPackage::new("wutongpackage", Default::default()))));
        api.expect_get_volume().returning(|_, _| Ok(None));
        api.expect_get_config_map()
            .returning(move |_, _| Ok(region_config.clone()));
        api
    }

    // ==========================================================================
    // Story Tests: requesting clusters
    // ==========================================================================

    /// Story: registering a custom cluster stores it, probes it, and queues a
    /// task the engine will mark complete.
    #[tokio::test]
    async fn story_custom_cluster_is_registered_and_queued() {
        let store = TaskStore::in_memory().unwrap();
        let body = Arc::new(Mutex::new(Vec::new()));
        let sink = body.clone();
        let mut producer = MockProducer::new();
        producer
            .expect_publish()
            .withf(|topic, _| *topic == Topic::ClusterCreate)
            .times(1)
            .returning(move |_, b| {
                *sink.lock().unwrap() = b;
                Ok(())
            });
        let service = service(store.clone(), healthy_connector("v1.20.4", 1, false), producer);

        let created = service
            .create_kubernetes_cluster(CreateKubernetesRequest {
                provider: "custom".into(),
                name: "prod".into(),
                kubeconfig: KUBECONFIG.into(),
                eip: vec!["47.1.2.3".into()],
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(created.state, ClusterState::Running);
        assert_eq!(created.task.status, TaskStatus::Start);
        assert!(store.get_custom_cluster(&created.task.cluster_id).unwrap().is_some());
        let stored = store.get_create_kubernetes_task(&created.task.task_id).unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Start);

        let message: KubernetesConfigMessage = serde_json::from_slice(&body.lock().unwrap()).unwrap();
        assert_eq!(message.task_id, created.task.task_id);
        assert_eq!(message.kubernetes_config.unwrap().cluster_id, created.task.cluster_id);
    }

    #[tokio::test]
    async fn test_publish_failure_leaves_task_pending() {
        let store = TaskStore::in_memory().unwrap();
        let mut producer = MockProducer::new();
        producer
            .expect_publish()
            .returning(|_, _| Err(Error::transport("broker down")));
        let service = service(store.clone(), healthy_connector("v1.20.4", 1, false), producer);

        let created = service
            .create_kubernetes_cluster(CreateKubernetesRequest {
                provider: "custom".into(),
                name: "prod".into(),
                kubeconfig: KUBECONFIG.into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(created.task.status, TaskStatus::Pending);
        let stored = store.get_create_kubernetes_task(&created.task.task_id).unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_managed_provider_needs_access_key() {
        let service = service(TaskStore::in_memory().unwrap(), MockClusterConnector::new(), silent());
        let err = service
            .create_kubernetes_cluster(CreateKubernetesRequest {
                provider: "ack".into(),
                name: "prod".into(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AccessKeyNotFound(p) if p == "ack"));
    }

    #[tokio::test]
    async fn test_bad_rke_config_creates_nothing() {
        let store = TaskStore::in_memory().unwrap();
        let service = service(store.clone(), MockClusterConnector::new(), silent());
        let err = service
            .create_kubernetes_cluster(CreateKubernetesRequest {
                provider: "rke".into(),
                name: "edge".into(),
                encoded_rke_config: "%%% not base64".into(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid(_)));
        assert!(store.list_rke_clusters().unwrap().is_empty());
    }

    // ==========================================================================
    // Story Tests: installing the platform
    // ==========================================================================

    /// Story: a second install request without the retry flag gets the first
    /// task back instead of a new one; with the flag it starts over.
    #[tokio::test]
    async fn story_second_init_needs_retry_flag() {
        let store = store_with_custom_cluster();
        let connector = connector_with(|| {
            let mut api = MockClusterApi::new();
            api.expect_get_deployment().returning(|_, _| Ok(None));
            api
        });
        let service = service(store, connector, accepting(Topic::PlatformInit));
        let req = InitPlatformReq {
            cluster_id: "c-1".into(),
            provider: "custom".into(),
            ..Default::default()
        };

        let first = service.init_platform(req.clone()).await.unwrap();
        assert_eq!(first.status, TaskStatus::Start);

        match service.init_platform(req.clone()).await {
            Err(Error::LastTaskNotComplete { task: Some(task), .. }) => {
                assert_eq!(task.task_id(), first.task_id)
            }
            other => panic!("expected last task not complete, got {:?}", other.map(|t| t.task_id)),
        }

        let retried = service
            .init_platform(InitPlatformReq { retry: true, ..req })
            .await
            .unwrap();
        assert_ne!(retried.task_id, first.task_id);
    }

    #[tokio::test]
    async fn test_init_refused_when_operator_present() {
        let connector = connector_with(|| {
            let mut api = MockClusterApi::new();
            api.expect_get_deployment()
                .returning(|_, _| Ok(Some(deployment(1))));
            api
        });
        let store = store_with_custom_cluster();
        let service = service(store.clone(), connector, silent());

        let err = service
            .init_platform(InitPlatformReq {
                cluster_id: "c-1".into(),
                provider: "custom".into(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PlatformInstalled(c) if c == "c-1"));
        assert!(store.init_task_for_cluster("c-1", "custom").unwrap().is_none());
    }

    /// Story: an install step failed on a transient error, but the cluster
    /// has since reached that step; reading the history heals the event.
    /// A healed step that does not decide the status leaves the task closed.
    #[tokio::test]
    async fn story_failed_step_is_healed_once_reached() {
        let store = store_with_custom_cluster();
        store
            .create_init_task(&InitPlatformTask {
                task_id: "t-1".into(),
                cluster_id: "c-1".into(),
                provider: "custom".into(),
                status: TaskStatus::Start,
                created_at: Utc::now(),
            })
            .unwrap();
        store
            .create_task_event("t-1", &StepMessage::new(StepType::InitWutongRegionOperator, StepStatus::Success, ""))
            .unwrap();
        store
            .create_task_event(
                "t-1",
                &StepMessage::new(StepType::InitWutongRegionImageHub, StepStatus::Failure, "push timeout"),
            )
            .unwrap();

        let connector = connector_with(|| status_api(1, &[CONDITION_IMAGE_REPOSITORY], None));
        let service = service(store.clone(), connector, silent());

        let events = service.list_task_events("t-1").await.unwrap();
        assert_eq!(events[1].status, StepStatus::Success);
        let stored = store.list_task_events("t-1").unwrap();
        assert_eq!(stored[1].status, StepStatus::Success);
        assert_eq!(
            store.get_init_task("t-1").unwrap().unwrap().status,
            TaskStatus::Complete
        );
    }

    /// Story: the final install step timed out but the platform is now
    /// running; reading the history heals the step and the task reports
    /// `inited` from then on.
    #[tokio::test]
    async fn story_healed_final_step_reports_inited() {
        let store = store_with_custom_cluster();
        store
            .create_init_task(&InitPlatformTask {
                task_id: "t-1".into(),
                cluster_id: "c-1".into(),
                provider: "custom".into(),
                status: TaskStatus::Start,
                created_at: Utc::now(),
            })
            .unwrap();
        store
            .create_task_event("t-1", &StepMessage::new(StepType::InitWutongRegionOperator, StepStatus::Success, ""))
            .unwrap();
        store
            .create_task_event(
                "t-1",
                &StepMessage::new(StepType::InitWutongRegion, StepStatus::Failure, "wait timeout"),
            )
            .unwrap();
        assert_eq!(
            store.get_init_task("t-1").unwrap().unwrap().status,
            TaskStatus::Complete
        );

        let connector = connector_with(|| {
            status_api(1, &[CONDITION_IMAGE_REPOSITORY, CONDITION_RUNNING], None)
        });
        let service = service(store.clone(), connector, silent());

        let events = service.list_task_events("t-1").await.unwrap();
        assert_eq!(events[1].status, StepStatus::Success);
        assert_eq!(
            store.get_init_task("t-1").unwrap().unwrap().status,
            TaskStatus::Inited
        );
        assert_eq!(
            service.get_task("t-1").unwrap().unwrap().status(),
            TaskStatus::Inited
        );
    }

    #[tokio::test]
    async fn test_init_task_reports_installing() {
        let store = store_with_custom_cluster();
        store
            .create_init_task(&InitPlatformTask {
                task_id: "t-1".into(),
                cluster_id: "c-1".into(),
                provider: "custom".into(),
                status: TaskStatus::Start,
                created_at: Utc::now(),
            })
            .unwrap();
        let connector = connector_with(|| status_api(0, &[], None));
        let service = service(store, connector, silent());

        let task = service.get_init_task("c-1", "custom").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Installing);
    }

    #[tokio::test]
    async fn test_unknown_task_has_no_events() {
        let service = service(TaskStore::in_memory().unwrap(), MockClusterConnector::new(), silent());
        assert!(service.list_task_events("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_uninstall_disabled_touches_nothing() {
        let service = service(store_with_custom_cluster(), MockClusterConnector::new(), silent())
            .with_uninstall_disabled(true);
        assert!(service.uninstall_platform("c-1", "custom").await.unwrap().is_none());
    }

    // ==========================================================================
    // Story Tests: changing nodes
    // ==========================================================================

    /// Story: node updates on one cluster are strictly sequenced; a request
    /// while the previous one runs is rejected, the next gets version + 1.
    #[tokio::test]
    async fn story_update_versions_increase() {
        let store = store_with_rke_cluster();
        let service = service(store.clone(), MockClusterConnector::new(), accepting(Topic::ClusterUpdate));
        let req = UpdateKubernetesRequest {
            cluster_id: "r-1".into(),
            provider: "rke".into(),
            encoded_rke_config: STANDARD.encode(RKE_YAML),
        };

        let first = service.update_kubernetes_cluster(req.clone()).await.unwrap();
        assert_eq!(first.version, 1);
        assert_eq!(first.node_number, 1);
        assert_eq!(
            store.get_update_task(&first.task_id).unwrap().unwrap().status,
            TaskStatus::Start
        );

        let err = service.update_kubernetes_cluster(req.clone()).await.unwrap_err();
        assert!(matches!(err, Error::LastTaskNotComplete { .. }));

        store
            .set_task_status(TaskKind::UpdateKubernetes, &first.task_id, TaskStatus::Complete)
            .unwrap();
        let second = service.update_kubernetes_cluster(req).await.unwrap();
        assert_eq!(second.version, 2);
    }

    #[tokio::test]
    async fn test_only_rke_clusters_can_be_updated() {
        let service = service(TaskStore::in_memory().unwrap(), MockClusterConnector::new(), silent());
        let err = service
            .update_kubernetes_cluster(UpdateKubernetesRequest {
                cluster_id: "c-1".into(),
                provider: "custom".into(),
                encoded_rke_config: STANDARD.encode(RKE_YAML),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_install_cluster_reuses_stored_config() {
        let store = store_with_rke_cluster();
        let service = service(store, MockClusterConnector::new(), accepting(Topic::ClusterCreate));
        let task = service.install_cluster("r-1").await.unwrap();
        assert_eq!(task.provider, "rke");
        assert_eq!(task.name, "edge");
        assert_eq!(task.status, TaskStatus::Start);
    }

    #[test]
    fn test_newer_update_replaces_last_create_task() {
        let store = store_with_rke_cluster();
        store
            .create_create_kubernetes_task(&CreateKubernetesTask {
                task_id: "create-1".into(),
                provider: "rke".into(),
                cluster_id: "r-1".into(),
                status: TaskStatus::Complete,
                created_at: Utc::now() - chrono::Duration::minutes(5),
                ..Default::default()
            })
            .unwrap();
        store
            .create_update_task(&UpdateKubernetesTask {
                task_id: "update-1".into(),
                cluster_id: "r-1".into(),
                version: 1,
                provider: "rke".into(),
                node_number: 3,
                status: TaskStatus::Start,
                created_at: Utc::now(),
            })
            .unwrap();
        let service = service(store, MockClusterConnector::new(), silent());

        let last = service.get_last_create_kubernetes_task("rke").unwrap().unwrap();
        assert_eq!(last.task_id, "update-1");
        assert_eq!(last.name, "edge");
        assert_eq!(last.status, TaskStatus::Start);
    }

    // ==========================================================================
    // Queries
    // ==========================================================================

    #[tokio::test]
    async fn test_region_config_exposes_fixed_keys() {
        let region_config = ConfigMap {
            data: Some(BTreeMap::from([(
                "apiAddress".to_string(),
                "https://47.1.2.3:8443".to_string(),
            )])),
            binary_data: Some(BTreeMap::from([(
                "ca.pem".to_string(),
                ByteString(b"CA".to_vec()),
            )])),
            ..Default::default()
        };
        let connector = connector_with(move || status_api(1, &[], Some(region_config.clone())));
        let service = service(store_with_custom_cluster(), connector, silent());

        let config = service.get_region_config("custom", "c-1").await.unwrap().unwrap();
        assert_eq!(config.len(), 7);
        assert_eq!(config["ca.pem"], "CA");
        assert_eq!(config["apiAddress"], "https://47.1.2.3:8443");
        assert_eq!(config["defaultTCPHost"], "");
    }

    fn pod(name: &str, label: Option<&str>, phase: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: label.map(|l| BTreeMap::from([("name".to_string(), l.to_string())])),
                ..Default::default()
            },
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_components_are_grouped_and_least_healthy_first() {
        let connector = connector_with(|| {
            let mut api = MockClusterApi::new();
            api.expect_list_components().returning(|_| {
                Ok(["wt-api", "wt-gateway"]
                    .iter()
                    .map(|n| WutongComponent::new(n, WutongComponentSpec::default()))
                    .collect())
            });
            api.expect_list_pods().returning(|_, selector| {
                if selector == OPERATOR_RELEASE_SELECTOR {
                    return Ok(vec![pod("operator-0", None, "Running")]);
                }
                Ok(vec![
                    pod("api-0", Some("wt-api"), "Running"),
                    pod("gw-0", Some("wt-gateway"), "Failed"),
                    pod("stray", None, "Running"),
                ])
            });
            api
        });
        let service = service(store_with_custom_cluster(), connector, silent());

        let components = service.list_components("custom", "c-1").await.unwrap();
        let apps: Vec<_> = components.iter().map(|c| c.app.as_str()).collect();
        assert_eq!(apps[0], "wt-gateway");
        assert_eq!(apps.len(), 3);
        assert!(apps.contains(&OPERATOR_NAME));
        assert!(components.iter().all(|c| c.pods.len() == 1));
    }

    #[test]
    fn test_invalid_override_document_is_rejected() {
        let store = TaskStore::in_memory().unwrap();
        let service = service(store.clone(), MockClusterConnector::new(), silent());

        let err = service.set_cluster_config("c-1", "spec: [unclosed").unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid(_)));
        assert!(store.get_cluster_config("c-1").unwrap().is_none());

        service
            .set_cluster_config("c-1", "spec:\n  enableHA: true\n")
            .unwrap();
        assert!(service.get_cluster_config("c-1").unwrap().is_some());
    }
}
