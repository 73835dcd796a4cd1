//! Platform installation task
//!
//! Checks the target cluster, installs the operator and the platform
//! resources, then follows the operator's status until the platform runs.
//! Each readiness phase is reported once, in order: operator, image hub,
//! package, region config.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{Progress, StepType, Task, TaskContext};
use crate::client::ClusterApi;
use crate::operator::{PlatformRegion, RegionStatus};
use crate::provider::{
    select_gateway_and_chaos_nodes, version_supported, Adaptor, Cluster, ClusterAdaptor,
    ClusterState, Credentials, MAX_SUPPORTED_MINOR, MIN_SUPPORTED_MINOR,
};
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::transport::InitPlatformRequest;
use crate::Error;

const NODE_LIST_TIMEOUT: Duration = Duration::from_secs(10);
const READY_POLL_INTERVAL: Duration = Duration::from_secs(5);
const READY_TIMEOUT: Duration = Duration::from_secs(60 * 60);

fn retry_once() -> RetryConfig {
    RetryConfig::fixed(2, Duration::ZERO)
}

/// Everything the install needs from the cluster check
struct CheckedCluster {
    cluster: Cluster,
    kubeconfig: String,
    api: Arc<dyn ClusterApi>,
    nodes: Vec<Node>,
}

#[derive(Default)]
struct ReadyPhases {
    operator: bool,
    image_hub: bool,
    package: bool,
}

/// Installs the platform onto one cluster
pub struct InitPlatform {
    task_id: String,
    config: InitPlatformRequest,
    ctx: TaskContext,
    progress: Progress,
}

impl InitPlatform {
    pub(crate) fn new(
        task_id: String,
        config: InitPlatformRequest,
        ctx: TaskContext,
        progress: Progress,
    ) -> Self {
        Self {
            task_id,
            config,
            ctx,
            progress,
        }
    }

    async fn install(&self, cancel: CancellationToken) {
        self.progress.start(StepType::Init, "").await;
        let credentials = (!self.config.access_key.is_empty()).then(|| Credentials {
            access_key: self.config.access_key.clone(),
            secret_key: self.config.secret_key.clone(),
        });
        let adaptor = match self.ctx.registry.adaptor(&self.config.provider, credentials) {
            Ok(adaptor) => adaptor,
            Err(e) => {
                self.progress
                    .failure(StepType::Init, format!("create cloud adaptor failure {}", e))
                    .await;
                return;
            }
        };
        self.progress.success(StepType::Init, "cloud adaptor create success").await;

        self.progress.start(StepType::CheckCluster, "").await;
        let checked = match self.check_cluster(&adaptor).await {
            Ok(checked) => checked,
            Err(message) => {
                self.progress.failure(StepType::CheckCluster, message).await;
                return;
            }
        };
        self.progress
            .success(StepType::CheckCluster, self.config.cluster_id.clone())
            .await;

        let (gateway_nodes, chaos_nodes) = select_gateway_and_chaos_nodes(&checked.nodes);
        let mut init_config = adaptor
            .get_init_config(&checked.cluster, &gateway_nodes, &chaos_nodes, &self.progress)
            .await;
        init_config.enterprise_id = self.config.enterprise_id.clone();
        init_config.wutong_version = self.ctx.settings.wutong_version.clone();
        init_config.wutong_ci_version = self.ctx.settings.ci_version.clone();

        self.progress.start(StepType::InitWutongRegionOperator, "").await;
        if init_config.eips.is_empty() {
            self.progress
                .failure(StepType::InitWutongRegionOperator, "can not select eip")
                .await;
            return;
        }

        let region = PlatformRegion::new(
            checked.api,
            self.ctx.runner.clone(),
            self.ctx.store.clone(),
            self.ctx.settings.clone(),
            checked.kubeconfig,
        )
        .with_work_dir(self.ctx.work_dir.clone());
        if let Err(e) = region.init_region(&cancel, &init_config).await {
            self.progress
                .failure(StepType::InitWutongRegionOperator, e.to_string())
                .await;
            return;
        }

        if self.wait_ready(&region, &cancel, &checked.cluster.name).await {
            self.progress
                .success(StepType::InitWutongRegion, checked.cluster.cluster_id.clone())
                .await;
        }
    }

    /// Describe, authenticate and list nodes; the error is the step message
    async fn check_cluster(&self, adaptor: &Adaptor) -> std::result::Result<CheckedCluster, String> {
        let cluster_id = self.config.cluster_id.as_str();
        let cluster = retry_with_backoff(&retry_once(), "describe cluster", || {
            adaptor.describe_cluster(cluster_id)
        })
        .await
        .map_err(|e| e.to_string())?;

        if cluster.state != ClusterState::Running {
            return Err(format!(
                "cluster status is {},not support init wutong",
                cluster.state
            ));
        }
        if !version_supported(&cluster.kubernetes_version) {
            return Err(format!(
                "current cluster version is {}, init wutong support kubernetes version is 1.{}.x-1.{}.x",
                cluster.kubernetes_version, MIN_SUPPORTED_MINOR, MAX_SUPPORTED_MINOR
            ));
        }
        info!(task_id = %self.task_id, endpoint = %cluster.api_server_endpoint, "init kubernetes url");
        if cluster.api_server_endpoint.is_empty() {
            return Err("cluster api not open eip,not support init wutong".to_string());
        }

        let kubeconfig = retry_with_backoff(&retry_once(), "get kube config", || {
            adaptor.get_kube_config(cluster_id)
        })
        .await
        .map_err(|e| format!("get kube config failure {}", e))?;

        let api = self
            .ctx
            .registry
            .connector()
            .connect(&kubeconfig)
            .await
            .map_err(|e| format!("get kube config failure {}", e))?;

        let client = &api;
        let nodes = retry_with_backoff(&retry_once(), "list nodes", || async move {
            match tokio::time::timeout(NODE_LIST_TIMEOUT, client.list_nodes()).await {
                Ok(result) => result,
                Err(_) => Err(Error::timeout("list nodes", NODE_LIST_TIMEOUT)),
            }
        })
        .await
        .map_err(|e| {
            warn!(task_id = %self.task_id, error = %e, "get kubernetes cluster node failure");
            "cluster node list can not found, please check cluster public access and account authorization"
                .to_string()
        })?;
        if nodes.is_empty() {
            return Err("node num is 0, can not init wutong".to_string());
        }

        Ok(CheckedCluster {
            cluster,
            kubeconfig,
            api,
            nodes,
        })
    }

    /// Follow the platform status until it runs; false when a failure was
    /// reported
    async fn wait_ready(
        &self,
        region: &PlatformRegion,
        cancel: &CancellationToken,
        cluster_name: &str,
    ) -> bool {
        let deadline = Instant::now() + READY_TIMEOUT;
        let mut phases = ReadyPhases::default();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.progress.failure(StepType::InitWutongRegion, "context cancel").await;
                    return false;
                }
                _ = tokio::time::sleep_until(deadline) => {
                    self.progress
                        .failure(StepType::InitWutongRegion, "waiting wutong region ready timeout")
                        .await;
                    return false;
                }
                _ = tokio::time::sleep(READY_POLL_INTERVAL) => {}
            }

            let status = match region.status().await {
                Ok(status) => status,
                Err(e) if e.is_not_found() => {
                    self.progress.failure(StepType::InitWutongRegion, e.to_string()).await;
                    return false;
                }
                Err(e) => {
                    warn!(task_id = %self.task_id, error = %e, "get wutong region status failure");
                    continue;
                }
            };

            if self.advance(&mut phases, &status, cluster_name).await {
                return true;
            }
        }
    }

    /// Report newly reached phases; true once the platform runs
    async fn advance(&self, phases: &mut ReadyPhases, status: &RegionStatus, cluster_name: &str) -> bool {
        if status.operator_ready && !phases.operator {
            self.progress.success(StepType::InitWutongRegionOperator, "").await;
            self.progress.start(StepType::InitWutongRegionImageHub, "").await;
            phases.operator = true;
            return false;
        }

        if !phases.operator {
            return false;
        }

        let cluster = status.cluster.as_ref();
        if !phases.image_hub && cluster.is_some_and(|c| c.image_hub_ready()) {
            self.progress.success(StepType::InitWutongRegionImageHub, "").await;
            self.progress.start(StepType::InitWutongRegionPackage, "").await;
            phases.image_hub = true;
            return false;
        }

        let (pushed, total) = status
            .package
            .as_ref()
            .and_then(|p| p.status.as_ref())
            .map_or((0, 0), |s| (s.images_pushed, s.images_number));
        info!(
            task_id = %self.task_id,
            cluster = %cluster_name,
            "Push Images:{}/{}\t{}",
            pushed,
            total,
            cluster.map(|c| c.condition_summary()).unwrap_or_default()
        );

        if phases.image_hub && !phases.package && status.package.as_ref().is_some_and(|p| p.ready()) {
            self.progress.success(StepType::InitWutongRegionPackage, "").await;
            self.progress.start(StepType::InitWutongRegionRegionConfig, "").await;
            phases.package = true;
        }

        phases.package && cluster.is_some_and(|c| c.running())
    }
}

#[async_trait]
impl Task for InitPlatform {
    fn task_id(&self) -> &str {
        &self.task_id
    }

    async fn run(&self, cancel: CancellationToken) {
        self.install(cancel).await;
        self.progress.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{MockClusterApi, MockClusterConnector, ServerVersion};
    use crate::crd::{
        Condition, ConditionStatus, PackageCondition, WutongCluster, WutongClusterSpec,
        WutongClusterStatus, WutongPackage, WutongPackageStatus, CONDITION_IMAGE_REPOSITORY,
        CONDITION_RUNNING, PACKAGE_CONDITION_READY, PACKAGE_STATUS_COMPLETED,
    };
    use crate::exec::{CommandOutput, MockCommandRunner};
    use crate::provider::tests::{node, KUBECONFIG};
    use crate::store::{CustomClusterRecord, TaskStore};
    use crate::task::tests::{context_with_runner, drain};
    use crate::task::{create_task, StepMessage, StepStatus, TaskConfig, TaskKind, TaskRun};
    use crate::transport::InitPlatformConfigMessage;
    use chrono::Utc;
    use k8s_openapi::api::apps::v1::{Deployment, DeploymentStatus};
    use k8s_openapi::api::rbac::v1::ClusterRoleBinding;

    fn ready_cluster() -> WutongCluster {
        let mut cluster = WutongCluster::new("wutongcluster", WutongClusterSpec::default());
        cluster.status = Some(WutongClusterStatus {
            conditions: vec![
                Condition::new(CONDITION_IMAGE_REPOSITORY, ConditionStatus::True),
                Condition::new(CONDITION_RUNNING, ConditionStatus::True),
            ],
        });
        cluster
    }

    fn ready_package() -> WutongPackage {
        let mut package = WutongPackage::new("wutongpackage", Default::default());
        package.status = Some(WutongPackageStatus {
            images_number: 3,
            images_pushed: 3,
            conditions: vec![PackageCondition {
                type_: PACKAGE_CONDITION_READY.into(),
                status: PACKAGE_STATUS_COMPLETED.into(),
                message: String::new(),
            }],
        });
        package
    }

    /// A cluster that accepts the install; `operator_ready` controls status
    fn platform_api(operator_ready: bool) -> MockClusterApi {
        let mut api = MockClusterApi::new();
        api.expect_server_version().returning(|| {
            Ok(ServerVersion {
                major: "1".into(),
                minor: "20".into(),
                git_version: "v1.20.4".into(),
            })
        });
        api.expect_list_nodes()
            .returning(|| Ok(vec![node("n1", "10.0.0.11", &[]), node("n2", "10.0.0.12", &[])]));
        api.expect_get_config_map().returning(|_, _| Ok(None));
        api.expect_create_config_map().returning(|_, _| Ok(true));
        api.expect_ensure_namespace().returning(|_| Ok(()));
        api.expect_get_cluster_role_binding()
            .returning(|_| Ok(Some(ClusterRoleBinding::default())));
        api.expect_create_cluster_resource().returning(|_, _| Ok(true));
        api.expect_create_volume().returning(|_, _| Ok(true));
        api.expect_create_package().returning(|_, _| Ok(true));
        api.expect_create_component().returning(|_, _| Ok(true));
        api.expect_get_deployment().returning(move |_, _| {
            Ok(Some(Deployment {
                status: Some(DeploymentStatus {
                    ready_replicas: Some(if operator_ready { 1 } else { 0 }),
                    ..Default::default()
                }),
                ..Default::default()
            }))
        });
        api.expect_get_cluster_resource()
            .returning(|_, _| Ok(Some(ready_cluster())));
        api.expect_get_package().returning(|_, _| Ok(Some(ready_package())));
        api.expect_get_volume().returning(|_, _| Ok(None));
        api
    }

    fn init_run(connector: MockClusterConnector) -> TaskRun {
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
        let mut runner = MockCommandRunner::new();
        runner.expect_run().returning(|_, _, _| {
            Ok(CommandOutput {
                success: true,
                ..Default::default()
            })
        });
        let ctx = context_with_runner(store, connector, runner);
        create_task(
            TaskKind::InitPlatform,
            TaskConfig::InitPlatform(InitPlatformConfigMessage {
                task_id: "t-1".into(),
                init_config: Some(InitPlatformRequest {
                    cluster_id: "c-1".into(),
                    provider: "custom".into(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            &ctx,
        )
        .unwrap()
    }

    fn connector(operator_ready: bool) -> MockClusterConnector {
        let mut connector = MockClusterConnector::new();
        connector
            .expect_connect()
            .returning(move |_| Ok(Arc::new(platform_api(operator_ready)) as Arc<dyn ClusterApi>));
        connector
    }

    async fn run_to_close(run: TaskRun, cancel: CancellationToken) -> Vec<StepMessage> {
        let TaskRun { task, events } = run;
        let collector = tokio::spawn(drain(events));
        task.run(cancel).await;
        collector.await.unwrap()
    }

    fn steps(messages: &[StepMessage]) -> Vec<(StepType, StepStatus)> {
        messages.iter().map(|m| (m.step_type, m.status)).collect()
    }

    // ==========================================================================
    // Story Tests: platform installation
    // ==========================================================================

    /// Story: a healthy custom cluster goes through every phase exactly once
    /// and finishes with the cluster id.
    #[tokio::test(start_paused = true)]
    async fn story_install_reports_each_phase_once() {
        let messages = run_to_close(init_run(connector(true)), CancellationToken::new()).await;

        use StepStatus::*;
        use StepType::*;
        assert_eq!(
            steps(&messages),
            vec![
                (Init, Start),
                (Init, Success),
                (CheckCluster, Start),
                (CheckCluster, Success),
                (InitWutongRegionOperator, Start),
                (InitWutongRegionOperator, Success),
                (InitWutongRegionImageHub, Start),
                (InitWutongRegionImageHub, Success),
                (InitWutongRegionPackage, Start),
                (InitWutongRegionPackage, Success),
                (InitWutongRegionRegionConfig, Start),
                (InitWutongRegion, Success),
                (Close, Success),
            ]
        );
        assert_eq!(messages[3].message, "c-1");
        assert_eq!(messages[11].message, "c-1");
    }

    /// Story: an unreachable cluster fails the check after one retry and the
    /// task still closes.
    #[tokio::test]
    async fn story_unreachable_cluster_fails_check() {
        let mut connector = MockClusterConnector::new();
        connector
            .expect_connect()
            .times(2)
            .returning(|_| Err(crate::Error::validation("invalid kubeconfig")));
        let messages = run_to_close(init_run(connector), CancellationToken::new()).await;

        let failure = &messages[3];
        assert_eq!((failure.step_type, failure.status), (StepType::CheckCluster, StepStatus::Failure));
        assert!(failure.message.contains("unreachable"));
        assert!(messages[4].is_close());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_while_waiting() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let messages = run_to_close(init_run(connector(true)), cancel).await;

        let last = &messages[messages.len() - 2];
        assert_eq!((last.step_type, last.status), (StepType::InitWutongRegion, StepStatus::Failure));
        assert_eq!(last.message, "context cancel");
    }

    #[tokio::test(start_paused = true)]
    async fn test_operator_never_ready_times_out() {
        let messages = run_to_close(init_run(connector(false)), CancellationToken::new()).await;

        let last = &messages[messages.len() - 2];
        assert_eq!((last.step_type, last.status), (StepType::InitWutongRegion, StepStatus::Failure));
        assert_eq!(last.message, "waiting wutong region ready timeout");
        assert!(!messages
            .iter()
            .any(|m| m.step_type == StepType::InitWutongRegionImageHub && m.status == StepStatus::Start));
    }
}
