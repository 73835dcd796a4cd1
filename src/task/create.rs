//! Cluster provisioning task

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{Progress, StepType, Task, TaskContext};
use crate::provider::{ClusterAdaptor, Credentials, KubernetesClusterConfig};

/// Provisions a Kubernetes cluster through the provider's adaptor
pub struct CreateKubernetes {
    task_id: String,
    config: KubernetesClusterConfig,
    ctx: TaskContext,
    progress: Progress,
}

impl CreateKubernetes {
    pub(crate) fn new(
        task_id: String,
        config: KubernetesClusterConfig,
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

    async fn provision(&self, cancel: CancellationToken) {
        self.progress.start(StepType::Init, "").await;
        let credentials = Credentials {
            access_key: self.config.access_key.clone(),
            secret_key: self.config.secret_key.clone(),
        };
        let adaptor = match self.ctx.registry.adaptor(&self.config.provider, Some(credentials)) {
            Ok(adaptor) => adaptor,
            Err(e) => {
                self.progress
                    .failure(StepType::Init, format!("create cloud adaptor failure {}", e))
                    .await;
                return;
            }
        };
        self.progress.success(StepType::Init, "cloud adaptor create success").await;

        if let Some(cluster) = adaptor
            .create_kubernetes(cancel, &self.config, &self.progress)
            .await
        {
            info!(task_id = %self.task_id, cluster = %cluster.cluster_id, "kubernetes cluster created");
        }
    }
}

#[async_trait]
impl Task for CreateKubernetes {
    fn task_id(&self) -> &str {
        &self.task_id
    }

    async fn run(&self, cancel: CancellationToken) {
        self.provision(cancel).await;
        self.progress.close().await;
    }
}
