//! Node update task

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{Progress, StepType, Task, TaskContext};
use crate::provider::{ClusterAdaptor, ExpansionNode};

/// Applies a new node set to a provisioned cluster
pub struct UpdateKubernetes {
    task_id: String,
    config: ExpansionNode,
    ctx: TaskContext,
    progress: Progress,
}

impl UpdateKubernetes {
    pub(crate) fn new(
        task_id: String,
        config: ExpansionNode,
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
}

#[async_trait]
impl Task for UpdateKubernetes {
    fn task_id(&self) -> &str {
        &self.task_id
    }

    async fn run(&self, cancel: CancellationToken) {
        self.progress.start(StepType::Init, "").await;
        match self.ctx.registry.adaptor(&self.config.provider, None) {
            Ok(adaptor) => {
                self.progress.success(StepType::Init, "cloud adaptor create success").await;
                if adaptor
                    .expansion_node(cancel, &self.config, &self.progress)
                    .await
                    .is_some()
                {
                    info!(task_id = %self.task_id, cluster = %self.config.cluster_id, "cluster nodes updated");
                }
            }
            Err(e) => {
                self.progress
                    .failure(StepType::Init, format!("create cloud adaptor failure {}", e))
                    .await;
            }
        }
        self.progress.close().await;
    }
}
