//! Long-running cluster tasks
//!
//! A task is built from a transport payload by [`create_task`], runs once on
//! its own tokio task and reports every step through a [`Progress`] channel.
//! The [`TaskHandler`] for each topic owns deduplication, spawning and
//! relaying progress into the event log.
//!
//! Tasks never return errors. Every outcome, good or bad, is a step message,
//! and the last message of every task is `Close`.

mod create;
mod handler;
mod init;
mod progress;
mod update;

pub use create::CreateKubernetes;
pub use handler::{EventRecorder, TaskHandler, TaskState};
pub use init::InitPlatform;
pub use progress::{
    Progress, StepMessage, StepStatus, StepType, TaskKind, PROGRESS_CHANNEL_CAPACITY,
};
pub use update::UpdateKubernetes;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::exec::CommandRunner;
use crate::operator::InstallSettings;
use crate::provider::ProviderRegistry;
use crate::store::TaskStore;
use crate::transport::{
    InitPlatformConfigMessage, KubernetesConfigMessage, UpdateKubernetesConfigMessage,
};
use crate::{Error, Result};

/// A runnable task
#[async_trait]
pub trait Task: Send + Sync {
    /// Task id
    fn task_id(&self) -> &str;

    /// Run to completion, reporting through the task's progress channel
    async fn run(&self, cancel: CancellationToken);
}

/// Typed payload of a task
#[derive(Clone, Debug)]
pub enum TaskConfig {
    /// `cluster.create` body
    CreateKubernetes(KubernetesConfigMessage),
    /// `platform.init` body
    InitPlatform(InitPlatformConfigMessage),
    /// `cluster.update` body
    UpdateKubernetes(UpdateKubernetesConfigMessage),
}

impl TaskConfig {
    /// Task id carried by the payload
    pub fn task_id(&self) -> &str {
        match self {
            Self::CreateKubernetes(m) => &m.task_id,
            Self::InitPlatform(m) => &m.task_id,
            Self::UpdateKubernetes(m) => &m.task_id,
        }
    }

    /// Kind of task the payload belongs to
    pub fn kind(&self) -> TaskKind {
        match self {
            Self::CreateKubernetes(_) => TaskKind::CreateKubernetes,
            Self::InitPlatform(_) => TaskKind::InitPlatform,
            Self::UpdateKubernetes(_) => TaskKind::UpdateKubernetes,
        }
    }
}

/// Collaborators every task needs
#[derive(Clone)]
pub struct TaskContext {
    /// Adaptor factory
    pub registry: Arc<ProviderRegistry>,
    /// Status store
    pub store: TaskStore,
    /// Runs helm
    pub runner: Arc<dyn CommandRunner>,
    /// Platform install settings
    pub settings: InstallSettings,
    /// Scratch directory for kubeconfig files
    pub work_dir: PathBuf,
}

/// A constructed task and the receiving end of its progress channel
pub struct TaskRun {
    /// The task
    pub task: Box<dyn Task>,
    /// Progress messages, ending with `Close`
    pub events: mpsc::Receiver<StepMessage>,
}

/// Build the task for `kind` from its payload
///
/// A payload of another kind, or one without its configuration section, is
/// [`Error::Validation`].
pub fn create_task(kind: TaskKind, config: TaskConfig, ctx: &TaskContext) -> Result<TaskRun> {
    if config.kind() != kind {
        return Err(Error::validation(format!(
            "{} task cannot run a {} payload",
            kind,
            config.kind()
        )));
    }
    let (progress, events) = Progress::channel(config.task_id());
    let task: Box<dyn Task> = match config {
        TaskConfig::CreateKubernetes(message) => {
            let config = message
                .kubernetes_config
                .ok_or_else(|| Error::validation("kubernetes config is required"))?;
            Box::new(CreateKubernetes::new(message.task_id, config, ctx.clone(), progress))
        }
        TaskConfig::InitPlatform(message) => {
            let config = message
                .init_config
                .ok_or_else(|| Error::validation("init wutong config is required"))?;
            Box::new(InitPlatform::new(message.task_id, config, ctx.clone(), progress))
        }
        TaskConfig::UpdateKubernetes(message) => {
            let config = message
                .config
                .ok_or_else(|| Error::validation("expansion node config is required"))?;
            Box::new(UpdateKubernetes::new(message.task_id, config, ctx.clone(), progress))
        }
    };
    Ok(TaskRun { task, events })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::client::MockClusterConnector;
    use crate::exec::MockCommandRunner;
    use crate::provider::RkeSettings;

    /// Context over an in-memory store with the given connector
    pub(crate) fn context(store: TaskStore, connector: MockClusterConnector) -> TaskContext {
        context_with_runner(store, connector, MockCommandRunner::new())
    }

    pub(crate) fn context_with_runner(
        store: TaskStore,
        connector: MockClusterConnector,
        runner: MockCommandRunner,
    ) -> TaskContext {
        let runner: Arc<dyn CommandRunner> = Arc::new(runner);
        TaskContext {
            registry: Arc::new(ProviderRegistry::new(
                store.clone(),
                Arc::new(connector),
                runner.clone(),
                RkeSettings::default(),
            )),
            store,
            runner,
            settings: InstallSettings::default(),
            work_dir: std::env::temp_dir(),
        }
    }

    /// Drain a progress channel up to and including `Close`
    pub(crate) async fn drain(mut events: mpsc::Receiver<StepMessage>) -> Vec<StepMessage> {
        let mut out = Vec::new();
        while let Some(message) = events.recv().await {
            let close = message.is_close();
            out.push(message);
            if close {
                break;
            }
        }
        out
    }

    #[test]
    fn test_mismatched_payload_is_rejected() {
        let ctx = context(TaskStore::in_memory().unwrap(), MockClusterConnector::new());
        let result = create_task(
            TaskKind::CreateKubernetes,
            TaskConfig::InitPlatform(InitPlatformConfigMessage::default()),
            &ctx,
        );
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[test]
    fn test_missing_config_section_is_rejected() {
        let ctx = context(TaskStore::in_memory().unwrap(), MockClusterConnector::new());
        let result = create_task(
            TaskKind::UpdateKubernetes,
            TaskConfig::UpdateKubernetes(UpdateKubernetesConfigMessage {
                task_id: "t-1".into(),
                ..Default::default()
            }),
            &ctx,
        );
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[test]
    fn test_task_keeps_payload_id() {
        let ctx = context(TaskStore::in_memory().unwrap(), MockClusterConnector::new());
        let run = create_task(
            TaskKind::CreateKubernetes,
            TaskConfig::CreateKubernetes(KubernetesConfigMessage {
                task_id: "t-7".into(),
                kubernetes_config: Some(Default::default()),
                ..Default::default()
            }),
            &ctx,
        )
        .unwrap();
        assert_eq!(run.task.task_id(), "t-7");
    }
}
