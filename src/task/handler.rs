//! Per-topic consumer that turns messages into running tasks

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[cfg(test)]
use mockall::automock;

use super::{create_task, StepMessage, StepStatus, StepType, TaskConfig, TaskContext, TaskKind, TaskRun};
use crate::store::TaskStore;
use crate::transport::MessageHandler;
use crate::Result;

/// Sink for the progress messages of running tasks
#[cfg_attr(test, automock)]
pub trait EventRecorder: Send + Sync {
    /// Persist one message of `task_id`
    fn record(&self, task_id: &str, message: &StepMessage) -> Result<()>;
}

impl EventRecorder for TaskStore {
    fn record(&self, task_id: &str, message: &StepMessage) -> Result<()> {
        self.create_task_event(task_id, message).map(|_| ())
    }
}

/// Lifecycle of a task id this process has seen
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    /// Spawned and not yet closed
    Running,
    /// Closed, failed to build, or panicked
    Complete,
}

/// Runs the tasks delivered on one topic
///
/// Each task id runs at most once: the in-memory map answers repeat
/// deliveries to this process, the store claim answers them across
/// restarts.
pub struct TaskHandler {
    kind: TaskKind,
    ctx: TaskContext,
    recorder: Arc<dyn EventRecorder>,
    seen: Arc<DashMap<String, TaskState>>,
    cancel: CancellationToken,
}

impl TaskHandler {
    /// Handler for `kind`, recording progress into the context's store
    pub fn new(kind: TaskKind, ctx: TaskContext, cancel: CancellationToken) -> Self {
        let recorder: Arc<dyn EventRecorder> = Arc::new(ctx.store.clone());
        Self {
            kind,
            ctx,
            recorder,
            seen: Arc::new(DashMap::new()),
            cancel,
        }
    }

    /// Replace the progress sink
    pub fn with_recorder(mut self, recorder: Arc<dyn EventRecorder>) -> Self {
        self.recorder = recorder;
        self
    }

    /// What this process knows about `task_id`
    pub fn state(&self, task_id: &str) -> Option<TaskState> {
        self.seen.get(task_id).map(|entry| *entry)
    }

    fn parse(&self, body: &[u8]) -> Result<TaskConfig> {
        Ok(match self.kind {
            TaskKind::CreateKubernetes => TaskConfig::CreateKubernetes(serde_json::from_slice(body)?),
            TaskKind::InitPlatform => TaskConfig::InitPlatform(serde_json::from_slice(body)?),
            TaskKind::UpdateKubernetes => TaskConfig::UpdateKubernetes(serde_json::from_slice(body)?),
        })
    }

    fn record(&self, task_id: &str, message: &StepMessage) {
        if let Err(e) = self.recorder.record(task_id, message) {
            warn!(task_id = %task_id, error = %e, "failed to record task event");
        }
    }

    fn spawn(&self, task_id: String, run: TaskRun) -> JoinHandle<()> {
        let TaskRun { task, mut events } = run;
        let recorder = self.recorder.clone();
        let seen = self.seen.clone();
        let cancel = self.cancel.child_token();

        tokio::spawn(async move {
            let relay_id = task_id.clone();
            let relay = tokio::spawn(async move {
                while let Some(message) = events.recv().await {
                    let close = message.is_close();
                    if let Err(e) = recorder.record(&relay_id, &message) {
                        warn!(task_id = %relay_id, error = %e, "failed to record task event");
                    }
                    if close {
                        break;
                    }
                }
            });

            let worker = tokio::spawn(async move { task.run(cancel).await });
            if let Err(e) = worker.await {
                if e.is_panic() {
                    error!(task_id = %task_id, "task panicked");
                } else {
                    warn!(task_id = %task_id, error = %e, "task aborted");
                }
            }
            if let Err(e) = relay.await {
                warn!(task_id = %task_id, error = %e, "progress relay aborted");
            }

            seen.insert(task_id.clone(), TaskState::Complete);
            info!(task_id = %task_id, "task finished");
        })
    }
}

#[async_trait]
impl MessageHandler for TaskHandler {
    async fn handle(&self, body: &[u8]) -> Result<()> {
        if body.is_empty() {
            warn!(kind = %self.kind, "dropping empty task message");
            return Ok(());
        }
        let config = match self.parse(body) {
            Ok(config) => config,
            Err(e) => {
                warn!(kind = %self.kind, error = %e, "dropping malformed task message");
                return Ok(());
            }
        };
        let task_id = config.task_id().to_string();
        if task_id.is_empty() {
            warn!(kind = %self.kind, "dropping task message without task id");
            return Ok(());
        }

        match self.seen.entry(task_id.clone()) {
            Entry::Occupied(_) => {
                debug!(task_id = %task_id, "task already seen by this process");
                return Ok(());
            }
            Entry::Vacant(slot) => {
                slot.insert(TaskState::Running);
            }
        }
        let claimed = match self.ctx.store.claim_task(&task_id, self.kind) {
            Ok(claimed) => claimed,
            Err(e) => {
                self.seen.remove(&task_id);
                return Err(e);
            }
        };
        if !claimed {
            info!(task_id = %task_id, "task already claimed");
            self.seen.insert(task_id, TaskState::Complete);
            return Ok(());
        }

        let run = match create_task(self.kind, config, &self.ctx) {
            Ok(run) => run,
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "failed to create task");
                let message = StepMessage::new(StepType::CreateTask, StepStatus::Failure, e.to_string());
                self.record(&task_id, &message);
                self.seen.insert(task_id, TaskState::Complete);
                return Ok(());
            }
        };

        info!(task_id = %task_id, kind = %self.kind, "starting task");
        self.spawn(task_id, run);
        Ok(())
    }
}
