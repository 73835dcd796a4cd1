//! Progress vocabulary shared by tasks, the event log and the transport

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;

use crate::transport::Topic;
use crate::Error;

/// Capacity of every task's progress channel
pub const PROGRESS_CHANNEL_CAPACITY: usize = 10;

/// The kinds of long-running task
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Provision a Kubernetes cluster
    CreateKubernetes,
    /// Install the platform onto a cluster
    #[serde(rename = "init_wutong_cluster")]
    InitPlatform,
    /// Add or change nodes of a provisioned cluster
    UpdateKubernetes,
}

impl TaskKind {
    /// Wire tag of the kind
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateKubernetes => "create_kubernetes",
            Self::InitPlatform => "init_wutong_cluster",
            Self::UpdateKubernetes => "update_kubernetes",
        }
    }

    /// Topic the kind's messages travel on
    pub fn topic(&self) -> Topic {
        match self {
            Self::CreateKubernetes => Topic::ClusterCreate,
            Self::InitPlatform => Topic::PlatformInit,
            Self::UpdateKubernetes => Topic::ClusterUpdate,
        }
    }

    /// Every kind
    pub const ALL: [TaskKind; 3] = [
        Self::CreateKubernetes,
        Self::InitPlatform,
        Self::UpdateKubernetes,
    ];
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create_kubernetes" => Ok(Self::CreateKubernetes),
            "init_wutong_cluster" => Ok(Self::InitPlatform),
            "update_kubernetes" => Ok(Self::UpdateKubernetes),
            other => Err(Error::validation(format!("unknown task kind {}", other))),
        }
    }
}

/// Named step of a task
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StepType {
    /// Task setup
    Init,
    /// Cluster reachability and shape checks
    CheckCluster,
    /// Operator chart installed and ready
    InitWutongRegionOperator,
    /// Image hub usable
    InitWutongRegionImageHub,
    /// Offline package loaded
    InitWutongRegionPackage,
    /// Region configuration available
    InitWutongRegionRegionConfig,
    /// Platform running
    InitWutongRegion,
    /// Cluster record created
    CreateCluster,
    /// Kubernetes installed by the bootstrap tool
    InstallKubernetes,
    /// Kubernetes nodes changed by the bootstrap tool
    UpdateKubernetes,
    /// Task could not be constructed
    CreateTask,
    /// Terminal marker; always the last message of a task
    Close,
}

impl StepType {
    /// Name persisted in the event log
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "Init",
            Self::CheckCluster => "CheckCluster",
            Self::InitWutongRegionOperator => "InitWutongRegionOperator",
            Self::InitWutongRegionImageHub => "InitWutongRegionImageHub",
            Self::InitWutongRegionPackage => "InitWutongRegionPackage",
            Self::InitWutongRegionRegionConfig => "InitWutongRegionRegionConfig",
            Self::InitWutongRegion => "InitWutongRegion",
            Self::CreateCluster => "CreateCluster",
            Self::InstallKubernetes => "InstallKubernetes",
            Self::UpdateKubernetes => "UpdateKubernetes",
            Self::CreateTask => "CreateTask",
            Self::Close => "Close",
        }
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_string()))
            .map_err(|_| Error::serialization(format!("unknown step type {}", s)))
    }
}

/// Outcome of a step
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    /// Step started
    #[default]
    Start,
    /// Step finished successfully
    Success,
    /// Step failed
    Failure,
}

impl StepStatus {
    /// Name persisted in the event log
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(Self::Start),
            "success" => Ok(Self::Success),
            "failure" => Ok(Self::Failure),
            other => Err(Error::serialization(format!("unknown step status {}", other))),
        }
    }
}

/// One progress report from a running task
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepMessage {
    /// Step being reported
    pub step_type: StepType,
    /// Free-form detail
    #[serde(default)]
    pub message: String,
    /// Outcome
    pub status: StepStatus,
}

impl StepMessage {
    /// Build a step message
    pub fn new(step_type: StepType, status: StepStatus, message: impl Into<String>) -> Self {
        Self {
            step_type,
            message: message.into(),
            status,
        }
    }

    /// Terminal close marker
    pub fn close() -> Self {
        Self::new(StepType::Close, StepStatus::Success, "")
    }

    /// Whether this is the close marker
    pub fn is_close(&self) -> bool {
        self.step_type == StepType::Close
    }
}

/// Sending half of a task's progress channel
///
/// Sends never fail the task: a closed receiver only means nobody listens
/// any more.
#[derive(Clone, Debug)]
pub struct Progress {
    task_id: String,
    tx: mpsc::Sender<StepMessage>,
}

impl Progress {
    /// Create a bounded progress channel for the task
    pub fn channel(task_id: impl Into<String>) -> (Self, mpsc::Receiver<StepMessage>) {
        let (tx, rx) = mpsc::channel(PROGRESS_CHANNEL_CAPACITY);
        (
            Self {
                task_id: task_id.into(),
                tx,
            },
            rx,
        )
    }

    /// Report a step
    pub async fn report(&self, step_type: StepType, status: StepStatus, message: impl Into<String>) {
        self.send(StepMessage::new(step_type, status, message)).await;
    }

    /// Report a step start
    pub async fn start(&self, step_type: StepType, message: impl Into<String>) {
        self.report(step_type, StepStatus::Start, message).await;
    }

    /// Report a step success
    pub async fn success(&self, step_type: StepType, message: impl Into<String>) {
        self.report(step_type, StepStatus::Success, message).await;
    }

    /// Report a step failure
    pub async fn failure(&self, step_type: StepType, message: impl Into<String>) {
        self.report(step_type, StepStatus::Failure, message).await;
    }

    /// Send the close marker
    pub async fn close(&self) {
        self.send(StepMessage::close()).await;
    }

    async fn send(&self, message: StepMessage) {
        if self.tx.send(message).await.is_err() {
            warn!(task_id = %self.task_id, "progress receiver dropped");
        }
    }
}
