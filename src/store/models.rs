//! Records persisted by the task status store

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::task::{StepStatus, StepType, TaskKind};

/// Persisted task status
///
/// Stored verbatim as `""`, `start`, `inited` or `complete`. `Installing`
/// is never stored; the facade reports it on read.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Created, not yet published
    #[default]
    #[serde(rename = "")]
    Pending,
    /// Published to the transport
    Start,
    /// Platform reported running
    Inited,
    /// Operator installed but platform not yet running
    Installing,
    /// Finished, successfully or not
    Complete,
}

impl TaskStatus {
    /// Persisted form
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "",
            Self::Start => "start",
            Self::Inited => "inited",
            Self::Installing => "installing",
            Self::Complete => "complete",
        }
    }

    /// Parse the persisted form; unknown values read as pending
    pub fn from_db(s: &str) -> Self {
        match s {
            "start" => Self::Start,
            "inited" => Self::Inited,
            "installing" => Self::Installing,
            "complete" => Self::Complete,
            _ => Self::Pending,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cluster provisioning task
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateKubernetesTask {
    /// Task id
    #[serde(rename = "taskID")]
    pub task_id: String,
    /// Cluster name
    pub name: String,
    /// Worker instance type
    #[serde(rename = "resourceType")]
    pub worker_resource_type: String,
    /// Worker count
    pub worker_num: i32,
    /// Provider name
    #[serde(rename = "providerName")]
    pub provider: String,
    /// Provider region
    pub region: String,
    /// Status
    pub status: TaskStatus,
    /// Target cluster
    #[serde(rename = "clusterID")]
    pub cluster_id: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// Platform installation task
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitPlatformTask {
    /// Task id
    #[serde(rename = "taskID")]
    pub task_id: String,
    /// Target cluster
    #[serde(rename = "clusterID")]
    pub cluster_id: String,
    /// Provider name
    #[serde(rename = "providerName")]
    pub provider: String,
    /// Status
    pub status: TaskStatus,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// Node update task
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateKubernetesTask {
    /// Task id
    #[serde(rename = "taskID")]
    pub task_id: String,
    /// Target cluster
    #[serde(rename = "clusterID")]
    pub cluster_id: String,
    /// Per-cluster sequence; unique with the cluster id
    pub version: i64,
    /// Provider name
    #[serde(rename = "providerName")]
    pub provider: String,
    /// Node count after the update
    pub node_number: i32,
    /// Status
    pub status: TaskStatus,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// Any task record
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum TaskRecord {
    /// Cluster provisioning
    CreateKubernetes(CreateKubernetesTask),
    /// Platform installation
    InitPlatform(InitPlatformTask),
    /// Node update
    UpdateKubernetes(UpdateKubernetesTask),
}

impl TaskRecord {
    /// Kind of the task
    pub fn kind(&self) -> TaskKind {
        match self {
            Self::CreateKubernetes(_) => TaskKind::CreateKubernetes,
            Self::InitPlatform(_) => TaskKind::InitPlatform,
            Self::UpdateKubernetes(_) => TaskKind::UpdateKubernetes,
        }
    }

    /// Task id
    pub fn task_id(&self) -> &str {
        match self {
            Self::CreateKubernetes(t) => &t.task_id,
            Self::InitPlatform(t) => &t.task_id,
            Self::UpdateKubernetes(t) => &t.task_id,
        }
    }

    /// Cluster id
    pub fn cluster_id(&self) -> &str {
        match self {
            Self::CreateKubernetes(t) => &t.cluster_id,
            Self::InitPlatform(t) => &t.cluster_id,
            Self::UpdateKubernetes(t) => &t.cluster_id,
        }
    }

    /// Provider name
    pub fn provider(&self) -> &str {
        match self {
            Self::CreateKubernetes(t) => &t.provider,
            Self::InitPlatform(t) => &t.provider,
            Self::UpdateKubernetes(t) => &t.provider,
        }
    }

    /// Status
    pub fn status(&self) -> TaskStatus {
        match self {
            Self::CreateKubernetes(t) => t.status,
            Self::InitPlatform(t) => t.status,
            Self::UpdateKubernetes(t) => t.status,
        }
    }
}

/// Immutable entry of the task event log
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEvent {
    /// Event id, UUID v4
    #[serde(rename = "eventID")]
    pub event_id: String,
    /// Task id
    #[serde(rename = "taskID")]
    pub task_id: String,
    /// Step
    #[serde(rename = "type")]
    pub step_type: StepType,
    /// Outcome
    pub status: StepStatus,
    /// Detail
    pub message: String,
    /// Classified reason, empty when none applies
    pub reason: String,
    /// Time of insertion
    pub created_at: DateTime<Utc>,
}

/// Customer-supplied cluster
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomClusterRecord {
    /// Cluster id
    pub cluster_id: String,
    /// Display name
    pub name: String,
    /// Public addresses
    pub eip: Vec<String>,
    /// Kubeconfig text
    pub kubeconfig: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// Cluster built with the bootstrap tool
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RkeClusterRecord {
    /// Cluster id
    pub cluster_id: String,
    /// Display name
    pub name: String,
    /// Provisioning state, e.g. `initial`, `installing`, `running`, `failed`
    pub state: String,
    /// Kubeconfig produced by the bootstrap tool
    pub kubeconfig: String,
    /// Bootstrap configuration YAML
    pub create_config: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// Credentials of a cloud provider
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessKey {
    /// Provider name
    pub provider: String,
    /// Access key
    pub access_key: String,
    /// Secret key
    pub secret_key: String,
}
