//! Error types for the cloud adaptor

use std::time::Duration;

use thiserror::Error;

use crate::provider::Cluster;
use crate::store::TaskRecord;

/// Main error type for cloud adaptor operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Validation error for requests and task payloads
    #[error("validation error: {0}")]
    Validation(String),

    /// Provider adaptor error
    #[error("provider error: {0}")]
    Provider(String),

    /// No adaptor is registered for the provider name
    #[error("provider {0} is not supported")]
    ProviderNotSupported(String),

    /// A managed provider was requested without stored credentials
    #[error("access key for provider {0} not found")]
    AccessKeyNotFound(String),

    /// The platform is already running on the target cluster
    #[error("platform already installed on cluster {0}")]
    PlatformInstalled(String),

    /// The cluster cannot be deleted while the platform is installed on it
    #[error("cluster {0} has the platform installed and cannot be deleted")]
    ClusterNotAllowDelete(String),

    /// A previous task for the same cluster has not finished
    #[error("last task for cluster {cluster_id} is not complete")]
    LastTaskNotComplete {
        /// Cluster the task belongs to
        cluster_id: String,
        /// The unfinished task, when the caller should be handed it back
        task: Option<Box<TaskRecord>>,
    },

    /// The cluster could not be probed; the partial view is kept for rendering
    #[error("cluster {} unreachable: {reason}", .cluster.cluster_id)]
    ClusterUnreachable {
        /// Best-effort cluster with its diagnostic message set
        cluster: Box<Cluster>,
        /// Underlying failure
        reason: String,
    },

    /// A resource that defines the installation does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// An operation did not finish within its deadline
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        /// Operation name
        operation: String,
        /// Deadline that elapsed
        timeout: Duration,
    },

    /// The operation observed cancellation
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Platform installation error
    #[error("install error: {0}")]
    Install(String),

    /// Stored cluster configuration could not be parsed
    #[error("invalid cluster config: {0}")]
    ConfigInvalid(String),

    /// Message transport error
    #[error("transport error: {0}")]
    Transport(String),

    /// Task status store error
    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a provider error with the given message
    pub fn provider(msg: impl Into<String>) -> Self {
        Self::Provider(msg.into())
    }

    /// Create a not-found error for the named resource
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Create an install error with the given message
    pub fn install(msg: impl Into<String>) -> Self {
        Self::Install(msg.into())
    }

    /// Create a transport error with the given message
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a timeout error for the named operation
    pub fn timeout(operation: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout,
        }
    }

    /// Returns true for a missing install-defining resource
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// The partial cluster carried by an unreachable-cluster error
    pub fn partial_cluster(&self) -> Option<&Cluster> {
        match self {
            Self::ClusterUnreachable { cluster, .. } => Some(cluster),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
