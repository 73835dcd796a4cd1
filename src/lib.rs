//! Cloud adaptor - Kubernetes cluster provisioning and Wutong platform installation
//!
//! The adaptor brings up Kubernetes clusters on several providers, installs
//! the Wutong platform onto them through its in-cluster operator, and tracks
//! every long-running operation as a task with a persisted event log.
//!
//! # Architecture
//!
//! - Requests enter through the [`service`] facade, which checks
//!   preconditions, records a task and publishes it on a [`transport`] topic
//! - One [`task::TaskHandler`] per topic consumes messages, runs each task
//!   once and relays its progress into the [`store`]
//! - Tasks reach clusters through a [`provider`] adaptor and install the
//!   platform with the [`operator`] reconciler
//!
//! # Modules
//!
//! - [`provider`] - Cluster adaptors (custom kubeconfig, rke) and the provider registry
//! - [`task`] - Task construction, progress reporting and the per-topic handler
//! - [`operator`] - Operator chart install, `WutongCluster` reconciliation, status and teardown
//! - [`crd`] - Custom resources of the platform operator
//! - [`store`] - SQLite persistence for tasks, events, clusters and credentials
//! - [`transport`] - Topic-addressed message transport (in-process or Redis)
//! - [`service`] - Orchestration facade
//! - [`client`] - Kubernetes seam used by providers and the reconciler
//! - [`exec`] - External command seam (helm, rke)
//! - [`retry`] - Retry helpers
//! - [`config`] - Process configuration
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod client;
pub mod config;
pub mod crd;
pub mod error;
pub mod exec;
pub mod operator;
pub mod provider;
pub mod retry;
pub mod service;
pub mod store;
pub mod task;
pub mod transport;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
