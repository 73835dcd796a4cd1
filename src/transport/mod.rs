//! Topic-addressed message transport
//!
//! Two interchangeable implementations: [`ChannelTransport`], a bounded
//! in-process queue per topic, and [`RedisTransport`], durable Redis lists.
//! Publishers go through [`Producer`]; consumers register a
//! [`MessageHandler`] per topic through [`Subscriber`].
//!
//! A handler that returns `Ok` acknowledges the message. Malformed bodies
//! must be acknowledged by the handler since they can never succeed.

mod broker;
mod channel;
mod messages;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[cfg(test)]
use mockall::automock;

pub use broker::RedisTransport;
pub use channel::ChannelTransport;
pub use messages::{
    EventMessage, InitPlatformConfigMessage, InitPlatformRequest, KubernetesConfigMessage,
    UpdateKubernetesConfigMessage,
};

use crate::Result;

/// Task topics
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Cluster provisioning requests
    ClusterCreate,
    /// Platform installation requests
    PlatformInit,
    /// Node update requests
    ClusterUpdate,
}

impl Topic {
    /// Every topic
    pub const ALL: [Topic; 3] = [Topic::ClusterCreate, Topic::PlatformInit, Topic::ClusterUpdate];

    /// Topic name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClusterCreate => "cluster.create",
            Self::PlatformInit => "platform.init",
            Self::ClusterUpdate => "cluster.update",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Publishes raw message bodies to a topic
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Producer: Send + Sync {
    /// Publish one body
    async fn publish(&self, topic: Topic, body: Vec<u8>) -> Result<()>;
}

/// Consumes message bodies from one topic
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle one body; `Ok` acknowledges it
    async fn handle(&self, body: &[u8]) -> Result<()>;
}

/// Starts a consumer loop per topic
pub trait Subscriber: Send + Sync {
    /// Feed every message on `topic` to `handler` until `cancel` fires
    fn subscribe(
        &self,
        topic: Topic,
        handler: Arc<dyn MessageHandler>,
        cancel: CancellationToken,
    ) -> Result<JoinHandle<()>>;
}

/// Typed publisher for the three task topics
#[derive(Clone)]
pub struct TaskProducer {
    inner: Arc<dyn Producer>,
}

impl TaskProducer {
    /// Wrap a raw producer
    pub fn new(inner: Arc<dyn Producer>) -> Self {
        Self { inner }
    }

    async fn send<T: serde::Serialize>(&self, topic: Topic, message: &T) -> Result<()> {
        let body = serde_json::to_vec(message)?;
        self.inner.publish(topic, body).await
    }

    /// Publish a cluster provisioning task
    pub async fn send_create_kubernetes_task(&self, message: &KubernetesConfigMessage) -> Result<()> {
        self.send(Topic::ClusterCreate, message).await
    }

    /// Publish a platform installation task
    pub async fn send_init_platform_task(&self, message: &InitPlatformConfigMessage) -> Result<()> {
        self.send(Topic::PlatformInit, message).await
    }

    /// Publish a node update task
    pub async fn send_update_kubernetes_task(
        &self,
        message: &UpdateKubernetesConfigMessage,
    ) -> Result<()> {
        self.send(Topic::ClusterUpdate, message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_task_producer_routes_by_topic() {
        let mut producer = MockProducer::new();
        producer
            .expect_publish()
            .withf(|topic, body| {
                *topic == Topic::PlatformInit
                    && serde_json::from_slice::<serde_json::Value>(body).unwrap()["task_id"]
                        == "t-1"
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let tasks = TaskProducer::new(Arc::new(producer));
        tasks
            .send_init_platform_task(&InitPlatformConfigMessage {
                task_id: "t-1".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
    }

    #[test]
    fn test_topic_names() {
        let names: Vec<_> = Topic::ALL.iter().map(Topic::as_str).collect();
        assert_eq!(names, vec!["cluster.create", "platform.init", "cluster.update"]);
    }
}
