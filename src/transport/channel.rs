//! In-process transport: one bounded tokio channel per topic

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::{MessageHandler, Producer, Subscriber, Topic};
use crate::{Error, Result};

/// Default queue depth per topic
pub const DEFAULT_CAPACITY: usize = 100;

const PUBLISH_TIMEOUT: Duration = Duration::from_secs(3);

/// Bounded in-process queue per topic
///
/// Messages are lost when the process exits. Each topic has exactly one
/// consumer.
pub struct ChannelTransport {
    senders: HashMap<Topic, mpsc::Sender<Vec<u8>>>,
    receivers: Mutex<HashMap<Topic, mpsc::Receiver<Vec<u8>>>>,
}

impl ChannelTransport {
    /// Create queues of `capacity` for every topic
    pub fn new(capacity: usize) -> Self {
        let mut senders = HashMap::new();
        let mut receivers = HashMap::new();
        for topic in Topic::ALL {
            let (tx, rx) = mpsc::channel(capacity);
            senders.insert(topic, tx);
            receivers.insert(topic, rx);
        }
        Self {
            senders,
            receivers: Mutex::new(receivers),
        }
    }
}

impl Default for ChannelTransport {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[async_trait]
impl Producer for ChannelTransport {
    async fn publish(&self, topic: Topic, body: Vec<u8>) -> Result<()> {
        let tx = self
            .senders
            .get(&topic)
            .ok_or_else(|| Error::transport(format!("unknown topic {}", topic)))?;
        match tokio::time::timeout(PUBLISH_TIMEOUT, tx.send(body)).await {
            Ok(Ok(())) => {
                debug!(topic = %topic, "published message");
                Ok(())
            }
            Ok(Err(_)) => Err(Error::transport(format!("topic {} has no consumer", topic))),
            Err(_) => Err(Error::timeout(format!("publish to {}", topic), PUBLISH_TIMEOUT)),
        }
    }
}

impl Subscriber for ChannelTransport {
    fn subscribe(
        &self,
        topic: Topic,
        handler: Arc<dyn MessageHandler>,
        cancel: CancellationToken,
    ) -> Result<JoinHandle<()>> {
        let mut rx = self
            .receivers
            .lock()
            .remove(&topic)
            .ok_or_else(|| Error::transport(format!("topic {} already has a consumer", topic)))?;

        info!(topic = %topic, "starting channel consumer");
        Ok(tokio::spawn(async move {
            loop {
                let body = tokio::select! {
                    _ = cancel.cancelled() => break,
                    body = rx.recv() => match body {
                        Some(body) => body,
                        None => break,
                    },
                };
                if let Err(e) = handler.handle(&body).await {
                    error!(topic = %topic, error = %e, "message handler failed");
                }
            }
            info!(topic = %topic, "channel consumer stopped");
        }))
    }
}
