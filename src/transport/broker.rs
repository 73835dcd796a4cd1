//! Durable transport on Redis lists
//!
//! Each topic maps to the list `queue:<topic>`. Producers `LPUSH`, the
//! consumer `BRPOP`s with a short block so cancellation is observed. A body
//! whose handler fails is pushed back for redelivery.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::{AsyncCommands, Client};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{MessageHandler, Producer, Subscriber, Topic};
use crate::{Error, Result};

const BROKER_TIMEOUT: Duration = Duration::from_secs(5);
const READY_INTERVAL: Duration = Duration::from_secs(3);
const RECONNECT_DELAY: Duration = Duration::from_secs(2);
// Seconds BRPOP blocks before the loop re-checks cancellation
const POP_BLOCK_SECS: usize = 1;

fn queue_key(topic: Topic) -> String {
    format!("queue:{}", topic)
}

fn broker_err(e: redis::RedisError) -> Error {
    Error::transport(e.to_string())
}

/// Topic queues stored as Redis lists
#[derive(Clone)]
pub struct RedisTransport {
    client: Client,
}

impl RedisTransport {
    /// Open a client for `url`; no connection is made yet
    pub fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url).map_err(broker_err)?;
        Ok(Self { client })
    }

    /// Block until the broker answers `PING`, or `cancel` fires
    pub async fn wait_ready(&self, cancel: &CancellationToken) -> Result<()> {
        loop {
            match self.ping().await {
                Ok(()) => {
                    info!("message broker is ready");
                    return Ok(());
                }
                Err(e) => warn!(error = %e, "message broker not ready, retrying"),
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(Error::Cancelled("waiting for message broker".to_string()));
                }
                _ = tokio::time::sleep(READY_INTERVAL) => {}
            }
        }
    }

    async fn ping(&self) -> Result<()> {
        let fut = async {
            let mut conn = self.client.get_async_connection().await.map_err(broker_err)?;
            redis::cmd("PING")
                .query_async::<_, String>(&mut conn)
                .await
                .map_err(broker_err)?;
            Ok(())
        };
        tokio::time::timeout(BROKER_TIMEOUT, fut)
            .await
            .map_err(|_| Error::timeout("ping message broker", BROKER_TIMEOUT))?
    }
}

#[async_trait]
impl Producer for RedisTransport {
    async fn publish(&self, topic: Topic, body: Vec<u8>) -> Result<()> {
        let key = queue_key(topic);
        let fut = async {
            let mut conn = self.client.get_async_connection().await.map_err(broker_err)?;
            let _: () = conn.lpush(&key, body).await.map_err(broker_err)?;
            Ok::<_, Error>(())
        };
        tokio::time::timeout(BROKER_TIMEOUT, fut)
            .await
            .map_err(|_| Error::timeout(format!("publish to {}", topic), BROKER_TIMEOUT))??;
        debug!(topic = %topic, "published message");
        Ok(())
    }
}

impl Subscriber for RedisTransport {
    fn subscribe(
        &self,
        topic: Topic,
        handler: Arc<dyn MessageHandler>,
        cancel: CancellationToken,
    ) -> Result<JoinHandle<()>> {
        let client = self.client.clone();
        let key = queue_key(topic);
        info!(topic = %topic, queue = %key, "starting broker consumer");

        Ok(tokio::spawn(async move {
            'connect: while !cancel.is_cancelled() {
                let mut conn = match client.get_async_connection().await {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(topic = %topic, error = %e, "broker connection failed");
                        tokio::select! {
                            _ = cancel.cancelled() => break 'connect,
                            _ = tokio::time::sleep(RECONNECT_DELAY) => continue 'connect,
                        }
                    }
                };

                loop {
                    if cancel.is_cancelled() {
                        break 'connect;
                    }
                    let popped = redis::cmd("BRPOP")
                        .arg(&key)
                        .arg(POP_BLOCK_SECS)
                        .query_async::<_, Option<(String, Vec<u8>)>>(&mut conn)
                        .await;
                    let body = match popped {
                        Ok(Some((_, body))) => body,
                        Ok(None) => continue,
                        Err(e) => {
                            warn!(topic = %topic, error = %e, "broker pop failed, reconnecting");
                            continue 'connect;
                        }
                    };

                    if let Err(e) = handler.handle(&body).await {
                        error!(topic = %topic, error = %e, "message handler failed, requeueing");
                        let requeued: redis::RedisResult<()> = conn.lpush(&key, body).await;
                        if let Err(e) = requeued {
                            error!(topic = %topic, error = %e, "failed to requeue message");
                        }
                    }
                }
            }
            info!(topic = %topic, "broker consumer stopped");
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_keys_are_per_topic() {
        assert_eq!(queue_key(Topic::ClusterCreate), "queue:cluster.create");
        assert_eq!(queue_key(Topic::PlatformInit), "queue:platform.init");
        assert_eq!(queue_key(Topic::ClusterUpdate), "queue:cluster.update");
    }

    #[test]
    fn test_invalid_url_is_a_transport_error() {
        let result = RedisTransport::connect("not a url");
        assert!(matches!(result, Err(Error::Transport(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_ready_observes_cancellation() {
        let transport = RedisTransport::connect("redis://127.0.0.1:1/").unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = transport.wait_ready(&cancel).await;
        assert!(matches!(result, Err(Error::Cancelled(_))));
    }
}
