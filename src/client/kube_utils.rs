//! Kubeconfig handling and polling helpers built on kube-rs

use std::future::Future;
use std::time::Duration;

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::{Error, Result};

/// Default connection timeout for cluster clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for cluster clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

fn parse_kubeconfig(kubeconfig: &str) -> Result<Kubeconfig> {
    if kubeconfig.trim().is_empty() {
        return Err(Error::provider("kubeconfig is empty"));
    }
    Kubeconfig::from_yaml(kubeconfig)
        .map_err(|e| Error::provider(format!("failed to parse kubeconfig: {}", e)))
}

/// Create a kube client from kubeconfig text with explicit timeouts
pub async fn create_client_from_kubeconfig(
    kubeconfig: &str,
    connect_timeout: Duration,
    read_timeout: Duration,
) -> Result<Client> {
    let kubeconfig = parse_kubeconfig(kubeconfig)?;
    let mut config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| Error::provider(format!("failed to load kubeconfig: {}", e)))?;
    config.connect_timeout = Some(connect_timeout);
    config.read_timeout = Some(read_timeout);
    Client::try_from(config)
        .map_err(|e| Error::provider(format!("failed to create client: {}", e)))
}

/// API server URL of the current context (or the first cluster when no
/// context is selected)
pub fn api_server_endpoint(kubeconfig: &str) -> Result<String> {
    let kubeconfig = parse_kubeconfig(kubeconfig)?;

    let cluster_name = kubeconfig.current_context.as_ref().and_then(|current| {
        kubeconfig
            .contexts
            .iter()
            .find(|c| &c.name == current)
            .and_then(|c| c.context.as_ref())
            .map(|c| c.cluster.clone())
    });

    let named = match cluster_name {
        Some(name) => kubeconfig.clusters.iter().find(|c| c.name == name),
        None => kubeconfig.clusters.first(),
    };

    named
        .and_then(|c| c.cluster.as_ref())
        .and_then(|c| c.server.clone())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::provider("kubeconfig has no cluster server"))
}

/// Poll `check_fn` until it returns true, the deadline elapses, or `cancel`
/// fires.
///
/// Check errors are treated as "not yet" and polling continues.
pub async fn poll_until<F, Fut>(
    cancel: &CancellationToken,
    timeout: Duration,
    poll_interval: Duration,
    timeout_msg: impl Into<String>,
    mut check_fn: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let deadline = Instant::now() + timeout;
    let timeout_msg = timeout_msg.into();

    loop {
        match check_fn().await {
            Ok(true) => return Ok(()),
            Ok(false) => trace!("Polling condition not yet met, retrying..."),
            Err(e) => trace!(error = %e, "Polling check returned error (retrying)"),
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled(timeout_msg)),
            _ = tokio::time::sleep_until(deadline) => {
                return Err(Error::timeout(timeout_msg, timeout));
            }
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    const KUBECONFIG: &str = r#"
apiVersion: v1
kind: Config
clusters:
- name: other
  cluster:
    server: https://10.0.0.9:6443
- name: main
  cluster:
    server: https://10.0.0.1:6443
contexts:
- name: main-ctx
  context:
    cluster: main
    user: admin
current-context: main-ctx
users:
- name: admin
  user:
    token: abc
"#;

    #[test]
    fn test_endpoint_follows_current_context() {
        assert_eq!(
            api_server_endpoint(KUBECONFIG).unwrap(),
            "https://10.0.0.1:6443"
        );
    }

    #[test]
    fn test_endpoint_rejects_empty_kubeconfig() {
        assert!(api_server_endpoint("").is_err());
        assert!(api_server_endpoint("   \n").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_until_succeeds_after_some_ticks() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let cancel = CancellationToken::new();

        let result = poll_until(
            &cancel,
            Duration::from_secs(60),
            Duration::from_secs(5),
            "wait",
            || {
                let c = c.clone();
                async move { Ok(c.fetch_add(1, Ordering::SeqCst) >= 2) }
            },
        )
        .await;

        assert!(result.is_ok());
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_until_times_out() {
        let cancel = CancellationToken::new();
        let result = poll_until(
            &cancel,
            Duration::from_secs(10 * 60),
            Duration::from_secs(5),
            "waiting namespace deleted timeout",
            || async { Ok(false) },
        )
        .await;

        match result {
            Err(Error::Timeout { operation, .. }) => {
                assert_eq!(operation, "waiting namespace deleted timeout")
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_until_observes_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = poll_until(
            &cancel,
            Duration::from_secs(60),
            Duration::from_secs(5),
            "wait",
            || async { Ok(false) },
        )
        .await;
        assert!(matches!(result, Err(Error::Cancelled(_))));
    }
}
