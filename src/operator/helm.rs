//! Operator chart installation through the helm CLI

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::client::ClusterApi;
use crate::exec::{CommandOutput, CommandRunner};
use crate::{Error, Result};

use super::{NAMESPACE, OPERATOR_CHART, OPERATOR_NAME};

const HELM_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const MAX_RECOVERIES: u32 = 3;

const RELEASE_IN_USE: &str = "cannot re-use a name that is still in use";
const STALE_BINDING: &str = "ClusterRoleBinding \"wutong-operator\" in namespace";

/// What a `helm install` run amounted to
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HelmOutcome {
    /// Release installed
    Installed,
    /// Release already present
    AlreadyInstalled,
    /// A binding left over from an earlier install blocks the release
    StaleRoleBinding,
    /// Anything else; carries the tail of the output
    Failed(String),
}

/// Classify the output of `helm install`
pub fn classify_helm_output(output: &CommandOutput) -> HelmOutcome {
    if output.success {
        return HelmOutcome::Installed;
    }
    let combined = output.combined();
    if combined.contains(RELEASE_IN_USE) {
        HelmOutcome::AlreadyInstalled
    } else if combined.contains(STALE_BINDING) {
        HelmOutcome::StaleRoleBinding
    } else {
        HelmOutcome::Failed(output.tail(10))
    }
}

/// `helm install` invocation for the operator chart
pub(crate) struct ChartInstall<'a> {
    pub helm_path: &'a str,
    pub kubeconfig_path: &'a str,
    pub image_repository: &'a str,
    pub image_tag: &'a str,
}

impl ChartInstall<'_> {
    fn args(&self) -> Vec<String> {
        vec![
            "install".to_string(),
            OPERATOR_NAME.to_string(),
            OPERATOR_CHART.to_string(),
            "-n".to_string(),
            NAMESPACE.to_string(),
            "--kubeconfig".to_string(),
            self.kubeconfig_path.to_string(),
            "--set".to_string(),
            format!("operator.image.name={}/{}", self.image_repository, OPERATOR_NAME),
            "--set".to_string(),
            format!("operator.image.tag={}", self.image_tag),
        ]
    }

    /// Install the chart, clearing a stale cluster role binding up to three
    /// times
    pub async fn run(
        &self,
        runner: &Arc<dyn CommandRunner>,
        api: &Arc<dyn ClusterApi>,
    ) -> Result<HelmOutcome> {
        let mut recoveries = 0;
        loop {
            let output = runner.run(self.helm_path, self.args(), HELM_TIMEOUT).await?;
            match classify_helm_output(&output) {
                HelmOutcome::StaleRoleBinding if recoveries < MAX_RECOVERIES => {
                    recoveries += 1;
                    warn!(attempt = recoveries, "stale operator cluster role binding, deleting it");
                    api.delete_cluster_role_binding(OPERATOR_NAME).await?;
                }
                HelmOutcome::StaleRoleBinding => {
                    return Err(Error::install(format!(
                        "install chart failure, cluster role binding {} keeps conflicting",
                        OPERATOR_NAME
                    )));
                }
                HelmOutcome::Failed(tail) => {
                    return Err(Error::install(format!("install chart failure {}", tail)));
                }
                outcome => {
                    info!(outcome = ?outcome, "operator chart applied");
                    return Ok(outcome);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockClusterApi;
    use crate::exec::MockCommandRunner;
    use rstest::rstest;

    fn failed(stderr: &str) -> CommandOutput {
        CommandOutput {
            success: false,
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }

    fn chart() -> ChartInstall<'static> {
        ChartInstall {
            helm_path: "/usr/local/bin/helm",
            kubeconfig_path: "/tmp/c-1.kubeconfig",
            image_repository: "registry.example.com/wutong",
            image_tag: "v1.9.0-arm64",
        }
    }

    #[rstest]
    #[case::success(CommandOutput { success: true, ..Default::default() }, HelmOutcome::Installed)]
    #[case::in_use(
        failed("Error: INSTALLATION FAILED: cannot re-use a name that is still in use"),
        HelmOutcome::AlreadyInstalled
    )]
    #[case::stale(
        failed("Error: ClusterRoleBinding \"wutong-operator\" in namespace \"\" exists and cannot be imported"),
        HelmOutcome::StaleRoleBinding
    )]
    #[case::other(failed("Error: chart not found"), HelmOutcome::Failed("Error: chart not found".into()))]
    fn test_classify(#[case] output: CommandOutput, #[case] expected: HelmOutcome) {
        assert_eq!(classify_helm_output(&output), expected);
    }

    #[test]
    fn test_args_point_at_operator_image() {
        let args = chart().args();
        assert_eq!(&args[..5], ["install", "wutong-operator", "wutong/wutong-operator", "-n", "wt-system"]);
        assert!(args.contains(&"operator.image.name=registry.example.com/wutong/wutong-operator".to_string()));
        assert!(args.contains(&"operator.image.tag=v1.9.0-arm64".to_string()));
        assert!(args.contains(&"/tmp/c-1.kubeconfig".to_string()));
    }

    // ==========================================================================
    // Story Tests: recovering from leftovers of an earlier install
    // ==========================================================================

    /// Story: a binding left behind by an earlier uninstall is removed and
    /// the install goes through on the next attempt.
    #[tokio::test]
    async fn story_stale_binding_is_cleared_once() {
        let mut seq = mockall::Sequence::new();
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(failed("ClusterRoleBinding \"wutong-operator\" in namespace")));
        runner
            .expect_run()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(CommandOutput { success: true, ..Default::default() }));
        let mut api = MockClusterApi::new();
        api.expect_delete_cluster_role_binding()
            .withf(|name| name == OPERATOR_NAME)
            .times(1)
            .returning(|_| Ok(()));

        let runner: Arc<dyn CommandRunner> = Arc::new(runner);
        let api: Arc<dyn ClusterApi> = Arc::new(api);
        assert_eq!(chart().run(&runner, &api).await.unwrap(), HelmOutcome::Installed);
    }

    /// Story: a binding that reappears every time gives up after three
    /// recoveries instead of looping forever.
    #[tokio::test]
    async fn story_recoveries_are_bounded() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .times(4)
            .returning(|_, _, _| Ok(failed("ClusterRoleBinding \"wutong-operator\" in namespace")));
        let mut api = MockClusterApi::new();
        api.expect_delete_cluster_role_binding().times(3).returning(|_| Ok(()));

        let runner: Arc<dyn CommandRunner> = Arc::new(runner);
        let api: Arc<dyn ClusterApi> = Arc::new(api);
        let err = chart().run(&runner, &api).await.unwrap_err();
        assert!(err.to_string().contains("install chart failure"));
    }

    #[tokio::test]
    async fn test_existing_release_is_not_an_error() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .returning(|_, _, _| Ok(failed("cannot re-use a name that is still in use")));
        let runner: Arc<dyn CommandRunner> = Arc::new(runner);
        let api: Arc<dyn ClusterApi> = Arc::new(MockClusterApi::new());
        assert_eq!(chart().run(&runner, &api).await.unwrap(), HelmOutcome::AlreadyInstalled);
    }
}
