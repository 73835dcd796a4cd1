//! Process configuration
//!
//! Every setting is a command line flag with an environment fallback, so the
//! same binary runs from a shell or from a container manifest.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, ValueEnum};

use crate::operator::InstallSettings;
use crate::provider::RkeSettings;

/// Which transport carries task messages
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum TransportKind {
    /// In-process queues; tasks are lost on exit
    #[default]
    Channel,
    /// Redis lists
    Redis,
}

/// Log output format
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human readable lines
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

/// Settings shared by every subcommand
#[derive(Args, Clone, Debug)]
pub struct Config {
    /// SQLite database holding tasks, events and cluster records
    #[arg(long, env = "DB_PATH", default_value = "/var/lib/cloud-adaptor/adaptor.db")]
    pub db_path: PathBuf,

    /// Task transport
    #[arg(long, env = "TRANSPORT", value_enum, default_value_t = TransportKind::Channel)]
    pub transport: TransportKind,

    /// Redis URL when the transport is `redis`
    #[arg(long, env = "REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    pub redis_url: String,

    /// Repository platform images are pulled from
    #[arg(
        long,
        env = "INSTALL_IMAGE_REPO",
        default_value = "registry.cn-hangzhou.aliyuncs.com/wutong"
    )]
    pub image_repository: String,

    /// Platform version installed onto clusters
    #[arg(long, env = "WUTONG_VERSION", default_value = "v1.9.0")]
    pub wutong_version: String,

    /// Build tooling version; the platform version when unset
    #[arg(long, env = "CI_VERSION")]
    pub ci_version: Option<String>,

    /// Operator chart image tag
    #[arg(long, env = "OPERATOR_VERSION", default_value = "v1.9.0")]
    pub operator_version: String,

    /// helm binary
    #[arg(long, env = "HELM_PATH", default_value = "/usr/local/bin/helm")]
    pub helm_path: String,

    /// rke binary
    #[arg(long, env = "RKE_PATH", default_value = "/usr/local/bin/rke")]
    pub rke_path: String,

    /// Deadline for one `rke up`, in seconds
    #[arg(long, env = "RKE_TIMEOUT_SECS", default_value = "3600")]
    pub rke_timeout_secs: u64,

    /// Skip platform teardown when asked to uninstall
    #[arg(long, env = "DISABLE_UNINSTALL_REGION")]
    pub disable_uninstall_region: bool,

    /// Scratch directory for kubeconfig files and rke work directories
    #[arg(long, env = "WORK_DIR", default_value = "/tmp/cloud-adaptor")]
    pub work_dir: PathBuf,

    /// Log format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

impl Config {
    /// Settings for platform installs
    pub fn install_settings(&self) -> InstallSettings {
        let wutong_version = self.wutong_version.clone();
        InstallSettings {
            image_repository: self.image_repository.trim_end_matches('/').to_string(),
            ci_version: self.ci_version.clone().unwrap_or_else(|| wutong_version.clone()),
            wutong_version,
            operator_version: self.operator_version.clone(),
            helm_path: self.helm_path.clone(),
        }
    }

    /// Settings for the rke adaptor
    pub fn rke_settings(&self) -> RkeSettings {
        RkeSettings {
            binary: self.rke_path.clone(),
            work_dir: self.work_dir.join("rke"),
            timeout: Duration::from_secs(self.rke_timeout_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use rstest::rstest;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        config: Config,
    }

    fn parse(args: &[&str]) -> Config {
        let argv = std::iter::once("cloud-adaptor").chain(args.iter().copied());
        TestCli::try_parse_from(argv).unwrap().config
    }

    #[rstest]
    #[case("registry.example.com/wutong/", "registry.example.com/wutong")]
    #[case("registry.example.com/wutong//", "registry.example.com/wutong")]
    #[case("registry.example.com/wutong", "registry.example.com/wutong")]
    fn test_image_repository_loses_trailing_slash(#[case] given: &str, #[case] expected: &str) {
        let config = parse(&["--image-repository", given]);
        assert_eq!(config.install_settings().image_repository, expected);
    }

    #[test]
    fn test_ci_version_follows_platform_version() {
        let config = parse(&["--wutong-version", "v2.0.0"]);
        let settings = config.install_settings();
        assert_eq!(settings.wutong_version, "v2.0.0");
        assert_eq!(settings.ci_version, "v2.0.0");

        let config = parse(&["--wutong-version", "v2.0.0", "--ci-version", "v1.1.0"]);
        assert_eq!(config.install_settings().ci_version, "v1.1.0");
    }

    #[test]
    fn test_transport_and_rke_settings() {
        let config = parse(&[
            "--transport",
            "redis",
            "--work-dir",
            "/data",
            "--rke-timeout-secs",
            "60",
        ]);
        assert_eq!(config.transport, TransportKind::Redis);
        let rke = config.rke_settings();
        assert_eq!(rke.work_dir, PathBuf::from("/data/rke"));
        assert_eq!(rke.timeout, Duration::from_secs(60));
    }
}
