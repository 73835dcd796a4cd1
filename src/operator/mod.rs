//! Platform installer and reconciler
//!
//! [`PlatformRegion`] drives one workload cluster: it installs the operator
//! chart, builds the `WutongCluster` spec, hands it to
//! [`Operator::install`] which applies the custom resources, and later
//! reports status or tears everything down in order.
//!
//! Every create is create-if-not-exists and every delete treats absence as
//! success, so each step can be re-run safely.

mod claims;
mod helm;
mod install;
mod region;

pub use claims::{generate_claims, ResourceClaim};
pub use helm::{classify_helm_output, HelmOutcome};
pub use install::Operator;
pub use region::{PlatformRegion, RegionStatus};
pub(crate) use region::{bounded, overlay_spec};

use std::time::Duration;

/// Namespace the platform runs in
pub const NAMESPACE: &str = "wt-system";
/// Name of the operator release, deployment and cluster role binding
pub const OPERATOR_NAME: &str = "wutong-operator";
/// Chart reference of the operator
pub const OPERATOR_CHART: &str = "wutong/wutong-operator";
/// Config map the platform writes once the region is configured
pub const REGION_CONFIG_MAP: &str = "region-config";
/// Config map holding the identity used for the domain suffix
pub const SUFFIX_CONFIG_MAP: &str = "wt-suffix-host";
/// Name of the `WutongCluster` object
pub const CLUSTER_NAME: &str = "wutongcluster";
/// Name of the `WutongPackage` object
pub const PACKAGE_NAME: &str = "wutongpackage";
/// Shared (read-write-many) volume
pub const VOLUME_RWX: &str = "wutongvolumerwx";
/// Exclusive (read-write-once) volume
pub const VOLUME_RWO: &str = "wutongvolumerwo";
/// Package archive path inside the operator
pub const PACKAGE_PATH: &str = "/opt/wutong/pkg/tgz/wutong.tgz";
/// HTTP domain suffix used when none can be derived
pub const DEFAULT_DOMAIN_SUFFIX: &str = "wtapps.cn";
/// Image hub domain of the built-in registry
pub const DEFAULT_IMAGE_HUB_DOMAIN: &str = "wutong.me";
/// Label on persistent volumes created by the operator
pub const OPERATOR_PV_SELECTOR: &str = "belongTo=wutong-operator";
/// Storage classes created outside the label scheme
pub const LEGACY_STORAGE_CLASSES: [&str; 2] = ["wutongslsc", "wutongsssc"];

/// Interval of the readiness and teardown polls
pub const POLL_INTERVAL: Duration = Duration::from_secs(5);
/// Deadline for the operator to come up, and for the namespace to go away
pub const POLL_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Installation settings shared by every cluster
#[derive(Clone, Debug)]
pub struct InstallSettings {
    /// Image repository the platform images are pulled from, no trailing `/`
    pub image_repository: String,
    /// Platform version
    pub wutong_version: String,
    /// Build tooling version
    pub ci_version: String,
    /// Operator image tag
    pub operator_version: String,
    /// Path of the helm binary
    pub helm_path: String,
}

impl Default for InstallSettings {
    fn default() -> Self {
        Self {
            image_repository: "registry.cn-hangzhou.aliyuncs.com/wutong".to_string(),
            wutong_version: "v1.9.0".to_string(),
            ci_version: "v1.9.0".to_string(),
            operator_version: "v1.9.0".to_string(),
            helm_path: "/usr/local/bin/helm".to_string(),
        }
    }
}

/// Image tag for the given CPU architecture
///
/// amd64 images carry the plain tag; other architectures append `-<arch>`.
pub fn image_fit_arch(tag: &str, arch: &str) -> String {
    match arch {
        "" | "amd64" => tag.to_string(),
        arch => format!("{}-{}", tag, arch),
    }
}
