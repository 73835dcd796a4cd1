//! Custom resources of the platform operator
//!
//! The adaptor never reconciles these itself. It creates them and reads the
//! status the in-cluster operator writes back.

mod cluster;
mod component;
mod package;
mod types;
mod volume;

pub use cluster::{
    WutongCluster, WutongClusterSpec, WutongClusterStatus, CONDITION_IMAGE_REPOSITORY,
    CONDITION_RUNNING,
};
pub use component::{WutongComponent, WutongComponentSpec};
pub use package::{
    PackageCondition, WutongPackage, WutongPackageSpec, WutongPackageStatus,
    PACKAGE_CONDITION_READY, PACKAGE_STATUS_COMPLETED,
};
pub use types::{
    condition_is_true, platform_label_selector, platform_labels, AliyunCloudDiskCsiPluginSource,
    AliyunNasCsiPluginSource, Condition, ConditionStatus, CsiPluginSource, Database, EtcdConfig,
    ImageHub, K8sNode, NfsCsiPluginSource, StorageClassParameters,
};
pub use volume::{WutongVolume, WutongVolumeSpec};
