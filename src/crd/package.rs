//! WutongPackage custom resource
//!
//! The offline image bundle the operator loads into the image hub.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition type on a package
pub const PACKAGE_CONDITION_READY: &str = "Ready";
/// Status value of the Ready condition once every image is pushed
pub const PACKAGE_STATUS_COMPLETED: &str = "Completed";

/// Package to load
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[kube(
    group = "wutong.io",
    version = "v1alpha1",
    kind = "WutongPackage",
    plural = "wutongpackages",
    status = "WutongPackageStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct WutongPackageSpec {
    /// Path of the bundle on the node
    #[serde(default)]
    pub pkg_path: String,
    /// Image hub user
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image_hub_user: String,
    /// Image hub password
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image_hub_pass: String,
}

/// Package condition; the status is a free-form phase string
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct PackageCondition {
    /// Condition type
    #[serde(rename = "type")]
    pub type_: String,
    /// Phase, e.g. `Completed`
    #[serde(default)]
    pub status: String,
    /// Detail
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

/// Load progress
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WutongPackageStatus {
    /// Images in the bundle
    #[serde(default)]
    pub images_number: i32,
    /// Images pushed so far
    #[serde(default)]
    pub images_pushed: i32,
    /// Conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<PackageCondition>,
}

impl WutongPackage {
    /// Every image has been pushed to the hub
    pub fn ready(&self) -> bool {
        self.status
            .as_ref()
            .map(|s| {
                s.conditions.iter().any(|c| {
                    c.type_ == PACKAGE_CONDITION_READY && c.status == PACKAGE_STATUS_COMPLETED
                })
            })
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ready_requires_completed_phase() {
        let mut pkg = WutongPackage::new("wutongpackage", WutongPackageSpec::default());
        assert!(!pkg.ready());

        pkg.status = Some(WutongPackageStatus {
            images_number: 10,
            images_pushed: 3,
            conditions: vec![PackageCondition {
                type_: PACKAGE_CONDITION_READY.to_string(),
                status: "Pushing".to_string(),
                message: String::new(),
            }],
        });
        assert!(!pkg.ready());

        if let Some(status) = pkg.status.as_mut() {
            status.conditions[0].status = PACKAGE_STATUS_COMPLETED.to_string();
        }
        assert!(pkg.ready());
    }
}
