//! Shared types for the platform custom resources

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition status following Kubernetes conventions
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Condition reported by the platform operator on a `WutongCluster`
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Condition type, e.g. `Running` or `ImageRepositoryInstalled`
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition
    #[serde(default)]
    pub status: ConditionStatus,

    /// Machine-readable reason
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,

    /// Human-readable message
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl Condition {
    /// Create a condition without reason or message
    pub fn new(type_: impl Into<String>, status: ConditionStatus) -> Self {
        Self {
            type_: type_.into(),
            status,
            ..Default::default()
        }
    }
}

/// Find a condition by type and report whether it is `True`
pub fn condition_is_true(conditions: &[Condition], type_: &str) -> bool {
    conditions
        .iter()
        .any(|c| c.type_ == type_ && c.status == ConditionStatus::True)
}

/// Addresses of a node selected for gateway or chaos duty
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct K8sNode {
    /// Node hostname
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Internal IP address
    #[serde(default, rename = "internalIP", skip_serializing_if = "String::is_empty")]
    pub internal_ip: String,
    /// External IP address
    #[serde(default, rename = "externalIP", skip_serializing_if = "String::is_empty")]
    pub external_ip: String,
}

/// External image registry used instead of the bundled hub
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ImageHub {
    /// Registry domain
    #[serde(default)]
    pub domain: String,
    /// Namespace inside the registry
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    /// Registry user
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    /// Registry password
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,
}

/// Connection settings for an external database
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Database {
    /// Host name or IP
    #[serde(default)]
    pub host: String,
    /// Port
    #[serde(default)]
    pub port: i32,
    /// User name
    #[serde(default)]
    pub username: String,
    /// Password
    #[serde(default)]
    pub password: String,
    /// Database name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
}

/// External etcd cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EtcdConfig {
    /// Client endpoints
    #[serde(default)]
    pub endpoints: Vec<String>,
    /// Secret holding client certificates
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub secret_name: String,
}

/// NFS provisioner source (no settings)
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct NfsCsiPluginSource {}

/// Aliyun cloud disk CSI plugin
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AliyunCloudDiskCsiPluginSource {
    /// Access key id
    #[serde(default, rename = "accessKeyID")]
    pub access_key_id: String,
    /// Access key secret
    #[serde(default)]
    pub access_key_secret: String,
    /// Max volumes per node
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub max_volume_per_node: String,
}

/// Aliyun NAS CSI plugin
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AliyunNasCsiPluginSource {
    /// Access key id
    #[serde(default, rename = "accessKeyID")]
    pub access_key_id: String,
    /// Access key secret
    #[serde(default)]
    pub access_key_secret: String,
}

/// The CSI plugin backing a platform volume; at most one source is set
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CsiPluginSource {
    /// In-cluster NFS provisioner
    #[serde(default, rename = "nfs", skip_serializing_if = "Option::is_none")]
    pub nfs: Option<NfsCsiPluginSource>,
    /// Aliyun cloud disk
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aliyun_cloud_disk: Option<AliyunCloudDiskCsiPluginSource>,
    /// Aliyun NAS
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aliyun_nas: Option<AliyunNasCsiPluginSource>,
}

impl CsiPluginSource {
    /// True when no source is selected
    pub fn is_empty(&self) -> bool {
        self.nfs.is_none() && self.aliyun_cloud_disk.is_none() && self.aliyun_nas.is_none()
    }
}

/// Parameters copied onto the generated storage class
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StorageClassParameters {
    /// Provisioner specific parameters
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

/// Labels applied to every resource the platform owns
pub fn platform_labels(extra: &[(&str, &str)]) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::from([("creator".to_string(), "Wutong".to_string())]);
    for (k, v) in extra {
        labels.insert((*k).to_string(), (*v).to_string());
    }
    labels
}

/// Label selector string for [`platform_labels`] without extras
pub fn platform_label_selector() -> String {
    platform_labels(&[])
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_condition_lookup_requires_true_status() {
        let conditions = vec![
            Condition::new("Running", ConditionStatus::False),
            Condition::new("ImageRepositoryInstalled", ConditionStatus::True),
        ];
        assert!(!condition_is_true(&conditions, "Running"));
        assert!(condition_is_true(&conditions, "ImageRepositoryInstalled"));
        assert!(!condition_is_true(&conditions, "Missing"));
    }

    #[test]
    fn test_empty_csi_source() {
        assert!(CsiPluginSource::default().is_empty());
        let nfs = CsiPluginSource {
            nfs: Some(NfsCsiPluginSource {}),
            ..Default::default()
        };
        assert!(!nfs.is_empty());
    }

    #[test]
    fn test_platform_labels_merge_extras() {
        let labels = platform_labels(&[("name", "wt-api")]);
        assert_eq!(labels.get("creator").map(String::as_str), Some("Wutong"));
        assert_eq!(labels.get("name").map(String::as_str), Some("wt-api"));
        assert_eq!(platform_label_selector(), "creator=Wutong");
    }

    /// Story: node addresses use the operator's field casing on the wire
    #[test]
    fn story_node_addresses_use_operator_casing() {
        let node = K8sNode {
            name: "node-1".to_string(),
            internal_ip: "10.0.0.1".to_string(),
            external_ip: String::new(),
        };
        let json = serde_json::to_value(&node).unwrap();
        assert_eq!(json["internalIP"], "10.0.0.1");
        assert!(json.get("externalIP").is_none());
    }
}
