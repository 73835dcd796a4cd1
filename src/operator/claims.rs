//! Component catalog
//!
//! Decides which platform components a cluster gets, at which version and
//! with how many replicas. Claims live only for the duration of one install.

use std::collections::BTreeMap;

use kube::api::ObjectMeta;

use crate::crd::{platform_labels, WutongCluster, WutongClusterSpec, WutongComponent, WutongComponentSpec};

use super::DEFAULT_IMAGE_HUB_DOMAIN;

const ALIYUN_NAS_PLUGIN: &str = "aliyun-csi-nas-plugin";
const ALIYUN_NAS_PROVISIONER: &str = "aliyun-csi-nas-provisioner";
const ALIYUN_DISK_PLUGIN: &str = "aliyun-csi-disk-plugin";
const ALIYUN_DISK_PROVISIONER: &str = "aliyun-csi-disk-provisioner";

const BASE_COMPONENTS: [&str; 8] = [
    "wt-api",
    "wt-chaos",
    "wt-eventlog",
    "wt-monitor",
    "wt-mq",
    "wt-worker",
    "wt-webcli",
    "wt-resource-proxy",
];

/// One component to create
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceClaim {
    /// Component name
    pub name: String,
    /// Image repository
    pub image_repository: String,
    /// Image name inside the repository
    pub image_name: String,
    /// Image tag
    pub version: String,
    /// Desired replicas
    pub replicas: i32,
    /// Started before everything else
    pub priority: bool,
}

impl ResourceClaim {
    fn new(name: &str, image_repository: &str, version: &str, replicas: i32) -> Self {
        Self {
            name: name.to_string(),
            image_repository: image_repository.to_string(),
            image_name: name.to_string(),
            version: version.to_string(),
            replicas,
            priority: false,
        }
    }

    fn image(mut self, image_name: &str, version: &str) -> Self {
        self.image_name = image_name.to_string();
        self.version = version.to_string();
        self
    }

    fn priority(mut self, priority: bool) -> Self {
        self.priority = priority;
        self
    }

    fn replicas(mut self, replicas: i32) -> Self {
        self.replicas = replicas;
        self
    }

    /// Fully qualified image reference
    pub fn image_ref(&self) -> String {
        format!(
            "{}/{}:{}",
            self.image_repository.trim_end_matches('/'),
            self.image_name,
            self.version
        )
    }

    /// The `WutongComponent` for this claim
    pub fn to_component(&self, namespace: &str) -> WutongComponent {
        let mut extra = vec![("name", self.name.as_str())];
        if self.priority {
            extra.push(("priorityComponent", "true"));
        }
        WutongComponent {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(namespace.to_string()),
                labels: Some(platform_labels(&extra)),
                ..Default::default()
            },
            spec: WutongComponentSpec {
                image: self.image_ref(),
                image_pull_policy: "IfNotPresent".to_string(),
                replicas: Some(self.replicas),
                priority_component: self.priority,
            },
        }
    }
}

/// No external image hub is configured
pub(crate) fn uses_builtin_hub(spec: &WutongClusterSpec) -> bool {
    spec.image_hub
        .as_ref()
        .map_or(true, |hub| hub.domain == DEFAULT_IMAGE_HUB_DOMAIN)
}

/// Claims for every component the cluster needs, keyed by name
///
/// Images come from the cluster's own image repository. `only_region`
/// leaves out the UI and its database.
pub fn generate_claims(
    cluster: &WutongCluster,
    default_version: &str,
    only_region: bool,
) -> BTreeMap<String, ResourceClaim> {
    let spec = &cluster.spec;
    let repository = spec.wutong_image_repository.as_str();
    let replicas = if spec.enable_ha { 2 } else { 1 };
    let priority = uses_builtin_hub(spec);
    let claim = |name: &str| ResourceClaim::new(name, repository, default_version, replicas);

    let mut claims = Vec::new();
    claims.extend(BASE_COMPONENTS.iter().map(|name| claim(name)));
    if !only_region {
        claims.push(claim("wt-app-ui"));
    }
    claims.push(claim("metrics-server").image("metrics-server", "v0.3.6"));

    if spec.region_database.is_none() || (spec.ui_database.is_none() && !only_region) {
        claims.push(claim("wt-db").image("wt-db", "8.0.19").replicas(1));
    }
    if priority {
        claims.push(claim("wt-hub").image("registry", "2.6.2").priority(true));
    }
    claims.push(claim("wt-gateway").priority(priority));
    claims.push(claim("wt-node").priority(priority));

    if spec.etcd_config.as_ref().map_or(true, |e| e.endpoints.is_empty()) {
        let etcd_replicas = if spec.enable_ha { 3 } else { replicas };
        claims.push(
            claim("wt-etcd")
                .image("etcd", "v3.3.18")
                .priority(priority)
                .replicas(etcd_replicas),
        );
    }

    claims.push(claim("kubernetes-dashboard").image("kubernetes-dashboard", "v2.0.1-3"));
    claims.push(claim("dashboard-metrics-scraper").image("metrics-scraper", "v1.0.4"));

    let plugin = |v: &Option<crate::crd::WutongVolumeSpec>| v.as_ref().and_then(|v| v.csi_plugin.clone());
    if let Some(rwx) = plugin(&spec.wutong_volume_spec_rwx) {
        if rwx.nfs.is_some() {
            claims.push(claim("nfs-provisioner").replicas(1).priority(priority));
        }
        if rwx.aliyun_nas.is_some() {
            claims.push(claim(ALIYUN_NAS_PLUGIN).priority(priority));
            claims.push(claim(ALIYUN_NAS_PROVISIONER).priority(priority).replicas(1));
        }
    }
    if let Some(rwo) = plugin(&spec.wutong_volume_spec_rwo) {
        if rwo.aliyun_cloud_disk.is_some() {
            claims.push(claim(ALIYUN_DISK_PLUGIN).priority(priority));
            claims.push(claim(ALIYUN_DISK_PROVISIONER).priority(priority).replicas(1));
        }
    }

    claims.into_iter().map(|c| (c.name.clone(), c)).collect()
}
