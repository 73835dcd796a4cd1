//! Platform region lifecycle on one workload cluster
//!
//! [`PlatformRegion`] owns everything that happens on the cluster side of an
//! install: the operator chart, the `WutongCluster` spec with its defaults
//! and overrides, the domain suffix, status reads and the ordered teardown.

use std::collections::BTreeMap;
use std::future::Future;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::ObjectMeta;
use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{poll_until, ClusterApi};
use crate::crd::{
    platform_label_selector, AliyunNasCsiPluginSource, CsiPluginSource, NfsCsiPluginSource,
    StorageClassParameters, WutongCluster, WutongClusterSpec, WutongPackage, WutongVolume,
    WutongVolumeSpec,
};
use crate::exec::CommandRunner;
use crate::provider::InitConfig;
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::store::TaskStore;
use crate::{Error, Result};

use super::helm::ChartInstall;
use super::install::Operator;
use super::{
    image_fit_arch, InstallSettings, CLUSTER_NAME, DEFAULT_DOMAIN_SUFFIX, LEGACY_STORAGE_CLASSES,
    NAMESPACE, OPERATOR_NAME, OPERATOR_PV_SELECTOR, PACKAGE_NAME, POLL_INTERVAL, POLL_TIMEOUT,
    REGION_CONFIG_MAP, SUFFIX_CONFIG_MAP, VOLUME_RWX,
};

const NAMESPACE_TIMEOUT: Duration = Duration::from_secs(10);
const STATUS_TIMEOUT: Duration = Duration::from_secs(5);
const SUFFIX_ATTEMPTS: u32 = 3;
const SUFFIX_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Snapshot of the platform on a cluster
#[derive(Clone, Debug, Default)]
pub struct RegionStatus {
    /// Operator deployment has a ready replica
    pub operator_ready: bool,
    /// Operator deployment exists
    pub operator_installed: bool,
    /// The `WutongCluster`, if it could be read
    pub cluster: Option<WutongCluster>,
    /// The `WutongPackage`, if it could be read
    pub package: Option<WutongPackage>,
    /// The shared volume, if it could be read
    pub volume: Option<WutongVolume>,
    /// Region config written by the platform once configured
    pub region_config: Option<ConfigMap>,
}

/// Installs, inspects and removes the platform on one cluster
pub struct PlatformRegion {
    api: Arc<dyn ClusterApi>,
    runner: Arc<dyn CommandRunner>,
    store: TaskStore,
    settings: InstallSettings,
    kubeconfig: String,
    work_dir: PathBuf,
}

/// Kubeconfig written for helm; removed on drop
struct KubeconfigFile(PathBuf);

impl KubeconfigFile {
    async fn write(dir: &Path, cluster_id: &str, content: &str) -> Result<Self> {
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(format!("{}.kubeconfig", cluster_id));
        tokio::fs::write(&path, content).await?;
        Ok(Self(path))
    }

    fn path(&self) -> String {
        self.0.to_string_lossy().to_string()
    }
}

impl Drop for KubeconfigFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.0) {
            debug!(path = %self.0.display(), error = %e, "kubeconfig file already gone");
        }
    }
}

#[derive(Deserialize)]
struct OverrideDocument {
    #[serde(default)]
    spec: Option<serde_yaml::Value>,
}

pub(crate) async fn bounded<T>(op: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::time::timeout(STATUS_TIMEOUT, fut)
        .await
        .map_err(|_| Error::timeout(op, STATUS_TIMEOUT))?
}

/// Recursively overlay `patch` onto `base`; objects merge, everything else
/// replaces
fn merge_json(base: &mut Value, patch: Value) {
    match (base, patch) {
        (Value::Object(base), Value::Object(patch)) => {
            for (key, value) in patch {
                merge_json(base.entry(key).or_insert(Value::Null), value);
            }
        }
        (base, patch) => *base = patch,
    }
}

/// Overlay an override document onto `spec`
///
/// The document is a `WutongCluster` manifest; only its `spec` section is
/// used. Fields it does not mention keep their value.
pub(crate) fn overlay_spec(spec: &WutongClusterSpec, document: &str) -> Result<WutongClusterSpec> {
    let doc: OverrideDocument = serde_yaml::from_str(document)?;
    let Some(patch) = doc.spec else {
        return Ok(spec.clone());
    };
    let patch = serde_json::to_value(patch)?;
    let mut merged = serde_json::to_value(spec)?;
    merge_json(&mut merged, patch);
    Ok(serde_json::from_value(merged)?)
}

/// `<first 8 chars of uuid>.<ip>.nip.io`
pub(crate) fn suffix_domain(ip: &str, uuid: &str) -> Result<String> {
    let ip: IpAddr = ip
        .parse()
        .map_err(|_| Error::validation(format!("{} is not an IP address", ip)))?;
    let id: String = uuid.chars().filter(|c| *c != '-').take(8).collect();
    if id.is_empty() {
        return Err(Error::validation("suffix identity has no uuid"));
    }
    let host = match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => v6.to_string().replace(':', "-"),
    };
    Ok(format!("{}.{}.nip.io", id.to_lowercase(), host))
}

fn nas_volume(server: &str) -> WutongVolumeSpec {
    WutongVolumeSpec {
        csi_plugin: Some(CsiPluginSource {
            aliyun_nas: Some(AliyunNasCsiPluginSource::default()),
            ..Default::default()
        }),
        storage_class_parameters: Some(StorageClassParameters {
            parameters: BTreeMap::from([
                ("volumeAs".to_string(), "subpath".to_string()),
                ("server".to_string(), server.to_string()),
                ("archiveOnDelete".to_string(), "true".to_string()),
            ]),
        }),
        ..Default::default()
    }
}

fn drop_empty_plugin(volume: &mut Option<WutongVolumeSpec>) {
    if let Some(volume) = volume {
        if volume.csi_plugin.as_ref().is_some_and(CsiPluginSource::is_empty) {
            volume.csi_plugin = None;
        }
    }
}

/// Fill in the fields the operator requires and drop empty sections
pub(crate) fn normalise(
    spec: &mut WutongClusterSpec,
    config: &InitConfig,
    settings: &InstallSettings,
) -> Result<()> {
    if spec.gateway_ingress_ips.is_empty() {
        return Err(Error::install(
            "can not select eip, please specify `gatewayIngressIPs` in the custom cluster init configuration",
        ));
    }
    if spec.etcd_config.as_ref().is_some_and(|e| e.endpoints.is_empty()) {
        spec.etcd_config = None;
    }
    spec.install_mode = "WithoutPackage".to_string();
    if spec.cache_mode.is_empty() {
        spec.cache_mode = "hostpath".to_string();
    }
    spec.config_completed = true;
    if spec.image_hub.as_ref().is_some_and(|h| h.domain.is_empty()) {
        spec.image_hub = None;
    }
    if spec.install_version.is_empty() {
        spec.install_version = config.wutong_version.clone();
    }
    if spec.ci_version.is_empty() {
        spec.ci_version = config.wutong_ci_version.clone();
    }
    if spec.wutong_image_repository.is_empty() {
        spec.wutong_image_repository = settings.image_repository.clone();
    }
    if let Some(etcd) = config.etcd_config.as_ref().filter(|e| !e.endpoints.is_empty()) {
        spec.etcd_config = Some(etcd.clone());
    }
    if let Some(db) = config.region_database.as_ref().filter(|d| !d.host.is_empty()) {
        spec.region_database = Some(db.clone());
    }
    if !config.nas_server.is_empty() {
        spec.wutong_volume_spec_rwx = Some(nas_volume(&config.nas_server));
    }

    drop_empty_plugin(&mut spec.wutong_volume_spec_rwx);
    drop_empty_plugin(&mut spec.wutong_volume_spec_rwo);
    if spec.wutong_volume_spec_rwo.as_ref().is_some_and(WutongVolumeSpec::is_unset) {
        spec.wutong_volume_spec_rwo = None;
    }
    if spec.wutong_volume_spec_rwx.as_ref().map_or(true, WutongVolumeSpec::is_unset) {
        spec.wutong_volume_spec_rwx = Some(WutongVolumeSpec {
            csi_plugin: Some(CsiPluginSource {
                nfs: Some(NfsCsiPluginSource {}),
                ..Default::default()
            }),
            ..Default::default()
        });
    }
    Ok(())
}

impl PlatformRegion {
    /// Create a region handle for the cluster `api` talks to
    ///
    /// `kubeconfig` is handed to helm; `store` supplies override documents.
    pub fn new(
        api: Arc<dyn ClusterApi>,
        runner: Arc<dyn CommandRunner>,
        store: TaskStore,
        settings: InstallSettings,
        kubeconfig: impl Into<String>,
    ) -> Self {
        Self {
            api,
            runner,
            store,
            settings,
            kubeconfig: kubeconfig.into(),
            work_dir: std::env::temp_dir(),
        }
    }

    /// Directory for the temporary kubeconfig file
    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = dir.into();
        self
    }

    /// Default spec for the cluster, overlaid with its stored override
    /// document
    pub(crate) fn build_spec(&self, config: &InitConfig) -> WutongClusterSpec {
        let spec = WutongClusterSpec {
            install_version: config.wutong_version.clone(),
            ci_version: config.wutong_ci_version.clone(),
            enable_ha: config.enable_ha,
            wutong_image_repository: self.settings.image_repository.clone(),
            suffix_http_host: config.suffix_http_host.clone(),
            nodes_for_chaos: config.chaos_nodes.clone(),
            nodes_for_gateway: config.gateway_nodes.clone(),
            gateway_ingress_ips: config.eips.clone(),
            ..Default::default()
        };

        let document = match self.store.get_cluster_config(&config.cluster_id) {
            Ok(Some(document)) => document,
            Ok(None) => return spec,
            Err(e) => {
                warn!(cluster = %config.cluster_id, error = %e, "failed to read cluster config");
                return spec;
            }
        };
        match overlay_spec(&spec, &document) {
            Ok(merged) => {
                info!(cluster = %config.cluster_id, "using custom wutongcluster config");
                merged
            }
            Err(e) => {
                warn!(cluster = %config.cluster_id, error = %e, "ignoring unparsable cluster config");
                spec
            }
        }
    }

    /// Install the operator and the platform resources
    pub async fn init_region(
        &self,
        cancel: &CancellationToken,
        config: &InitConfig,
    ) -> Result<WutongCluster> {
        let mut spec = self.build_spec(config);
        normalise(&mut spec, config, &self.settings)?;

        let file = KubeconfigFile::write(&self.work_dir, &config.cluster_id, &self.kubeconfig)
            .await
            .map_err(|e| Error::install(format!("write kubeconfig file failure {}", e)))?;

        tokio::time::timeout(NAMESPACE_TIMEOUT, self.api.ensure_namespace(NAMESPACE))
            .await
            .map_err(|_| Error::timeout("create namespace", NAMESPACE_TIMEOUT))?
            .map_err(|e| Error::install(format!("create namespace failure {}", e)))?;

        let tag = image_fit_arch(&self.settings.operator_version, &spec.arch);
        let kubeconfig_path = file.path();
        let chart = ChartInstall {
            helm_path: &self.settings.helm_path,
            kubeconfig_path: &kubeconfig_path,
            image_repository: &self.settings.image_repository,
            image_tag: &tag,
        };
        chart.run(&self.runner, &self.api).await?;
        drop(file);

        let api = self.api.clone();
        poll_until(
            cancel,
            POLL_TIMEOUT,
            POLL_INTERVAL,
            "waiting wutong operator ready timeout",
            || {
                let api = api.clone();
                async move { Ok(api.get_cluster_role_binding(OPERATOR_NAME).await?.is_some()) }
            },
        )
        .await?;

        if spec.suffix_http_host.is_empty() {
            spec.suffix_http_host = self.suffix_http_host(config).await;
        }

        let mut cluster = WutongCluster::new(CLUSTER_NAME, spec);
        cluster.metadata.namespace = Some(NAMESPACE.to_string());
        Operator::new(
            self.api.clone(),
            NAMESPACE,
            self.settings.image_repository.clone(),
            config.wutong_version.clone(),
        )
        .install(cluster)
        .await
        .map_err(|e| Error::install(format!("create wutong CR failure {}", e)))
    }

    async fn suffix_http_host(&self, config: &InitConfig) -> String {
        let ip = config
            .eips
            .first()
            .filter(|ip| !ip.is_empty())
            .or_else(|| config.gateway_nodes.first().map(|n| &n.internal_ip))
            .filter(|ip| !ip.is_empty());
        let Some(ip) = ip else {
            return DEFAULT_DOMAIN_SUFFIX.to_string();
        };

        let retry = RetryConfig::fixed(SUFFIX_ATTEMPTS, SUFFIX_RETRY_DELAY);
        let derived = retry_with_backoff(&retry, "generate suffix http host", || async {
            let uuid = self.suffix_identity().await?;
            suffix_domain(ip, &uuid)
        })
        .await;
        match derived {
            Ok(domain) => domain,
            Err(e) => {
                warn!(error = %e, "generate suffix http host failed, using default");
                DEFAULT_DOMAIN_SUFFIX.to_string()
            }
        }
    }

    /// The `uuid` of the suffix config map, created on first use
    async fn suffix_identity(&self) -> Result<String> {
        if let Some(cm) = self.api.get_config_map(NAMESPACE, SUFFIX_CONFIG_MAP).await? {
            return Ok(cm
                .data
                .and_then(|d| d.get("uuid").cloned())
                .unwrap_or_default());
        }
        info!("not found configmap {}, create it", SUFFIX_CONFIG_MAP);
        let uuid = uuid::Uuid::new_v4().to_string();
        let cm = ConfigMap {
            metadata: ObjectMeta {
                name: Some(SUFFIX_CONFIG_MAP.to_string()),
                namespace: Some(NAMESPACE.to_string()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([
                ("uuid".to_string(), uuid.clone()),
                ("auth".to_string(), uuid::Uuid::new_v4().to_string()),
            ])),
            ..Default::default()
        };
        self.api.create_config_map(NAMESPACE, &cm).await?;
        Ok(uuid)
    }

    /// Read the platform state
    ///
    /// A missing cluster or package means the platform is not installed and
    /// yields [`Error::NotFound`]. Other failures only blank their field.
    pub async fn status(&self) -> Result<RegionStatus> {
        let mut status = RegionStatus::default();

        match bounded("get operator", self.api.get_deployment(NAMESPACE, OPERATOR_NAME)).await {
            Ok(Some(deployment)) => {
                status.operator_installed = true;
                status.operator_ready = deployment
                    .status
                    .and_then(|s| s.ready_replicas)
                    .unwrap_or(0)
                    >= 1;
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "get operator failure"),
        }

        match bounded("get cluster", self.api.get_cluster_resource(NAMESPACE, CLUSTER_NAME)).await {
            Ok(Some(cluster)) => status.cluster = Some(cluster),
            Ok(None) => return Err(Error::not_found(format!("wutongcluster {}", CLUSTER_NAME))),
            Err(e) => warn!(error = %e, "get cluster failure"),
        }

        match bounded("get package", self.api.get_package(NAMESPACE, PACKAGE_NAME)).await {
            Ok(Some(package)) => status.package = Some(package),
            Ok(None) => return Err(Error::not_found(format!("wutongpackage {}", PACKAGE_NAME))),
            Err(e) => warn!(error = %e, "get package failure"),
        }

        match bounded("get volume", self.api.get_volume(NAMESPACE, VOLUME_RWX)).await {
            Ok(volume) => status.volume = volume,
            Err(e) => warn!(error = %e, "get wutong volume failure"),
        }

        match bounded("get region config", self.api.get_config_map(NAMESPACE, REGION_CONFIG_MAP)).await {
            Ok(config) => status.region_config = config,
            Err(e) => warn!(error = %e, "get region config failure"),
        }

        Ok(status)
    }

    /// Remove the platform and wait for its namespace to disappear
    pub async fn uninstall(&self, cancel: &CancellationToken) -> Result<()> {
        let api = &self.api;
        let step = |what: &'static str| move |e: Error| Error::install(format!("{}: {}", what, e));

        api.delete_all_components(NAMESPACE).await.map_err(step("delete component failure"))?;
        api.delete_all_packages(NAMESPACE).await.map_err(step("delete wutong package failure"))?;
        api.delete_all_volumes(NAMESPACE).await.map_err(step("delete wutong volume failure"))?;

        let claims = api.list_pvcs(NAMESPACE).await.map_err(step("list pv"))?;
        for volume in claims
            .iter()
            .filter_map(|c| c.spec.as_ref()?.volume_name.as_deref())
            .filter(|v| !v.is_empty())
        {
            api.delete_pv(volume).await.map_err(step("delete persistent volume"))?;
        }
        api.delete_all_pvcs(NAMESPACE)
            .await
            .map_err(step("delete persistent volume claims"))?;
        api.delete_pvs_by_label(OPERATOR_PV_SELECTOR)
            .await
            .map_err(step("delete persistent volumes"))?;

        let selector = platform_label_selector();
        api.delete_storage_classes_by_label(&selector)
            .await
            .map_err(step("delete storageclass"))?;
        for class in LEGACY_STORAGE_CLASSES {
            api.delete_storage_class(class).await.map_err(step("delete storageclass"))?;
        }
        api.delete_csi_drivers_by_label(&selector)
            .await
            .map_err(step("delete csidriver"))?;
        api.delete_cluster_role_binding(OPERATOR_NAME)
            .await
            .map_err(step("delete cluster role binding"))?;
        api.delete_all_cluster_resources(NAMESPACE)
            .await
            .map_err(step("delete wutong cluster failure"))?;
        api.delete_namespace(NAMESPACE).await.map_err(step("delete namespace"))?;
        info!("platform resources deleted, waiting for namespace");

        let api = self.api.clone();
        poll_until(cancel, POLL_TIMEOUT, POLL_INTERVAL, "waiting namespace deleted timeout", || {
            let api = api.clone();
            async move { Ok(!api.namespace_exists(NAMESPACE).await?) }
        })
        .await
    }
}
