//! Applies the platform custom resources to a cluster

use std::sync::Arc;
use std::time::Duration;

use kube::api::ObjectMeta;
use tracing::{debug, info};

use crate::client::ClusterApi;
use crate::crd::{
    platform_labels, WutongCluster, WutongPackage, WutongPackageSpec, WutongVolume,
    WutongVolumeSpec,
};
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::{Error, Result};

use super::claims::generate_claims;
use super::{PACKAGE_NAME, PACKAGE_PATH, VOLUME_RWO, VOLUME_RWX};

const COMPONENT_ATTEMPTS: u32 = 3;
const COMPONENT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Installs the platform custom resources into one namespace
pub struct Operator {
    api: Arc<dyn ClusterApi>,
    namespace: String,
    image_repository: String,
    version: String,
    only_region: bool,
}

impl Operator {
    /// Create an installer
    ///
    /// `image_repository` is stamped onto volumes, `version` is the default
    /// component tag.
    pub fn new(
        api: Arc<dyn ClusterApi>,
        namespace: impl Into<String>,
        image_repository: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            api,
            namespace: namespace.into(),
            image_repository: image_repository.into(),
            version: version.into(),
            only_region: true,
        }
    }

    /// Also install the UI and its database
    pub fn with_ui(mut self) -> Self {
        self.only_region = false;
        self
    }

    /// Apply the cluster, volumes, package and components
    ///
    /// An existing `WutongCluster` keeps its image hub and databases where
    /// the new spec leaves them unset; the rest of its spec is replaced.
    pub async fn install(&self, mut cluster: WutongCluster) -> Result<WutongCluster> {
        cluster.metadata.namespace = Some(self.namespace.clone());
        let name = cluster.metadata.name.clone().unwrap_or_default();

        if !self.api.create_cluster_resource(&self.namespace, &cluster).await? {
            let mut old = self
                .api
                .get_cluster_resource(&self.namespace, &name)
                .await?
                .ok_or_else(|| Error::install(format!("wutong cluster {} vanished during update", name)))?;

            let mut spec = cluster.spec;
            if spec.image_hub.is_none() {
                spec.image_hub = old.spec.image_hub.take();
            }
            if spec.region_database.is_none() {
                spec.region_database = old.spec.region_database.take();
            }
            if spec.ui_database.is_none() {
                spec.ui_database = old.spec.ui_database.take();
            }
            old.spec = spec;
            self.api
                .replace_cluster_resource(&self.namespace, &old)
                .await
                .map_err(|e| Error::install(format!("update wutong cluster failure {}", e)))?;
            info!(cluster = %name, "updated existing wutong cluster");
            cluster = old;
        } else {
            info!(cluster = %name, "created wutong cluster");
        }

        self.create_volumes(&cluster)
            .await
            .map_err(|e| Error::install(format!("create wutong volume failure {}", e)))?;
        self.create_package()
            .await
            .map_err(|e| Error::install(format!("create wutong package failure {}", e)))?;
        self.create_components(&cluster).await?;
        Ok(cluster)
    }

    async fn create_volumes(&self, cluster: &WutongCluster) -> Result<()> {
        let volumes = [
            (VOLUME_RWX, "rwx", &cluster.spec.wutong_volume_spec_rwx),
            (VOLUME_RWO, "rwo", &cluster.spec.wutong_volume_spec_rwo),
        ];
        for (name, mode, spec) in volumes {
            let Some(spec) = spec else { continue };
            let volume = self.volume(name, mode, spec);
            if self.api.create_volume(&self.namespace, &volume).await? {
                info!(volume = %name, "created wutong volume");
            }
        }
        Ok(())
    }

    fn volume(&self, name: &str, mode: &str, spec: &WutongVolumeSpec) -> WutongVolume {
        WutongVolume {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(self.namespace.clone()),
                labels: Some(platform_labels(&[("accessModes", mode)])),
                ..Default::default()
            },
            spec: WutongVolumeSpec {
                image_repository: self.image_repository.clone(),
                ..spec.clone()
            },
        }
    }

    async fn create_package(&self) -> Result<()> {
        let package = WutongPackage {
            metadata: ObjectMeta {
                name: Some(PACKAGE_NAME.to_string()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            spec: WutongPackageSpec {
                pkg_path: PACKAGE_PATH.to_string(),
                ..Default::default()
            },
            status: None,
        };
        self.api.create_package(&self.namespace, &package).await?;
        Ok(())
    }

    async fn create_components(&self, cluster: &WutongCluster) -> Result<()> {
        let retry = RetryConfig::fixed(COMPONENT_ATTEMPTS, COMPONENT_RETRY_DELAY);
        for claim in generate_claims(cluster, &self.version, self.only_region).values() {
            let component = claim.to_component(&self.namespace);
            let op = format!("create component {}", claim.name);
            retry_with_backoff(&retry, &op, || async {
                self.api.create_component(&self.namespace, &component).await
            })
            .await
            .map_err(|e| {
                Error::install(format!("create wutong component {} failure {}", claim.name, e))
            })?;
            debug!(component = %claim.name, image = %component.spec.image, "component applied");
        }
        Ok(())
    }
}
