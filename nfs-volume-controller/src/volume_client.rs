use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use kube::{
    Api, Client, ResourceExt,
    api::{DeleteParams, PostParams},
};

use crate::{
    MANAGER,
    errors::{ControllerError, ExtKubeApiError},
};

/// Mutating access to the derived resources.
///
/// Deleting an object which no longer exists is a success. Claims are never
/// updated, their spec is immutable once bound.
#[async_trait]
pub(crate) trait VolumeClient: Send + Sync {
    async fn create_volume(&self, pv: &PersistentVolume) -> Result<(), ControllerError>;
    async fn update_volume(&self, pv: &PersistentVolume) -> Result<(), ControllerError>;
    async fn delete_volume(&self, name: &str) -> Result<(), ControllerError>;
    async fn create_claim(
        &self,
        namespace: &str,
        pvc: &PersistentVolumeClaim,
    ) -> Result<(), ControllerError>;
    async fn delete_claim(&self, namespace: &str, name: &str) -> Result<(), ControllerError>;
}

/// [`VolumeClient`] talking to the Kubernetes API server.
pub(crate) struct KubeVolumeClient {
    client: Client,
}

impl KubeVolumeClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn volumes(&self) -> Api<PersistentVolume> {
        Api::all(self.client.clone())
    }

    fn claims(&self, namespace: &str) -> Api<PersistentVolumeClaim> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn post_params() -> PostParams {
        let mut pp = PostParams::default();
        pp.field_manager = Some(MANAGER.to_string());
        pp
    }
}

#[async_trait]
impl VolumeClient for KubeVolumeClient {
    async fn create_volume(&self, pv: &PersistentVolume) -> Result<(), ControllerError> {
        self.volumes().create(&Self::post_params(), pv).await?;
        Ok(())
    }

    async fn update_volume(&self, pv: &PersistentVolume) -> Result<(), ControllerError> {
        self.volumes()
            .replace(pv.name_any().as_str(), &Self::post_params(), pv)
            .await?;
        Ok(())
    }

    async fn delete_volume(&self, name: &str) -> Result<(), ControllerError> {
        match self.volumes().delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => {
                debug!(
                    "tried to delete PersistentVolume {}, but it does no longer exist: {}",
                    name, e
                );
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn create_claim(
        &self,
        namespace: &str,
        pvc: &PersistentVolumeClaim,
    ) -> Result<(), ControllerError> {
        self.claims(namespace)
            .create(&Self::post_params(), pvc)
            .await?;
        Ok(())
    }

    async fn delete_claim(&self, namespace: &str, name: &str) -> Result<(), ControllerError> {
        match self
            .claims(namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => {
                debug!(
                    "tried to delete PersistentVolumeClaim {}/{}, but it does no longer exist: {}",
                    namespace, name, e
                );
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
