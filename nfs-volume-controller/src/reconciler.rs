use std::{fmt, sync::Arc};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use kube::ResourceExt;
use nfs_volume_controller_apis::{APP_LABEL, NFSVolume, pvc_app_label};

use crate::{
    cache::{LabelSelector, SharedCache},
    errors::ControllerError,
    events::EventPublisher,
    object_key::ObjectKey,
    provisioner::volume_selector,
    volume_client::VolumeClient,
};

/// Create/update logic for an existing [`NFSVolume`].
///
/// Returning an error re-queues the key with backoff.
#[async_trait]
pub(crate) trait Upsert: Send + Sync {
    async fn upsert(&self, volume: &NFSVolume) -> Result<(), ControllerError>;
}

/// [`Upsert`] used when provisioning is not configured, it only logs.
pub(crate) struct ObserveOnly;

#[async_trait]
impl Upsert for ObserveOnly {
    async fn upsert(&self, volume: &NFSVolume) -> Result<(), ControllerError> {
        debug!(
            "observed NFSVolume {}/{} (path {}, {}), provisioning is disabled",
            volume.namespace().unwrap_or_default(),
            volume.name_any(),
            volume.spec.path,
            volume.spec.access_mode
        );
        Ok(())
    }
}

/// Which branch a reconciliation took.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ReconcileState {
    /// The object exists, upsert was invoked.
    Present,
    /// The object is gone, derived resources were cleaned up.
    Absent,
}

impl ReconcileState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconcileState::Present => "present",
            ReconcileState::Absent => "absent",
        }
    }
}

impl fmt::Display for ReconcileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reconciles a single [`ObjectKey`] against the cached state.
pub(crate) struct Reconciler {
    volumes: SharedCache<NFSVolume>,
    pvs: SharedCache<PersistentVolume>,
    pvcs: SharedCache<PersistentVolumeClaim>,
    client: Arc<dyn VolumeClient>,
    upsert: Arc<dyn Upsert>,
    events: EventPublisher,
}

impl Reconciler {
    pub fn new(
        volumes: SharedCache<NFSVolume>,
        pvs: SharedCache<PersistentVolume>,
        pvcs: SharedCache<PersistentVolumeClaim>,
        client: Arc<dyn VolumeClient>,
        upsert: Arc<dyn Upsert>,
        events: EventPublisher,
    ) -> Self {
        Self {
            volumes,
            pvs,
            pvcs,
            client,
            upsert,
            events,
        }
    }

    pub async fn reconcile(&self, key: &ObjectKey) -> Result<ReconcileState, ControllerError> {
        match self.volumes.get(&key.namespace, &key.name) {
            None => {
                self.delete_derived(key).await?;
                Ok(ReconcileState::Absent)
            }
            Some(volume) => {
                if let Err(e) = self.upsert.upsert(volume.as_ref()).await {
                    self.events
                        .warning(volume.as_ref(), "SyncFailed", format!("{}", e))
                        .await;
                    return Err(e);
                }
                Ok(ReconcileState::Present)
            }
        }
    }

    /// Delete every claim and volume derived from the deleted [`NFSVolume`].
    ///
    /// The derivation labels are expected to be unique, additional matches
    /// are deleted as well.
    async fn delete_derived(&self, key: &ObjectKey) -> Result<(), ControllerError> {
        let selector = LabelSelector::eq(APP_LABEL, pvc_app_label(&key.name));
        let claims = self.pvcs.list(Some(key.namespace.as_str()), &selector);
        if claims.len() > 1 {
            warn!(
                "{} PersistentVolumeClaims match {} in namespace {}, deleting all of them",
                claims.len(),
                selector,
                key.namespace
            );
        }
        for claim in claims {
            let name = claim.name_any();
            self.client.delete_claim(&key.namespace, &name).await?;
            info!(
                "deleted PersistentVolumeClaim {}/{} of {}",
                key.namespace, name, key
            );
        }

        let selector = volume_selector(&key.namespace, &key.name);
        let volumes = self.pvs.list(None, &selector);
        if volumes.len() > 1 {
            warn!(
                "{} PersistentVolumes match {}, deleting all of them",
                volumes.len(),
                selector
            );
        }
        for volume in volumes {
            let name = volume.name_any();
            self.client.delete_volume(&name).await?;
            info!("deleted PersistentVolume {} of {}", name, key);
        }
        Ok(())
    }
}
