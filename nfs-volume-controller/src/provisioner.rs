use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use k8s_openapi::{
    api::core::v1::{
        NFSVolumeSource, PersistentVolume, PersistentVolumeClaim, PersistentVolumeClaimSpec,
        PersistentVolumeSpec, VolumeResourceRequirements,
    },
    apimachinery::pkg::api::resource::Quantity,
};
use kube::{ResourceExt, api::ObjectMeta};
use nfs_volume_controller_apis::{
    APP_LABEL, NAMESPACE_LABEL, NFSVolume, pv_app_label, pvc_app_label,
};

use crate::{
    cache::{LabelSelector, SharedCache},
    errors::{ControllerError, ExtKubeApiError},
    events::EventPublisher,
    reconciler::Upsert,
    volume_client::VolumeClient,
};

/// Name of the (cluster scoped) PersistentVolume provisioned for an [`NFSVolume`].
pub(crate) fn volume_name(namespace: &str, name: &str) -> String {
    format!("{}-{}-pv", namespace, name)
}

/// Name of the PersistentVolumeClaim provisioned for an [`NFSVolume`].
pub(crate) fn claim_name(name: &str) -> String {
    format!("{}-pvc", name)
}

/// Selects the PersistentVolumes derived from the [`NFSVolume`] `namespace/name`.
pub(crate) fn volume_selector(namespace: &str, name: &str) -> LabelSelector {
    LabelSelector::eq(APP_LABEL, pv_app_label(name)).and(NAMESPACE_LABEL, namespace)
}

fn labels(value: String) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(APP_LABEL.to_string(), value);
    labels
}

fn storage(capacity: &Quantity) -> Option<BTreeMap<String, Quantity>> {
    let mut resources = BTreeMap::new();
    resources.insert("storage".to_string(), capacity.clone());
    Some(resources)
}

/// Provisions a statically bound PersistentVolume / PersistentVolumeClaim pair
/// for every [`NFSVolume`].
pub(crate) struct ProvisionUpsert {
    pvs: SharedCache<PersistentVolume>,
    pvcs: SharedCache<PersistentVolumeClaim>,
    client: Arc<dyn VolumeClient>,
    nfs_server: String,
    capacity: Quantity,
    events: EventPublisher,
}

impl ProvisionUpsert {
    pub fn new(
        pvs: SharedCache<PersistentVolume>,
        pvcs: SharedCache<PersistentVolumeClaim>,
        client: Arc<dyn VolumeClient>,
        nfs_server: String,
        capacity: Quantity,
        events: EventPublisher,
    ) -> Self {
        Self {
            pvs,
            pvcs,
            client,
            nfs_server,
            capacity,
            events,
        }
    }

    fn desired_volume(&self, volume: &NFSVolume) -> PersistentVolume {
        let namespace = volume.namespace().unwrap_or_default();
        let name = volume.name_any();
        let mode = volume.spec.access_mode;
        let mut labels = labels(pv_app_label(&name));
        labels.insert(NAMESPACE_LABEL.to_string(), namespace.clone());
        PersistentVolume {
            metadata: ObjectMeta {
                name: Some(volume_name(&namespace, &name)),
                labels: Some(labels),
                ..Default::default()
            },
            spec: Some(PersistentVolumeSpec {
                access_modes: Some(vec![mode.to_string()]),
                capacity: storage(&self.capacity),
                // the volume source is immutable, `read_only` is fixed at creation
                nfs: Some(NFSVolumeSource {
                    server: self.nfs_server.clone(),
                    path: volume.spec.path.clone(),
                    read_only: Some(mode.is_read_only()),
                }),
                persistent_volume_reclaim_policy: Some("Retain".to_string()),
                // an empty class disables dynamic provisioning for the claim
                storage_class_name: Some(String::new()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn desired_claim(&self, volume: &NFSVolume) -> PersistentVolumeClaim {
        let namespace = volume.namespace().unwrap_or_default();
        let name = volume.name_any();
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(claim_name(&name)),
                namespace: Some(namespace.clone()),
                labels: Some(labels(pvc_app_label(&name))),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec![volume.spec.access_mode.to_string()]),
                resources: Some(VolumeResourceRequirements {
                    requests: storage(&self.capacity),
                    ..Default::default()
                }),
                volume_name: Some(volume_name(&namespace, &name)),
                storage_class_name: Some(String::new()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    async fn ensure_volume(&self, volume: &NFSVolume) -> Result<(), ControllerError> {
        let desired = self.desired_volume(volume);
        let namespace = volume.namespace().unwrap_or_default();
        let selector = volume_selector(&namespace, &volume.name_any());
        let existing = self.pvs.list(None, &selector).into_iter().next();
        match existing {
            None => match self.client.create_volume(&desired).await {
                Ok(()) => {
                    info!("created PersistentVolume {}", desired.name_any());
                    self.events
                        .normal(
                            volume,
                            "VolumeCreated",
                            format!("Created PersistentVolume {}", desired.name_any()),
                        )
                        .await;
                    Ok(())
                }
                // The cache has not caught up with an earlier create yet.
                Err(e) if e.is_conflict() => {
                    debug!(
                        "PersistentVolume {} already exists: {}",
                        desired.name_any(),
                        e
                    );
                    Ok(())
                }
                Err(e) => Err(e),
            },
            Some(current) => {
                let desired_modes = desired.spec.as_ref().and_then(|s| s.access_modes.clone());
                let current_modes = current.spec.as_ref().and_then(|s| s.access_modes.clone());
                if desired_modes != current_modes {
                    let mut updated = current.as_ref().clone();
                    if let Some(spec) = updated.spec.as_mut() {
                        spec.access_modes = desired_modes;
                    }
                    self.client.update_volume(&updated).await?;
                    info!("updated access modes of PersistentVolume {}", updated.name_any());
                }
                let read_only = |pv: &PersistentVolume| {
                    pv.spec
                        .as_ref()
                        .and_then(|s| s.nfs.as_ref())
                        .and_then(|nfs| nfs.read_only)
                };
                if read_only(&desired) != read_only(current.as_ref()) {
                    warn!(
                        "NFS source of PersistentVolume {} is immutable, read only stays {:?}",
                        current.name_any(),
                        read_only(current.as_ref())
                    );
                    self.events
                        .warning(
                            volume,
                            "VolumeSourceImmutable",
                            format!(
                                "PersistentVolume {} keeps its read only flag, recreate the NFSVolume to change it",
                                current.name_any()
                            ),
                        )
                        .await;
                }
                Ok(())
            }
        }
    }

    async fn ensure_claim(&self, volume: &NFSVolume) -> Result<(), ControllerError> {
        let desired = self.desired_claim(volume);
        let namespace = volume.namespace().unwrap_or_default();
        let selector = LabelSelector::eq(APP_LABEL, pvc_app_label(&volume.name_any()));
        let existing = self
            .pvcs
            .list(Some(namespace.as_str()), &selector)
            .into_iter()
            .next();
        match existing {
            None => match self.client.create_claim(&namespace, &desired).await {
                Ok(()) => {
                    info!(
                        "created PersistentVolumeClaim {}/{}",
                        namespace,
                        desired.name_any()
                    );
                    self.events
                        .normal(
                            volume,
                            "ClaimCreated",
                            format!("Created PersistentVolumeClaim {}", desired.name_any()),
                        )
                        .await;
                    Ok(())
                }
                Err(e) if e.is_conflict() => {
                    debug!(
                        "PersistentVolumeClaim {}/{} already exists: {}",
                        namespace,
                        desired.name_any(),
                        e
                    );
                    Ok(())
                }
                Err(e) => Err(e),
            },
            // The API server rejects access mode changes of a claim.
            Some(current) => {
                let desired_modes = desired.spec.as_ref().and_then(|s| s.access_modes.clone());
                let current_modes = current.spec.as_ref().and_then(|s| s.access_modes.clone());
                if desired_modes != current_modes {
                    warn!(
                        "access modes of PersistentVolumeClaim {}/{} are {:?}, wanted {:?}",
                        namespace,
                        current.name_any(),
                        current_modes.unwrap_or_default(),
                        desired_modes.unwrap_or_default()
                    );
                    self.events
                        .warning(
                            volume,
                            "ClaimImmutable",
                            format!(
                                "PersistentVolumeClaim {} keeps its access modes, recreate the NFSVolume to change them",
                                current.name_any()
                            ),
                        )
                        .await;
                }
                Ok(())
            }
        }
    }
}

#[async_trait]
impl Upsert for ProvisionUpsert {
    async fn upsert(&self, volume: &NFSVolume) -> Result<(), ControllerError> {
        self.ensure_volume(volume).await?;
        self.ensure_claim(volume).await
    }
}
