use std::fmt;

use kube::CustomResource;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const API_GROUP: &'static str = "samplecrd.k8s.io";

/// Label key used to link derived `PersistentVolume` and `PersistentVolumeClaim`
/// objects back to the owning [`NFSVolume`].
pub const APP_LABEL: &'static str = "app";

/// Label key carrying the namespace of the [`NFSVolume`] owning a (cluster scoped)
/// `PersistentVolume`, the [`APP_LABEL`] alone is only unique per namespace.
pub const NAMESPACE_LABEL: &'static str = "nfs-volume-namespace";

/// Value of the [`APP_LABEL`] on the `PersistentVolume` derived from the [`NFSVolume`] `name`.
pub fn pv_app_label(name: &str) -> String {
    format!("{}_pv", name)
}

/// Value of the [`APP_LABEL`] on the `PersistentVolumeClaim` derived from the [`NFSVolume`] `name`.
pub fn pvc_app_label(name: &str) -> String {
    format!("{}_pvc", name)
}

/// An NFS export which should be made available to workloads as a
/// `PersistentVolume` / `PersistentVolumeClaim` pair.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "samplecrd.k8s.io",
    version = "v1",
    kind = "NFSVolume",
    plural = "nfsvolumes",
    shortname = "nv",
    derive = "PartialEq",
    status = "VolumeStatus",
    namespaced,
    printcolumn = r#"{
        "name":"Path",
        "type": "string",
        "jsonPath": ".spec.path",
        "description": "The exported NFS path."
    }"#,
    printcolumn = r#"{
        "name":"AccessMode",
        "type": "string",
        "jsonPath": ".spec.access_mode",
        "description": "Access mode of the provisioned volume."
    }"#,
    printcolumn = r#"{
        "name":"Phase",
        "type": "string",
        "jsonPath": ".status.phase",
        "description": "Last known reconciliation phase."
    }"#
)]
pub struct NFSVolumeSpec {
    /// The path exported by the NFS server.
    pub path: String,
    /// How the volume may be mounted.
    #[serde(default)]
    pub access_mode: VolumeAccessMode,
}

/// Last known reconciliation outcome.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Default, JsonSchema)]
pub struct VolumeStatus {
    pub phase: String,
    pub msg: String,
}

/// Volume access modes, spelled exactly like the Kubernetes `accessModes` values.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, JsonSchema)]
pub enum VolumeAccessMode {
    ReadWriteOnce,
    ReadOnlyMany,
    ReadWriteMany,
}

impl Default for VolumeAccessMode {
    fn default() -> Self {
        Self::ReadWriteOnce
    }
}

impl VolumeAccessMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            VolumeAccessMode::ReadWriteOnce => "ReadWriteOnce",
            VolumeAccessMode::ReadOnlyMany => "ReadOnlyMany",
            VolumeAccessMode::ReadWriteMany => "ReadWriteMany",
        }
    }

    pub fn is_read_only(&self) -> bool {
        *self == VolumeAccessMode::ReadOnlyMany
    }
}

impl fmt::Display for VolumeAccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
