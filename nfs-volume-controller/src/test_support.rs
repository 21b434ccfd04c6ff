//! Fixtures shared by the unit tests.

use std::{
    collections::BTreeMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::anyhow;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use kube::{Resource, ResourceExt};
use kube_runtime::{reflector::store::Writer, watcher};
use nfs_volume_controller_apis::{
    APP_LABEL, NAMESPACE_LABEL, NFSVolume, NFSVolumeSpec, VolumeAccessMode,
};
use tokio::time::Instant;

use crate::{
    cache::SharedCache, errors::ControllerError, object_key::ObjectKey, reconciler::Upsert,
    volume_client::VolumeClient,
};

pub(crate) fn nfs_volume(namespace: &str, name: &str, resource_version: &str) -> NFSVolume {
    let mut volume = NFSVolume::new(
        name,
        NFSVolumeSpec {
            path: format!("/exports/{}", name),
            access_mode: VolumeAccessMode::ReadWriteMany,
        },
    );
    volume.metadata.namespace = Some(namespace.to_string());
    volume.metadata.resource_version = Some(resource_version.to_string());
    volume
}

fn app_labels(app: &str) -> Option<BTreeMap<String, String>> {
    let mut labels = BTreeMap::new();
    labels.insert(APP_LABEL.to_string(), app.to_string());
    Some(labels)
}

/// A PersistentVolume derived from an NFSVolume in `owner_namespace`.
pub(crate) fn persistent_volume(name: &str, owner_namespace: &str, app: &str) -> PersistentVolume {
    let mut pv = PersistentVolume::default();
    pv.metadata.name = Some(name.to_string());
    let mut labels = app_labels(app).unwrap_or_default();
    labels.insert(NAMESPACE_LABEL.to_string(), owner_namespace.to_string());
    pv.metadata.labels = Some(labels);
    pv
}

pub(crate) fn persistent_volume_claim(
    namespace: &str,
    name: &str,
    app: &str,
) -> PersistentVolumeClaim {
    let mut pvc = PersistentVolumeClaim::default();
    pvc.metadata.name = Some(name.to_string());
    pvc.metadata.namespace = Some(namespace.to_string());
    pvc.metadata.labels = app_labels(app);
    pvc
}

/// A cache which completed its initial list with `objects`.
pub(crate) fn synced_cache<K>(objects: Vec<K>) -> SharedCache<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    let (cache, _writer) = writable_cache(objects, true);
    cache
}

/// A cache together with the writer feeding it.
pub(crate) fn writable_cache<K>(objects: Vec<K>, synced: bool) -> (SharedCache<K>, CacheWriter<K>)
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    let mut writer: Writer<K> = Default::default();
    for obj in objects {
        writer.apply_watcher_event(&watcher::Event::Apply(obj));
    }
    let synced = Arc::new(AtomicBool::new(synced));
    let cache = SharedCache::new(writer.as_reader(), synced.clone());
    (
        cache,
        CacheWriter {
            writer: Mutex::new(writer),
            synced,
        },
    )
}

pub(crate) struct CacheWriter<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    writer: Mutex<Writer<K>>,
    synced: Arc<AtomicBool>,
}

impl<K> CacheWriter<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    pub fn apply(&self, obj: K) {
        self.writer
            .lock()
            .unwrap()
            .apply_watcher_event(&watcher::Event::Apply(obj));
    }

    pub fn delete(&self, obj: K) {
        self.writer
            .lock()
            .unwrap()
            .apply_watcher_event(&watcher::Event::Delete(obj));
    }

    pub fn mark_synced(&self) {
        self.synced.store(true, Ordering::Release);
    }
}

/// Mutation recorded by [`FakeCluster`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Call {
    CreateVolume(String),
    UpdateVolume(String),
    DeleteVolume(String),
    CreateClaim(String, String),
    DeleteClaim(String, String),
}

/// In-memory [`VolumeClient`], successful mutations are reflected into the
/// PV/PVC caches like a watch would.
pub(crate) struct FakeCluster {
    pvs: SharedCache<PersistentVolume>,
    pv_writer: CacheWriter<PersistentVolume>,
    pvcs: SharedCache<PersistentVolumeClaim>,
    pvc_writer: CacheWriter<PersistentVolumeClaim>,
    calls: Mutex<Vec<Call>>,
    failing: AtomicBool,
}

impl Default for FakeCluster {
    fn default() -> Self {
        Self::with(vec![], vec![])
    }
}

impl FakeCluster {
    pub fn with(pvs: Vec<PersistentVolume>, pvcs: Vec<PersistentVolumeClaim>) -> Self {
        let (pvs, pv_writer) = writable_cache(pvs, true);
        let (pvcs, pvc_writer) = writable_cache(pvcs, true);
        Self {
            pvs,
            pv_writer,
            pvcs,
            pvc_writer,
            calls: Default::default(),
            failing: AtomicBool::new(false),
        }
    }

    pub fn pvs(&self) -> SharedCache<PersistentVolume> {
        self.pvs.clone()
    }

    pub fn pvcs(&self) -> SharedCache<PersistentVolumeClaim> {
        self.pvcs.clone()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// Make every following mutation fail with a transient error.
    pub fn fail_mutations(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn record(&self, call: Call) -> Result<(), ControllerError> {
        self.calls.lock().unwrap().push(call);
        if self.failing.load(Ordering::SeqCst) {
            Err(anyhow!("connection refused").into())
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl VolumeClient for FakeCluster {
    async fn create_volume(&self, pv: &PersistentVolume) -> Result<(), ControllerError> {
        self.record(Call::CreateVolume(pv.name_any()))?;
        self.pv_writer.apply(pv.clone());
        Ok(())
    }

    async fn update_volume(&self, pv: &PersistentVolume) -> Result<(), ControllerError> {
        self.record(Call::UpdateVolume(pv.name_any()))?;
        self.pv_writer.apply(pv.clone());
        Ok(())
    }

    async fn delete_volume(&self, name: &str) -> Result<(), ControllerError> {
        self.record(Call::DeleteVolume(name.to_string()))?;
        if let Some(pv) = self.pvs.get("", name) {
            self.pv_writer.delete(pv.as_ref().clone());
        }
        Ok(())
    }

    async fn create_claim(
        &self,
        namespace: &str,
        pvc: &PersistentVolumeClaim,
    ) -> Result<(), ControllerError> {
        self.record(Call::CreateClaim(namespace.to_string(), pvc.name_any()))?;
        self.pvc_writer.apply(pvc.clone());
        Ok(())
    }

    async fn delete_claim(&self, namespace: &str, name: &str) -> Result<(), ControllerError> {
        self.record(Call::DeleteClaim(namespace.to_string(), name.to_string()))?;
        if let Some(pvc) = self.pvcs.get(namespace, name) {
            self.pvc_writer.delete(pvc.as_ref().clone());
        }
        Ok(())
    }
}

/// [`Upsert`] stub recording its invocations.
#[derive(Default)]
pub(crate) struct RecordingUpsert {
    calls: Mutex<Vec<(ObjectKey, String, Instant)>>,
    failures_remaining: AtomicU32,
    panics_remaining: AtomicU32,
    delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl RecordingUpsert {
    /// Fail the first `failures` invocations with a transient error.
    pub fn failing(failures: u32) -> Self {
        Self {
            failures_remaining: AtomicU32::new(failures),
            ..Default::default()
        }
    }

    /// Panic on the first `panics` invocations.
    pub fn panicking(panics: u32) -> Self {
        Self {
            panics_remaining: AtomicU32::new(panics),
            ..Default::default()
        }
    }

    /// Take `delay` for every invocation.
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<ObjectKey> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(k, _, _)| k.clone())
            .collect()
    }

    pub fn paths(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(_, p, _)| p.clone())
            .collect()
    }

    pub fn call_times(&self) -> Vec<Instant> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(_, _, t)| *t)
            .collect()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl Upsert for RecordingUpsert {
    async fn upsert(&self, volume: &NFSVolume) -> Result<(), ControllerError> {
        let key = ObjectKey::from_object(volume)?;
        self.calls
            .lock()
            .unwrap()
            .push((key.clone(), volume.spec.path.clone(), Instant::now()));
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if take_one(&self.panics_remaining) {
            panic!("upsert of {} exploded", key);
        }
        if take_one(&self.failures_remaining) {
            return Err(anyhow!("transient failure for {}", key).into());
        }
        Ok(())
    }
}
