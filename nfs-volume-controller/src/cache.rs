use std::{
    collections::BTreeMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use kube::{Resource, ResourceExt};
use kube_runtime::reflector::{ObjectRef, Store};

/// Equality based label selector, all labels must match.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct LabelSelector(BTreeMap<String, String>);

impl LabelSelector {
    pub fn eq(key: &str, value: impl Into<String>) -> Self {
        let mut labels = BTreeMap::new();
        labels.insert(key.to_string(), value.into());
        Self(labels)
    }

    /// Additionally require `key=value`.
    pub fn and(mut self, key: &str, value: impl Into<String>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.0.iter().all(|(k, v)| labels.get(k) == Some(v))
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let terms: Vec<String> = self.0.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        f.write_str(terms.join(",").as_str())
    }
}

/// Read-only view of an eventually consistent local mirror of one resource
/// collection, populated by an [`crate::informer::Informer`].
///
/// Workers never mutate the cache. Mutations go through the API server and are
/// observed back through the watch stream.
pub(crate) struct SharedCache<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    store: Store<K>,
    synced: Arc<AtomicBool>,
}

impl<K> Clone for SharedCache<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            synced: self.synced.clone(),
        }
    }
}

impl<K> SharedCache<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    pub(crate) fn new(store: Store<K>, synced: Arc<AtomicBool>) -> Self {
        Self { store, synced }
    }

    /// Point lookup, use an empty namespace for cluster scoped objects.
    pub fn get(&self, namespace: &str, name: &str) -> Option<Arc<K>> {
        let object_ref = if namespace.is_empty() {
            ObjectRef::<K>::new(name)
        } else {
            ObjectRef::<K>::new(name).within(namespace)
        };
        self.store.get(&object_ref)
    }

    /// All cached objects matching `selector`, optionally restricted to one
    /// namespace, ordered by name.
    pub fn list(&self, namespace: Option<&str>, selector: &LabelSelector) -> Vec<Arc<K>> {
        let mut objects: Vec<Arc<K>> = self
            .store
            .state()
            .into_iter()
            .filter(|o| namespace.map_or(true, |ns| o.namespace().as_deref() == Some(ns)))
            .filter(|o| selector.matches(o.labels()))
            .collect();
        objects.sort_by(|a, b| a.name_any().cmp(&b.name_any()));
        objects
    }

    /// Whether the initial list has been completed.
    pub fn has_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }
}
