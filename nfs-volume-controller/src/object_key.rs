use std::fmt;

use kube::{Resource, ResourceExt};

use crate::errors::ControllerError;

/// Work queue item, `{namespace}/{name}` of a watched object.
///
/// Cluster scoped objects have an empty namespace and render as just `{name}`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Derive the key of a watched object, fails for objects without a name.
    pub fn from_object<K: Resource>(obj: &K) -> Result<Self, ControllerError> {
        match obj.meta().name.as_deref() {
            Some(name) if !name.is_empty() => Ok(Self {
                namespace: obj.namespace().unwrap_or_default(),
                name: name.to_string(),
            }),
            _ => Err(ControllerError::InvalidKey(format!(
                "object without name (uid {})",
                obj.uid().unwrap_or_default()
            ))),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}
