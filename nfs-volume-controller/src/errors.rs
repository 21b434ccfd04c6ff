/// Extension methods for Kubernetes API errors.
pub(crate) trait ExtKubeApiError {
    fn is_not_found(&self) -> bool;
    fn is_conflict(&self) -> bool;
    /// The request itself was rejected (400 / 422), resending it cannot succeed.
    fn is_invalid(&self) -> bool;
}

impl ExtKubeApiError for kube::Error {
    fn is_not_found(&self) -> bool {
        match self {
            kube::Error::Api(e) if e.code == 404 || e.code == 410 => true,
            _ => false,
        }
    }

    fn is_conflict(&self) -> bool {
        match self {
            kube::Error::Api(e) if e.code == 409 => true,
            _ => false,
        }
    }

    fn is_invalid(&self) -> bool {
        match self {
            kube::Error::Api(e) if e.code == 400 || e.code == 422 => true,
            _ => false,
        }
    }
}

impl ExtKubeApiError for ControllerError {
    fn is_not_found(&self) -> bool {
        match self {
            ControllerError::KubeApi(e) => e.is_not_found(),
            _ => false,
        }
    }

    fn is_conflict(&self) -> bool {
        match self {
            ControllerError::KubeApi(e) => e.is_conflict(),
            _ => false,
        }
    }

    fn is_invalid(&self) -> bool {
        match self {
            ControllerError::KubeApi(e) => e.is_invalid(),
            _ => false,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum ControllerError {
    /// The stop signal fired before all caches completed their initial list.
    #[error("failed to wait for {0} caches to sync")]
    CacheSync(String),
    /// A watched object (or a string key) does not identify a namespace/name pair.
    #[error("invalid resource key: {0}")]
    InvalidKey(String),
    /// The reconcile handler panicked while processing the given key.
    #[error("reconcile of '{key}' panicked: {message}")]
    Panicked { key: String, message: String },
    /// Invalid process configuration.
    #[error("invalid configuration: {0}")]
    Configuration(String),
    /// Kubernetes API error
    #[error("{0}")]
    KubeApi(#[from] kube::Error),
    /// Any other kind of errors
    #[error("{0}")]
    Any(#[from] anyhow::Error),
}

impl ControllerError {
    /// Whether retrying the same key later might succeed.
    pub(crate) fn is_temporary(&self) -> bool {
        match self {
            ControllerError::InvalidKey(_) | ControllerError::Configuration(_) => false,
            ControllerError::CacheSync(_) => false,
            ControllerError::KubeApi(e) => !e.is_invalid(),
            _ => true,
        }
    }
}
