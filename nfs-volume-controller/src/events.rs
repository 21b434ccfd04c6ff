use std::sync::Arc;

use kube::Resource;
use kube_runtime::events::{Event, EventType, Recorder};
use nfs_volume_controller_apis::NFSVolume;

/// Optional audit trail of controller actions, published as Kubernetes events
/// on the [`NFSVolume`] they relate to.
///
/// Failing to publish is logged and otherwise ignored.
#[derive(Clone, Default)]
pub(crate) struct EventPublisher {
    recorder: Option<Arc<Recorder>>,
}

impl EventPublisher {
    pub fn new(recorder: Recorder) -> Self {
        Self {
            recorder: Some(Arc::new(recorder)),
        }
    }

    pub async fn normal(&self, volume: &NFSVolume, reason: &str, note: String) {
        self.publish(volume, EventType::Normal, reason, note).await
    }

    pub async fn warning(&self, volume: &NFSVolume, reason: &str, note: String) {
        self.publish(volume, EventType::Warning, reason, note).await
    }

    async fn publish(&self, volume: &NFSVolume, type_: EventType, reason: &str, note: String) {
        if let Some(recorder) = &self.recorder {
            let event = Event {
                type_,
                reason: reason.into(),
                note: Some(note),
                action: "Reconcile".into(),
                secondary: None,
            };
            if let Err(e) = recorder.publish(&event, &volume.object_ref(&())).await {
                warn!("failed to publish {} event: {}", reason, e);
            }
        }
    }
}
