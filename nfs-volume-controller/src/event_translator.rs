use kube::Resource;
use tokio::sync::mpsc::Receiver;
use tokio_util::sync::CancellationToken;

use crate::{
    errors::ControllerError,
    error_sink::ErrorSink,
    informer::{DeletedObject, Notification},
    object_key::ObjectKey,
    work_queue::RateLimitingQueue,
};

const EVENT_TRANSLATOR: &'static str = "event_translator";

/// Turns cache notifications into work queue keys.
pub(crate) struct EventTranslator {
    queue: RateLimitingQueue<ObjectKey>,
    errors: ErrorSink,
}

impl EventTranslator {
    pub fn new(queue: RateLimitingQueue<ObjectKey>, errors: ErrorSink) -> Self {
        Self { queue, errors }
    }

    pub fn on_add<K: Resource>(&self, obj: &K) {
        self.enqueue(ObjectKey::from_object(obj));
    }

    pub fn on_update<K: Resource>(&self, old: &K, new: &K) {
        // Periodic resyncs re-deliver every known object as an update, two
        // different versions of the same object always differ in resourceVersion.
        if old.meta().resource_version == new.meta().resource_version {
            return;
        }
        self.enqueue(ObjectKey::from_object(new));
    }

    pub fn on_delete<K: Resource>(&self, obj: &DeletedObject<K>) {
        let key = match obj {
            DeletedObject::Live(obj) => ObjectKey::from_object(obj.as_ref()),
            DeletedObject::Tombstone(key) => Ok(key.clone()),
        };
        self.enqueue(key);
    }

    pub fn handle<K: Resource>(&self, notification: Notification<K>) {
        match notification {
            Notification::Added(obj) => self.on_add(obj.as_ref()),
            Notification::Updated { old, new } => self.on_update(old.as_ref(), new.as_ref()),
            Notification::Deleted(obj) => self.on_delete(&obj),
        }
    }

    fn enqueue(&self, key: Result<ObjectKey, ControllerError>) {
        match key {
            Ok(key) => {
                trace!("enqueue {}", key);
                self.queue.add_rate_limited(key);
            }
            Err(e) => self.errors.report(EVENT_TRANSLATOR, e),
        }
    }

    /// Translate notifications until the channel closes or `stop` fires.
    pub async fn run<K: Resource>(
        self,
        mut notifications: Receiver<Notification<K>>,
        stop: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                notification = notifications.recv() => match notification {
                    Some(notification) => self.handle(notification),
                    None => break,
                },
            }
        }
        debug!("event translator stopped");
    }
}
