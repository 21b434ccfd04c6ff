use std::{
    collections::HashSet,
    fmt::Debug,
    pin::pin,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use futures::{Stream, StreamExt};
use kube::Resource;
use kube_runtime::{
    reflector::{ObjectRef, Store, store::Writer},
    watcher,
};
use tokio::{
    sync::mpsc,
    time::{Instant, Interval, interval_at},
};
use tokio_util::sync::CancellationToken;

use crate::{cache::SharedCache, error_sink::ErrorSink, object_key::ObjectKey};

/// Typed change notification emitted by an [`Informer`].
#[derive(Debug)]
pub(crate) enum Notification<K> {
    Added(Arc<K>),
    Updated { old: Arc<K>, new: Arc<K> },
    Deleted(DeletedObject<K>),
}

/// Payload of a delete notification.
#[derive(Debug)]
pub(crate) enum DeletedObject<K> {
    /// The deleted object as last seen by the watch.
    Live(Arc<K>),
    /// The object vanished during a relist, only its key is known.
    Tombstone(ObjectKey),
}

/// Applies a watch stream to a [`SharedCache`] and turns it into
/// [`Notification`]s.
///
/// Notifications produced while a relist is in flight are held back until the
/// relist is committed to the cache, so consumers always observe a cache which
/// is at least as new as the notification.
pub(crate) struct Informer<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    kind: &'static str,
    writer: Writer<K>,
    reader: Store<K>,
    synced: Arc<AtomicBool>,
    resync_period: Duration,
    subscriber: Option<mpsc::Sender<Notification<K>>>,
    errors: ErrorSink,
    /// Objects seen since the last `Init`, `None` if no relist is in progress.
    relisted: Option<HashSet<ObjectRef<K>>>,
    pending: Vec<Notification<K>>,
}

impl<K> Informer<K>
where
    K: Resource<DynamicType = ()> + Clone + Debug + Send + Sync + 'static,
{
    pub fn new(kind: &'static str, resync_period: Duration, errors: ErrorSink) -> Self {
        let writer: Writer<K> = Default::default();
        let reader = writer.as_reader();
        Self {
            kind,
            writer,
            reader,
            synced: Arc::new(AtomicBool::new(false)),
            resync_period,
            subscriber: None,
            errors,
            relisted: None,
            pending: Default::default(),
        }
    }

    pub fn cache(&self) -> SharedCache<K> {
        SharedCache::new(self.reader.clone(), self.synced.clone())
    }

    /// Receive change notifications, only one subscriber is supported.
    pub fn subscribe(&mut self, capacity: usize) -> mpsc::Receiver<Notification<K>> {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        self.subscriber = Some(sender);
        receiver
    }

    /// Consume `events` until the stream ends or `stop` fires.
    pub async fn run<S>(mut self, events: S, stop: CancellationToken)
    where
        S: Stream<Item = Result<watcher::Event<K>, watcher::Error>>,
    {
        let mut events = pin!(events);
        let mut resync = if self.resync_period.is_zero() {
            None
        } else {
            Some(interval_at(
                Instant::now() + self.resync_period,
                self.resync_period,
            ))
        };
        info!("starting {} informer", self.kind);
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                event = events.next() => match event {
                    Some(Ok(event)) => self.apply(event).await,
                    Some(Err(e)) => self.errors.report(self.kind, format!("watch failed: {}", e)),
                    None => break,
                },
                _ = tick(&mut resync) => self.resync().await,
            }
        }
        info!("stopped {} informer", self.kind);
    }

    async fn apply(&mut self, event: watcher::Event<K>) {
        match &event {
            watcher::Event::Init => {
                debug!("{} informer: relist started", self.kind);
                self.relisted = Some(Default::default());
            }
            watcher::Event::InitApply(obj) => {
                let object_ref = ObjectRef::from_obj(obj);
                let notification = self.changed(&object_ref, obj);
                if let Some(relisted) = self.relisted.as_mut() {
                    relisted.insert(object_ref);
                }
                self.writer.apply_watcher_event(&event);
                self.pending.push(notification);
            }
            watcher::Event::InitDone => {
                let before: Vec<ObjectRef<K>> = self
                    .reader
                    .state()
                    .iter()
                    .map(|o| ObjectRef::from_obj(o.as_ref()))
                    .collect();
                self.writer.apply_watcher_event(&event);
                let relisted = self.relisted.take().unwrap_or_default();
                for gone in before.into_iter().filter(|r| !relisted.contains(r)) {
                    let key = ObjectKey::new(gone.namespace.unwrap_or_default(), gone.name);
                    self.pending
                        .push(Notification::Deleted(DeletedObject::Tombstone(key)));
                }
                if !self.synced.swap(true, Ordering::AcqRel) {
                    info!("{} cache synced", self.kind);
                }
                for notification in std::mem::take(&mut self.pending) {
                    self.notify(notification).await;
                }
            }
            watcher::Event::Apply(obj) => {
                let notification = self.changed(&ObjectRef::from_obj(obj), obj);
                self.writer.apply_watcher_event(&event);
                self.notify(notification).await;
            }
            watcher::Event::Delete(obj) => {
                self.writer.apply_watcher_event(&event);
                self.notify(Notification::Deleted(DeletedObject::Live(Arc::new(
                    obj.clone(),
                ))))
                .await;
            }
        }
    }

    fn changed(&self, object_ref: &ObjectRef<K>, obj: &K) -> Notification<K> {
        let new = Arc::new(obj.clone());
        match self.reader.get(object_ref) {
            Some(old) => Notification::Updated { old, new },
            None => Notification::Added(new),
        }
    }

    /// Re-deliver every cached object as an update to itself.
    async fn resync(&mut self) {
        let objects = self.reader.state();
        debug!("{} informer: resync of {} objects", self.kind, objects.len());
        for obj in objects {
            self.notify(Notification::Updated {
                old: obj.clone(),
                new: obj,
            })
            .await;
        }
    }

    async fn notify(&mut self, notification: Notification<K>) {
        if let Some(subscriber) = &self.subscriber {
            if subscriber.send(notification).await.is_err() {
                debug!("{} informer: subscriber is gone", self.kind);
                self.subscriber = None;
            }
        }
    }
}

async fn tick(resync: &mut Option<Interval>) {
    match resync {
        Some(interval) => {
            interval.tick().await;
        }
        None => futures::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::nfs_volume;
    use futures::stream;
    use kube::ResourceExt;
    use nfs_volume_controller_apis::NFSVolume;

    fn events(
        events: Vec<watcher::Event<NFSVolume>>,
    ) -> impl Stream<Item = Result<watcher::Event<NFSVolume>, watcher::Error>> {
        stream::iter(events.into_iter().map(Ok))
    }

    fn informer() -> Informer<NFSVolume> {
        let (errors, _) = ErrorSink::new();
        Informer::new("NFSVolume", Duration::ZERO, errors)
    }

    fn drain(receiver: &mut mpsc::Receiver<Notification<NFSVolume>>) -> Vec<String> {
        let mut seen = Vec::new();
        while let Ok(notification) = receiver.try_recv() {
            seen.push(match notification {
                Notification::Added(o) => format!("added {}", o.name_any()),
                Notification::Updated { old, new } => format!(
                    "updated {} {}->{}",
                    new.name_any(),
                    old.resource_version().unwrap_or_default(),
                    new.resource_version().unwrap_or_default()
                ),
                Notification::Deleted(DeletedObject::Live(o)) => {
                    format!("deleted {}", o.name_any())
                }
                Notification::Deleted(DeletedObject::Tombstone(key)) => {
                    format!("tombstone {}", key)
                }
            });
        }
        seen
    }

    #[tokio::test]
    async fn initial_list_marks_cache_synced() {
        let mut informer = informer();
        let mut receiver = informer.subscribe(16);
        let cache = informer.cache();
        assert!(!cache.has_synced());
        informer
            .run(
                events(vec![
                    watcher::Event::Init,
                    watcher::Event::InitApply(nfs_volume("ns", "a", "1")),
                    watcher::Event::InitDone,
                ]),
                CancellationToken::new(),
            )
            .await;
        assert!(cache.has_synced());
        assert!(cache.get("ns", "a").is_some());
        assert_eq!(drain(&mut receiver), vec!["added a"]);
    }

    #[tokio::test]
    async fn apply_and_delete_events() {
        let mut informer = informer();
        let mut receiver = informer.subscribe(16);
        let cache = informer.cache();
        informer
            .run(
                events(vec![
                    watcher::Event::Init,
                    watcher::Event::InitDone,
                    watcher::Event::Apply(nfs_volume("ns", "a", "1")),
                    watcher::Event::Apply(nfs_volume("ns", "a", "2")),
                    watcher::Event::Delete(nfs_volume("ns", "a", "3")),
                ]),
                CancellationToken::new(),
            )
            .await;
        assert!(cache.get("ns", "a").is_none());
        assert_eq!(
            drain(&mut receiver),
            vec!["added a", "updated a 1->2", "deleted a"]
        );
    }

    #[tokio::test]
    async fn objects_missing_from_relist_become_tombstones() {
        let mut informer = informer();
        let mut receiver = informer.subscribe(16);
        let cache = informer.cache();
        informer
            .run(
                events(vec![
                    watcher::Event::Init,
                    watcher::Event::InitApply(nfs_volume("ns", "a", "1")),
                    watcher::Event::InitApply(nfs_volume("ns", "b", "1")),
                    watcher::Event::InitDone,
                    // watch desync, relist without `b`
                    watcher::Event::Init,
                    watcher::Event::InitApply(nfs_volume("ns", "a", "5")),
                    watcher::Event::InitDone,
                ]),
                CancellationToken::new(),
            )
            .await;
        assert!(cache.get("ns", "b").is_none());
        assert_eq!(
            cache.get("ns", "a").and_then(|a| a.resource_version()),
            Some("5".to_string())
        );
        assert_eq!(
            drain(&mut receiver),
            vec![
                "added a",
                "added b",
                "updated a 1->5",
                "tombstone ns/b"
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn resync_redelivers_cached_objects_unchanged() {
        let (errors, _) = ErrorSink::new();
        let mut informer = Informer::new("NFSVolume", Duration::from_secs(30), errors);
        let mut receiver = informer.subscribe(16);
        let stop = CancellationToken::new();
        let initial = events(vec![
            watcher::Event::Init,
            watcher::Event::InitApply(nfs_volume("ns", "a", "1")),
            watcher::Event::InitDone,
        ]);
        // keep the stream open so the informer stays alive for the resync
        let events = initial.chain(stream::pending());
        let task = tokio::spawn(informer.run(events, stop.clone()));
        tokio::time::sleep(Duration::from_secs(31)).await;
        stop.cancel();
        task.await.unwrap();
        assert_eq!(drain(&mut receiver), vec!["added a", "updated a 1->1"]);
    }

    #[tokio::test]
    async fn watch_errors_are_reported() {
        let (errors, mut reported) = ErrorSink::new();
        let informer: Informer<NFSVolume> = Informer::new("NFSVolume", Duration::ZERO, errors);
        let failing = stream::iter(vec![Err(watcher::Error::NoResourceVersion)]);
        informer.run(failing, CancellationToken::new()).await;
        let reported = reported.recv().await.unwrap();
        assert_eq!(reported.source, "NFSVolume");
        assert!(reported.message.starts_with("watch failed"));
    }
}
