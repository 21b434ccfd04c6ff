#[macro_use]
extern crate log;

use std::sync::Arc;

use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use kube_runtime::{
    WatchStreamExt,
    events::{Recorder, Reporter},
    watcher::{self, watcher},
};
use nfs_volume_controller_apis::NFSVolume;
use opentelemetry::global;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use tokio_util::sync::CancellationToken;

mod cache;
mod configuration;
mod controller;
mod error_sink;
mod errors;
mod event_translator;
mod events;
mod informer;
mod object_key;
mod prometheus_exporter;
mod provisioner;
mod rate_limiter;
mod reconciler;
mod shutdown;
#[cfg(test)]
mod test_support;
mod utils;
mod volume_client;
mod work_queue;

use configuration::Configuration;
use controller::{CacheSynced, NfsVolumeController};
use error_sink::{ErrorSink, log_reported_errors};
use event_translator::EventTranslator;
use events::EventPublisher;
use informer::Informer;
use prometheus_exporter::start_prometheus_metrics_server;
use provisioner::ProvisionUpsert;
use rate_limiter::default_controller_rate_limiter;
use reconciler::{ObserveOnly, Reconciler, Upsert};
use shutdown::install_signal_handler;
use volume_client::{KubeVolumeClient, VolumeClient};
use work_queue::RateLimitingQueue;

/// The K8s field manager name.
const MANAGER: &str = "nfs-volume-controller";

/// Capacity of the NFSVolume notification channel.
const NOTIFICATION_BUFFER: usize = 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        debug!("rustls crypto provider already installed");
    }
    let configuration = Configuration::from_env()?;

    let registry = prometheus::Registry::new();
    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(registry.clone())
        .build()?;
    let meter_provider = SdkMeterProvider::builder().with_reader(exporter).build();
    global::set_meter_provider(meter_provider.clone());
    let metrics_addr = configuration.metrics_addr;
    tokio::spawn(async move {
        if let Err(e) = start_prometheus_metrics_server(metrics_addr, registry).await {
            error!("metrics server on {} failed: {}", metrics_addr, e);
        }
    });

    let client = configuration.client().await?;
    let stop = CancellationToken::new();
    let _signals = install_signal_handler(stop.clone())?;

    let (errors, reported) = ErrorSink::new();
    tokio::spawn(log_reported_errors(reported));

    // Caches
    let resync = configuration.resync_period;
    let mut volume_informer = Informer::<NFSVolume>::new("NFSVolume", resync, errors.clone());
    let notifications = volume_informer.subscribe(NOTIFICATION_BUFFER);
    let volumes = volume_informer.cache();
    let pv_informer = Informer::<PersistentVolume>::new("PersistentVolume", resync, errors.clone());
    let pvs = pv_informer.cache();
    let pvc_informer =
        Informer::<PersistentVolumeClaim>::new("PersistentVolumeClaim", resync, errors.clone());
    let pvcs = pvc_informer.cache();

    let volume_events = watcher(
        configuration.nfs_volume_api(client.clone()),
        watcher::Config::default(),
    )
    .default_backoff();
    let pv_events = watcher(
        configuration.persistent_volume_api(client.clone()),
        watcher::Config::default(),
    )
    .default_backoff();
    let pvc_events = watcher(
        configuration.persistent_volume_claim_api(client.clone()),
        watcher::Config::default(),
    )
    .default_backoff();
    tokio::spawn(volume_informer.run(volume_events, stop.clone()));
    tokio::spawn(pv_informer.run(pv_events, stop.clone()));
    tokio::spawn(pvc_informer.run(pvc_events, stop.clone()));

    // Work queue
    let queue = RateLimitingQueue::new(default_controller_rate_limiter(
        &configuration.rate_limiter,
    ));
    let translator = EventTranslator::new(queue.clone(), errors.clone());
    tokio::spawn(translator.run(notifications, stop.clone()));

    // Reconciler
    let events = EventPublisher::new(Recorder::new(
        client.clone(),
        Reporter {
            controller: MANAGER.to_string(),
            instance: None,
        },
    ));
    let volume_client: Arc<dyn VolumeClient> = Arc::new(KubeVolumeClient::new(client));
    let upsert: Arc<dyn Upsert> = match &configuration.nfs_server {
        Some(server) => {
            info!(
                "provisioning NFS volumes from server {} with capacity {}",
                server, configuration.nfs_capacity.0
            );
            Arc::new(ProvisionUpsert::new(
                pvs.clone(),
                pvcs.clone(),
                volume_client.clone(),
                server.clone(),
                configuration.nfs_capacity.clone(),
                events.clone(),
            ))
        }
        None => {
            warn!("NFS_SERVER is not set, NFSVolumes are only observed");
            Arc::new(ObserveOnly)
        }
    };
    let caches = vec![
        CacheSynced::of("NFSVolume", &volumes),
        CacheSynced::of("PersistentVolume", &pvs),
        CacheSynced::of("PersistentVolumeClaim", &pvcs),
    ];
    let reconciler = Reconciler::new(volumes, pvs, pvcs, volume_client, upsert, events);
    let controller = Arc::new(NfsVolumeController::new(
        queue,
        reconciler,
        caches,
        errors,
        configuration.max_retries,
    ));

    info!("start controller ...");
    let result = controller.run(configuration.workers, stop.clone()).await;
    stop.cancel();
    if let Err(e) = meter_provider.shutdown() {
        warn!("failed to shut down meter provider: {}", e);
    }
    result?;
    info!("controller stopped");
    Ok(())
}
