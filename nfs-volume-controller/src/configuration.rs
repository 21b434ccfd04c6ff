use std::{fmt::Display, net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

use anyhow::Context;
use k8s_openapi::{
    api::core::v1::{PersistentVolume, PersistentVolumeClaim},
    apimachinery::pkg::api::resource::Quantity,
};
use kube::{
    Api, Client, Config,
    config::{KubeConfigOptions, Kubeconfig},
};
use nfs_volume_controller_apis::NFSVolume;

use crate::{
    controller::DEFAULT_MAX_RETRIES, errors::ControllerError, rate_limiter::RateLimiterConfig,
    utils::env_var,
};

const DEFAULT_RESYNC_INTERVAL_SECS: u64 = 30;
const DEFAULT_NFS_CAPACITY: &str = "1Gi";
const DEFAULT_METRICS_LISTEN_ADDR: &str = "0.0.0.0";
const DEFAULT_METRICS_LISTEN_PORT: &str = "9000";

/// Process configuration, read from environment variables.
#[derive(Clone, Debug)]
pub(crate) struct Configuration {
    /// Explicit kubeconfig file, otherwise the in-cluster or default config is inferred.
    pub kubeconfig: Option<PathBuf>,
    /// Overrides the API server URL of the kubeconfig.
    pub master_url: Option<String>,
    pub workers: usize,
    pub resync_period: Duration,
    pub max_retries: u32,
    /// NFS server exporting the volumes, provisioning is disabled if unset.
    pub nfs_server: Option<String>,
    pub nfs_capacity: Quantity,
    pub metrics_addr: SocketAddr,
    /// Restrict the controller to a single namespace.
    pub watch_namespace: Option<String>,
    pub rate_limiter: RateLimiterConfig,
}

impl Configuration {
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(env_var)
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ControllerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let workers: usize = match lookup("WORKER_COUNT") {
            Some(v) => parse("WORKER_COUNT", &v)?,
            None => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        };
        if workers == 0 {
            return Err(ControllerError::Configuration(
                "WORKER_COUNT must be at least 1".to_string(),
            ));
        }
        let resync_secs: u64 = match lookup("RESYNC_INTERVAL_SECS") {
            Some(v) => parse("RESYNC_INTERVAL_SECS", &v)?,
            None => DEFAULT_RESYNC_INTERVAL_SECS,
        };
        let max_retries: u32 = match lookup("MAX_RETRIES") {
            Some(v) => parse("MAX_RETRIES", &v)?,
            None => DEFAULT_MAX_RETRIES,
        };
        let metrics_addr = format!(
            "{}:{}",
            lookup("METRICS_LISTEN_ADDR").unwrap_or_else(|| DEFAULT_METRICS_LISTEN_ADDR.into()),
            lookup("METRICS_LISTEN_PORT").unwrap_or_else(|| DEFAULT_METRICS_LISTEN_PORT.into())
        );
        let metrics_addr: SocketAddr =
            parse("METRICS_LISTEN_ADDR/METRICS_LISTEN_PORT", &metrics_addr)?;
        Ok(Self {
            kubeconfig: lookup("KUBECONFIG").map(PathBuf::from),
            master_url: lookup("MASTER_URL"),
            workers,
            resync_period: Duration::from_secs(resync_secs),
            max_retries,
            nfs_server: lookup("NFS_SERVER"),
            nfs_capacity: Quantity(
                lookup("NFS_CAPACITY").unwrap_or_else(|| DEFAULT_NFS_CAPACITY.to_string()),
            ),
            metrics_addr,
            watch_namespace: lookup("WATCH_NAMESPACE"),
            rate_limiter: Default::default(),
        })
    }

    /// Build the Kubernetes client from `KUBECONFIG`/`MASTER_URL` or the
    /// inferred (in-cluster or `~/.kube/config`) configuration.
    pub async fn client(&self) -> anyhow::Result<Client> {
        let mut config = match &self.kubeconfig {
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(path)
                    .with_context(|| format!("failed to read kubeconfig {}", path.display()))?;
                Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?
            }
            None => Config::infer().await?,
        };
        if let Some(master_url) = &self.master_url {
            config.cluster_url = master_url
                .parse()
                .with_context(|| format!("invalid MASTER_URL {}", master_url))?;
        }
        info!("connecting to Kubernetes API server {}", config.cluster_url);
        Ok(Client::try_from(config)?)
    }

    pub fn nfs_volume_api(&self, client: Client) -> Api<NFSVolume> {
        match &self.watch_namespace {
            Some(ns) => {
                info!("Controller is only watching NFSVolumes in namespace {}", ns);
                Api::namespaced(client, ns)
            }
            None => {
                info!("Controller is watching NFSVolumes in all namespaces");
                Api::all(client)
            }
        }
    }

    pub fn persistent_volume_api(&self, client: Client) -> Api<PersistentVolume> {
        Api::all(client)
    }

    pub fn persistent_volume_claim_api(&self, client: Client) -> Api<PersistentVolumeClaim> {
        match &self.watch_namespace {
            Some(ns) => Api::namespaced(client, ns),
            None => Api::all(client),
        }
    }
}

fn parse<T>(name: &str, value: &str) -> Result<T, ControllerError>
where
    T: FromStr,
    T::Err: Display,
{
    value
        .parse()
        .map_err(|e| ControllerError::Configuration(format!("{}={}: {}", name, value, e)))
}
