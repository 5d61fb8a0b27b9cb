//! kapply kubehub: client construction and the kube-backed cluster.

#![forbid(unsafe_code)]

use std::marker::PhantomData;
use std::time::Duration;

use anyhow::{Context, Result};
use kapply_core::{Cluster, Object, ObjectApi, RemoteError};
use kube::{
    api::{Api, PostParams},
    config::{KubeConfigOptions, Kubeconfig},
    core::{ApiResource, DynamicObject},
    Client, Config,
};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info};

const FIELD_MANAGER: &str = "kapply";

/// Per-call timeout from `KAPPLY_CALL_TIMEOUT_SECS` (default 10s).
pub fn call_timeout() -> Duration {
    let secs = std::env::var("KAPPLY_CALL_TIMEOUT_SECS")
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .filter(|s| *s > 0)
        .unwrap_or(10);
    Duration::from_secs(secs)
}

/// Build a client for `context`, or for the inferred environment (in-cluster or
/// current kubeconfig context) when `None`.
pub async fn get_kube_client(context: Option<&str>) -> Result<Client> {
    match context {
        Some(ctx) => {
            let opts = KubeConfigOptions { context: Some(ctx.to_string()), ..Default::default() };
            let config = Config::from_kubeconfig(&opts).await.with_context(|| format!("loading kubeconfig context {}", ctx))?;
            info!(context = %ctx, cluster_url = %config.cluster_url, "kube client configured");
            Client::try_from(config).context("building kube client")
        }
        None => {
            let client = Client::try_default().await.context("inferring kube client config")?;
            info!(namespace = client.default_namespace(), "kube client configured");
            Ok(client)
        }
    }
}

/// Name of the kubeconfig's current context, if a kubeconfig is readable.
pub fn current_context() -> Option<String> {
    Kubeconfig::read().ok().and_then(|k| k.current_context)
}

/// [`Cluster`] backed by a live API server.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    timeout: Duration,
    dry_run: bool,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client, timeout: call_timeout(), dry_run: false }
    }

    pub async fn connect(context: Option<&str>) -> Result<Self> {
        Ok(Self::new(get_kube_client(context).await?))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Send creates and updates as server-side dry runs.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run
    }
}

impl Cluster for KubeCluster {
    fn api<K: Object>(&self, namespace: Option<&str>) -> Box<dyn ObjectApi<K>> {
        let ar = ApiResource::erase::<K>(&());
        let api = match namespace {
            Some(ns) if K::namespaced() => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        };
        let pp = PostParams { dry_run: self.dry_run, field_manager: Some(FIELD_MANAGER.to_string()) };
        Box::new(KubeApi::<K> { api, pp, timeout: self.timeout, _kind: PhantomData })
    }
}

struct KubeApi<K> {
    api: Api<DynamicObject>,
    pp: PostParams,
    timeout: Duration,
    _kind: PhantomData<fn() -> K>,
}

/// Await one API call, giving up after `dur` with [`RemoteError::Timeout`].
pub async fn with_timeout<T, F>(dur: Duration, fut: F) -> Result<T, RemoteError>
where
    F: std::future::Future<Output = kube::Result<T>>,
{
    match tokio::time::timeout(dur, fut).await {
        Ok(res) => res.map_err(RemoteError::from),
        Err(_) => Err(RemoteError::Timeout(dur)),
    }
}

fn to_dynamic<T: Serialize>(obj: &T) -> Result<DynamicObject, RemoteError> {
    Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
}

fn from_dynamic<T: DeserializeOwned>(obj: DynamicObject) -> Result<T, RemoteError> {
    Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
}

#[async_trait::async_trait]
impl<K: Object> ObjectApi<K> for KubeApi<K> {
    async fn get(&self, name: &str) -> Result<Option<K>, RemoteError> {
        debug!(kind = %K::kind(&()), name, "get");
        match with_timeout(self.timeout, self.api.get_opt(name)).await? {
            Some(obj) => Ok(Some(from_dynamic(obj)?)),
            None => Ok(None),
        }
    }

    async fn create(&self, obj: &K) -> Result<K, RemoteError> {
        let body = to_dynamic(obj)?;
        debug!(kind = %K::kind(&()), name = ?body.metadata.name, dry_run = self.pp.dry_run, "create");
        from_dynamic(with_timeout(self.timeout, self.api.create(&self.pp, &body)).await?)
    }

    async fn update(&self, obj: &K) -> Result<K, RemoteError> {
        let body = to_dynamic(obj)?;
        let name = body.metadata.name.clone().unwrap_or_default();
        debug!(kind = %K::kind(&()), %name, rv = ?body.metadata.resource_version, dry_run = self.pp.dry_run, "replace");
        from_dynamic(with_timeout(self.timeout, self.api.replace(&name, &self.pp, &body)).await?)
    }
}
