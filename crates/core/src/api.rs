//! Capability seams between the reconciler and a cluster.

use crate::{Object, RemoteError};

/// Typed per-kind operations, already bound to a namespace (or cluster-wide).
#[async_trait::async_trait]
pub trait ObjectApi<K: Object>: Send + Sync {
    /// Fetch the current server copy. `Ok(None)` means not found.
    async fn get(&self, name: &str) -> Result<Option<K>, RemoteError>;

    async fn create(&self, obj: &K) -> Result<K, RemoteError>;

    /// Replace the object; the caller stamps the version token.
    async fn update(&self, obj: &K) -> Result<K, RemoteError>;
}

/// Capability bundle handed to the synchronizer: yields per-kind handles.
pub trait Cluster: Send + Sync {
    /// `namespace` is `Some` for namespaced kinds and `None` for cluster-scoped ones.
    fn api<K: Object>(&self, namespace: Option<&str>) -> Box<dyn ObjectApi<K>>;
}

impl<C: Cluster> Cluster for &C {
    fn api<K: Object>(&self, namespace: Option<&str>) -> Box<dyn ObjectApi<K>> {
        (**self).api(namespace)
    }
}

impl<C: Cluster> Cluster for std::sync::Arc<C> {
    fn api<K: Object>(&self, namespace: Option<&str>) -> Box<dyn ObjectApi<K>> {
        (**self).api(namespace)
    }
}
