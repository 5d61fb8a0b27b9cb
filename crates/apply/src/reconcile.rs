//! Idempotent apply for one typed object: lookup, then create or update.
//!
//! Exactly one lookup per object, followed by exactly one of create or update
//! (plus the optional confirmation update after a create). No retries: a
//! create/update that loses a race with another writer fails verbatim.

use futures::future::BoxFuture;
use kapply_core::{Action, Applied, Cluster, Object, ObjectApi, ObjectKey, SyncError};
use kapply_kinds::{UpdatePolicy, Visitor};
use kube::ResourceExt;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileOptions {
    pub update: UpdatePolicy,
    /// Issue one update right after a successful create, carrying the create's token.
    pub confirm_after_create: bool,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self { update: UpdatePolicy::Replace, confirm_after_create: true }
    }
}

pub async fn reconcile<K: Object>(
    api: &dyn ObjectApi<K>,
    mut desired: K,
    opts: ReconcileOptions,
) -> Result<Applied, SyncError> {
    let key = ObjectKey::of(&desired);
    let mut applied = Applied::new(key.clone());

    let existing = match api.get(&key.name).await {
        Ok(found) => found,
        Err(source) => {
            warn!(%key, error = %source, "lookup failed; skipping create/update");
            return Err(SyncError::LookupFailed { key, source });
        }
    };

    match existing {
        None => {
            debug!(%key, "not found; creating");
            // The API rejects creates that carry a version token.
            desired.meta_mut().resource_version = None;
            let created = api
                .create(&desired)
                .await
                .map_err(|source| SyncError::CreateFailed { key: key.clone(), source })?;
            let token = created.resource_version();
            info!(%key, rv = ?token, "created");
            applied.record(Action::Created, token.clone());

            if opts.confirm_after_create && opts.update == UpdatePolicy::Replace {
                desired.meta_mut().resource_version = token;
                let updated = api
                    .update(&desired)
                    .await
                    .map_err(|source| SyncError::UpdateFailed { key: key.clone(), source })?;
                debug!(%key, rv = ?updated.resource_version(), "confirmed after create");
                applied.record(Action::Updated, updated.resource_version());
            }
        }
        Some(existing) => {
            let token = existing.resource_version();
            match opts.update {
                UpdatePolicy::Replace => {
                    desired.meta_mut().resource_version = token;
                    let updated = api
                        .update(&desired)
                        .await
                        .map_err(|source| SyncError::UpdateFailed { key: key.clone(), source })?;
                    info!(%key, rv = ?updated.resource_version(), "updated");
                    applied.record(Action::Updated, updated.resource_version());
                }
                UpdatePolicy::Skip => {
                    warn!(%key, "exists and kind has no update capability; leaving as is");
                    applied.resource_version = token;
                }
            }
        }
    }
    Ok(applied)
}

/// Routes a decoded [`kapply_kinds::Resource`] to [`reconcile`] with a handle of the right scope.
pub(crate) struct Reconcile<'a, C> {
    pub cluster: &'a C,
    pub default_namespace: &'a str,
    pub opts: ReconcileOptions,
}

impl<'a, C: Cluster> Visitor for Reconcile<'a, C> {
    type Output = BoxFuture<'a, Result<Applied, SyncError>>;

    fn visit<K: Object>(self, mut obj: K) -> Self::Output {
        let namespace = if K::namespaced() {
            let meta = obj.meta_mut();
            // An empty namespace is the same as none.
            let ns = match meta.namespace.take().filter(|s| !s.is_empty()) {
                Some(ns) => ns,
                None => self.default_namespace.to_string(),
            };
            meta.namespace = Some(ns.clone());
            Some(ns)
        } else {
            None
        };
        let api = self.cluster.api::<K>(namespace.as_deref());
        let opts = self.opts;
        Box::pin(async move { reconcile(api.as_ref(), obj, opts).await })
    }
}
