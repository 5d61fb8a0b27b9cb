//! Batch synchronizer: classify, decode and reconcile each manifest in order.

use std::borrow::Borrow;
use std::time::Instant;

use kapply_core::{Applied, BatchReport, Cluster, ItemReport, KindTag, Manifest, Outcome, SyncError};
use kapply_kinds::{KindEntry, UpdatePolicy};
use metrics::{counter, histogram};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::reconcile::{Reconcile, ReconcileOptions};

fn env_flag(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => match v.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOptions {
    /// Namespace for namespaced manifests that do not declare one.
    pub default_namespace: String,
    /// Follow every successful create with one update (kept for compatibility).
    pub confirm_after_create: bool,
    /// Opt in to updating kinds registered as create-only.
    pub update_custom_resources: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self { default_namespace: "default".to_string(), confirm_after_create: true, update_custom_resources: false }
    }
}

impl SyncOptions {
    /// Defaults overridden by `KAPPLY_NAMESPACE`, `KAPPLY_CONFIRM_AFTER_CREATE`
    /// and `KAPPLY_UPDATE_CUSTOM_RESOURCES`.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            default_namespace: std::env::var("KAPPLY_NAMESPACE")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(d.default_namespace),
            confirm_after_create: env_flag("KAPPLY_CONFIRM_AFTER_CREATE", d.confirm_after_create),
            update_custom_resources: env_flag("KAPPLY_UPDATE_CUSTOM_RESOURCES", d.update_custom_resources),
        }
    }

    fn reconcile_options(&self, entry: &KindEntry) -> ReconcileOptions {
        let update = match entry.update {
            UpdatePolicy::Skip if self.update_custom_resources => UpdatePolicy::Replace,
            p => p,
        };
        ReconcileOptions { update, confirm_after_create: self.confirm_after_create }
    }
}

/// Applies manifests against the capability bundle `C`, one at a time.
pub struct Synchronizer<C> {
    cluster: C,
    options: SyncOptions,
}

impl<C: Cluster> Synchronizer<C> {
    pub fn new(cluster: C, options: SyncOptions) -> Self {
        Self { cluster, options }
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    pub fn cluster(&self) -> &C {
        &self.cluster
    }

    /// Reconcile a single manifest. Never panics on bad input; every failure lands in the report.
    pub async fn sync_one(&self, manifest: &Manifest) -> ItemReport {
        let t0 = Instant::now();
        let mut kind = None;
        let result = self.process(manifest, &mut kind).await;
        histogram!("sync_item_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        counter!("sync_items_total", 1u64);
        match &result {
            Ok(applied) => {
                match applied.outcome() {
                    Outcome::Created => {
                        counter!("sync_created_total", 1u64);
                    }
                    Outcome::Updated => {
                        counter!("sync_updated_total", 1u64);
                    }
                    Outcome::Unchanged => {
                        counter!("sync_unchanged_total", 1u64);
                    }
                }
                info!(origin = %manifest.origin(), key = %applied.key, outcome = applied.outcome().as_str(), "reconciled");
            }
            Err(e) => {
                counter!("sync_failed_total", 1u64, "reason" => e.reason());
                warn!(origin = %manifest.origin(), kind = ?kind.as_ref().map(KindTag::as_str), reason = e.reason(), error = %e, "manifest failed");
            }
        }
        ItemReport { origin: manifest.origin().to_string(), kind, result }
    }

    async fn process(&self, manifest: &Manifest, kind: &mut Option<KindTag>) -> Result<Applied, SyncError> {
        let tag = manifest.kind()?;
        *kind = Some(tag.clone());
        let (resource, entry) = kapply_kinds::decode(tag, manifest.bytes())?;
        let visitor = Reconcile {
            cluster: &self.cluster,
            default_namespace: &self.options.default_namespace,
            opts: self.options.reconcile_options(entry),
        };
        resource.accept(visitor).await
    }

    /// Process every manifest in input order without stopping on failures.
    pub async fn run<I>(&self, manifests: I) -> BatchReport
    where
        I: IntoIterator,
        I::Item: Borrow<Manifest>,
    {
        self.run_until(manifests, &CancellationToken::new()).await
    }

    /// Like [`Self::run`], but stops issuing calls once `cancel` fires and
    /// returns what was gathered so far.
    pub async fn run_until<I>(&self, manifests: I, cancel: &CancellationToken) -> BatchReport
    where
        I: IntoIterator,
        I::Item: Borrow<Manifest>,
    {
        let mut report = BatchReport::default();
        for manifest in manifests {
            if cancel.is_cancelled() {
                warn!(done = report.items.len(), "sync cancelled; stopping");
                report.cancelled = true;
                break;
            }
            report.items.push(self.sync_one(manifest.borrow()).await);
        }
        let s = report.summary();
        info!(created = s.created, updated = s.updated, unchanged = s.unchanged, failed = s.failed, cancelled = report.cancelled, "sync finished");
        report
    }
}
