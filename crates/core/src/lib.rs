//! kapply core types: manifests, kind tags, object keys and reconciliation outcomes.

#![forbid(unsafe_code)]

use std::fmt;

use k8s_openapi::{ClusterResourceScope, NamespaceResourceScope};
use kube::ResourceExt;
use once_cell::sync::OnceCell;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use smallvec::SmallVec;

pub mod api;
pub mod classify;
pub mod error;

pub use api::{Cluster, ObjectApi};
pub use classify::{classify, classify_envelope, Envelope};
pub use error::{DecodeCause, RemoteError, SyncError};

pub mod prelude {
    pub use super::{
        Action, Applied, BatchReport, Cluster, ItemReport, KindTag, Manifest, Object, ObjectApi, ObjectKey, Outcome,
        RemoteError, Summary, SyncError,
    };
}

/// One serialized resource document as read from the source, plus where it came from.
#[derive(Debug, Clone)]
pub struct Manifest {
    origin: String,
    bytes: Vec<u8>,
    /// Classifier result, computed on first use. `None` means malformed.
    kind: OnceCell<Option<KindTag>>,
}

impl Manifest {
    pub fn new(origin: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self { origin: origin.into(), bytes: bytes.into(), kind: OnceCell::new() }
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Kind tag of this manifest. Classified once; later calls reuse the result.
    pub fn kind(&self) -> Result<&KindTag, SyncError> {
        self.kind
            .get_or_init(|| classify(&self.bytes).ok())
            .as_ref()
            .ok_or(SyncError::MalformedManifest)
    }
}

impl PartialEq for Manifest {
    fn eq(&self, other: &Self) -> bool {
        self.origin == other.origin && self.bytes == other.bytes
    }
}

impl Eq for Manifest {}

/// Declared kind of a manifest, e.g. `Namespace` or `ClusterRoleBinding`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KindTag(String);

impl KindTag {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KindTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for KindTag {
    fn from(v: &str) -> Self {
        Self(v.to_string())
    }
}

/// Address of a single object: kind, optional namespace and name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectKey {
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn of<K: Object>(obj: &K) -> Self {
        Self { kind: K::kind(&()).into_owned(), namespace: obj.namespace(), name: obj.name_any() }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.kind, ns, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}

/// Scope marker mapping the k8s-openapi scope types to a plain flag.
pub trait ScopeExt {
    const NAMESPACED: bool;
}

impl ScopeExt for NamespaceResourceScope {
    const NAMESPACED: bool = true;
}

impl ScopeExt for ClusterResourceScope {
    const NAMESPACED: bool = false;
}

/// A typed, statically known Kubernetes kind that kapply can reconcile.
pub trait Object:
    kube::Resource<DynamicType = ()> + Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    fn namespaced() -> bool;
}

impl<K> Object for K
where
    K: kube::Resource<DynamicType = ()> + Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static,
    <K as kube::Resource>::Scope: ScopeExt,
{
    fn namespaced() -> bool {
        <<K as kube::Resource>::Scope as ScopeExt>::NAMESPACED
    }
}

/// Remote write performed while reconciling one object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    Created,
    Updated,
}

/// Summary outcome of a successful reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Created,
    Updated,
    /// Object exists and its kind has no registered update capability.
    Unchanged,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Created => "created",
            Outcome::Updated => "updated",
            Outcome::Unchanged => "unchanged",
        }
    }
}

/// Record of a successful reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Applied {
    pub key: ObjectKey,
    /// Writes in the order they were issued.
    pub actions: SmallVec<[Action; 2]>,
    /// Last version token returned by the server for this object.
    pub resource_version: Option<String>,
}

impl Applied {
    pub fn new(key: ObjectKey) -> Self {
        Self { key, actions: SmallVec::new(), resource_version: None }
    }

    pub fn record(&mut self, action: Action, resource_version: Option<String>) {
        self.actions.push(action);
        self.resource_version = resource_version;
    }

    pub fn outcome(&self) -> Outcome {
        if self.actions.contains(&Action::Created) {
            Outcome::Created
        } else if self.actions.contains(&Action::Updated) {
            Outcome::Updated
        } else {
            Outcome::Unchanged
        }
    }
}

/// Reconciliation result for one manifest of a batch.
#[derive(Debug)]
pub struct ItemReport {
    pub origin: String,
    /// Set once the manifest has been classified.
    pub kind: Option<KindTag>,
    pub result: Result<Applied, SyncError>,
}

impl ItemReport {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }

    /// Stable status label: outcome name on success, error reason on failure.
    pub fn status(&self) -> &'static str {
        match &self.result {
            Ok(applied) => applied.outcome().as_str(),
            Err(e) => e.reason(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub failed: usize,
}

/// Aggregated results of one synchronization run, in input order.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub items: Vec<ItemReport>,
    /// True when the run stopped early because it was cancelled.
    pub cancelled: bool,
}

impl BatchReport {
    pub fn summary(&self) -> Summary {
        let mut s = Summary::default();
        for item in &self.items {
            match &item.result {
                Ok(applied) => match applied.outcome() {
                    Outcome::Created => s.created += 1,
                    Outcome::Updated => s.updated += 1,
                    Outcome::Unchanged => s.unchanged += 1,
                },
                Err(_) => s.failed += 1,
            }
        }
        s
    }

    pub fn failures(&self) -> impl Iterator<Item = (&ItemReport, &SyncError)> {
        self.items.iter().filter_map(|i| i.result.as_ref().err().map(|e| (i, e)))
    }

    pub fn is_success(&self) -> bool {
        !self.cancelled && self.items.iter().all(ItemReport::is_ok)
    }
}
