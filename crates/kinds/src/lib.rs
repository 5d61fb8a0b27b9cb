//! kapply kinds: the closed set of resource variants and the dispatch table
//! mapping a kind tag to its decoder and update capability.

#![forbid(unsafe_code)]

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kapply_core::{DecodeCause, KindTag, Object, ScopeExt, SyncError};
use kube::api::ObjectMeta;
use kube::core::TypeMeta;
use kube::Resource as KubeResource;
use serde::de::DeserializeOwned;
use tracing::debug;

pub mod nfd;

pub use nfd::{NodeFeatureDiscovery, NodeFeatureDiscoverySpec};

/// Whether a kind may be updated once it exists on the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdatePolicy {
    /// Replace the object, carrying the freshly read version token.
    Replace,
    /// Leave existing objects alone; only create missing ones.
    Skip,
}

impl UpdatePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdatePolicy::Replace => "replace",
            UpdatePolicy::Skip => "skip",
        }
    }
}

type DecodeFn = fn(&[u8]) -> Result<Resource, DecodeCause>;

/// One row of the dispatch table.
#[derive(Debug, Clone, Copy)]
pub struct KindEntry {
    pub tag: &'static str,
    pub namespaced: bool,
    pub update: UpdatePolicy,
    decode: DecodeFn,
}

impl KindEntry {
    /// Decode a manifest already classified as this entry's kind. All or nothing.
    pub fn decode(&self, bytes: &[u8]) -> Result<Resource, SyncError> {
        (self.decode)(bytes).map_err(|source| SyncError::DecodeError {
            kind: KindTag::new(self.tag),
            len: bytes.len(),
            source,
        })
    }
}

/// Callback over the typed value inside a [`Resource`].
pub trait Visitor {
    type Output;
    fn visit<K: Object>(self, obj: K) -> Self::Output;
}

fn decode_as<K>(bytes: &[u8]) -> Result<Resource, DecodeCause>
where
    K: KubeResource<DynamicType = ()> + DeserializeOwned + Into<Resource>,
{
    // derived custom resource types accept any apiVersion/kind
    let types: TypeMeta = serde_yaml::from_slice(bytes)?;
    let (api_version, kind) = (K::api_version(&()), K::kind(&()));
    if types.api_version != api_version || types.kind != kind {
        return Err(DecodeCause::TypeMismatch {
            expected: format!("{}/{}", api_version, kind),
            found: format!("{}/{}", types.api_version, types.kind),
        });
    }
    let obj: K = serde_yaml::from_slice(bytes)?;
    if obj.meta().name.as_deref().map_or(true, str::is_empty) {
        return Err(DecodeCause::MissingName);
    }
    Ok(obj.into())
}

macro_rules! resources {
    ($($variant:ident($ty:ty) => $policy:expr),+ $(,)?) => {
        /// A decoded manifest, one variant per registered kind.
        #[derive(Debug, Clone, PartialEq)]
        pub enum Resource {
            $($variant($ty)),+
        }

        $(
            impl From<$ty> for Resource {
                fn from(v: $ty) -> Self {
                    Resource::$variant(v)
                }
            }
        )+

        impl Resource {
            pub fn kind(&self) -> &'static str {
                match self {
                    $(Resource::$variant(_) => stringify!($variant)),+
                }
            }

            pub fn meta(&self) -> &ObjectMeta {
                match self {
                    $(Resource::$variant(r) => r.meta()),+
                }
            }

            /// Hand the typed value to `visitor`.
            pub fn accept<V: Visitor>(self, visitor: V) -> V::Output {
                match self {
                    $(Resource::$variant(r) => visitor.visit(r)),+
                }
            }
        }

        /// Dispatch table. Extend by adding a variant above, never by touching dispatch.
        pub static KINDS: &[KindEntry] = &[
            $(KindEntry {
                tag: stringify!($variant),
                namespaced: <<$ty as KubeResource>::Scope as ScopeExt>::NAMESPACED,
                update: $policy,
                decode: decode_as::<$ty>,
            }),+
        ];
    };
}

resources! {
    Namespace(Namespace) => UpdatePolicy::Replace,
    ServiceAccount(ServiceAccount) => UpdatePolicy::Replace,
    ConfigMap(ConfigMap) => UpdatePolicy::Replace,
    ClusterRole(ClusterRole) => UpdatePolicy::Replace,
    ClusterRoleBinding(ClusterRoleBinding) => UpdatePolicy::Replace,
    Role(Role) => UpdatePolicy::Replace,
    RoleBinding(RoleBinding) => UpdatePolicy::Replace,
    CustomResourceDefinition(CustomResourceDefinition) => UpdatePolicy::Replace,
    Deployment(Deployment) => UpdatePolicy::Replace,
    DaemonSet(DaemonSet) => UpdatePolicy::Replace,
    // Custom resources are create-only until update support is decided per kind.
    NodeFeatureDiscovery(NodeFeatureDiscovery) => UpdatePolicy::Skip,
}

/// Find the dispatch entry for a kind tag.
pub fn lookup(tag: &KindTag) -> Option<&'static KindEntry> {
    KINDS.iter().find(|e| e.tag == tag.as_str())
}

/// Look up `tag` and decode `bytes` with its entry.
pub fn decode(tag: &KindTag, bytes: &[u8]) -> Result<(Resource, &'static KindEntry), SyncError> {
    let entry = lookup(tag).ok_or_else(|| SyncError::UnknownKind { kind: tag.clone() })?;
    let resource = entry.decode(bytes)?;
    debug!(kind = %tag, name = ?resource.meta().name, "decoded manifest");
    Ok((resource, entry))
}
