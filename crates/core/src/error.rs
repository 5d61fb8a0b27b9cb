use std::time::Duration;

use crate::{KindTag, ObjectKey};

/// Failure of a single remote call (lookup, create or update).
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error(transparent)]
    Kube(#[from] kube::Error),
    #[error("call timed out after {0:?}")]
    Timeout(Duration),
    #[error("converting object: {0}")]
    Convert(#[from] serde_json::Error),
}

impl RemoteError {
    /// HTTP status code reported by the API server, if any.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            RemoteError::Kube(kube::Error::Api(resp)) => Some(resp.code),
            _ => None,
        }
    }
}

/// Why a manifest could not be decoded into its typed resource.
#[derive(Debug, thiserror::Error)]
pub enum DecodeCause {
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
    #[error("metadata.name is missing or empty")]
    MissingName,
    #[error("expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },
}

/// Per-manifest synchronization failure. Every variant is scoped to one manifest.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("no kind marker found in manifest")]
    MalformedManifest,

    #[error("unknown kind {kind}")]
    UnknownKind { kind: KindTag },

    #[error("decoding {kind} manifest ({len} bytes): {source}")]
    DecodeError {
        kind: KindTag,
        len: usize,
        #[source]
        source: DecodeCause,
    },

    #[error("looking up {key}: {source}")]
    LookupFailed {
        key: ObjectKey,
        #[source]
        source: RemoteError,
    },

    #[error("creating {key}: {source}")]
    CreateFailed {
        key: ObjectKey,
        #[source]
        source: RemoteError,
    },

    #[error("updating {key}: {source}")]
    UpdateFailed {
        key: ObjectKey,
        #[source]
        source: RemoteError,
    },
}

impl SyncError {
    /// Stable taxonomy name, used in reports and metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            SyncError::MalformedManifest => "MalformedManifest",
            SyncError::UnknownKind { .. } => "UnknownKind",
            SyncError::DecodeError { .. } => "DecodeError",
            SyncError::LookupFailed { .. } => "LookupFailed",
            SyncError::CreateFailed { .. } => "CreateFailed",
            SyncError::UpdateFailed { .. } => "UpdateFailed",
        }
    }

    /// Object the failure refers to, when the manifest got far enough to have one.
    pub fn key(&self) -> Option<&ObjectKey> {
        match self {
            SyncError::LookupFailed { key, .. }
            | SyncError::CreateFailed { key, .. }
            | SyncError::UpdateFailed { key, .. } => Some(key),
            _ => None,
        }
    }
}
