//! kapply source: load manifests from a directory tree.

#![forbid(unsafe_code)]

use std::path::Path;

use anyhow::{Context, Result};
use kapply_core::Manifest;
use tracing::{debug, info};
use walkdir::WalkDir;

/// Read every regular file under `root`, recursively, in lexical file-name
/// order. Each file is one manifest; no extension filter is applied.
pub fn load_dir(root: impl AsRef<Path>) -> Result<Vec<Manifest>> {
    let root = root.as_ref();
    let mut out = Vec::new();
    for entry in WalkDir::new(root).follow_links(true).sort_by_file_name() {
        let entry = entry.with_context(|| format!("walking {}", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        debug!(path = %path.display(), len = bytes.len(), "manifest loaded");
        out.push(Manifest::new(path.display().to_string(), bytes));
    }
    info!(root = %root.display(), count = out.len(), "manifests loaded");
    Ok(out)
}

/// Apply rank of a kind: prerequisites first. Unclassifiable manifests go last.
pub fn apply_rank(manifest: &Manifest) -> u8 {
    let Ok(tag) = manifest.kind() else { return u8::MAX };
    match tag.as_str() {
        "Namespace" => 0,
        "CustomResourceDefinition" => 1,
        "ServiceAccount" | "ClusterRole" | "Role" => 2,
        "ClusterRoleBinding" | "RoleBinding" => 3,
        "ConfigMap" | "Secret" => 4,
        _ => 5,
    }
}

/// Stable pre-sort so that prerequisites are created before their dependents.
/// Manifests of equal rank keep their relative order. The kind tag computed
/// here is cached on each manifest and reused by the synchronizer.
pub fn sort_for_apply(manifests: &mut [Manifest]) {
    manifests.sort_by_cached_key(apply_rank);
}
