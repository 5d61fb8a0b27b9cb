//! Kind classification: find the declared kind of a raw manifest before decoding it.
//!
//! The document is first read through a minimal envelope (kind + metadata only).
//! Partial or otherwise unparsable documents fall back to a line scan for a
//! `kind: <value>` marker; the least indented marker wins so that nested keys
//! such as `roleRef.kind` or a CRD's `names.kind` never shadow the top-level one.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use tracing::debug;

use crate::{KindTag, SyncError};

static KIND_MARKER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?m)^(?P<indent>[ \t\-]*)["']?kind["']?[ \t]*:(?P<value>.*)$"#).expect("kind marker regex")
});

/// Minimal view of a manifest: just enough to route and report it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub metadata: EnvelopeMeta,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct EnvelopeMeta {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
}

/// Extract the kind tag of a manifest.
pub fn classify(bytes: &[u8]) -> Result<KindTag, SyncError> {
    classify_envelope(bytes).map(|(tag, _)| tag)
}

/// Extract the kind tag plus whatever metadata the envelope pass could read.
/// The envelope is empty when the textual fallback was needed.
///
/// The line scan only runs when the document does not parse. A parsed document
/// without a top-level kind is malformed; nested `kind` keys never stand in for it.
pub fn classify_envelope(bytes: &[u8]) -> Result<(KindTag, Envelope), SyncError> {
    #[cfg(test)]
    CLASSIFY_RUNS.with(|n| n.set(n.get() + 1));

    match serde_yaml::from_slice::<Envelope>(bytes) {
        Ok(env) => {
            let tag = env.kind.as_deref().map(str::trim).filter(|k| !k.is_empty()).map(KindTag::new);
            match tag {
                Some(tag) => Ok((tag, env)),
                None => Err(SyncError::MalformedManifest),
            }
        }
        Err(e) => {
            debug!(error = %e, "envelope parse failed; scanning for kind marker");
            scan_kind(&String::from_utf8_lossy(bytes))
                .map(|k| (KindTag::new(k), Envelope::default()))
                .ok_or(SyncError::MalformedManifest)
        }
    }
}

#[cfg(test)]
thread_local! {
    pub(crate) static CLASSIFY_RUNS: std::cell::Cell<usize> = const { std::cell::Cell::new(0) };
}

fn scan_kind(text: &str) -> Option<String> {
    let mut best: Option<(usize, String)> = None;
    for caps in KIND_MARKER.captures_iter(text) {
        let indent = caps.name("indent").map_or(0, |m| m.as_str().len());
        let Some(value) = caps.name("value").and_then(|m| clean_value(m.as_str())) else { continue };
        if best.as_ref().map_or(true, |(d, _)| indent < *d) {
            best = Some((indent, value));
        }
    }
    best.map(|(_, v)| v)
}

fn clean_value(raw: &str) -> Option<String> {
    let mut v = raw.trim();
    if let Some(pos) = v.find(" #").or_else(|| v.find("\t#")) {
        v = v[..pos].trim_end();
    }
    if v.starts_with('#') {
        return None;
    }
    let v = v.trim_end_matches(',').trim();
    let v = v
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .or_else(|| v.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')))
        .unwrap_or(v)
        .trim();
    if v.is_empty() || v.starts_with('{') || v.starts_with('[') {
        None
    } else {
        Some(v.to_string())
    }
}
