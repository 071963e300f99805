//! Path and device-tag cache.
//!
//! Canonical paths are only meaningful inside the mount namespace they were
//! resolved in, so each namespace handle owns its own cache.

pub mod probe;

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

pub use probe::{FsProber, Probe, SuperblockProber};

use crate::tab::fs::parse_tag;

/// A cache shared between tables and contexts.
pub type SharedCache = Arc<Mutex<Cache>>;

/// Memoized canonical paths, tag lookups and probe results.
#[derive(Debug)]
pub struct Cache {
    tag_dir: PathBuf,
    paths: HashMap<String, Option<String>>,
    tags: HashMap<(String, String), Option<String>>,
    probes: HashMap<String, Probe>,
}

impl Cache {
    /// Create a cache resolving tags below `tag_dir` (normally `/dev/disk`).
    #[must_use]
    pub fn new(tag_dir: impl Into<PathBuf>) -> Self {
        Self {
            tag_dir: tag_dir.into(),
            paths: HashMap::new(),
            tags: HashMap::new(),
            probes: HashMap::new(),
        }
    }

    /// Wrap into a shared handle.
    #[must_use]
    pub fn shared(self) -> SharedCache {
        Arc::new(Mutex::new(self))
    }

    /// Canonical form of `path`, or `None` if it does not exist.
    pub fn resolve_path(&mut self, path: &str) -> Option<String> {
        if let Some(cached) = self.paths.get(path) {
            return cached.clone();
        }
        let resolved = std::fs::canonicalize(path)
            .ok()
            .map(|p| p.to_string_lossy().into_owned());
        tracing::trace!(path, ?resolved, "Canonicalized path");
        self.paths.insert(path.to_string(), resolved.clone());
        resolved
    }

    /// Device path for a `name=value` tag.
    pub fn resolve_tag(&mut self, name: &str, value: &str) -> Option<String> {
        let key = (name.to_string(), value.to_string());
        if let Some(cached) = self.tags.get(&key) {
            return cached.clone();
        }
        let resolved = tag_subdir(name)
            .map(|dir| self.tag_dir.join(dir).join(encode_tag_value(value)))
            .and_then(|link| std::fs::canonicalize(link).ok())
            .map(|p| p.to_string_lossy().into_owned());
        tracing::trace!(name, value, ?resolved, "Resolved tag");
        self.tags.insert(key, resolved.clone());
        resolved
    }

    /// Resolve a source that is either a tag or a path.
    pub fn resolve_spec(&mut self, spec: &str) -> Option<String> {
        match parse_tag(spec) {
            Some((name, value)) => self.resolve_tag(name, value),
            None => self.resolve_path(spec),
        }
    }

    /// Probe `device` once and remember the answer.
    pub fn probe(&mut self, device: &str, prober: &dyn FsProber) -> io::Result<Probe> {
        if let Some(cached) = self.probes.get(device) {
            return Ok(cached.clone());
        }
        let probe = prober.probe(Path::new(device))?;
        self.probes.insert(device.to_string(), probe.clone());
        Ok(probe)
    }
}

impl Default for Cache {
    fn default() -> Self {
        Self::new(mountkit_common::paths::TAG_DIR.clone())
    }
}

fn tag_subdir(name: &str) -> Option<&'static str> {
    Some(match name {
        "UUID" => "by-uuid",
        "LABEL" => "by-label",
        "PARTUUID" => "by-partuuid",
        "PARTLABEL" => "by-partlabel",
        "ID" => "by-id",
        _ => return None,
    })
}

/// udev-style encoding of a tag value used as a symlink name.
fn encode_tag_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        if byte.is_ascii_alphanumeric() || b"#+-.:=@_".contains(&byte) {
            out.push(char::from(byte));
        } else {
            out.push_str(&format!("\\x{byte:02x}"));
        }
    }
    out
}
