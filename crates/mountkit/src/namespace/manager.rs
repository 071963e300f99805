//! Namespace manager: origin and target handles plus the current pointer.

use std::path::Path;
use std::sync::Arc;

use mountkit_common::{MountError, MountResult};

use super::{NsHandle, NsKind, NsSwitcher, SELF_MNT_NS, SetnsSwitcher};
use crate::cache::SharedCache;

fn ns_error(what: &str, path: Option<&Path>, err: &std::io::Error) -> MountError {
    MountError::Namespace {
        message: match path {
            Some(path) => format!("{what} {}: {err}", path.display()),
            None => format!("{what}: {err}"),
        },
    }
}

/// Tracks the origin and target mount namespaces of a context.
#[derive(Debug)]
pub struct NamespaceManager {
    origin: NsHandle,
    target: NsHandle,
    current: NsKind,
    switcher: Arc<dyn NsSwitcher>,
}

impl Default for NamespaceManager {
    fn default() -> Self {
        Self::new(Arc::new(SetnsSwitcher))
    }
}

impl NamespaceManager {
    /// Create a manager entering namespaces through `switcher`.
    #[must_use]
    pub fn new(switcher: Arc<dyn NsSwitcher>) -> Self {
        Self {
            origin: NsHandle::default(),
            target: NsHandle::default(),
            current: NsKind::Origin,
            switcher,
        }
    }

    /// Replace the namespace-entry strategy.
    pub fn set_switcher(&mut self, switcher: Arc<dyn NsSwitcher>) {
        self.switcher = switcher;
    }

    /// The namespace currently entered.
    #[must_use]
    pub const fn current(&self) -> NsKind {
        self.current
    }

    /// Borrow a handle.
    #[must_use]
    pub const fn handle(&self, kind: NsKind) -> &NsHandle {
        match kind {
            NsKind::Origin => &self.origin,
            NsKind::Target => &self.target,
        }
    }

    fn handle_mut(&mut self, kind: NsKind) -> &mut NsHandle {
        match kind {
            NsKind::Origin => &mut self.origin,
            NsKind::Target => &mut self.target,
        }
    }

    /// Cache of the current namespace.
    pub fn current_cache(&mut self, tag_dir: &Path) -> SharedCache {
        let kind = if self.target.is_set() {
            self.current
        } else {
            NsKind::Origin
        };
        self.handle_mut(kind).cache(tag_dir)
    }

    /// Cache of the origin namespace.
    pub fn set_origin_cache(&mut self, cache: Option<SharedCache>) {
        self.origin.set_cache(cache);
    }

    /// Set (or with `None` clear) the target namespace.
    ///
    /// The namespace is entered once and left again to verify it is usable.
    #[cfg(target_os = "linux")]
    pub fn set_target(&mut self, path: Option<&Path>) -> MountResult<()> {
        let Some(path) = path else {
            if self.current == NsKind::Target {
                self.switch(NsKind::Origin)?;
            }
            self.target = NsHandle::default();
            return Ok(());
        };

        if !self.origin.is_set() {
            let mut origin = NsHandle::open(SELF_MNT_NS)
                .map_err(|e| ns_error("cannot open", Some(Path::new(SELF_MNT_NS)), &e))?;
            origin.set_cache(self.origin.cache.take());
            self.origin = origin;
        }

        let handle = NsHandle::open(path).map_err(|e| ns_error("cannot open", Some(path), &e))?;
        if let Some(fd) = handle.fd() {
            self.switcher
                .enter(fd)
                .map_err(|e| ns_error("cannot enter", Some(path), &e))?;
        }
        if let Some(fd) = self.origin.fd() {
            self.switcher
                .enter(fd)
                .map_err(|e| ns_error("cannot return to", Some(Path::new(SELF_MNT_NS)), &e))?;
        }

        tracing::debug!(path = %path.display(), "Target namespace set");
        self.target = handle;
        Ok(())
    }

    /// Set (or with `None` clear) the target namespace.
    #[cfg(not(target_os = "linux"))]
    pub fn set_target(&mut self, path: Option<&Path>) -> MountResult<()> {
        if path.is_none() {
            return Ok(());
        }
        Err(MountError::Unsupported {
            feature: "mount namespaces".to_string(),
        })
    }

    /// Enter `kind`, returning the previously current namespace.
    ///
    /// Unset handles and the already-current namespace are no-ops.
    pub fn switch(&mut self, kind: NsKind) -> MountResult<NsKind> {
        let previous = self.current;
        if kind == previous {
            return Ok(previous);
        }
        let handle = self.handle(kind);
        let Some(fd) = handle.fd() else {
            return Ok(previous);
        };
        self.switcher
            .enter(fd)
            .map_err(|e| ns_error("cannot enter", handle.path(), &e))?;

        tracing::trace!(?previous, current = ?kind, "Switched namespace");
        self.current = kind;
        Ok(previous)
    }

    /// Duplicate the handles for use by another context.
    pub fn try_clone(&self) -> MountResult<Self> {
        Ok(Self {
            origin: self.origin.try_clone()?,
            target: self.target.try_clone()?,
            current: self.current,
            switcher: Arc::clone(&self.switcher),
        })
    }
}
