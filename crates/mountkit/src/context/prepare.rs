//! Source, target and filesystem type preparation.

use std::fmt;
use std::os::unix::fs::DirBuilderExt;
use std::path::Path;
use std::sync::Arc;

use mountkit_common::{MountError, MountResult};

use super::{Action, Context};
use crate::cache::Probe;
use crate::namespace::NsKind;
use crate::options::{MapId, ms};
use crate::tab::fs::{is_network_source, match_fstype, parse_tag};

const DEFAULT_MKDIR_MODE: u32 = 0o755;

/// A source preparation step, such as loop or verity device setup.
///
/// Hooks run after the source has been resolved and may replace it.
pub trait SourceHook: Send + Sync + fmt::Debug {
    /// Name used in logs and errors.
    fn name(&self) -> &str;

    /// Prepare the source of `cxt`.
    fn prepare(&self, cxt: &mut Context) -> MountResult<()>;
}

impl Context {
    fn nocanonicalize_for(&self, role: &str) -> bool {
        if self.behavior.nocanonicalize {
            return true;
        }
        self.optlist
            .get_named("X-mount.nocanonicalize")
            .is_some_and(|opt| opt.unquoted_value().is_none_or(|v| v.is_empty() || v == role))
    }

    /// Resolve the source into something mountable.
    pub fn prepare_srcpath(&mut self) -> MountResult<()> {
        if self.fs.source.is_none() && self.is_propagation_only() {
            self.set_source(Some("none"));
            return Ok(());
        }
        let Some(source) = self.fs.source.clone() else {
            return Ok(());
        };
        if is_network_source(&source) || self.fs.is_netfs() || self.fs.is_dataset() {
            tracing::debug!(source, "Source is not a path");
            return Ok(());
        }

        self.in_namespace(NsKind::Target, |ctx| {
            let cache = ctx.get_cache();
            if let Some((name, value)) = parse_tag(&source) {
                let device = cache
                    .lock()
                    .resolve_tag(name, value)
                    .ok_or_else(|| MountError::NoSource {
                        spec: source.clone(),
                    })?;
                tracing::debug!(source, device, "Resolved tag");
                ctx.fs_mut().source = Some(device);
            } else if !ctx.nocanonicalize_for("source") && !ctx.fs.is_pseudofs() {
                let resolved = cache.lock().resolve_path(&source);
                if let Some(path) = resolved.filter(|path| *path != source) {
                    tracing::debug!(source, path, "Canonicalized source");
                    ctx.fs_mut().source = Some(path);
                }
            }
            Ok(())
        })?;

        let flags = self.get_flags(MapId::Linux);
        if flags & (ms::BIND | ms::MOVE | ms::REMOUNT) != 0
            || self.fs.is_pseudofs()
            || self.is_propagation_only()
        {
            return Ok(());
        }

        let hooks: Vec<Arc<dyn SourceHook>> = self.source_hooks.clone();
        for hook in hooks {
            tracing::debug!(hook = hook.name(), "Running source hook");
            hook.prepare(self).map_err(|err| match err {
                MountError::SourcePreparation { .. } => err,
                other => MountError::SourcePreparation {
                    message: format!("{}: {other}", hook.name()),
                },
            })?;
        }
        Ok(())
    }

    /// Resolve and possibly create the mountpoint.
    pub fn prepare_target(&mut self) -> MountResult<()> {
        let Some(mut target) = self.fs.target.clone() else {
            return Ok(());
        };
        if let Some(prefix) = &self.target_prefix {
            target = Path::new(prefix)
                .join(target.trim_start_matches('/'))
                .to_string_lossy()
                .into_owned();
            tracing::debug!(target, "Applied target prefix");
            self.fs_mut().target = Some(target.clone());
        }

        self.in_namespace(NsKind::Target, |ctx| {
            if ctx.action == Some(Action::Mount) {
                ctx.mkdir_target(&target)?;
            }
            if !ctx.nocanonicalize_for("target") {
                let resolved = ctx.get_cache().lock().resolve_path(&target);
                if let Some(path) = resolved.filter(|path| *path != target) {
                    tracing::debug!(target, path, "Canonicalized target");
                    ctx.fs_mut().target = Some(path);
                }
            }
            Ok(())
        })?;

        if let Some(subdir) = self.named_value("X-mount.subdir") {
            let subdir = subdir.trim_start_matches('/');
            if subdir.is_empty() {
                return Err(MountError::MountOptions {
                    message: "X-mount.subdir requires a directory".to_string(),
                });
            }
            self.subdir = Some(subdir.to_string());
        }
        Ok(())
    }

    fn mkdir_target(&self, target: &str) -> MountResult<()> {
        let Some(opt) = self
            .optlist
            .get_named("X-mount.mkdir")
            .or_else(|| self.optlist.get_named("x-mount.mkdir"))
        else {
            return Ok(());
        };
        let mode = match opt.unquoted_value().filter(|v| !v.is_empty()) {
            Some(value) => u32::from_str_radix(value, 8).map_err(|_| MountError::MountOptions {
                message: format!("invalid mkdir mode '{value}'"),
            })?,
            None => DEFAULT_MKDIR_MODE,
        };
        if self.restricted {
            return Err(MountError::permission(format!("mkdir {target}")));
        }
        if Path::new(target).exists() {
            return Ok(());
        }

        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(mode)
            .create(target)?;
        tracing::info!(target, mode = format_args!("{mode:o}"), "Created mountpoint");
        Ok(())
    }

    /// Fill in the filesystem type when none was given.
    pub fn guess_fstype(&mut self) -> MountResult<()> {
        let flags = self.get_flags(MapId::Linux);
        if flags & (ms::BIND | ms::MOVE) != 0 || self.is_propagation_only() {
            self.set_fstype(Some("none"));
            return Ok(());
        }
        if self.fstype() == Some("auto") {
            self.set_fstype(None);
        }
        if self.fstype().is_some() || self.fstype_pattern.is_some() {
            return Ok(());
        }
        if flags & ms::REMOUNT != 0 {
            self.set_fstype(Some("none"));
            return Ok(());
        }
        let Some(device) = self.fs.srcpath().map(String::from) else {
            return Ok(());
        };

        let fstype = if Path::new(&device).exists() {
            self.guess_srcpath_fstype()?
        } else if device.starts_with("//") {
            Some("cifs".to_string())
        } else if device.contains(':') {
            Some("nfs".to_string())
        } else {
            None
        };
        if let Some(fstype) = fstype {
            tracing::debug!(device, fstype, "Guessed filesystem type");
            self.set_fstype(Some(&fstype));
        }
        Ok(())
    }

    /// Probe the source for its filesystem type.
    ///
    /// Ambiguous signatures are an error, and a guess outside the
    /// `X-mount.auto-fstypes` allow-list is rejected.
    pub fn guess_srcpath_fstype(&mut self) -> MountResult<Option<String>> {
        let Some(device) = self.fs.srcpath().map(String::from) else {
            return Ok(None);
        };
        let probe = self.in_namespace(NsKind::Target, |ctx| {
            let cache = ctx.get_cache();
            let prober = Arc::clone(&ctx.prober);
            let probe = cache.lock().probe(&device, prober.as_ref());
            Ok(probe)
        })?;

        let fstype = match probe {
            Ok(Probe::Found(fstype)) => fstype,
            Ok(Probe::Ambiguous(found)) => {
                tracing::debug!(device, ?found, "Ambiguous signatures");
                return Err(MountError::AmbiguousFilesystem { device });
            }
            Ok(Probe::Unknown) => return Ok(None),
            Err(err) => {
                tracing::debug!(device, %err, "Cannot probe");
                return Ok(None);
            }
        };

        if let Some(allowed) = self.named_value("X-mount.auto-fstypes") {
            if !match_fstype(Some(&fstype), Some(&allowed)) {
                return Err(MountError::DisallowedFilesystem { fstype, allowed });
            }
        }
        Ok(Some(fstype))
    }
}
