//! External helper selection, execution and helper mode.

use std::sync::Arc;

use mountkit_common::{MountError, MountResult};

use super::{Action, Context};
use crate::exec::{HelperRequest, find_helper};
use crate::namespace::NsKind;

impl Context {
    /// Search the helper path for `<name>.<type>`, using the filesystem
    /// type when `fstype` is `None`. Finding nothing is not an error.
    pub fn prepare_helper(&mut self, name: &str, fstype: Option<&str>) -> MountResult<()> {
        self.helper = None;
        let Some(fstype) = fstype.map(String::from).or_else(|| self.fs.fstype.clone()) else {
            return Ok(());
        };
        if self.behavior.nohelpers
            || fstype == "none"
            || fstype.contains(',')
            || fstype.contains("/..")
            || self.fs.is_swaparea()
        {
            return Ok(());
        }

        let found = self.in_namespace(NsKind::Origin, |ctx| {
            Ok(find_helper(ctx.config.paths.helper_dirs(), name, &fstype))
        })?;
        if let Some(helper) = found {
            tracing::debug!(helper = %helper.display(), fstype, "Selected helper");
            self.helper = Some(helper);
        }
        Ok(())
    }

    /// Run `request` from the caller's namespace and record its exit status.
    pub(crate) fn exec_helper(&mut self, request: &HelperRequest) -> MountResult<()> {
        if self.behavior.fake {
            tracing::debug!(command = %request, "Fake helper run");
            self.set_helper_status(0);
            return Ok(());
        }
        let runner = Arc::clone(&self.runner);
        let status = self.in_namespace(NsKind::Origin, |_| runner.run(request))?;
        self.set_helper_status(status);
        Ok(())
    }

    /// Put the context into helper mode: it runs as `mount.<type>` or
    /// `umount.<type>` on behalf of another mount tool. No nested helpers
    /// are called and no events are emitted.
    pub fn init_helper(&mut self, action: Action) {
        self.action = Some(action);
        self.behavior.nohelpers = true;
        self.progress.helper_mode = true;
        tracing::debug!(?action, "Helper mode");
    }

    /// Whether the context runs in helper mode.
    #[must_use]
    pub const fn is_helper_mode(&self) -> bool {
        self.progress.helper_mode
    }

    /// Apply one command-line option of a helper invocation.
    ///
    /// Returns `false` for options that are not understood.
    pub fn helper_setopt(&mut self, option: char, arg: Option<&str>) -> MountResult<bool> {
        match option {
            'n' => self.behavior.nomtab = true,
            'f' if self.action == Some(Action::Umount) => self.behavior.force = true,
            'f' => self.behavior.fake = true,
            'l' => self.behavior.lazy = true,
            'r' => self.behavior.rdonly_umount = true,
            'v' => self.behavior.verbose = true,
            's' => self.behavior.sloppy = true,
            'o' => self.append_options(required(option, arg)?)?,
            't' => self.set_fstype(Some(required(option, arg)?)),
            'N' => self.set_target_ns(Some(std::path::Path::new(required(option, arg)?)))?,
            _ => return Ok(false),
        }
        Ok(true)
    }
}

fn required(option: char, arg: Option<&str>) -> MountResult<&str> {
    arg.ok_or_else(|| MountError::invalid(format!("option -{option} requires an argument")))
}
