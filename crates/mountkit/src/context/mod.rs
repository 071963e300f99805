//! The mount context: one mount or unmount operation in progress.
//!
//! A [`Context`] is configured by the caller (source, target, options, mode
//! switches) and then driven through the pipeline:
//!
//! 1. prepare: apply fstab, merge flags, check permissions, resolve the
//!    source, type, target and helper;
//! 2. execute: one `mount(2)`/`umount(2)` call or one helper run, whose
//!    outcome is recorded on the context;
//! 3. bookkeeping: update the userspace mount table under lock;
//! 4. [`get_excode`](Context::get_excode) turns the outcome into an exit
//!    code and a diagnostic.

mod all;
mod apply;
pub mod excode;
mod flags;
mod helper;
mod mount;
mod prepare;
mod tabs;
mod umount;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;

use mountkit_common::{MountError, MountResult};

pub use all::{ChildOutcome, ChildTally, Ignored, NextEntry, NextStatus, TabCursor};
pub use excode::Excode;
pub use flags::{Behavior, OptsMode, Progress};
pub use prepare::SourceHook;

use crate::cache::{FsProber, SharedCache, SuperblockProber};
use crate::config::EngineConfig;
use crate::events::EventBus;
use crate::exec::{HelperRunner, KernelExecutor, MountExecutor, ProcessRunner};
use crate::identity::{self, Credentials};
use crate::namespace::{NamespaceManager, NsKind, NsSwitcher};
use crate::options::{MapId, OptionList};
use crate::tab::{FileTableProvider, Fs, Table, TableFilter, TableProvider};
use crate::update::{Lock, Update};

/// Operation a context performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Mount a filesystem.
    Mount,
    /// Unmount a filesystem.
    Umount,
}

/// Options saved by mount-all and reapplied after every reset.
#[derive(Debug, Clone)]
struct Template {
    fs: Fs,
    optlist: OptionList,
}

/// The evolving description of one mount operation.
pub struct Context {
    action: Option<Action>,
    restricted: bool,
    credentials: Credentials,
    behavior: Behavior,
    progress: Progress,
    optsmode: OptsMode,

    fs: Arc<Fs>,
    optlist: OptionList,
    mountflags: u64,
    user_mountflags: u64,
    mountdata: Option<String>,
    addmounts: Vec<u64>,

    fstype_pattern: Option<String>,
    optstr_pattern: Option<String>,
    target_prefix: Option<String>,
    subdir: Option<String>,

    helper: Option<PathBuf>,
    syscall_status: Option<i32>,
    helper_status: Option<i32>,

    fstab: Option<Arc<Table>>,
    mountinfo: Option<Arc<Table>>,
    table_filter: Option<TableFilter>,
    update: Option<Update>,
    lock: Option<Lock>,
    namespaces: NamespaceManager,

    config: EngineConfig,
    executor: Arc<dyn MountExecutor>,
    runner: Arc<dyn HelperRunner>,
    tables: Arc<dyn TableProvider>,
    prober: Arc<dyn FsProber>,
    source_hooks: Vec<Arc<dyn SourceHook>>,
    events: EventBus,

    template: Option<Template>,
    children: Vec<JoinHandle<ChildOutcome>>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("action", &self.action)
            .field("restricted", &self.restricted)
            .field("behavior", &self.behavior)
            .field("progress", &self.progress)
            .field("optsmode", &self.optsmode)
            .field("fs", &self.fs)
            .field("options", &self.optlist.to_string())
            .field("helper", &self.helper)
            .field("syscall_status", &self.syscall_status)
            .field("helper_status", &self.helper_status)
            .finish_non_exhaustive()
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    /// Create a context with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    /// Create a context using `config`.
    #[must_use]
    pub fn with_config(config: EngineConfig) -> Self {
        let credentials = Credentials::current();
        Self {
            action: None,
            restricted: credentials.is_restricted(),
            credentials,
            behavior: Behavior::default(),
            progress: Progress::default(),
            optsmode: OptsMode::empty(),
            fs: Arc::new(Fs::new()),
            optlist: OptionList::new(),
            mountflags: 0,
            user_mountflags: 0,
            mountdata: None,
            addmounts: Vec::new(),
            fstype_pattern: None,
            optstr_pattern: None,
            target_prefix: None,
            subdir: None,
            helper: None,
            syscall_status: None,
            helper_status: None,
            fstab: None,
            mountinfo: None,
            table_filter: None,
            update: None,
            lock: None,
            namespaces: NamespaceManager::default(),
            config,
            executor: Arc::new(KernelExecutor),
            runner: Arc::new(ProcessRunner),
            tables: Arc::new(FileTableProvider),
            prober: Arc::new(SuperblockProber),
            source_hooks: Vec::new(),
            events: EventBus::new(),
            template: None,
            children: Vec::new(),
        }
    }

    /// Full reset: forget the filesystem, options, live table and all
    /// pipeline state. Caller behavior, fstab, patterns, namespaces and
    /// injected collaborators are kept; a saved template is reapplied.
    pub fn reset(&mut self) {
        self.mountinfo = None;
        self.reset_keep_mountinfo();
    }

    fn reset_keep_mountinfo(&mut self) {
        tracing::trace!("Resetting context");
        self.fs = Arc::new(Fs::new());
        self.optlist = OptionList::new();
        self.mountflags = 0;
        self.user_mountflags = 0;
        self.mountdata = None;
        self.addmounts.clear();
        self.subdir = None;
        self.helper = None;
        self.table_filter = None;
        self.update = None;
        self.lock = None;
        self.progress = Progress::default();
        self.reset_status();

        if let Some(template) = &self.template {
            self.fs = Arc::new(template.fs.clone());
            self.optlist = template.optlist.clone();
        }
    }

    /// Soft reset: forget the syscall and helper outcome so the same
    /// configured operation can be retried.
    pub fn reset_status(&mut self) {
        self.syscall_status = None;
        self.helper_status = None;
    }

    /// Remember the current filesystem and options as the template applied
    /// after each reset.
    pub fn save_template(&mut self) {
        let mut fs = Fs::clone(&self.fs);
        fs.source = None;
        fs.target = None;
        fs.fstype = None;
        tracing::debug!(options = %self.optlist, "Saved template");
        self.template = Some(Template {
            fs,
            optlist: self.optlist.clone(),
        });
    }

    /// The operation being performed, once known.
    #[must_use]
    pub const fn action(&self) -> Option<Action> {
        self.action
    }

    /// Whether the caller is treated as unprivileged.
    #[must_use]
    pub const fn is_restricted(&self) -> bool {
        self.restricted
    }

    /// Treat the caller as unprivileged even when running as root.
    pub const fn force_restricted(&mut self) {
        self.restricted = true;
    }

    /// Treat the caller as privileged. For callers that did their own
    /// permission checks, e.g. a mount helper started by a privileged parent.
    pub const fn force_unrestricted(&mut self) {
        self.restricted = false;
    }

    pub(crate) fn set_credentials(&mut self, credentials: Credentials) {
        self.restricted = credentials.is_restricted();
        self.credentials = credentials;
    }

    /// Caller credentials used for permission checks.
    #[must_use]
    pub const fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Caller-selected behavior.
    #[must_use]
    pub const fn behavior(&self) -> &Behavior {
        &self.behavior
    }

    /// Mutable caller-selected behavior.
    pub const fn behavior_mut(&mut self) -> &mut Behavior {
        &mut self.behavior
    }

    /// Pipeline progress.
    #[must_use]
    pub const fn progress(&self) -> &Progress {
        &self.progress
    }

    /// Never retry a failed mount read-only.
    pub const fn enable_rwonly_mount(&mut self, enable: bool) {
        self.progress.rwonly_mount = enable;
    }

    /// Whether a table lookup may swap source and target.
    #[must_use]
    pub const fn is_swapmatch(&self) -> bool {
        !self.behavior.noswapmatch
    }

    /// Engine configuration.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    // -- filesystem description --

    /// The filesystem description.
    #[must_use]
    pub const fn fs(&self) -> &Arc<Fs> {
        &self.fs
    }

    /// Mutable filesystem description; copied first if shared.
    pub fn fs_mut(&mut self) -> &mut Fs {
        Arc::make_mut(&mut self.fs)
    }

    /// Replace the filesystem description; `None` installs an empty one.
    pub fn set_fs(&mut self, fs: Option<Arc<Fs>>) {
        self.fs = fs.unwrap_or_default();
    }

    /// Set the source (device, tag, path or pseudo source).
    pub fn set_source(&mut self, source: Option<&str>) {
        self.fs_mut().source = source.map(String::from);
    }

    /// Set the mountpoint.
    pub fn set_target(&mut self, target: Option<&str>) {
        self.fs_mut().target = target.map(String::from);
    }

    /// Set the filesystem type (or comma-separated list of types).
    pub fn set_fstype(&mut self, fstype: Option<&str>) {
        self.fs_mut().fstype = fstype.map(String::from);
    }

    /// Source of the filesystem.
    #[must_use]
    pub fn source(&self) -> Option<&str> {
        self.fs.source.as_deref()
    }

    /// Mountpoint of the filesystem.
    #[must_use]
    pub fn target(&self) -> Option<&str> {
        self.fs.target.as_deref()
    }

    /// Filesystem type.
    #[must_use]
    pub fn fstype(&self) -> Option<&str> {
        self.fs.fstype.as_deref()
    }

    /// Type pattern used by mount-all and by mounts without a type.
    pub fn set_fstype_pattern(&mut self, pattern: Option<&str>) {
        self.fstype_pattern = pattern.map(String::from);
    }

    /// Options pattern used by mount-all.
    pub fn set_options_pattern(&mut self, pattern: Option<&str>) {
        self.optstr_pattern = pattern.map(String::from);
    }

    /// Prefix prepended to the mountpoint.
    pub fn set_target_prefix(&mut self, prefix: Option<&str>) {
        self.target_prefix = prefix.map(String::from);
    }

    /// Sub-directory of the mounted filesystem to bind to the target.
    #[must_use]
    pub fn subdir(&self) -> Option<&str> {
        self.subdir.as_deref()
    }

    /// Raw filesystem data passed to `mount(2)` instead of the options.
    pub fn set_mountdata(&mut self, data: Option<&str>) -> MountResult<()> {
        if self.restricted && data.is_some() {
            return Err(MountError::permission("mount data override"));
        }
        self.mountdata = data.map(String::from);
        Ok(())
    }

    /// The option list.
    #[must_use]
    pub const fn optlist(&self) -> &OptionList {
        &self.optlist
    }

    /// How table options are applied.
    pub fn set_optsmode(&mut self, mode: OptsMode) {
        self.optsmode = mode;
    }

    /// The options-application mode.
    #[must_use]
    pub const fn optsmode(&self) -> OptsMode {
        self.optsmode
    }

    // -- outcome tracking --

    /// Raw syscall outcome: `None` before the call, `0` on success,
    /// negative errno on failure.
    #[must_use]
    pub const fn syscall_status(&self) -> Option<i32> {
        self.syscall_status
    }

    /// Record the outcome of a mount or unmount call made by the caller.
    pub fn set_syscall_status(&mut self, status: i32) {
        tracing::debug!(status, "Syscall status set");
        self.syscall_status = Some(status);
    }

    /// Whether the syscall was called.
    #[must_use]
    pub const fn syscall_called(&self) -> bool {
        self.syscall_status.is_some()
    }

    /// Positive errno of a failed syscall.
    #[must_use]
    pub fn syscall_errno(&self) -> Option<i32> {
        self.syscall_status.filter(|s| *s < 0).map(|s| -s)
    }

    /// Exit status of an executed helper.
    #[must_use]
    pub const fn helper_status(&self) -> Option<i32> {
        self.helper_status
    }

    /// Record the exit status of a helper run by the caller.
    pub fn set_helper_status(&mut self, status: i32) {
        tracing::debug!(status, "Helper status set");
        self.helper_status = Some(status);
    }

    /// Whether a helper was executed.
    #[must_use]
    pub const fn helper_executed(&self) -> bool {
        self.helper_status.is_some()
    }

    /// Whether the operation succeeded, by syscall or by helper.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.syscall_status == Some(0) || self.helper_status == Some(0)
    }

    /// Whether the mount was retried read-only.
    #[must_use]
    pub const fn is_forced_rdonly(&self) -> bool {
        self.progress.forced_rdonly
    }

    /// The selected helper, if any.
    #[must_use]
    pub fn helper(&self) -> Option<&Path> {
        self.helper.as_deref()
    }

    // -- collaborators --

    /// Perform mount calls through `executor`.
    pub fn set_executor(&mut self, executor: Arc<dyn MountExecutor>) {
        self.executor = executor;
    }

    /// Run helpers through `runner`.
    pub fn set_helper_runner(&mut self, runner: Arc<dyn HelperRunner>) {
        self.runner = runner;
    }

    /// Load tables through `provider`.
    pub fn set_table_provider(&mut self, provider: Arc<dyn TableProvider>) {
        self.tables = provider;
    }

    /// Detect filesystem types through `prober`.
    pub fn set_prober(&mut self, prober: Arc<dyn FsProber>) {
        self.prober = prober;
    }

    /// Enter namespaces through `switcher`.
    pub fn set_ns_switcher(&mut self, switcher: Arc<dyn NsSwitcher>) {
        self.namespaces.set_switcher(switcher);
    }

    /// Register a source preparation step (loop or verity device setup).
    pub fn add_source_hook(&mut self, hook: Arc<dyn SourceHook>) {
        self.source_hooks.push(hook);
    }

    /// Bus receiving table change events.
    #[must_use]
    pub const fn events(&self) -> &EventBus {
        &self.events
    }

    // -- namespaces --

    /// Operate in the mount namespace at `path`; `None` goes back to the
    /// caller's namespace.
    pub fn set_target_ns(&mut self, path: Option<&Path>) -> MountResult<()> {
        // Caches are namespace specific.
        self.fstab = None;
        self.mountinfo = None;
        self.namespaces.set_target(path)
    }

    /// The namespace currently entered.
    #[must_use]
    pub const fn current_ns(&self) -> NsKind {
        self.namespaces.current()
    }

    /// Enter `kind`, returning the previously current namespace.
    pub fn switch_ns(&mut self, kind: NsKind) -> MountResult<NsKind> {
        self.namespaces.switch(kind)
    }

    /// Run `f` inside `kind` and switch back to the previously current
    /// namespace afterwards, whatever `f` returned.
    pub fn in_namespace<T>(
        &mut self,
        kind: NsKind,
        f: impl FnOnce(&mut Self) -> MountResult<T>,
    ) -> MountResult<T> {
        let previous = self.namespaces.current();
        let result = self.namespaces.switch(kind).and_then(|_| f(self));
        let restored = self.namespaces.switch(previous);

        match (result, restored) {
            (Err(err), Err(restore_err)) => {
                tracing::warn!(%restore_err, "Failed to switch namespace back");
                Err(err)
            }
            (Err(err), Ok(_)) | (Ok(_), Err(err)) => Err(err),
            (Ok(value), Ok(_)) => Ok(value),
        }
    }

    /// Cache of the current namespace.
    pub fn get_cache(&mut self) -> SharedCache {
        self.namespaces.current_cache(&self.config.paths.tag_dir)
    }

    /// Share `cache` as the caller's namespace cache.
    pub fn set_cache(&mut self, cache: Option<SharedCache>) {
        self.namespaces.set_origin_cache(cache);
    }

    // -- tables --

    /// Share a pre-loaded fstab.
    pub fn set_fstab(&mut self, table: Option<Arc<Table>>) {
        self.fstab = table;
    }

    /// Share a pre-loaded live mount table.
    pub fn set_mountinfo(&mut self, table: Option<Arc<Table>>) {
        self.mountinfo = table;
    }

    /// Filter applied when the live mount table is loaded.
    pub fn set_tabfilter(&mut self, filter: Option<TableFilter>) {
        self.table_filter = filter;
        self.mountinfo = None;
    }

    /// The fstab, loaded on first use in the target namespace.
    pub fn get_fstab(&mut self) -> MountResult<Arc<Table>> {
        if let Some(table) = &self.fstab {
            return Ok(Arc::clone(table));
        }
        let table = self.in_namespace(NsKind::Target, |ctx| {
            let mut table = ctx.tables.fstab(&ctx.config.paths.fstab)?;
            table.set_cache(Some(ctx.get_cache()));
            tracing::debug!(entries = table.len(), "Loaded fstab");
            Ok(Arc::new(table))
        })?;
        self.fstab = Some(Arc::clone(&table));
        Ok(table)
    }

    /// The live mount table with utab options merged, loaded on first use
    /// in the target namespace.
    pub fn get_mountinfo(&mut self) -> MountResult<Arc<Table>> {
        if let Some(table) = &self.mountinfo {
            return Ok(Arc::clone(table));
        }
        let filter = self.table_filter.clone();
        let table = self.load_mountinfo(filter.as_ref())?;
        self.mountinfo = Some(Arc::clone(&table));
        Ok(table)
    }

    /// Live mount table entries for `target` only. Not cached.
    pub fn get_mountinfo_for_target(&mut self, target: &str) -> MountResult<Arc<Table>> {
        if let Some(table) = &self.mountinfo {
            return Ok(Arc::clone(table));
        }
        let canonical = self.in_namespace(NsKind::Target, |ctx| {
            Ok(ctx.get_cache().lock().resolve_path(target))
        })?;
        let wanted = target.to_string();
        let filter: TableFilter = Arc::new(move |fs: &Fs| {
            fs.target.as_deref() == Some(wanted.as_str())
                || (canonical.is_some() && fs.target == canonical)
        });
        self.load_mountinfo(Some(&filter))
    }

    fn load_mountinfo(&mut self, filter: Option<&TableFilter>) -> MountResult<Arc<Table>> {
        self.in_namespace(NsKind::Target, |ctx| {
            let paths = &ctx.config.paths;
            let mut table = ctx.tables.mountinfo(&paths.mountinfo, filter)?;
            if !table.is_empty() {
                match ctx.tables.utab(&paths.utab) {
                    Ok(utab) => table.merge_user_options(&utab),
                    Err(err) => tracing::warn!(%err, "Failed to read utab"),
                }
            }
            table.set_cache(Some(ctx.get_cache()));
            tracing::debug!(entries = table.len(), "Loaded mountinfo");
            Ok(Arc::new(table))
        })
    }

    fn username(&self) -> String {
        identity::username(self.credentials.uid, &mountkit_common::paths::PASSWD_PATH)
    }

    /// Userspace option value, unquoted.
    fn named_value(&self, name: &str) -> Option<String> {
        self.optlist
            .get_named(name)
            .and_then(|opt| opt.unquoted_value())
            .map(String::from)
    }

    fn require_target(&self) -> MountResult<String> {
        self.fs
            .target
            .clone()
            .ok_or_else(|| MountError::invalid("no mountpoint specified"))
    }

    fn userspace_flags(&self) -> u64 {
        if self.progress.flags_merged {
            self.user_mountflags
        } else {
            self.optlist.get_flags(MapId::Userspace)
        }
    }
}
