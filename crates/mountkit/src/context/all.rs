//! Mount-all and umount-all iteration.

use std::sync::Arc;

use mountkit_common::MountResult;

use super::{Context, Excode, OptsMode};
use crate::namespace::NsKind;
use crate::tab::{Direction, Fs, Table};

/// Position of a mount-all or umount-all walk over a table.
#[derive(Debug, Clone, Copy, Default)]
pub struct TabCursor {
    next: usize,
}

impl TabCursor {
    /// A cursor at the start of the table.
    #[must_use]
    pub const fn new() -> Self {
        Self { next: 0 }
    }

    /// Go back to the start.
    pub const fn reset(&mut self) {
        self.next = 0;
    }

    fn advance(&mut self, table: &Table, direction: Direction) -> Option<Arc<Fs>> {
        let index = match direction {
            Direction::Forward => self.next,
            Direction::Backward => table.len().checked_sub(self.next + 1)?,
        };
        let fs = Arc::clone(table.get(index)?);
        self.next += 1;
        Some(fs)
    }
}

/// Why an entry was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ignored {
    /// Swap, root, `noauto`, or a type or options pattern mismatch.
    NotMatched,
    /// The filesystem is mounted already.
    AlreadyMounted,
}

/// What happened to one entry.
#[derive(Debug)]
pub enum NextStatus {
    /// Skipped.
    Ignored(Ignored),
    /// Mounted or unmounted in this thread, with the driver result.
    Done(MountResult<()>),
    /// Handed to a worker; see [`Context::wait_for_children`].
    Spawned,
}

/// One step of a mount-all or umount-all walk.
#[derive(Debug)]
pub struct NextEntry {
    /// The table entry.
    pub fs: Arc<Fs>,
    /// Its outcome.
    pub status: NextStatus,
}

/// Result reported by a mount worker.
#[derive(Debug)]
pub struct ChildOutcome {
    /// The fstab entry the worker mounted.
    pub fs: Arc<Fs>,
    /// Driver result.
    pub result: MountResult<()>,
    /// Exit code and diagnostic for the result.
    pub excode: Excode,
}

/// Tally of joined workers.
#[derive(Debug, Default)]
pub struct ChildTally {
    /// Number of workers joined.
    pub children: usize,
    /// Workers that failed or panicked.
    pub errors: usize,
    /// Outcomes of the workers that finished.
    pub outcomes: Vec<ChildOutcome>,
}

impl Context {
    /// Mount the next fstab entry.
    ///
    /// Returns `None` at the end of fstab. Skipped entries are reported with
    /// [`NextStatus::Ignored`]; mount failures are in [`NextStatus::Done`].
    /// The options set before the first call are kept as a template and
    /// reapplied to every entry. In fork mode the mount runs in a worker
    /// thread with a non-forking copy of this context.
    pub fn next_mount(&mut self, cursor: &mut TabCursor) -> MountResult<Option<NextEntry>> {
        let fstab = self.get_fstab()?;
        let Some(fs) = cursor.advance(&fstab, Direction::Forward) else {
            return Ok(None);
        };
        tracing::debug!(target = ?fs.target, "next-mount: trying");

        let noauto = fs
            .all_options()
            .is_some_and(|options| options.split(',').any(|opt| opt == "noauto"));
        if fs.is_swaparea()
            || matches!(fs.target.as_deref(), Some("/" | "root"))
            || noauto
            || !fs.match_fstype(self.fstype_pattern.as_deref())
            || !fs.match_options(self.optstr_pattern.as_deref())
        {
            tracing::debug!(
                fstype = ?fs.fstype,
                pattern = ?self.fstype_pattern,
                options = ?fs.all_options(),
                options_pattern = ?self.optstr_pattern,
                "next-mount: not matched"
            );
            return Ok(Some(NextEntry {
                fs,
                status: NextStatus::Ignored(Ignored::NotMatched),
            }));
        }

        if self.get_mountinfo()?.is_fs_mounted(&fs) {
            return Ok(Some(NextEntry {
                fs,
                status: NextStatus::Ignored(Ignored::AlreadyMounted),
            }));
        }

        if self.template.is_none() {
            self.set_source(None);
            self.set_target(None);
            self.set_fstype(None);
            self.save_template();
        }
        self.reset_keep_mountinfo();

        let in_target_ns = self.namespaces.handle(NsKind::Target).is_set();
        if self.behavior.fork && in_target_ns {
            tracing::debug!("Target namespace set, mounting without workers");
        }
        if self.behavior.fork && !in_target_ns {
            let mut worker = self.worker()?;
            let entry = Arc::clone(&fs);
            let handle = std::thread::Builder::new()
                .name(format!("mount {}", entry.target.as_deref().unwrap_or("?")))
                .spawn(move || {
                    let result = worker.mount_entry(&entry);
                    let excode = worker.get_excode(&result);
                    ChildOutcome {
                        fs: entry,
                        result,
                        excode,
                    }
                })?;
            tracing::debug!(children = self.children.len() + 1, "Mount worker started");
            self.children.push(handle);
            return Ok(Some(NextEntry {
                fs,
                status: NextStatus::Spawned,
            }));
        }

        let result = self.mount_entry(&fs);
        Ok(Some(NextEntry {
            fs,
            status: NextStatus::Done(result),
        }))
    }

    /// Mount one fstab entry. The type pattern selects entries and must not
    /// be used as the type to try.
    fn mount_entry(&mut self, fs: &Fs) -> MountResult<()> {
        self.apply_entry(fs, OptsMode::PREPEND)?;
        let pattern = self.fstype_pattern.take();
        let result = self.mount();
        self.fstype_pattern = pattern;
        result
    }

    /// A non-forking copy sharing tables, collaborators and the template.
    fn worker(&self) -> MountResult<Self> {
        let mut worker = Self::with_config(self.config.clone());
        worker.restricted = self.restricted;
        worker.credentials = self.credentials.clone();
        worker.behavior = self.behavior;
        worker.behavior.fork = false;
        worker.progress = self.progress.clone();
        worker.optsmode = self.optsmode;
        worker.fs = Arc::clone(&self.fs);
        worker.optlist = self.optlist.clone();
        worker.fstype_pattern.clone_from(&self.fstype_pattern);
        worker.optstr_pattern.clone_from(&self.optstr_pattern);
        worker.target_prefix.clone_from(&self.target_prefix);
        worker.fstab.clone_from(&self.fstab);
        worker.mountinfo.clone_from(&self.mountinfo);
        worker.table_filter.clone_from(&self.table_filter);
        worker.namespaces = self.namespaces.try_clone()?;
        worker.executor = Arc::clone(&self.executor);
        worker.runner = Arc::clone(&self.runner);
        worker.tables = Arc::clone(&self.tables);
        worker.prober = Arc::clone(&self.prober);
        worker.source_hooks.clone_from(&self.source_hooks);
        worker.events = self.events.clone();
        worker.template.clone_from(&self.template);
        Ok(worker)
    }

    /// Number of mount workers not yet joined.
    #[must_use]
    pub fn pending_children(&self) -> usize {
        self.children.len()
    }

    /// Join all mount workers started by [`next_mount`](Context::next_mount).
    pub fn wait_for_children(&mut self) -> ChildTally {
        let mut tally = ChildTally::default();
        for handle in self.children.drain(..) {
            tally.children += 1;
            match handle.join() {
                Ok(outcome) => {
                    if outcome.result.is_err() {
                        tally.errors += 1;
                    }
                    tally.outcomes.push(outcome);
                }
                Err(_) => {
                    tracing::warn!("Mount worker panicked");
                    tally.errors += 1;
                }
            }
        }
        tracing::debug!(children = tally.children, errors = tally.errors, "Workers joined");
        tally
    }

    /// Unmount the next entry of the live table, most recent first.
    ///
    /// Returns `None` at the end of the table. Entries not matching the type
    /// or options pattern are reported with [`NextStatus::Ignored`].
    pub fn next_umount(&mut self, cursor: &mut TabCursor) -> MountResult<Option<NextEntry>> {
        let mountinfo = self.get_mountinfo()?;
        self.reset_keep_mountinfo();

        let fs = loop {
            let Some(fs) = cursor.advance(&mountinfo, Direction::Backward) else {
                return Ok(None);
            };
            if fs.target.is_some() {
                break fs;
            }
        };
        tracing::debug!(target = ?fs.target, "next-umount: trying");

        if !fs.match_fstype(self.fstype_pattern.as_deref())
            || !fs.match_options(self.optstr_pattern.as_deref())
        {
            return Ok(Some(NextEntry {
                fs,
                status: NextStatus::Ignored(Ignored::NotMatched),
            }));
        }

        self.set_fs(Some(Arc::clone(&fs)));
        let result = self.umount();
        Ok(Some(NextEntry {
            fs,
            status: NextStatus::Done(result),
        }))
    }
}
