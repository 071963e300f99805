//! Test doubles shared by the unit tests.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::os::fd::BorrowedFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use mountkit_common::MountResult;
use parking_lot::Mutex;
use tempfile::TempDir;

use crate::cache::{FsProber, Probe};
use crate::config::EngineConfig;
use crate::context::Context;
use crate::exec::{HelperRequest, HelperRunner, MountExecutor, MountRequest, UmountFlags};
use crate::identity::Credentials;
use crate::namespace::NsSwitcher;
use crate::tab::{Fs, Table, TableFilter, TableProvider};

/// Counts namespace entries; fails on demand.
#[derive(Debug, Default)]
pub struct FakeSwitcher {
    pub fail: AtomicBool,
    pub entered: AtomicUsize,
}

impl NsSwitcher for FakeSwitcher {
    fn enter(&self, _ns: BorrowedFd<'_>) -> io::Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(io::Error::from_raw_os_error(libc::EPERM));
        }
        self.entered.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Records mount calls and fails them with queued errnos.
#[derive(Debug, Default)]
pub struct RecordingExecutor {
    pub mounts: Mutex<Vec<MountRequest>>,
    pub umounts: Mutex<Vec<(String, UmountFlags)>>,
    pub mount_errors: Mutex<VecDeque<i32>>,
    pub umount_errors: Mutex<VecDeque<i32>>,
}

impl RecordingExecutor {
    pub fn fail_mount(&self, errno: i32) {
        self.mount_errors.lock().push_back(errno);
    }

    pub fn fail_umount(&self, errno: i32) {
        self.umount_errors.lock().push_back(errno);
    }
}

fn outcome(queue: &Mutex<VecDeque<i32>>) -> io::Result<()> {
    match queue.lock().pop_front() {
        Some(0) | None => Ok(()),
        Some(errno) => Err(io::Error::from_raw_os_error(errno)),
    }
}

impl MountExecutor for RecordingExecutor {
    fn mount(&self, request: &MountRequest) -> io::Result<()> {
        self.mounts.lock().push(request.clone());
        outcome(&self.mount_errors)
    }

    fn umount(&self, target: &str, flags: UmountFlags) -> io::Result<()> {
        self.umounts.lock().push((target.to_string(), flags));
        outcome(&self.umount_errors)
    }
}

/// Records helper runs and answers with queued exit statuses.
#[derive(Debug, Default)]
pub struct RecordingRunner {
    pub runs: Mutex<Vec<HelperRequest>>,
    pub statuses: Mutex<VecDeque<i32>>,
}

impl HelperRunner for RecordingRunner {
    fn run(&self, request: &HelperRequest) -> MountResult<i32> {
        self.runs.lock().push(request.clone());
        Ok(self.statuses.lock().pop_front().unwrap_or(0))
    }
}

/// Answers probes from a fixed map.
#[derive(Debug, Default)]
pub struct FakeProber {
    pub results: Mutex<HashMap<String, Probe>>,
}

impl FakeProber {
    pub fn set(&self, device: &str, probe: Probe) {
        self.results.lock().insert(device.to_string(), probe);
    }
}

impl FsProber for FakeProber {
    fn probe(&self, device: &Path) -> io::Result<Probe> {
        Ok(self
            .results
            .lock()
            .get(device.to_string_lossy().as_ref())
            .cloned()
            .unwrap_or(Probe::Unknown))
    }
}

/// Tables kept in memory.
#[derive(Debug, Default)]
pub struct MemoryTables {
    pub fstab: Mutex<Table>,
    pub mountinfo: Mutex<Table>,
    pub utab: Mutex<Table>,
}

impl MemoryTables {
    pub fn set_fstab(&self, entries: impl IntoIterator<Item = Fs>) {
        *self.fstab.lock() = Table::from_entries(entries);
    }

    pub fn set_mountinfo(&self, entries: impl IntoIterator<Item = Fs>) {
        *self.mountinfo.lock() = Table::from_entries(entries);
    }
}

impl TableProvider for MemoryTables {
    fn fstab(&self, _path: &Path) -> MountResult<Table> {
        Ok(self.fstab.lock().clone())
    }

    fn mountinfo(&self, _path: &Path, filter: Option<&TableFilter>) -> MountResult<Table> {
        let table = self.mountinfo.lock();
        Ok(Table::from_entries(
            table
                .iter(crate::tab::Direction::Forward)
                .filter(|fs| filter.is_none_or(|f| f(fs)))
                .map(|fs| Fs::clone(fs)),
        ))
    }

    fn utab(&self, _path: &Path) -> MountResult<Table> {
        Ok(self.utab.lock().clone())
    }
}

pub fn root() -> Credentials {
    Credentials {
        uid: 0,
        euid: 0,
        gid: 0,
        groups: Vec::new(),
    }
}

pub fn user(uid: u32) -> Credentials {
    Credentials {
        uid,
        euid: 0,
        gid: uid,
        groups: Vec::new(),
    }
}

/// A temporary root with every collaborator faked.
#[derive(Debug)]
pub struct Sandbox {
    pub dir: TempDir,
    pub root: PathBuf,
    pub executor: Arc<RecordingExecutor>,
    pub runner: Arc<RecordingRunner>,
    pub tables: Arc<MemoryTables>,
    pub prober: Arc<FakeProber>,
}

impl Sandbox {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = std::fs::canonicalize(dir.path()).unwrap();
        Self {
            dir,
            root,
            executor: Arc::default(),
            runner: Arc::default(),
            tables: Arc::default(),
            prober: Arc::default(),
        }
    }

    pub fn path(&self, rel: &str) -> String {
        self.root.join(rel).to_string_lossy().into_owned()
    }

    pub fn mkdir(&self, rel: &str) -> String {
        let path = self.root.join(rel);
        std::fs::create_dir_all(&path).unwrap();
        path.to_string_lossy().into_owned()
    }

    pub fn config(&self) -> EngineConfig {
        EngineConfig::default()
            .with_root(&self.root)
            .with_helper_search_path(self.path("sbin"))
            .with_block_signals(false)
    }

    /// A privileged context over the sandbox.
    pub fn context(&self) -> Context {
        let mut cxt = Context::with_config(self.config());
        cxt.set_credentials(root());
        cxt.set_executor(self.executor.clone());
        cxt.set_helper_runner(self.runner.clone());
        cxt.set_table_provider(self.tables.clone());
        cxt.set_prober(self.prober.clone());
        cxt
    }

    /// Write an executable helper named `name` into the helper directory.
    pub fn helper(&self, name: &str) -> String {
        let dir = self.mkdir("sbin");
        let path = Path::new(&dir).join(name);
        std::fs::write(&path, "#!/bin/sh\nexit 0\n").unwrap();
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        path.to_string_lossy().into_owned()
    }

    pub fn mounts(&self) -> Vec<MountRequest> {
        self.executor.mounts.lock().clone()
    }
}

/// A privileged context that never touches real tables or devices.
pub fn context() -> Context {
    let mut cxt = Context::with_config(
        EngineConfig::default()
            .with_root("/nonexistent/mountkit")
            .with_block_signals(false),
    );
    cxt.set_credentials(root());
    cxt.behavior_mut().nomtab = true;
    cxt.set_executor(Arc::new(RecordingExecutor::default()));
    cxt.set_helper_runner(Arc::new(RecordingRunner::default()));
    cxt.set_table_provider(Arc::new(MemoryTables::default()));
    cxt.set_prober(Arc::new(FakeProber::default()));
    cxt
}
