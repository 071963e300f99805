//! Engine integration tests: the public API over an in-memory executor and
//! on-disk tables in a temporary root.

use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use mountkit::context::{Context, NextStatus, TabCursor, excode};
use mountkit::events::MountEvent;
use mountkit::exec::{HelperRequest, HelperRunner, MountExecutor, MountRequest, UmountFlags};
use mountkit::options::ms;
use mountkit::EngineConfig;
use mountkit_common::MountResult;
use parking_lot::Mutex;

#[derive(Debug, Default)]
struct MemoryExecutor {
    mounts: Mutex<Vec<MountRequest>>,
    umounts: Mutex<Vec<String>>,
    errors: Mutex<VecDeque<i32>>,
}

impl MountExecutor for MemoryExecutor {
    fn mount(&self, request: &MountRequest) -> io::Result<()> {
        self.mounts.lock().push(request.clone());
        match self.errors.lock().pop_front() {
            Some(errno) => Err(io::Error::from_raw_os_error(errno)),
            None => Ok(()),
        }
    }

    fn umount(&self, target: &str, _flags: UmountFlags) -> io::Result<()> {
        self.umounts.lock().push(target.to_string());
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemoryRunner {
    runs: Mutex<Vec<HelperRequest>>,
}

impl HelperRunner for MemoryRunner {
    fn run(&self, request: &HelperRequest) -> MountResult<i32> {
        self.runs.lock().push(request.clone());
        Ok(0)
    }
}

struct Root {
    _dir: tempfile::TempDir,
    path: PathBuf,
    executor: Arc<MemoryExecutor>,
}

impl Root {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = std::fs::canonicalize(dir.path()).unwrap();
        let root = Self {
            _dir: dir,
            path,
            executor: Arc::default(),
        };
        root.write("etc/fstab", "");
        root.write("proc/self/mountinfo", "");
        root
    }

    fn join(&self, rel: &str) -> String {
        self.path.join(rel).to_string_lossy().into_owned()
    }

    fn mkdir(&self, rel: &str) -> String {
        std::fs::create_dir_all(self.path.join(rel)).unwrap();
        self.join(rel)
    }

    fn write(&self, rel: &str, text: &str) {
        let path = self.path.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, text).unwrap();
    }

    fn read(&self, rel: &str) -> String {
        std::fs::read_to_string(self.path.join(rel)).unwrap_or_default()
    }

    fn context(&self) -> Context {
        let config = EngineConfig::default()
            .with_root(&self.path)
            .with_block_signals(false);
        let mut cxt = Context::with_config(config);
        cxt.force_unrestricted();
        cxt.set_executor(self.executor.clone());
        cxt
    }

    fn mounts(&self) -> Vec<MountRequest> {
        self.executor.mounts.lock().clone()
    }
}

#[test]
fn mount_then_umount_keeps_utab_in_step() {
    let root = Root::new();
    let data = root.mkdir("data");

    let mut cxt = root.context();
    let events = cxt.events().subscribe();
    cxt.set_source(Some("/dev/sdb1"));
    cxt.set_target(Some(&data));
    cxt.set_fstype(Some("ext4"));
    cxt.set_options(Some("noatime,x-app.id=7")).unwrap();
    cxt.mount().unwrap();

    let mounts = root.mounts();
    assert_eq!(mounts.len(), 1);
    assert_eq!(mounts[0].flags & ms::NOATIME, ms::NOATIME);
    assert!(root.read("run/mount/utab").contains("OPTS=x-app.id=7"));
    assert!(Path::new(&root.join("run/mount/utab.event")).exists());
    assert!(matches!(
        events.try_recv().unwrap(),
        MountEvent::Mounted { target, .. } if target == data
    ));

    root.write(
        "proc/self/mountinfo",
        &format!("40 1 8:17 / {data} rw,noatime shared:1 - ext4 /dev/sdb1 rw\n"),
    );
    let mut cxt = root.context();
    cxt.set_target(Some(&data));
    let result = cxt.umount();
    assert!(cxt.get_excode(&result).is_success());
    assert_eq!(*root.executor.umounts.lock(), [data.clone()]);
    assert!(!root.read("run/mount/utab").contains(&data));
}

#[test]
fn mount_all_reads_fstab_from_disk() {
    let root = Root::new();
    let data = root.mkdir("data");
    let backup = root.mkdir("backup");
    let scratch = root.mkdir("scratch");
    root.write(
        "etc/fstab",
        &format!(
            "# static table\n\
             /dev/sda1 / ext4 defaults 0 1\n\
             /dev/sdb1 {data} ext4 noatime 0 2\n\
             /dev/sdc1 {backup} xfs noauto 0 0\n\
             tmpfs {scratch} tmpfs size=1m 0 0\n"
        ),
    );
    root.write(
        "proc/self/mountinfo",
        &format!("40 1 0:31 / {scratch} rw shared:1 - tmpfs tmpfs rw,size=1024k\n"),
    );

    let mut cxt = root.context();
    let mut cursor = TabCursor::new();
    let mut mounted = Vec::new();
    while let Some(entry) = cxt.next_mount(&mut cursor).unwrap() {
        if let NextStatus::Done(result) = entry.status {
            result.unwrap();
            mounted.push(entry.fs.target.clone().unwrap());
        }
    }

    assert_eq!(mounted, [data.clone()]);
    let mounts = root.mounts();
    assert_eq!(mounts.len(), 1);
    assert_eq!(mounts[0].target, data);
    assert_eq!(mounts[0].fstype.as_deref(), Some("ext4"));
}

#[test_log::test]
fn write_protected_source_is_mounted_read_only() {
    let root = Root::new();
    let data = root.mkdir("data");
    root.executor.errors.lock().push_back(libc::EROFS);

    let mut cxt = root.context();
    cxt.set_source(Some("/dev/sr0"));
    cxt.set_target(Some(&data));
    cxt.set_fstype(Some("iso9660"));
    let result = cxt.mount();
    assert!(result.is_ok());
    assert!(cxt.is_forced_rdonly());

    let mounts = root.mounts();
    assert_eq!(mounts.len(), 2);
    assert_eq!(mounts[0].flags & ms::RDONLY, 0);
    assert_eq!(mounts[1].flags & ms::RDONLY, ms::RDONLY);

    let excode = cxt.get_excode(&result);
    assert!(excode.is_success());
    assert!(excode.message.unwrap().contains("write-protected"));
}

#[test]
fn type_helper_replaces_the_syscall() {
    let root = Root::new();
    let data = root.mkdir("data");
    let helper = root.path.join("sbin/mount.ext4");
    root.write("sbin/mount.ext4", "#!/bin/sh\nexit 0\n");
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&helper, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
    let runner = Arc::new(MemoryRunner::default());

    let mut cxt = root.context();
    cxt.set_helper_runner(runner.clone());
    cxt.set_source(Some("/dev/sdb1"));
    cxt.set_target(Some(&data));
    cxt.set_fstype(Some("ext4"));
    cxt.mount().unwrap();

    assert!(cxt.helper_executed());
    assert!(root.mounts().is_empty());
    let runs = runner.runs.lock();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].helper, helper);
    assert_eq!(runs[0].args[..2], ["/dev/sdb1".to_string(), data]);
}

#[test]
fn missing_fstab_entry_is_a_usage_error() {
    let root = Root::new();
    let mut cxt = root.context();
    cxt.set_target(Some("/nowhere"));
    let result = cxt.mount();
    assert!(result.is_err());

    let excode = cxt.get_excode(&result);
    assert_eq!(excode.code, excode::USAGE);
    assert!(excode.message.unwrap().contains("can't find in"));
    assert!(root.mounts().is_empty());
}
