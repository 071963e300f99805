//! CLI command definitions and handlers.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use color_eyre::eyre::{Result, eyre};
use mountkit_common::MountResult;
use mountkit_common::paths::CONFIG_PATH;
use tabled::{Table, Tabled};

use crate::config::EngineConfig;
use crate::context::{Context, Excode, Ignored, NextStatus, OptsMode, TabCursor, excode};
use crate::tab::{Direction, FileTableProvider, Fs, TableProvider};

/// mountkit - mount and unmount filesystems
#[derive(Parser)]
#[command(name = "mountkit")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Engine configuration file [default: /etc/mountkit.toml]
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// mountkit commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Mount a filesystem
    Mount(MountArgs),

    /// Unmount a filesystem
    Umount(UmountArgs),

    /// Show a mount table
    List {
        /// Table to show
        #[arg(value_enum, default_value_t = TableKind::Mountinfo)]
        table: TableKind,

        /// Output format (table, json)
        #[arg(long, default_value = "table")]
        format: String,
    },
}

/// Arguments of `mountkit mount`.
#[derive(Args)]
#[allow(clippy::struct_excessive_bools)]
pub struct MountArgs {
    /// Device, tag or directory to mount
    pub source: Option<String>,

    /// Mountpoint
    pub target: Option<String>,

    /// Mount all filesystems mentioned in fstab
    #[arg(short, long)]
    pub all: bool,

    /// Mount in parallel workers (with --all)
    #[arg(short = 'F', long)]
    pub fork: bool,

    /// Do everything except the actual mount
    #[arg(short, long)]
    pub fake: bool,

    /// Do not write the userspace mount table
    #[arg(short = 'n', long)]
    pub no_mtab: bool,

    /// Do not call mount.<type> helpers
    #[arg(short, long)]
    pub internal_only: bool,

    /// Tolerate sloppy mount options
    #[arg(short, long)]
    pub sloppy: bool,

    /// Say what is being done
    #[arg(short, long)]
    pub verbose: bool,

    /// Mount the filesystem read-only
    #[arg(short, long)]
    pub read_only: bool,

    /// Mount the filesystem read-write, never fall back to read-only
    #[arg(short = 'w', long = "rw", visible_alias = "read-write")]
    pub read_write: bool,

    /// Filesystem types; with --all a pattern like "nonfs,smbfs"
    #[arg(short = 't', long = "types")]
    pub types: Option<String>,

    /// Limit --all to filesystems with matching options
    #[arg(short = 'O', long = "test-opts")]
    pub test_opts: Option<String>,

    /// Comma-separated mount options
    #[arg(short, long = "options")]
    pub options: Vec<String>,

    /// How to use options from fstab (ignore, append, prepend, replace)
    #[arg(long)]
    pub options_mode: Option<String>,

    /// Tables to read options from (fstab, mtab, disable)
    #[arg(long)]
    pub options_source: Option<String>,

    /// Use options from fstab even when source and target are given
    #[arg(long)]
    pub options_source_force: bool,

    /// Do not canonicalize paths
    #[arg(long)]
    pub no_canonicalize: bool,

    /// Perform the mount in another mount namespace
    #[arg(short = 'N', long = "namespace")]
    pub namespace: Option<PathBuf>,

    /// Prepend this directory to the mountpoint
    #[arg(long)]
    pub target_prefix: Option<String>,

    /// Mount a subtree somewhere else
    #[arg(short = 'B', long)]
    pub bind: bool,

    /// Mount a subtree and all submounts somewhere else
    #[arg(short = 'R', long)]
    pub rbind: bool,

    /// Move a subtree to some other place
    #[arg(short = 'M', long = "move")]
    pub move_mount: bool,

    /// Change the propagation type of the mountpoint
    #[arg(long, value_enum)]
    pub make: Option<Propagation>,
}

/// Arguments of `mountkit umount`.
#[derive(Args)]
#[allow(clippy::struct_excessive_bools)]
pub struct UmountArgs {
    /// Mountpoint or source to unmount
    pub target: Option<String>,

    /// Unmount all filesystems of the live mount table
    #[arg(short, long)]
    pub all: bool,

    /// Detach the filesystem now, clean up later
    #[arg(short, long)]
    pub lazy: bool,

    /// Force an unmount (unreachable NFS)
    #[arg(short, long)]
    pub force: bool,

    /// Do everything except the actual unmount
    #[arg(long)]
    pub fake: bool,

    /// Remount read-only when the unmount fails
    #[arg(short = 'r', long = "read-only")]
    pub read_only: bool,

    /// Do not write the userspace mount table
    #[arg(short = 'n', long)]
    pub no_mtab: bool,

    /// Do not call umount.<type> helpers
    #[arg(short, long)]
    pub internal_only: bool,

    /// Say what is being done
    #[arg(short, long)]
    pub verbose: bool,

    /// Limit --all to these filesystem types
    #[arg(short = 't', long = "types")]
    pub types: Option<String>,

    /// Limit --all to filesystems with matching options
    #[arg(short = 'O', long = "test-opts")]
    pub test_opts: Option<String>,

    /// Perform the unmount in another mount namespace
    #[arg(short = 'N', long = "namespace")]
    pub namespace: Option<PathBuf>,

    /// Do not canonicalize paths
    #[arg(long)]
    pub no_canonicalize: bool,
}

/// Mount table shown by `mountkit list`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TableKind {
    /// Static mount table
    Fstab,
    /// Live mount table
    Mountinfo,
    /// Userspace mount table
    Utab,
}

/// Propagation types accepted by `--make`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Propagation {
    /// Shared
    Shared,
    /// Slave
    Slave,
    /// Private
    Private,
    /// Unbindable
    Unbindable,
    /// Recursively shared
    Rshared,
    /// Recursively slave
    Rslave,
    /// Recursively private
    Rprivate,
    /// Recursively unbindable
    Runbindable,
}

impl Propagation {
    const fn option(self) -> &'static str {
        match self {
            Self::Shared => "shared",
            Self::Slave => "slave",
            Self::Private => "private",
            Self::Unbindable => "unbindable",
            Self::Rshared => "rshared",
            Self::Rslave => "rslave",
            Self::Rprivate => "rprivate",
            Self::Runbindable => "runbindable",
        }
    }
}

#[derive(Tabled)]
struct FsRow {
    #[tabled(rename = "SOURCE")]
    source: String,
    #[tabled(rename = "TARGET")]
    target: String,
    #[tabled(rename = "FSTYPE")]
    fstype: String,
    #[tabled(rename = "OPTIONS")]
    options: String,
}

impl From<&Fs> for FsRow {
    fn from(fs: &Fs) -> Self {
        let text = |value: Option<&str>| value.unwrap_or("-").to_string();
        Self {
            source: text(fs.source.as_deref()),
            target: text(fs.target.as_deref()),
            fstype: text(fs.fstype.as_deref()),
            options: fs.all_options().unwrap_or_else(|| "-".into()),
        }
    }
}

/// Mount-all or umount-all tally.
#[derive(Debug, Default)]
struct Tally {
    ok: usize,
    failed: usize,
}

impl Tally {
    fn record(&mut self, excode: &Excode) {
        if excode.is_success() {
            self.ok += 1;
        } else {
            self.failed += 1;
        }
    }

    const fn code(&self) -> i32 {
        match (self.ok, self.failed) {
            (_, 0) => excode::SUCCESS,
            (0, _) => excode::FAIL,
            _ => excode::SOMEOK,
        }
    }
}

impl Cli {
    /// Log filter directive for the selected verbosity.
    #[must_use]
    pub fn log_directive(&self) -> &'static str {
        let verbose = match &self.command {
            Commands::Mount(args) => args.verbose,
            Commands::Umount(args) => args.verbose,
            Commands::List { .. } => false,
        };
        if self.debug || verbose {
            "mountkit=debug"
        } else {
            "mountkit=info"
        }
    }

    /// Execute the CLI command.
    pub fn execute(self) -> Result<ExitCode> {
        let path = self.config.as_deref().unwrap_or(CONFIG_PATH.as_path());
        let config = EngineConfig::load_or_default(path)
            .map_err(|e| eyre!("Failed to load configuration: {e}"))?;

        let code = match self.command {
            Commands::Mount(args) => run_mount(&args, config)?,
            Commands::Umount(args) => run_umount(&args, config)?,
            Commands::List { table, format } => {
                list(table, &format, &config)?;
                excode::SUCCESS
            }
        };
        Ok(ExitCode::from(u8::try_from(code).unwrap_or(u8::MAX)))
    }
}

/// Print the diagnostic of `excode`, if any.
fn report(command: &str, excode: &Excode) {
    if let Some(message) = &excode.message {
        if excode.is_success() {
            println!("{command}: {message}");
        } else {
            eprintln!("{command}: {message}");
        }
    }
}

fn optsmode(args: &MountArgs) -> Result<OptsMode> {
    let mut mode = OptsMode::empty();
    if let Some(name) = &args.options_mode {
        mode |= match name.as_str() {
            "ignore" | "append" | "prepend" | "replace" => OptsMode::from_name(name),
            _ => None,
        }
        .ok_or_else(|| eyre!("unknown options mode: {name}"))?;
    }
    if let Some(sources) = &args.options_source {
        for source in sources.split(',') {
            mode |= match source {
                "fstab" => OptsMode::FSTAB,
                "mtab" => OptsMode::MTAB,
                "disable" => OptsMode::NOTAB,
                _ => return Err(eyre!("unknown options source: {source}")),
            };
        }
    }
    if args.options_source_force {
        mode |= OptsMode::FORCE;
    }
    if args.move_mount || args.make.is_some() {
        mode |= OptsMode::NOTAB;
    }
    Ok(mode)
}

fn mount_context(args: &MountArgs, config: EngineConfig) -> Result<Context> {
    let mut cxt = Context::with_config(config);
    let behavior = cxt.behavior_mut();
    behavior.fork = args.fork;
    behavior.fake = args.fake;
    behavior.nomtab = args.no_mtab;
    behavior.nohelpers = args.internal_only;
    behavior.sloppy = args.sloppy;
    behavior.verbose = args.verbose;
    behavior.nocanonicalize = args.no_canonicalize;

    let mode = optsmode(args)?;
    if !mode.is_empty() {
        cxt.set_optsmode(mode);
    }
    if let Some(path) = &args.namespace {
        cxt.set_target_ns(Some(path.as_path()))?;
    }
    cxt.set_target_prefix(args.target_prefix.as_deref());
    cxt.set_options_pattern(args.test_opts.as_deref());

    for options in &args.options {
        cxt.append_options(options)?;
    }
    let switches = [
        (args.bind, "bind"),
        (args.rbind, "rbind"),
        (args.move_mount, "move"),
        (args.read_only, "ro"),
        (args.read_write, "rw"),
    ];
    for (_, option) in switches.iter().filter(|(on, _)| *on) {
        cxt.append_options(option)?;
    }
    if let Some(propagation) = args.make {
        cxt.append_options(propagation.option())?;
    }
    if args.read_write {
        cxt.enable_rwonly_mount(true);
    }
    Ok(cxt)
}

fn run_mount(args: &MountArgs, config: EngineConfig) -> Result<i32> {
    let mut cxt = mount_context(args, config)?;

    if args.all {
        cxt.set_fstype_pattern(args.types.as_deref());
        return Ok(mount_all(&mut cxt, args.verbose));
    }

    match (&args.source, &args.target) {
        (Some(source), Some(target)) => {
            cxt.set_source(Some(source));
            cxt.set_target(Some(target));
        }
        // A single argument is looked up in fstab as mountpoint or source.
        (Some(spec), None) | (None, Some(spec)) => cxt.set_target(Some(spec)),
        (None, None) => return Err(eyre!("no mountpoint specified")),
    }
    if let Some(types) = &args.types {
        if types.starts_with("no") {
            cxt.set_fstype_pattern(Some(types));
        } else {
            cxt.set_fstype(Some(types));
        }
    }

    let result = cxt.mount();
    let excode = cxt.get_excode(&result);
    report("mount", &excode);
    if excode.is_success() && args.verbose {
        println!(
            "mount: {} mounted on {}",
            cxt.source().unwrap_or("none"),
            cxt.target().unwrap_or_default()
        );
    }
    Ok(excode.code)
}

fn mount_all(cxt: &mut Context, verbose: bool) -> i32 {
    let mut tally = Tally::default();
    let mut cursor = TabCursor::new();

    loop {
        let entry = match cxt.next_mount(&mut cursor) {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(err) => {
                let excode = cxt.get_excode(&Err(err));
                report("mount", &excode);
                tally.record(&excode);
                break;
            }
        };
        let target = entry.fs.target.as_deref().unwrap_or("none");
        match entry.status {
            NextStatus::Ignored(reason) => {
                if verbose {
                    let why = match reason {
                        Ignored::AlreadyMounted => "already mounted",
                        Ignored::NotMatched => "ignored",
                    };
                    println!("{target:<30}: {why}");
                }
            }
            NextStatus::Done(result) => {
                let excode = cxt.get_excode(&result);
                report("mount", &excode);
                if verbose && excode.is_success() {
                    println!("{target:<30}: successfully mounted");
                }
                tally.record(&excode);
            }
            NextStatus::Spawned => {}
        }
    }

    let children = cxt.wait_for_children();
    tally.failed += children.errors - children.outcomes.iter().filter(|o| o.result.is_err()).count();
    for outcome in &children.outcomes {
        report("mount", &outcome.excode);
        if verbose && outcome.excode.is_success() {
            println!(
                "{:<30}: successfully mounted",
                outcome.fs.target.as_deref().unwrap_or("none")
            );
        }
        tally.record(&outcome.excode);
    }

    tracing::debug!(ok = tally.ok, failed = tally.failed, "Mount-all finished");
    tally.code()
}

fn umount_context(args: &UmountArgs, config: EngineConfig) -> MountResult<Context> {
    let mut cxt = Context::with_config(config);
    let behavior = cxt.behavior_mut();
    behavior.lazy = args.lazy;
    behavior.force = args.force;
    behavior.fake = args.fake;
    behavior.rdonly_umount = args.read_only;
    behavior.nomtab = args.no_mtab;
    behavior.nohelpers = args.internal_only;
    behavior.verbose = args.verbose;
    behavior.nocanonicalize = args.no_canonicalize;

    if let Some(path) = &args.namespace {
        cxt.set_target_ns(Some(path.as_path()))?;
    }
    cxt.set_fstype_pattern(args.types.as_deref());
    cxt.set_options_pattern(args.test_opts.as_deref());
    Ok(cxt)
}

fn run_umount(args: &UmountArgs, config: EngineConfig) -> Result<i32> {
    let mut cxt = umount_context(args, config)?;

    if args.all {
        return Ok(umount_all(&mut cxt, args.verbose));
    }
    let Some(target) = &args.target else {
        return Err(eyre!("no mountpoint specified"));
    };

    cxt.set_target(Some(target));
    let result = cxt.umount();
    let excode = cxt.get_excode(&result);
    report("umount", &excode);
    if excode.is_success() && args.verbose {
        println!("umount: {} unmounted", cxt.target().unwrap_or(target));
    }
    Ok(excode.code)
}

fn umount_all(cxt: &mut Context, verbose: bool) -> i32 {
    let mut tally = Tally::default();
    let mut cursor = TabCursor::new();

    loop {
        let entry = match cxt.next_umount(&mut cursor) {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(err) => {
                let excode = cxt.get_excode(&Err(err));
                report("umount", &excode);
                tally.record(&excode);
                break;
            }
        };
        if let NextStatus::Done(result) = entry.status {
            let excode = cxt.get_excode(&result);
            report("umount", &excode);
            if verbose && excode.is_success() {
                println!(
                    "umount: {} unmounted",
                    entry.fs.target.as_deref().unwrap_or("none")
                );
            }
            tally.record(&excode);
        }
    }
    tally.code()
}

fn list(kind: TableKind, format: &str, config: &EngineConfig) -> Result<()> {
    let provider = FileTableProvider;
    let paths = &config.paths;
    let table = match kind {
        TableKind::Fstab => provider.fstab(&paths.fstab),
        TableKind::Mountinfo => provider.mountinfo(&paths.mountinfo, None).map(|mut table| {
            if let Ok(utab) = provider.utab(&paths.utab) {
                table.merge_user_options(&utab);
            }
            table
        }),
        TableKind::Utab => provider.utab(&paths.utab),
    }
    .map_err(|e| eyre!("Failed to read {kind:?} table: {e}"))?;

    let entries: Vec<Arc<Fs>> = table.iter(Direction::Forward).cloned().collect();
    if format == "json" {
        let list: Vec<&Fs> = entries.iter().map(AsRef::as_ref).collect();
        println!("{}", serde_json::to_string_pretty(&list)?);
    } else if entries.is_empty() {
        println!("No entries");
    } else {
        let rows: Vec<FsRow> = entries.iter().map(|fs| FsRow::from(fs.as_ref())).collect();
        println!("{}", Table::new(rows));
    }
    Ok(())
}
