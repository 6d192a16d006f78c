// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Operator CLI for driving one VM's lifecycle.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use slog::{info, o, Drain, Logger};

use bridle::compile::Defaults;
use bridle::hotplug::SleepPacer;
use bridle::lifecycle::{
    StartOpts, StopOpts, VmManager, LOCK_TIMEOUT,
};
use bridle::process::RunPaths;
use bridle::store::{ConfigStore, VmLockFile};
use bridle_config::devspec::Descriptor;
use bridle_config::record::DeleteMode;
use bridle_types::{DeviceId, VmId};

mod launch;
mod qmp;
mod store;
mod volumes;

fn parse_log_level(s: &str) -> anyhow::Result<slog::Level> {
    s.parse().map_err(|_| anyhow::anyhow!("Invalid log level"))
}

#[derive(Debug, Parser)]
#[clap(about, version)]
/// Control plane for QEMU/KVM virtual machines
struct Args {
    /// Directory holding the per-VM config records
    #[clap(long, default_value = "/etc/bridle")]
    config_dir: PathBuf,

    /// Directory for sockets, pidfiles, and lock files
    #[clap(long, default_value = "/run/bridle")]
    run_dir: PathBuf,

    /// Root of the file-backed volume pools
    #[clap(long, default_value = "/var/lib/bridle/images")]
    volume_root: PathBuf,

    /// Emulator binary to invoke
    #[clap(long, default_value = "/usr/bin/qemu-system-x86_64")]
    emulator: PathBuf,

    #[clap(long, default_value_t = slog::Level::Info,
        value_parser = parse_log_level)]
    log_level: slog::Level,

    #[clap(subcommand)]
    cmd: Cmd,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Start the instance
    Start {
        vmid: VmId,
        /// Ignore the in-config operation lock
        #[clap(long)]
        skip_lock: bool,
    },
    /// Stop the instance, escalating from graceful shutdown to SIGKILL
    Stop {
        vmid: VmId,
        /// Seconds to wait for a cooperative shutdown before escalating
        #[clap(long, default_value_t = 60)]
        grace: u64,
        #[clap(long)]
        skip_lock: bool,
    },
    /// Pause the instance, or save its state to disk and stop it
    Suspend {
        vmid: VmId,
        #[clap(long)]
        to_disk: bool,
    },
    /// Resume a paused instance
    Resume { vmid: VmId },
    /// Reconcile pending config edits with the instance
    Apply { vmid: VmId },
    /// Stage a configuration edit
    Set { vmid: VmId, key: String, value: String },
    /// Stage removal of a configuration option
    Unset {
        vmid: VmId,
        key: String,
        /// Destroy the option's backing data when the removal applies
        #[clap(long)]
        force: bool,
    },
    /// Create a snapshot
    Snapshot {
        vmid: VmId,
        name: String,
        /// Also save the running guest's memory state
        #[clap(long)]
        vmstate: bool,
    },
    /// Delete a snapshot
    Delsnapshot {
        vmid: VmId,
        name: String,
        /// Press on past per-drive errors
        #[clap(long)]
        force: bool,
    },
    /// Roll the VM back to a snapshot
    Rollback { vmid: VmId, name: String },
    /// Print the emulator invocation the current config compiles to
    ShowCmd { vmid: VmId },
    /// Report whether the instance is running
    Status { vmid: VmId },
}

impl Cmd {
    fn vmid(&self) -> VmId {
        match self {
            Cmd::Start { vmid, .. }
            | Cmd::Stop { vmid, .. }
            | Cmd::Suspend { vmid, .. }
            | Cmd::Resume { vmid }
            | Cmd::Apply { vmid }
            | Cmd::Set { vmid, .. }
            | Cmd::Unset { vmid, .. }
            | Cmd::Snapshot { vmid, .. }
            | Cmd::Delsnapshot { vmid, .. }
            | Cmd::Rollback { vmid, .. }
            | Cmd::ShowCmd { vmid }
            | Cmd::Status { vmid } => *vmid,
        }
    }
}

fn build_logger(level: slog::Level) -> Logger {
    let main_drain = if atty::is(atty::Stream::Stdout) {
        let decorator = slog_term::TermDecorator::new().build();
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        slog_async::Async::new(drain)
            .overflow_strategy(slog_async::OverflowStrategy::Block)
            .build_no_guard()
    } else {
        let drain = slog_bunyan::with_name("bridled", std::io::stdout())
            .build()
            .fuse();
        slog_async::Async::new(drain)
            .overflow_strategy(slog_async::OverflowStrategy::Block)
            .build_no_guard()
    };
    Logger::root(
        slog::LevelFilter::new(main_drain, level).fuse(),
        o!(),
    )
}

async fn run(args: Args, log: Logger) -> anyhow::Result<()> {
    let vmid = args.cmd.vmid();
    std::fs::create_dir_all(&args.run_dir)
        .context("creating run directory")?;

    let paths = RunPaths::new(&args.run_dir, vmid);
    let store = store::DirConfigStore::new(args.config_dir.clone());
    let volumes = volumes::FileVolumes::new(args.volume_root.clone());
    let monitor = qmp::QmpMonitor::new(paths.qmp_socket.clone());
    let agent = qmp::QgaChannel::new(paths.qga_socket.clone());
    let launcher =
        launch::OsLauncher::new(args.emulator.clone(), args.run_dir.clone());
    let version = launch::probe_version(&args.emulator)
        .context("probing emulator version")?;

    let manager = VmManager {
        vmid,
        store: &store,
        volumes: &volumes,
        monitor: &monitor,
        agent: &agent,
        launcher: &launcher,
        pacer: &SleepPacer,
        defaults: Defaults::default(),
        host: launch::probe_host(),
        version,
        lock_dir: args.run_dir.clone(),
        run_dir: args.run_dir.clone(),
        lock_timeout: LOCK_TIMEOUT,
        log: log.new(o!("vm" => vmid.to_string())),
    };

    match args.cmd {
        Cmd::Start { skip_lock, .. } => {
            manager.start(StartOpts { skip_lock }).await?;
        }
        Cmd::Stop { grace, skip_lock, .. } => {
            let tier = manager
                .stop(StopOpts {
                    skip_lock,
                    grace: Duration::from_secs(grace),
                })
                .await?;
            println!("stopped ({})", tier);
        }
        Cmd::Suspend { to_disk, .. } => {
            manager.suspend(to_disk).await?;
        }
        Cmd::Resume { .. } => {
            manager.resume().await?;
        }
        Cmd::Apply { .. } => {
            let report = manager.apply_pending(false).await?;
            for key in &report.applied {
                println!("applied: {}", key);
            }
            for (key, err) in &report.errors {
                println!("failed: {}: {}", key, err);
            }
            if !report.errors.is_empty() {
                bail!("{} pending change(s) failed", report.errors.len());
            }
        }
        Cmd::Set { key, value, .. } => {
            stage_edit(&store, vmid, &args.run_dir, &key, value)?;
        }
        Cmd::Unset { key, force, .. } => {
            let _flock =
                VmLockFile::acquire(&args.run_dir, vmid, LOCK_TIMEOUT)?;
            let mut cfg = store.read(vmid)?;
            let mode = if force {
                DeleteMode::Force
            } else {
                DeleteMode::Soft
            };
            cfg.mark_pending_delete(&key, mode)?;
            store.write(vmid, &cfg)?;
        }
        Cmd::Snapshot { name, vmstate, .. } => {
            manager.snapshot_create(&name, vmstate).await?;
            info!(log, "snapshot created"; "name" => name);
        }
        Cmd::Delsnapshot { name, force, .. } => {
            manager.snapshot_delete(&name, force).await?;
        }
        Cmd::Rollback { name, .. } => {
            manager.snapshot_rollback(&name).await?;
        }
        Cmd::ShowCmd { .. } => {
            let out = manager.show_command()?;
            println!("{} {}", args.emulator.display(), out.argv.join(" "));
        }
        Cmd::Status { .. } => {
            let cfg = store.read(vmid)?;
            let state = if manager.running().await {
                "running"
            } else {
                "stopped"
            };
            match cfg.lock {
                Some(lock) => println!("{} (lock: {})", state, lock),
                None => println!("{}", state),
            }
        }
    }
    Ok(())
}

/// Stage one edit. Device descriptors are parsed and re-printed so the
/// stored value is canonical and carries a concrete MAC address.
fn stage_edit(
    store: &store::DirConfigStore,
    vmid: VmId,
    lock_dir: &std::path::Path,
    key: &str,
    value: String,
) -> anyhow::Result<()> {
    let _flock = VmLockFile::acquire(lock_dir, vmid, LOCK_TIMEOUT)?;
    let mut cfg = store.read(vmid)?;
    let value = match DeviceId::from_str(key) {
        Ok(id) => Descriptor::parse(id, &value)
            .with_context(|| format!("parsing {} descriptor", key))?
            .print(),
        Err(_) => value,
    };
    cfg.set_pending(key, value)?;
    store.write(vmid, &cfg)?;
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let log = build_logger(args.log_level);
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(args, log))
}
