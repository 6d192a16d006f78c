// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The lifecycle and lock manager.
//!
//! All state-changing operations against one VM serialize here: a bounded
//! advisory file lock guards each critical section, the config is re-read
//! fresh after every acquisition, and the in-config operation lock refuses
//! overlapping long operations even across control-plane restarts (it
//! lives in the config store, so every node sees it).
//!
//! Operations that perform real side effects incrementally (start, stop,
//! the snapshot family) are written so the persisted config always matches
//! what has actually been done, even when aborting partway.

use std::path::PathBuf;
use std::time::Duration;

use bridle_config::devspec::{DriveSpec, NetSpec, ParseError, VolumeRef};
use bridle_config::record::{typed_opt, OptionMap, SnapState};
use bridle_config::{OperationLock, RecordError, VmConfig};
use bridle_types::{
    DeviceId, HypervisorVersion, MachineType, VmId,
};
use slog::{info, o, warn, Logger};
use thiserror::Error;
use uuid::Uuid;

use crate::compile::{
    self, CompileEnv, CompileError, CompiledCommand, Defaults, HostCaps,
};
use crate::hotplug::{self, HotplugCtx, HotplugError, HotplugReport, Pacer};
use crate::monitor::{GuestAgent, Mon, Monitor, MonitorError};
use crate::process::{CgroupLimits, Launcher, ProcessError, RunPaths};
use crate::store::{ConfigStore, LockError, StoreError, VmLockFile};
use crate::volume::{VolumeError, VolumeManager};

mod snapshot;

/// How long a blocking lock acquisition waits before raising busy.
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(10);

const MONITOR_WAIT_TRIES: u32 = 30;
const TERM_WAIT_TRIES: u32 = 10;
const KILL_WAIT_TRIES: u32 = 5;
const WAIT_INTERVAL: Duration = Duration::from_secs(1);

/// Which escalation tier a stop reached. Surfaced on success and failure
/// so operators can tell a soft guest hang from a stuck process.
#[derive(Clone, Copy, PartialEq, Eq, Debug, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum StopTier {
    Graceful,
    Term,
    Kill,
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("VM {0} is locked ({1})")]
    Locked(VmId, OperationLock),

    #[error(transparent)]
    Busy(#[from] LockError),

    #[error("instance is already running")]
    AlreadyRunning,

    #[error("instance is not running")]
    NotRunning,

    #[error("invalid snapshot name {0:?}")]
    BadSnapshotName(String),

    #[error("snapshot {0:?} already exists")]
    SnapshotExists(String),

    #[error("no snapshot {0:?}")]
    NoSuchSnapshot(String),

    #[error("snapshot {name:?} has unfinished state {state}")]
    SnapshotBusy { name: String, state: SnapState },

    #[error("stop failed at the {tier} tier: {msg}")]
    StopFailed { tier: StopTier, msg: String },

    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Hotplug(#[from] HotplugError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Record(#[from] RecordError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Volume(#[from] VolumeError),

    #[error(transparent)]
    Monitor(#[from] MonitorError),

    #[error(transparent)]
    Process(#[from] ProcessError),
}

#[derive(Clone, Copy, Debug, Default)]
pub struct StartOpts {
    /// Privileged override: ignore the in-config operation lock.
    pub skip_lock: bool,
}

#[derive(Clone, Copy, Debug)]
pub struct StopOpts {
    pub skip_lock: bool,
    /// How long the graceful tier waits before escalating.
    pub grace: Duration,
}

impl Default for StopOpts {
    fn default() -> Self {
        Self { skip_lock: false, grace: Duration::from_secs(60) }
    }
}

/// One VM's operation surface, wired to the collaborators.
pub struct VmManager<'a> {
    pub vmid: VmId,
    pub store: &'a dyn ConfigStore,
    pub volumes: &'a dyn VolumeManager,
    pub monitor: &'a dyn Monitor,
    pub agent: &'a dyn GuestAgent,
    pub launcher: &'a dyn Launcher,
    pub pacer: &'a dyn Pacer,
    pub defaults: Defaults,
    pub host: HostCaps,
    pub version: HypervisorVersion,
    pub lock_dir: PathBuf,
    pub run_dir: PathBuf,
    pub lock_timeout: Duration,
    pub log: Logger,
}

/// The drive descriptors of an option map, in identity order.
pub(crate) fn drives_of(
    options: &OptionMap,
) -> Result<Vec<(DeviceId, DriveSpec)>, ParseError> {
    let mut out = Vec::new();
    for (key, raw) in options {
        if let Ok(id) = key.parse::<DeviceId>() {
            if id.kind().is_drive() {
                out.push((id, DriveSpec::parse(id.kind(), raw)?));
            }
        }
    }
    out.sort_by_key(|(id, _)| *id);
    Ok(out)
}

impl VmManager<'_> {
    fn flock(&self) -> Result<VmLockFile, LifecycleError> {
        Ok(VmLockFile::acquire(
            &self.lock_dir,
            self.vmid,
            self.lock_timeout,
        )?)
    }

    fn read_fresh(&self) -> Result<VmConfig, LifecycleError> {
        Ok(self.store.read(self.vmid)?)
    }

    fn check_lock(
        &self,
        cfg: &VmConfig,
        skip: bool,
    ) -> Result<(), LifecycleError> {
        match cfg.lock {
            Some(lock) if !skip => {
                Err(LifecycleError::Locked(self.vmid, lock))
            }
            _ => Ok(()),
        }
    }

    pub async fn running(&self) -> bool {
        Mon(self.monitor).ping().await.is_ok()
    }

    fn paths(&self) -> RunPaths {
        RunPaths::new(&self.run_dir, self.vmid)
    }

    fn instance_pid(&self) -> Option<u32> {
        std::fs::read_to_string(self.paths().pidfile)
            .ok()?
            .trim()
            .parse()
            .ok()
    }

    fn compile_cfg(
        &self,
        cfg: &VmConfig,
        machine_override: Option<MachineType>,
    ) -> Result<CompiledCommand, LifecycleError> {
        let env = CompileEnv {
            defaults: &self.defaults,
            host: self.host,
            version: self.version,
            machine_override,
            volumes: self.volumes,
            run_dir: &self.run_dir,
            log: &self.log,
        };
        Ok(compile::compile(self.vmid, cfg, &env)?)
    }

    /// Compile the current configuration without side effects; the CLI
    /// uses this to show the would-be invocation.
    pub fn show_command(&self) -> Result<CompiledCommand, LifecycleError> {
        let cfg = self.read_fresh()?;
        let pinned =
            typed_opt::<MachineType>(&cfg.active, "runningmachine")?;
        self.compile_cfg(&cfg, pinned)
    }

    /// The pool that holds memory-state volumes: wherever the first
    /// configured drive lives.
    pub(crate) fn state_pool(
        &self,
        cfg: &VmConfig,
    ) -> Result<String, LifecycleError> {
        for (_, spec) in drives_of(&cfg.active)? {
            if let VolumeRef::Volume { store, .. } = spec.volume {
                return Ok(store);
            }
        }
        Err(LifecycleError::Compile(CompileError::Config(
            "no storage pool available for the state volume".to_string(),
        )))
    }

    /// Whether any snapshot still references this state volume; such a
    /// volume must survive a resume.
    fn state_volume_is_snapshotted(
        &self,
        cfg: &VmConfig,
        volume: &VolumeRef,
    ) -> bool {
        let needle = volume.to_string();
        cfg.snapshots
            .values()
            .any(|snap| snap.vmstate.as_deref() == Some(needle.as_str()))
    }

    async fn wait_monitor_up(&self) -> bool {
        for attempt in 0..MONITOR_WAIT_TRIES {
            if attempt > 0 {
                self.pacer.pause(WAIT_INTERVAL).await;
            }
            if self.running().await {
                return true;
            }
        }
        false
    }

    async fn wait_monitor_down(&self, tries: u32) -> bool {
        for attempt in 0..tries {
            if attempt > 0 {
                self.pacer.pause(WAIT_INTERVAL).await;
            }
            if !self.running().await {
                return true;
            }
        }
        false
    }

    async fn wait_process_dead(&self, pid: u32, tries: u32) -> bool {
        for attempt in 0..tries {
            if attempt > 0 {
                self.pacer.pause(WAIT_INTERVAL).await;
            }
            if !self.launcher.alive(pid) {
                return true;
            }
        }
        false
    }

    /// Start the instance.
    pub async fn start(&self, opts: StartOpts) -> Result<(), LifecycleError> {
        let log = self.log.new(o!(
            "op" => "start",
            "op_id" => Uuid::new_v4().to_string(),
        ));
        let _flock = self.flock()?;
        let mut cfg = self.read_fresh()?;
        // A suspended instance restarts by resuming its saved state; any
        // other lock refuses the start.
        let resuming = cfg.lock == Some(OperationLock::Suspended);
        if !resuming {
            self.check_lock(&cfg, opts.skip_lock)?;
        }
        if self.running().await {
            return Err(LifecycleError::AlreadyRunning);
        }

        if !resuming && !cfg.pending.is_empty() {
            let applied = hotplug::apply_pending_cold(
                self.vmid,
                &mut cfg,
                self.volumes,
                &log,
            )?;
            self.store.write(self.vmid, &cfg)?;
            info!(log, "applied pending changes before start";
                "count" => applied.len());
        }

        let pinned =
            typed_opt::<MachineType>(&cfg.active, "runningmachine")?;
        let out = self.compile_cfg(&cfg, pinned)?;
        let mut argv = out.argv.clone();

        let state_volume = if resuming {
            match cfg.active.get("vmstate") {
                Some(raw) => Some(raw.parse::<VolumeRef>()?),
                None => None,
            }
        } else {
            None
        };
        if let Some(volume) = &state_volume {
            let path = self.volumes.resolve_path(self.vmid, volume)?;
            argv.push("-loadstate".to_string());
            argv.push(path.display().to_string());
        }

        self.volumes.activate(self.vmid, &out.used_volumes)?;
        let limits = CgroupLimits {
            cpu_shares: typed_opt::<u32>(&cfg.active, "cpuunits")?,
            cpu_quota: typed_opt::<f64>(&cfg.active, "cpulimit")?,
        };
        let pid = match self.launcher.spawn(
            self.vmid,
            &argv,
            &[],
            0o027,
            &limits,
        ) {
            Ok(pid) => pid,
            Err(err) => {
                if let Err(e) =
                    self.volumes.deactivate(self.vmid, &out.used_volumes)
                {
                    warn!(log, "deactivation after failed spawn";
                        "error" => %e);
                }
                return Err(err.into());
            }
        };

        if !self.wait_monitor_up().await {
            warn!(log, "instance never became reachable, tearing down";
                "pid" => pid);
            let _ = self.launcher.kill(pid);
            if let Err(e) =
                self.volumes.deactivate(self.vmid, &out.used_volumes)
            {
                warn!(log, "teardown deactivation"; "error" => %e);
            }
            self.remove_run_files(&out);
            return Err(LifecycleError::Process(ProcessError::EarlyExit(
                "monitor never became reachable".to_string(),
            )));
        }

        if resuming {
            cfg.lock = None;
            cfg.active.remove("vmstate");
            cfg.active.remove("runningmachine");
            self.store.write(self.vmid, &cfg)?;
            if let Some(volume) = &state_volume {
                if !self.state_volume_is_snapshotted(&cfg, volume) {
                    if let Err(e) = self.volumes.free(self.vmid, volume) {
                        warn!(log, "freeing consumed state volume";
                            "volume" => %volume, "error" => %e);
                    }
                }
            }
        }

        self.post_start_fixups(&cfg, &log).await;
        info!(log, "instance started"; "pid" => pid);
        Ok(())
    }

    /// Adjustments only expressible against a live instance: NICs
    /// configured link-down, and the balloon target.
    async fn post_start_fixups(&self, cfg: &VmConfig, log: &Logger) {
        let mon = Mon(self.monitor);
        for (key, raw) in &cfg.active {
            let id = match key.parse::<DeviceId>() {
                Ok(id) if id.kind() == bridle_types::DeviceKind::Net => id,
                _ => continue,
            };
            let spec = match NetSpec::parse(raw) {
                Ok(spec) => spec,
                Err(_) => continue,
            };
            if spec.link_down == Some(true) {
                if let Err(e) = mon.set_link(&id.to_string(), false).await {
                    warn!(log, "post-start link fixup";
                        "device" => %id, "error" => %e);
                }
            }
        }
        if let Ok(Some(balloon)) = typed_opt::<u64>(&cfg.active, "balloon") {
            if balloon > 0 {
                if let Err(e) = mon.balloon(balloon << 20).await {
                    warn!(log, "post-start balloon target"; "error" => %e);
                }
            }
        }
    }

    /// Stop the instance, escalating graceful -> SIGTERM -> SIGKILL, each
    /// tier with its own bounded wait. Cleanup runs exactly once at the
    /// end regardless of which tier succeeded.
    pub async fn stop(
        &self,
        opts: StopOpts,
    ) -> Result<StopTier, LifecycleError> {
        let _flock = self.flock()?;
        let cfg = self.read_fresh()?;
        self.check_lock(&cfg, opts.skip_lock)?;
        if !self.running().await {
            return Err(LifecycleError::NotRunning);
        }
        let result = self.escalate_stop(&cfg, &opts).await;
        self.cleanup(&cfg);
        if let Ok(tier) = &result {
            info!(self.log, "instance stopped"; "tier" => %tier);
        }
        result
    }

    async fn escalate_stop(
        &self,
        cfg: &VmConfig,
        opts: &StopOpts,
    ) -> Result<StopTier, LifecycleError> {
        let agent_on =
            typed_opt::<u8>(&cfg.active, "agent")?.unwrap_or(0) != 0;
        let graceful_sent = if agent_on && self.agent.ping().await {
            self.agent.shutdown().await.is_ok()
        } else {
            Mon(self.monitor).system_powerdown().await.is_ok()
        };
        let grace_tries = opts.grace.as_secs().max(1) as u32;
        if graceful_sent && self.wait_monitor_down(grace_tries).await {
            return Ok(StopTier::Graceful);
        }

        let pid = match self.instance_pid() {
            Some(pid) => pid,
            None => {
                return Err(LifecycleError::StopFailed {
                    tier: StopTier::Graceful,
                    msg: "guest ignored shutdown and no pidfile is present"
                        .to_string(),
                })
            }
        };
        self.launcher.terminate(pid)?;
        if self.wait_process_dead(pid, TERM_WAIT_TRIES).await {
            return Ok(StopTier::Term);
        }
        self.launcher.kill(pid)?;
        if self.wait_process_dead(pid, KILL_WAIT_TRIES).await {
            return Ok(StopTier::Kill);
        }
        Err(LifecycleError::StopFailed {
            tier: StopTier::Kill,
            msg: format!("pid {} survived SIGKILL", pid),
        })
    }

    /// Deactivate volumes and clear transient runtime files. Best-effort;
    /// failures are logged, never raised.
    fn cleanup(&self, cfg: &VmConfig) {
        match drives_of(&cfg.active) {
            Ok(drives) => {
                let volumes: Vec<VolumeRef> =
                    drives.into_iter().map(|(_, s)| s.volume).collect();
                if let Err(e) =
                    self.volumes.deactivate(self.vmid, &volumes)
                {
                    warn!(self.log, "volume deactivation"; "error" => %e);
                }
            }
            Err(e) => {
                warn!(self.log, "skipping volume deactivation";
                    "error" => %e)
            }
        }
        let paths = self.paths();
        for path in
            paths.sockets().into_iter().chain([paths.pidfile.clone()])
        {
            let _ = std::fs::remove_file(path);
        }
    }

    fn remove_run_files(&self, out: &CompiledCommand) {
        for path in &out.sidecar_sockets {
            let _ = std::fs::remove_file(path);
        }
        let _ = std::fs::remove_file(self.paths().pidfile);
    }

    /// Pause execution in RAM, or save state to disk and stop.
    pub async fn suspend(
        &self,
        to_disk: bool,
    ) -> Result<(), LifecycleError> {
        {
            let _flock = self.flock()?;
            let mut cfg = self.read_fresh()?;
            self.check_lock(&cfg, false)?;
            if !self.running().await {
                return Err(LifecycleError::NotRunning);
            }
            if !to_disk {
                Mon(self.monitor).pause().await?;
                return Ok(());
            }
            cfg.lock = Some(OperationLock::Suspending);
            self.store.write(self.vmid, &cfg)?;
        }
        match self.suspend_data_phase().await {
            Ok(state_volume) => {
                let _flock = self.flock()?;
                let mut cfg = self.read_fresh()?;
                cfg.active.insert(
                    "vmstate".to_string(),
                    state_volume.to_string(),
                );
                let machine = cfg
                    .active
                    .get("machine")
                    .cloned()
                    .unwrap_or_else(|| self.defaults.machine.to_string());
                cfg.active.insert("runningmachine".to_string(), machine);
                cfg.lock = Some(OperationLock::Suspended);
                self.store.write(self.vmid, &cfg)?;
                let _ = Mon(self.monitor).quit().await;
                self.cleanup(&cfg);
                Ok(())
            }
            Err(err) => {
                let _flock = self.flock()?;
                let mut cfg = self.read_fresh()?;
                cfg.lock = None;
                self.store.write(self.vmid, &cfg)?;
                Err(err)
            }
        }
    }

    async fn suspend_data_phase(
        &self,
    ) -> Result<VolumeRef, LifecycleError> {
        let cfg = self.read_fresh()?;
        let memory_mib = typed_opt::<u64>(&cfg.active, "memory")?
            .unwrap_or(self.defaults.memory_mib);
        let pool = self.state_pool(&cfg)?;
        // state needs the guest memory plus device state headroom
        let size = bridle_types::ByteQty::from_mib(
            memory_mib + memory_mib / 10 + 32,
        );
        let name = format!("vm-{}-state-suspend", self.vmid);
        let volume = self.volumes.allocate(
            &pool,
            self.vmid,
            "raw",
            size,
            Some(&name),
        )?;
        let path = self.volumes.resolve_path(self.vmid, &volume)?;
        let mon = Mon(self.monitor);
        if let Err(err) =
            mon.savevm_start(&path.display().to_string()).await
        {
            let _ = self.volumes.free(self.vmid, &volume);
            return Err(err.into());
        }
        if let Err(err) = mon.savevm_end().await {
            let _ = self.volumes.free(self.vmid, &volume);
            return Err(err.into());
        }
        Ok(volume)
    }

    /// Resume a RAM-paused instance.
    pub async fn resume(&self) -> Result<(), LifecycleError> {
        let _flock = self.flock()?;
        let cfg = self.read_fresh()?;
        self.check_lock(&cfg, false)?;
        if !self.running().await {
            return Err(LifecycleError::NotRunning);
        }
        Mon(self.monitor).resume().await?;
        Ok(())
    }

    /// Reconcile pending edits with the instance: hotplug when running,
    /// plain promotion when stopped.
    pub async fn apply_pending(
        &self,
        skip_lock: bool,
    ) -> Result<HotplugReport, LifecycleError> {
        let _flock = self.flock()?;
        let mut cfg = self.read_fresh()?;
        self.check_lock(&cfg, skip_lock)?;
        if cfg.pending.is_empty() {
            return Ok(HotplugReport::default());
        }
        if !self.running().await {
            let applied = hotplug::apply_pending_cold(
                self.vmid,
                &mut cfg,
                self.volumes,
                &self.log,
            )?;
            self.store.write(self.vmid, &cfg)?;
            return Ok(HotplugReport { applied, ..Default::default() });
        }
        let ctx = HotplugCtx {
            vmid: self.vmid,
            monitor: self.monitor,
            volumes: self.volumes,
            store: self.store,
            pacer: self.pacer,
            defaults: &self.defaults,
            log: &self.log,
        };
        Ok(hotplug::apply_pending(&ctx, &mut cfg).await?)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testutil::{
        FakeAgent, FakeLauncher, FakeMonitor, FakeVolumes, MemStore,
        NullPacer,
    };
    use std::str::FromStr;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    pub(crate) const CONFIG: &str = "\
name: web1
agent: 0
cores: 2
memory: 1024
net0: virtio,bridge=vmbr0,macaddr=BC:24:11:2A:2B:2C
scsi0: tank:vm-100-disk-0
scsi1: tank:vm-100-disk-1
scsi2: tank:vm-100-disk-2
scsihw: virtio-scsi-pci
";

    pub(crate) struct Rig {
        pub(crate) monitor: Arc<FakeMonitor>,
        pub(crate) volumes: Arc<FakeVolumes>,
        pub(crate) store: Arc<MemStore>,
        pub(crate) launcher: Arc<FakeLauncher>,
        pub(crate) agent: Arc<FakeAgent>,
        pub(crate) lock_dir: tempfile::TempDir,
        pub(crate) run_dir: tempfile::TempDir,
    }

    /// A rig over the standard three-drive config.
    pub(crate) fn rig() -> Rig {
        Rig::new(CONFIG)
    }

    impl Rig {
        pub(crate) fn new(config: &str) -> Self {
            let vmid = VmId::from_str("100").unwrap();
            let monitor = Arc::new(FakeMonitor::default());
            {
                let mut st = monitor.state.lock().unwrap();
                st.auto_confirm = true;
                st.powerdown_stops = true;
            }
            Self {
                launcher: Arc::new(FakeLauncher::new(monitor.clone())),
                agent: Arc::new(FakeAgent::new(monitor.clone())),
                volumes: Arc::new(FakeVolumes::default()),
                store: MemStore::with(
                    vmid,
                    VmConfig::parse(config).unwrap(),
                ),
                monitor,
                lock_dir: tempfile::tempdir().unwrap(),
                run_dir: tempfile::tempdir().unwrap(),
            }
        }

        pub(crate) fn manager(&self) -> VmManager<'_> {
            VmManager {
                vmid: VmId::from_str("100").unwrap(),
                store: &*self.store,
                volumes: &*self.volumes,
                monitor: &*self.monitor,
                agent: &*self.agent,
                launcher: &*self.launcher,
                pacer: &NullPacer,
                defaults: Defaults::default(),
                host: HostCaps { logical_cpus: 8, hw_virt: true },
                version: HypervisorVersion::new(9, 0, 2),
                lock_dir: self.lock_dir.path().to_path_buf(),
                run_dir: self.run_dir.path().to_path_buf(),
                lock_timeout: Duration::from_millis(50),
                log: Logger::root(slog::Discard, o!()),
            }
        }

        pub(crate) fn config(&self) -> VmConfig {
            self.store.get(VmId::from_str("100").unwrap())
        }

        pub(crate) fn write_pidfile(&self) {
            std::fs::write(self.run_dir.path().join("100.pid"), "4242\n")
                .unwrap();
        }
    }

    #[tokio::test]
    async fn start_then_start_again() {
        let rig = Rig::new(CONFIG);
        let mgr = rig.manager();
        mgr.start(StartOpts::default()).await.unwrap();
        assert_eq!(rig.launcher.spawns.lock().unwrap().len(), 1);
        // second attempt sees a live instance
        match mgr.start(StartOpts::default()).await {
            Err(LifecycleError::AlreadyRunning) => {}
            other => panic!("expected AlreadyRunning, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn concurrent_start_observes_busy_lock() {
        let rig = Rig::new(CONFIG);
        let mgr = rig.manager();
        let _held = VmLockFile::acquire(
            rig.lock_dir.path(),
            VmId::from_str("100").unwrap(),
            Duration::from_millis(10),
        )
        .unwrap();
        match mgr.start(StartOpts::default()).await {
            Err(LifecycleError::Busy(LockError::Busy(_))) => {}
            other => panic!("expected Busy, got {:?}", other),
        }
        // nothing was spawned by the loser
        assert!(rig.launcher.spawns.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn start_refuses_operation_lock() {
        let rig = Rig::new(&format!("lock: backup\n{}", CONFIG));
        let mgr = rig.manager();
        match mgr.start(StartOpts::default()).await {
            Err(LifecycleError::Locked(_, OperationLock::Backup)) => {}
            other => panic!("expected Locked, got {:?}", other),
        }
        // the privileged override goes through
        mgr.start(StartOpts { skip_lock: true }).await.unwrap();
    }

    #[tokio::test]
    async fn start_applies_pending_cold() {
        let rig = Rig::new(&format!("{}[PENDING]\nmemory: 2048\n", CONFIG));
        let mgr = rig.manager();
        mgr.start(StartOpts::default()).await.unwrap();
        let cfg = rig.config();
        assert_eq!(cfg.active.get("memory").unwrap(), "2048");
        assert!(cfg.pending.is_empty());
    }

    #[tokio::test]
    async fn failed_start_tears_down() {
        let rig = Rig::new(CONFIG);
        // monitor never comes up
        rig.launcher.connect_on_spawn.store(false, Ordering::SeqCst);
        let mgr = rig.manager();
        match mgr.start(StartOpts::default()).await {
            Err(LifecycleError::Process(ProcessError::EarlyExit(_))) => {}
            other => panic!("expected EarlyExit, got {:?}", other),
        }
        assert!(rig.launcher.signals().contains(&"kill"));
        assert!(rig
            .volumes
            .ops()
            .iter()
            .any(|op| op.starts_with("deactivate")));
    }

    #[tokio::test]
    async fn stop_graceful_by_powerdown() {
        let rig = Rig::new(CONFIG);
        let mgr = rig.manager();
        mgr.start(StartOpts::default()).await.unwrap();
        let tier = mgr.stop(StopOpts::default()).await.unwrap();
        assert_eq!(tier, StopTier::Graceful);
        assert!(rig.launcher.signals().is_empty());
    }

    #[tokio::test]
    async fn stop_escalates_to_kill() {
        let rig = Rig::new(CONFIG);
        let mgr = rig.manager();
        mgr.start(StartOpts::default()).await.unwrap();
        rig.write_pidfile();
        {
            let mut st = rig.monitor.state.lock().unwrap();
            st.powerdown_stops = false;
        }
        rig.launcher.dies_on_term.store(false, Ordering::SeqCst);
        let tier = mgr
            .stop(StopOpts {
                grace: Duration::from_secs(2),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(tier, StopTier::Kill);
        assert_eq!(rig.launcher.signals(), ["term", "kill"]);
        // cleanup ran exactly once
        let deactivations = rig
            .volumes
            .ops()
            .iter()
            .filter(|op| op.starts_with("deactivate"))
            .count();
        assert_eq!(deactivations, 3);
    }

    #[tokio::test]
    async fn stop_graceful_via_agent() {
        let rig = Rig::new(&CONFIG.replace("agent: 0", "agent: 1"));
        let mgr = rig.manager();
        mgr.start(StartOpts::default()).await.unwrap();
        rig.agent.live.store(true, Ordering::SeqCst);
        let tier = mgr.stop(StopOpts::default()).await.unwrap();
        assert_eq!(tier, StopTier::Graceful);
        assert_eq!(rig.agent.shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stop_requires_running_instance() {
        let rig = Rig::new(CONFIG);
        let mgr = rig.manager();
        match mgr.stop(StopOpts::default()).await {
            Err(LifecycleError::NotRunning) => {}
            other => panic!("expected NotRunning, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn suspend_to_disk_stamps_locks() {
        let rig = Rig::new(CONFIG);
        let mgr = rig.manager();
        mgr.start(StartOpts::default()).await.unwrap();
        mgr.suspend(true).await.unwrap();
        let cfg = rig.config();
        assert_eq!(cfg.lock, Some(OperationLock::Suspended));
        assert!(cfg.active.get("vmstate").unwrap().contains("state"));
        // saved state goes through the long-timeout save commands
        assert_eq!(rig.monitor.calls_of("savevm-start").len(), 1);
        assert_eq!(rig.monitor.calls_of("savevm-end").len(), 1);
    }

    #[tokio::test]
    async fn resume_from_disk_clears_residue() {
        let rig = Rig::new(CONFIG);
        let mgr = rig.manager();
        mgr.start(StartOpts::default()).await.unwrap();
        mgr.suspend(true).await.unwrap();
        mgr.start(StartOpts::default()).await.unwrap();
        let cfg = rig.config();
        assert_eq!(cfg.lock, None);
        assert!(!cfg.active.contains_key("vmstate"));
        // the consumed state volume was freed
        assert!(rig
            .volumes
            .ops()
            .iter()
            .any(|op| op.starts_with("free") && op.contains("state")));
        // and the restart passed the state file to the emulator
        let spawns = rig.launcher.spawns.lock().unwrap();
        assert!(spawns[1].iter().any(|a| a == "-loadstate"));
    }
}
