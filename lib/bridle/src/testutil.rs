// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fake collaborators for engine and lifecycle tests.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bridle_config::devspec::VolumeRef;
use bridle_config::VmConfig;
use bridle_types::{ByteQty, VmId};
use serde_json::{json, Value};

use crate::hotplug::Pacer;
use crate::monitor::{GuestAgent, Monitor, MonitorError};
use crate::process::{CgroupLimits, Launcher, ProcessError};
use crate::store::{ConfigStore, StoreError};
use crate::volume::{VolumeError, VolumeManager};

/// A pacer that never sleeps, so verify loops run out their tries
/// instantly.
pub struct NullPacer;

#[async_trait]
impl Pacer for NullPacer {
    async fn pause(&self, _interval: Duration) {}
}

#[derive(Default)]
pub struct FakeMonitorState {
    pub running: bool,
    /// Ids visible in the live device inventory.
    pub devices: BTreeSet<String>,
    pub calls: Vec<(String, Value)>,
    /// Whether device_add/device_del immediately update the inventory.
    pub auto_confirm: bool,
    /// Whether the guest honors system_powerdown.
    pub powerdown_stops: bool,
    /// Fail the nth (1-based) invocation of a command.
    pub fail_nth: BTreeMap<String, (usize, MonitorError)>,
    counters: BTreeMap<String, usize>,
}

#[derive(Default)]
pub struct FakeMonitor {
    pub state: Mutex<FakeMonitorState>,
}

impl FakeMonitor {
    pub fn running_with(devices: &[&str]) -> Arc<Self> {
        let mon = Self::default();
        {
            let mut st = mon.state.lock().unwrap();
            st.running = true;
            st.auto_confirm = true;
            st.powerdown_stops = true;
            st.devices = devices.iter().map(|s| s.to_string()).collect();
        }
        Arc::new(mon)
    }

    pub fn set_running(&self, on: bool) {
        self.state.lock().unwrap().running = on;
    }

    pub fn devices(&self) -> BTreeSet<String> {
        self.state.lock().unwrap().devices.clone()
    }

    pub fn calls_of(&self, command: &str) -> Vec<Value> {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|(cmd, _)| cmd == command)
            .map(|(_, args)| args.clone())
            .collect()
    }

    pub fn fail_nth(&self, command: &str, nth: usize, err: MonitorError) {
        self.state
            .lock()
            .unwrap()
            .fail_nth
            .insert(command.to_string(), (nth, err));
    }
}

#[async_trait]
impl Monitor for FakeMonitor {
    async fn call(
        &self,
        command: &str,
        args: Value,
        _timeout: Duration,
    ) -> Result<Value, MonitorError> {
        let mut st = self.state.lock().unwrap();
        if !st.running {
            return Err(MonitorError::NotRunning);
        }
        st.calls.push((command.to_string(), args.clone()));
        let count = st.counters.entry(command.to_string()).or_insert(0);
        *count += 1;
        let n = *count;
        if let Some((nth, err)) = st.fail_nth.get(command) {
            if *nth == n {
                return Err(err.clone());
            }
        }
        match command {
            "qom-list" => {
                let list: Vec<Value> = st
                    .devices
                    .iter()
                    .map(|d| json!({"name": d, "type": "child<device>"}))
                    .collect();
                Ok(Value::Array(list))
            }
            "device_add" => {
                if st.auto_confirm {
                    if let Some(id) = args.get("id").and_then(Value::as_str)
                    {
                        st.devices.insert(id.to_string());
                    }
                }
                Ok(json!({}))
            }
            "device_del" => {
                let id = args
                    .get("id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                if !st.devices.contains(&id) {
                    return Err(MonitorError::Protocol {
                        class: "DeviceNotFound".to_string(),
                        desc: format!("Device '{}' not found", id),
                    });
                }
                if st.auto_confirm {
                    st.devices.remove(&id);
                }
                Ok(json!({}))
            }
            "query-status" => {
                Ok(json!({"status": "running", "running": true}))
            }
            "system_powerdown" => {
                if st.powerdown_stops {
                    st.running = false;
                }
                Ok(json!({}))
            }
            "quit" => {
                st.running = false;
                Ok(json!({}))
            }
            _ => Ok(json!({})),
        }
    }
}

#[derive(Default)]
pub struct FakeVolumes {
    pub ops: Mutex<Vec<String>>,
    /// Volume names whose storage snapshot fails.
    pub fail_snapshot_of: Mutex<Vec<String>>,
}

impl FakeVolumes {
    pub fn ops(&self) -> Vec<String> {
        self.ops.lock().unwrap().clone()
    }

    pub fn fail_snapshot_of(&self, name: &str) {
        self.fail_snapshot_of.lock().unwrap().push(name.to_string());
    }

    fn record(&self, op: String) {
        self.ops.lock().unwrap().push(op);
    }
}

impl VolumeManager for FakeVolumes {
    fn resolve_path(
        &self,
        _vmid: VmId,
        volume: &VolumeRef,
    ) -> Result<PathBuf, VolumeError> {
        Ok(match volume {
            VolumeRef::Path(p) => PathBuf::from(p),
            VolumeRef::Volume { store, name } => {
                PathBuf::from(format!("/fake/{}/{}", store, name))
            }
        })
    }

    fn allocate(
        &self,
        pool: &str,
        vmid: VmId,
        _format: &str,
        _size: ByteQty,
        name: Option<&str>,
    ) -> Result<VolumeRef, VolumeError> {
        let name = name
            .map(str::to_string)
            .unwrap_or_else(|| format!("vm-{}-fresh", vmid));
        let volume =
            VolumeRef::Volume { store: pool.to_string(), name };
        self.record(format!("allocate {}", volume));
        Ok(volume)
    }

    fn free(
        &self,
        _vmid: VmId,
        volume: &VolumeRef,
    ) -> Result<(), VolumeError> {
        self.record(format!("free {}", volume));
        Ok(())
    }

    fn activate(
        &self,
        _vmid: VmId,
        volumes: &[VolumeRef],
    ) -> Result<(), VolumeError> {
        for volume in volumes {
            self.record(format!("activate {}", volume));
        }
        Ok(())
    }

    fn deactivate(
        &self,
        _vmid: VmId,
        volumes: &[VolumeRef],
    ) -> Result<(), VolumeError> {
        for volume in volumes {
            self.record(format!("deactivate {}", volume));
        }
        Ok(())
    }

    fn snapshot(
        &self,
        _vmid: VmId,
        volume: &VolumeRef,
        snap: &str,
    ) -> Result<(), VolumeError> {
        let fails = self.fail_snapshot_of.lock().unwrap();
        if let VolumeRef::Volume { name, .. } = volume {
            if fails.iter().any(|f| f == name) {
                return Err(VolumeError::Storage {
                    volume: volume.clone(),
                    msg: "injected snapshot failure".to_string(),
                });
            }
        }
        drop(fails);
        self.record(format!("snapshot {} {}", volume, snap));
        Ok(())
    }

    fn delete_snapshot(
        &self,
        _vmid: VmId,
        volume: &VolumeRef,
        snap: &str,
    ) -> Result<(), VolumeError> {
        self.record(format!("delsnapshot {} {}", volume, snap));
        Ok(())
    }

    fn rollback_snapshot(
        &self,
        _vmid: VmId,
        volume: &VolumeRef,
        snap: &str,
    ) -> Result<(), VolumeError> {
        self.record(format!("rollback {} {}", volume, snap));
        Ok(())
    }

    fn volume_size(
        &self,
        _vmid: VmId,
        _volume: &VolumeRef,
    ) -> Result<ByteQty, VolumeError> {
        Ok(ByteQty::from_mib(1024))
    }
}

#[derive(Default)]
pub struct MemStore {
    pub configs: Mutex<BTreeMap<VmId, VmConfig>>,
}

impl MemStore {
    pub fn with(vmid: VmId, cfg: VmConfig) -> Arc<Self> {
        let store = Self::default();
        store.configs.lock().unwrap().insert(vmid, cfg);
        Arc::new(store)
    }

    pub fn get(&self, vmid: VmId) -> VmConfig {
        self.configs.lock().unwrap().get(&vmid).cloned().unwrap()
    }
}

impl ConfigStore for MemStore {
    fn read(&self, vmid: VmId) -> Result<VmConfig, StoreError> {
        self.configs
            .lock()
            .unwrap()
            .get(&vmid)
            .cloned()
            .ok_or(StoreError::NotFound(vmid))
    }

    fn write(
        &self,
        vmid: VmId,
        config: &VmConfig,
    ) -> Result<(), StoreError> {
        self.configs.lock().unwrap().insert(vmid, config.clone());
        Ok(())
    }

    fn exists(&self, vmid: VmId) -> bool {
        self.configs.lock().unwrap().contains_key(&vmid)
    }
}

pub struct FakeLauncher {
    pub monitor: Arc<FakeMonitor>,
    /// Whether a spawn brings the monitor socket up.
    pub connect_on_spawn: AtomicBool,
    /// Whether SIGTERM stops the instance (SIGKILL always does).
    pub dies_on_term: AtomicBool,
    pub spawns: Mutex<Vec<Vec<String>>>,
    pub signals: Mutex<Vec<&'static str>>,
    pub alive: AtomicBool,
}

impl FakeLauncher {
    pub fn new(monitor: Arc<FakeMonitor>) -> Self {
        Self {
            monitor,
            connect_on_spawn: AtomicBool::new(true),
            dies_on_term: AtomicBool::new(true),
            spawns: Mutex::new(Vec::new()),
            signals: Mutex::new(Vec::new()),
            alive: AtomicBool::new(false),
        }
    }

    pub fn signals(&self) -> Vec<&'static str> {
        self.signals.lock().unwrap().clone()
    }
}

impl Launcher for FakeLauncher {
    fn spawn(
        &self,
        _vmid: VmId,
        argv: &[String],
        _env: &[(String, String)],
        _umask: u32,
        _limits: &CgroupLimits,
    ) -> Result<u32, ProcessError> {
        self.spawns.lock().unwrap().push(argv.to_vec());
        self.alive.store(true, Ordering::SeqCst);
        if self.connect_on_spawn.load(Ordering::SeqCst) {
            self.monitor.set_running(true);
        }
        Ok(4242)
    }

    fn alive(&self, _pid: u32) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn terminate(&self, _pid: u32) -> Result<(), ProcessError> {
        self.signals.lock().unwrap().push("term");
        if self.dies_on_term.load(Ordering::SeqCst) {
            self.alive.store(false, Ordering::SeqCst);
            self.monitor.set_running(false);
        }
        Ok(())
    }

    fn kill(&self, _pid: u32) -> Result<(), ProcessError> {
        self.signals.lock().unwrap().push("kill");
        self.alive.store(false, Ordering::SeqCst);
        self.monitor.set_running(false);
        Ok(())
    }
}

pub struct FakeAgent {
    pub monitor: Arc<FakeMonitor>,
    pub live: AtomicBool,
    /// Whether a cooperative shutdown actually stops the guest.
    pub effective: AtomicBool,
    pub shutdowns: AtomicUsize,
}

impl FakeAgent {
    pub fn new(monitor: Arc<FakeMonitor>) -> Self {
        Self {
            monitor,
            live: AtomicBool::new(false),
            effective: AtomicBool::new(true),
            shutdowns: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl GuestAgent for FakeAgent {
    async fn ping(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    async fn shutdown(&self) -> Result<(), MonitorError> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        if self.effective.load(Ordering::SeqCst) {
            self.monitor.set_running(false);
        }
        Ok(())
    }
}
