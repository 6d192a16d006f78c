// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The hotplug engine.
//!
//! `apply_pending` reconciles a running instance's device set with the
//! config's pending region. Every pending key is attempted independently:
//! one key failing neither blocks the others nor discards its staged
//! value, which simply stays pending for a later retry. A step that is
//! legitimately inapplicable right now (the device class is not
//! hot-pluggable, or hotplug is disabled for it) raises
//! [`HotplugError::Skip`], which is swallowed rather than reported.
//!
//! Adding a device ensures its controller ancestor exists first, attaches
//! the backing store, attaches the device, and then polls the live device
//! inventory until the new identity appears, rolling the attachments back
//! in reverse order if it never does. Removal mirrors this, with one
//! asymmetry: "not found" on detach is success, because the hypervisor
//! may have auto-removed the device already.
//!
//! The poll interval sleeps through an injected [`Pacer`] so tests drive
//! the verify loops with no real delay.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use bridle_config::devspec::{Descriptor, DriveSpec, ParseError, VolumeRef};
use bridle_config::options::{HotplugSet, ScsiAdapter};
use bridle_config::record::{typed_opt, DeleteMode, RecordError};
use bridle_config::VmConfig;
use bridle_types::{DeviceId, DeviceKind, VmId};
use serde_json::json;
use slog::{debug, info, warn, Logger};
use thiserror::Error;

use crate::compile::{cpu, memory, net, storage, CompileError, Defaults};
use crate::monitor::{Mon, Monitor, MonitorError};
use crate::store::{ConfigStore, StoreError};
use crate::volume::{VolumeError, VolumeManager};

pub const VERIFY_TRIES: u32 = 10;
pub const VERIFY_INTERVAL: Duration = Duration::from_secs(1);

/// The sleep seam for verify polling.
#[async_trait]
pub trait Pacer: Send + Sync {
    async fn pause(&self, interval: Duration);
}

/// Real wall-clock pacing.
pub struct SleepPacer;

#[async_trait]
impl Pacer for SleepPacer {
    async fn pause(&self, interval: Duration) {
        tokio::time::sleep(interval).await;
    }
}

#[derive(Debug, Error)]
pub enum HotplugError {
    /// Not applicable to the live instance right now; the key stays
    /// pending for the next cold start. Never reported as a failure.
    #[error("deferred to cold restart: {0}")]
    Skip(&'static str),

    #[error("device {0} did not appear after plugging")]
    VerifyAdd(DeviceId),

    #[error("device {0} did not disappear after unplugging")]
    VerifyRemove(DeviceId),

    #[error(transparent)]
    Monitor(#[from] MonitorError),

    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Record(#[from] RecordError),

    #[error(transparent)]
    Volume(#[from] VolumeError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl HotplugError {
    pub fn is_skip(&self) -> bool {
        matches!(self, HotplugError::Skip(_))
    }
}

/// Everything the engine needs around one reconciliation pass.
pub struct HotplugCtx<'a> {
    pub vmid: VmId,
    pub monitor: &'a dyn Monitor,
    pub volumes: &'a dyn VolumeManager,
    pub store: &'a dyn ConfigStore,
    pub pacer: &'a dyn Pacer,
    pub defaults: &'a Defaults,
    pub log: &'a Logger,
}

/// The outcome of one pass. Partial success is expected and normal.
#[derive(Debug, Default)]
pub struct HotplugReport {
    pub applied: Vec<String>,
    pub errors: BTreeMap<String, HotplugError>,
}

/// Reconcile a running instance with the pending region, key by key.
/// After every successfully applied key the config is persisted, so a
/// crash mid-pass leaves it consistent with what was actually done.
pub async fn apply_pending(
    ctx: &HotplugCtx<'_>,
    cfg: &mut VmConfig,
) -> Result<HotplugReport, StoreError> {
    let mut report = HotplugReport::default();
    let keys: Vec<String> = cfg
        .pending
        .options
        .keys()
        .chain(cfg.pending.delete.keys())
        .cloned()
        .collect();
    for key in keys {
        match apply_key(ctx, cfg, &key).await {
            Ok(()) => {
                cfg.apply_pending_key(&key);
                ctx.store.write(ctx.vmid, cfg)?;
                info!(ctx.log, "applied pending change"; "key" => &key);
                report.applied.push(key);
            }
            Err(err) if err.is_skip() => {
                debug!(ctx.log, "pending change deferred";
                    "key" => &key, "reason" => %err);
            }
            Err(err) => {
                warn!(ctx.log, "pending change failed";
                    "key" => &key, "error" => %err);
                report.errors.insert(key, err);
            }
        }
    }
    Ok(report)
}

/// Promote every pending key without touching an instance. Used by the
/// start path when no instance is running; force-deletes free their
/// backing volumes here.
pub fn apply_pending_cold(
    vmid: VmId,
    cfg: &mut VmConfig,
    volumes: &dyn VolumeManager,
    log: &Logger,
) -> Result<Vec<String>, HotplugError> {
    let mut applied = Vec::new();
    let deletes: Vec<(String, DeleteMode)> = cfg
        .pending
        .delete
        .iter()
        .map(|(k, m)| (k.clone(), *m))
        .collect();
    for (key, mode) in deletes {
        if mode == DeleteMode::Force {
            if let Some(volume) = active_drive_volume(cfg, &key)? {
                if let Err(err) = volumes.free(vmid, &volume) {
                    warn!(log, "freeing detached volume failed";
                        "volume" => %volume, "error" => %err);
                }
            }
        }
        cfg.apply_pending_key(&key);
        applied.push(key);
    }
    let staged: Vec<String> = cfg.pending.options.keys().cloned().collect();
    for key in staged {
        cfg.apply_pending_key(&key);
        applied.push(key);
    }
    Ok(applied)
}

/// The backing volume of the drive currently active on `key`, if the key
/// names a drive with one.
fn active_drive_volume(
    cfg: &VmConfig,
    key: &str,
) -> Result<Option<VolumeRef>, HotplugError> {
    let id = match DeviceId::from_str(key) {
        Ok(id) if id.kind().is_drive() => id,
        _ => return Ok(None),
    };
    match cfg.active.get(key) {
        Some(raw) => {
            let spec = DriveSpec::parse(id.kind(), raw)?;
            Ok(Some(spec.volume))
        }
        None => Ok(None),
    }
}

fn adapter_of(cfg: &VmConfig, defaults: &Defaults) -> ScsiAdapter {
    typed_opt::<ScsiAdapter>(&cfg.active, "scsihw")
        .ok()
        .flatten()
        .unwrap_or(defaults.scsihw)
}

async fn apply_key(
    ctx: &HotplugCtx<'_>,
    cfg: &mut VmConfig,
    key: &str,
) -> Result<(), HotplugError> {
    let hotplug = typed_opt::<HotplugSet>(&cfg.active, "hotplug")?
        .unwrap_or_default();
    if let Ok(id) = DeviceId::from_str(key) {
        return apply_device(ctx, cfg, id, key, &hotplug).await;
    }
    match key {
        "memory" => apply_memory(ctx, cfg, &hotplug).await,
        "vcpus" => apply_vcpus(ctx, cfg, &hotplug).await,
        "balloon" => apply_balloon(ctx, cfg).await,
        // purely descriptive; nothing on the instance to touch
        "name" | "onboot" | "boot" => Ok(()),
        _ => Err(HotplugError::Skip("option requires a cold restart")),
    }
}

fn device_hotpluggable(
    kind: DeviceKind,
    hotplug: &HotplugSet,
) -> Result<(), HotplugError> {
    let allowed = match kind {
        DeviceKind::Scsi | DeviceKind::Virtio => hotplug.disk,
        DeviceKind::Ide | DeviceKind::Sata => {
            return Err(HotplugError::Skip(
                "ide/sata drives cannot be hotplugged",
            ))
        }
        DeviceKind::Net => hotplug.network,
        DeviceKind::Usb => hotplug.usb,
        _ => {
            return Err(HotplugError::Skip(
                "device class cannot be hotplugged",
            ))
        }
    };
    if allowed {
        Ok(())
    } else {
        Err(HotplugError::Skip("hotplug disabled for this device class"))
    }
}

async fn apply_device(
    ctx: &HotplugCtx<'_>,
    cfg: &VmConfig,
    id: DeviceId,
    key: &str,
    hotplug: &HotplugSet,
) -> Result<(), HotplugError> {
    device_hotpluggable(id.kind(), hotplug)?;
    let mon = Mon(ctx.monitor);
    let present = mon.device_list().await?.contains(&id.to_string());

    if let Some(mode) = cfg.pending.delete.get(key) {
        if present {
            unplug_device(ctx, id).await?;
        }
        if *mode == DeleteMode::Force {
            if let Some(volume) = active_drive_volume(cfg, key)? {
                ctx.volumes.free(ctx.vmid, &volume)?;
            }
        }
        return Ok(());
    }

    let raw = cfg
        .pending
        .options
        .get(key)
        .expect("apply_device called for a staged key");
    let desc = Descriptor::parse(id, raw)?;

    if present {
        let active_raw = match cfg.active.get(key) {
            Some(raw) => raw,
            // present on the instance but unknown to the active config;
            // replace it wholesale
            None => {
                unplug_device(ctx, id).await?;
                return plug_device(ctx, cfg, id, &desc).await;
            }
        };
        let active_desc = Descriptor::parse(id, active_raw)?;
        if let Some(applied) =
            try_in_place(ctx, id, &active_desc, &desc).await?
        {
            return applied;
        }
        unplug_device(ctx, id).await?;
        return plug_device(ctx, cfg, id, &desc).await;
    }
    plug_device(ctx, cfg, id, &desc).await
}

/// Narrow in-place edits that skip the remove/add cycle. Returns
/// `Some(result)` when the diff was handled in place, `None` when a full
/// replug is required.
async fn try_in_place(
    ctx: &HotplugCtx<'_>,
    id: DeviceId,
    active: &Descriptor,
    wanted: &Descriptor,
) -> Result<Option<Result<(), HotplugError>>, HotplugError> {
    let mon = Mon(ctx.monitor);
    match (active, wanted) {
        (Descriptor::Drive(old), Descriptor::Drive(new)) => {
            // Same backing and device shape: throttle and size adjust in
            // place.
            let mut neutral = new.clone();
            neutral.throttle = old.throttle;
            neutral.size = old.size;
            if &neutral != old {
                return Ok(None);
            }
            if new.throttle != old.throttle {
                mon.block_set_io_throttle(storage::throttle_args(
                    id,
                    &new.throttle,
                ))
                .await?;
            }
            if let (Some(old_size), Some(new_size)) = (old.size, new.size) {
                if new_size > old_size {
                    mon.block_resize(
                        &storage::node_name(id),
                        new_size.bytes(),
                    )
                    .await?;
                }
            }
            Ok(Some(Ok(())))
        }
        (Descriptor::Net(old), Descriptor::Net(new)) => {
            // Link state is a monitor call; rate, VLAN membership, and
            // firewall are host-side plumbing with no device impact.
            let mut neutral = new.clone();
            neutral.link_down = old.link_down;
            neutral.rate_bps = old.rate_bps;
            neutral.tag = old.tag;
            neutral.trunks = old.trunks.clone();
            neutral.firewall = old.firewall;
            if &neutral != old {
                return Ok(None);
            }
            if new.link_down != old.link_down {
                let up = new.link_down != Some(true);
                mon.set_link(&id.to_string(), up).await?;
            }
            Ok(Some(Ok(())))
        }
        _ => Ok(None),
    }
}

/// Poll the live inventory until `id`'s presence matches `want`.
async fn verify_presence(
    ctx: &HotplugCtx<'_>,
    id: DeviceId,
    want: bool,
) -> Result<bool, MonitorError> {
    let mon = Mon(ctx.monitor);
    for attempt in 0..VERIFY_TRIES {
        if attempt > 0 {
            ctx.pacer.pause(VERIFY_INTERVAL).await;
        }
        let present =
            mon.device_list().await?.contains(&id.to_string());
        if present == want {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Ensure the bridge serving `id`'s bus exists before anything addresses
/// into it. Devices on bus 0, or without a table position, need nothing.
async fn ensure_bridge(
    ctx: &HotplugCtx<'_>,
    id: DeviceId,
) -> Result<(), HotplugError> {
    let slot = match crate::slots::slot_for(id) {
        Some(slot) if slot.bridge_needed() => slot,
        _ => return Ok(()),
    };
    let bridge_id = format!("pci.{}", slot.bus());
    let mon = Mon(ctx.monitor);
    if mon.device_list().await?.contains(&bridge_id) {
        return Ok(());
    }
    let position = match crate::slots::bridge_slot(slot.bus()) {
        Some(position) => position,
        None => return Ok(()),
    };
    mon.device_add(json!({
        "driver": "pci-bridge",
        "id": bridge_id,
        "chassis_nr": slot.bus(),
        "bus": format!("pci.{}", position.bus()),
        "addr": format!("{:#x}", position.slot()),
    }))
    .await?;
    Ok(())
}

async fn plug_device(
    ctx: &HotplugCtx<'_>,
    cfg: &VmConfig,
    id: DeviceId,
    desc: &Descriptor,
) -> Result<(), HotplugError> {
    let mon = Mon(ctx.monitor);
    match desc {
        Descriptor::Drive(spec) => {
            let adapter = adapter_of(cfg, ctx.defaults);
            ensure_bridge(ctx, id).await?;
            // then the controller the drive addresses into
            if let Some((ctrl, _)) = storage::controller_for(id, adapter) {
                let ctrl_id = ctrl.device_id();
                if !mon.device_list().await?.contains(&ctrl_id) {
                    let (dev, iothread) =
                        ctrl.device(adapter, spec.iothread == Some(true));
                    if let Some(io_id) = iothread {
                        mon.object_add(json!({
                            "qom-type": "iothread",
                            "id": io_id,
                        }))
                        .await?;
                    }
                    mon.device_add(dev.qmp_args()).await?;
                    let ctrl_dev: DeviceId =
                        ctrl_id.parse().map_err(|_| {
                            CompileError::Config(format!(
                                "controller identity {} out of range",
                                ctrl_id
                            ))
                        })?;
                    if !verify_presence(ctx, ctrl_dev, true).await? {
                        return Err(HotplugError::VerifyAdd(ctrl_dev));
                    }
                }
            }
            let path = ctx.volumes.resolve_path(ctx.vmid, &spec.volume)?;
            mon.blockdev_add(storage::blockdev_args(id, &path, spec))
                .await?;
            let (dev, iothread) =
                storage::disk_device(id, spec, adapter, None, ctx.log)?;
            if let Some(io_id) = iothread {
                mon.object_add(json!({
                    "qom-type": "iothread",
                    "id": io_id,
                }))
                .await?;
            }
            if let Err(err) = mon.device_add(dev.qmp_args()).await {
                rollback_drive(ctx, id).await;
                return Err(err.into());
            }
            if !verify_presence(ctx, id, true).await? {
                rollback_drive(ctx, id).await;
                return Err(HotplugError::VerifyAdd(id));
            }
            if !spec.throttle.is_empty() {
                mon.block_set_io_throttle(storage::throttle_args(
                    id,
                    &spec.throttle,
                ))
                .await?;
            }
            Ok(())
        }
        Descriptor::Net(spec) => {
            ensure_bridge(ctx, id).await?;
            mon.netdev_add(net::netdev_args(id, spec)).await?;
            let dev = net::nic_device(id, spec, None, ctx.log);
            if let Err(err) = mon.device_add(dev.qmp_args()).await {
                let _ = mon.netdev_del(&id.to_string()).await;
                return Err(err.into());
            }
            if !verify_presence(ctx, id, true).await? {
                let _ = mon.device_del(&id.to_string()).await;
                let _ = mon.netdev_del(&id.to_string()).await;
                return Err(HotplugError::VerifyAdd(id));
            }
            if spec.link_down == Some(true) {
                mon.set_link(&id.to_string(), false).await?;
            }
            Ok(())
        }
        Descriptor::Usb(spec) => {
            let dev = crate::compile::usb_device_arg(id, spec);
            mon.device_add(dev.qmp_args()).await?;
            if !verify_presence(ctx, id, true).await? {
                let _ = mon.device_del(&id.to_string()).await;
                return Err(HotplugError::VerifyAdd(id));
            }
            Ok(())
        }
        _ => Err(HotplugError::Skip("device class cannot be hotplugged")),
    }
}

/// Best-effort teardown of a half-plugged drive, in reverse order.
async fn rollback_drive(ctx: &HotplugCtx<'_>, id: DeviceId) {
    let mon = Mon(ctx.monitor);
    if let Err(err) = mon.device_del(&id.to_string()).await {
        if !err.is_device_not_found() {
            warn!(ctx.log, "rollback device_del failed";
                "device" => %id, "error" => %err);
        }
    }
    if let Err(err) = mon.blockdev_del(&storage::node_name(id)).await {
        warn!(ctx.log, "rollback blockdev_del failed";
            "device" => %id, "error" => %err);
    }
}

/// Detach a device and its backing. "Not found" anywhere along the way is
/// success; the hypervisor may have auto-removed things already.
async fn unplug_device(
    ctx: &HotplugCtx<'_>,
    id: DeviceId,
) -> Result<(), HotplugError> {
    let mon = Mon(ctx.monitor);
    match mon.device_del(&id.to_string()).await {
        Ok(()) => {}
        Err(err) if err.is_device_not_found() => return Ok(()),
        Err(err) => return Err(err.into()),
    }
    if !verify_presence(ctx, id, false).await? {
        return Err(HotplugError::VerifyRemove(id));
    }
    if id.kind().is_drive() {
        match mon.blockdev_del(&storage::node_name(id)).await {
            Ok(()) => {}
            Err(err) if err.is_device_not_found() => {}
            Err(err) => return Err(err.into()),
        }
    }
    if id.kind() == DeviceKind::Net {
        match mon.netdev_del(&id.to_string()).await {
            Ok(()) => {}
            Err(err) if err.is_device_not_found() => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

/// Replay the memory module schedule one increment at a time, persisting
/// the new effective total after every plugged or unplugged module so a
/// crash leaves the config matching reality.
async fn apply_memory(
    ctx: &HotplugCtx<'_>,
    cfg: &mut VmConfig,
    hotplug: &HotplugSet,
) -> Result<(), HotplugError> {
    if !hotplug.memory {
        return Err(HotplugError::Skip("memory hotplug disabled"));
    }
    let current = typed_opt::<u64>(&cfg.active, "memory")?
        .unwrap_or(ctx.defaults.memory_mib);
    let target = match cfg.pending.options.get("memory") {
        Some(raw) => raw.parse::<u64>().map_err(|_| {
            HotplugError::Record(RecordError::Value {
                key: "memory".to_string(),
                value: raw.clone(),
            })
        })?,
        None => return Err(HotplugError::Skip("memory not staged")),
    };
    let nodes = memory::numa_nodes(&cfg.active)?;
    let mon = Mon(ctx.monitor);

    if target >= current {
        let mut plugged = current;
        for module in memory::plug_steps(current, target, nodes)? {
            mon.object_add(json!({
                "qom-type": "memory-backend-ram",
                "id": module.object_id(),
                "size": module.size_mib << 20,
            }))
            .await?;
            if let Err(err) = mon
                .device_add(json!({
                    "driver": "pc-dimm",
                    "id": module.device_id(),
                    "memdev": module.object_id(),
                    "node": module.node,
                }))
                .await
            {
                let _ = mon.object_del(&module.object_id()).await;
                return Err(err.into());
            }
            plugged += module.size_mib;
            persist_total(ctx, cfg, "memory", plugged.to_string())?;
        }
    } else {
        let mut plugged = current;
        for module in memory::unplug_steps(current, target, nodes)? {
            mon.device_del(&module.device_id()).await?;
            if !verify_dimm_gone(ctx, &module.device_id()).await? {
                return Err(HotplugError::Skip(
                    "guest is still using the memory module",
                ));
            }
            let _ = mon.object_del(&module.object_id()).await;
            plugged -= module.size_mib;
            persist_total(ctx, cfg, "memory", plugged.to_string())?;
        }
    }
    Ok(())
}

async fn verify_dimm_gone(
    ctx: &HotplugCtx<'_>,
    device_id: &str,
) -> Result<bool, MonitorError> {
    let mon = Mon(ctx.monitor);
    for attempt in 0..VERIFY_TRIES {
        if attempt > 0 {
            ctx.pacer.pause(VERIFY_INTERVAL).await;
        }
        if !mon.device_list().await?.iter().any(|d| d == device_id) {
            return Ok(true);
        }
    }
    Ok(false)
}

fn persist_total(
    ctx: &HotplugCtx<'_>,
    cfg: &mut VmConfig,
    key: &str,
    value: String,
) -> Result<(), HotplugError> {
    cfg.active.insert(key.to_string(), value);
    ctx.store.write(ctx.vmid, cfg)?;
    Ok(())
}

/// Replay the vcpu schedule one core at a time, persisting after each.
async fn apply_vcpus(
    ctx: &HotplugCtx<'_>,
    cfg: &mut VmConfig,
    hotplug: &HotplugSet,
) -> Result<(), HotplugError> {
    if !hotplug.cpu {
        return Err(HotplugError::Skip("cpu hotplug disabled"));
    }
    let host = crate::compile::HostCaps {
        // topology was validated at start; only the online count moves
        logical_cpus: u32::MAX,
        hw_virt: true,
    };
    let topo = cpu::topology(&cfg.active, ctx.defaults, &host)?;
    let current = topo.online;
    let target = match cfg.pending.options.get("vcpus") {
        Some(raw) => raw.parse::<u32>().map_err(|_| {
            HotplugError::Record(RecordError::Value {
                key: "vcpus".to_string(),
                value: raw.clone(),
            })
        })?,
        None => return Err(HotplugError::Skip("vcpus not staged")),
    };
    if target < 1 || target > topo.total() {
        return Err(HotplugError::Compile(CompileError::Config(format!(
            "vcpus {} outside 1..{}",
            target,
            topo.total()
        ))));
    }
    let mon = Mon(ctx.monitor);
    if target >= current {
        for index in current..target {
            mon.device_add(json!({
                "driver": "qemu64-x86_64-cpu",
                "id": cpu::vcpu_device_id(index),
                "socket-id": index / topo.cores,
                "core-id": index % topo.cores,
                "thread-id": 0,
            }))
            .await?;
            persist_total(ctx, cfg, "vcpus", (index + 1).to_string())?;
        }
    } else {
        for index in (target..current).rev() {
            mon.device_del(&cpu::vcpu_device_id(index)).await?;
            if !verify_dimm_gone(ctx, &cpu::vcpu_device_id(index)).await? {
                return Err(HotplugError::Skip(
                    "guest did not release the vcpu",
                ));
            }
            persist_total(ctx, cfg, "vcpus", index.to_string())?;
        }
    }
    Ok(())
}

/// Balloon target changes are a single in-place call.
async fn apply_balloon(
    ctx: &HotplugCtx<'_>,
    cfg: &mut VmConfig,
) -> Result<(), HotplugError> {
    let target = match cfg.pending.options.get("balloon") {
        Some(raw) => raw.parse::<u64>().map_err(|_| {
            HotplugError::Record(RecordError::Value {
                key: "balloon".to_string(),
                value: raw.clone(),
            })
        })?,
        None => return Err(HotplugError::Skip("balloon not staged")),
    };
    if target == 0 {
        // removing the balloon device entirely is a cold operation
        return Err(HotplugError::Skip("balloon removal needs a restart"));
    }
    Mon(ctx.monitor).balloon(target << 20).await?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testutil::{FakeMonitor, FakeVolumes, MemStore, NullPacer};
    use std::str::FromStr;
    use std::sync::Arc;

    struct Rig {
        monitor: Arc<FakeMonitor>,
        volumes: Arc<FakeVolumes>,
        store: Arc<MemStore>,
        defaults: Defaults,
        log: Logger,
    }

    fn vmid() -> VmId {
        VmId::from_str("100").unwrap()
    }

    impl Rig {
        fn new(config: &str, live_devices: &[&str]) -> (Rig, VmConfig) {
            let cfg = VmConfig::parse(config).unwrap();
            let rig = Rig {
                monitor: FakeMonitor::running_with(live_devices),
                volumes: Arc::new(FakeVolumes::default()),
                store: MemStore::with(vmid(), cfg.clone()),
                defaults: Defaults::default(),
                log: Logger::root(slog::Discard, slog::o!()),
            };
            (rig, cfg)
        }

        fn ctx(&self) -> HotplugCtx<'_> {
            HotplugCtx {
                vmid: vmid(),
                monitor: &*self.monitor,
                volumes: &*self.volumes,
                store: &*self.store,
                pacer: &NullPacer,
                defaults: &self.defaults,
                log: &self.log,
            }
        }

        fn stored(&self) -> VmConfig {
            self.store.get(vmid())
        }
    }

    fn protocol_err(class: &str) -> MonitorError {
        MonitorError::Protocol {
            class: class.to_string(),
            desc: "injected".to_string(),
        }
    }

    #[tokio::test]
    async fn plugs_new_drive_and_promotes_key() {
        let (rig, mut cfg) = Rig::new(
            "hotplug: 1\nscsihw: virtio-scsi-pci\n\
             scsi0: tank:vm-100-disk-0\n\
             [PENDING]\nscsi1: tank:vm-100-disk-1,bps_rd=5000\n",
            &["scsi0", "scsihw0"],
        );
        let report = apply_pending(&rig.ctx(), &mut cfg).await.unwrap();
        assert_eq!(report.applied, ["scsi1"]);
        assert!(report.errors.is_empty());
        assert!(cfg.pending.is_empty());
        assert!(cfg.active.contains_key("scsi1"));
        // backing attach, device attach, then the throttle
        assert_eq!(rig.monitor.calls_of("blockdev-add").len(), 1);
        assert_eq!(rig.monitor.calls_of("device_add").len(), 1);
        assert_eq!(
            rig.monitor.calls_of("block_set_io_throttle").len(),
            1
        );
        // the promoted config was persisted
        assert!(rig.stored().active.contains_key("scsi1"));
    }

    #[tokio::test]
    async fn secondary_bus_drive_gets_its_bridge_first() {
        // virtio6 addresses into bus 2, whose bridge is absent
        let (rig, mut cfg) = Rig::new(
            "hotplug: 1\n[PENDING]\nvirtio6: tank:vm-100-disk-6\n",
            &[],
        );
        let report = apply_pending(&rig.ctx(), &mut cfg).await.unwrap();
        assert_eq!(report.applied, ["virtio6"]);
        let adds = rig.monitor.calls_of("device_add");
        assert_eq!(adds[0]["driver"], "pci-bridge");
        assert_eq!(adds[0]["id"], "pci.2");
        assert_eq!(adds[1]["id"], "virtio6");

        // replay over an instance that already has the bridge
        let (rig, mut cfg) = Rig::new(
            "hotplug: 1\n[PENDING]\nvirtio6: tank:vm-100-disk-6\n",
            &["pci.2"],
        );
        apply_pending(&rig.ctx(), &mut cfg).await.unwrap();
        let adds = rig.monitor.calls_of("device_add");
        assert_eq!(adds.len(), 1);
        assert_eq!(adds[0]["id"], "virtio6");
    }

    #[tokio::test]
    async fn controller_ancestor_is_plugged_first() {
        // capacity 7: scsi9 lands on controller 1, which is absent
        let (rig, mut cfg) = Rig::new(
            "hotplug: 1\nscsihw: lsi\n\
             [PENDING]\nscsi9: tank:vm-100-disk-9\n",
            &[],
        );
        let report = apply_pending(&rig.ctx(), &mut cfg).await.unwrap();
        assert_eq!(report.applied, ["scsi9"]);
        let adds = rig.monitor.calls_of("device_add");
        assert_eq!(adds.len(), 2);
        assert_eq!(adds[0]["id"], "scsihw1");
        assert_eq!(adds[1]["id"], "scsi9");
    }

    #[tokio::test]
    async fn removing_an_absent_device_succeeds() {
        let (rig, mut cfg) = Rig::new(
            "hotplug: 1\nnet0: virtio,bridge=vmbr0,\
             macaddr=BC:24:11:2A:2B:2C\n[PENDING]\ndelete: net0\n",
            &[],
        );
        let report = apply_pending(&rig.ctx(), &mut cfg).await.unwrap();
        assert_eq!(report.applied, ["net0"]);
        assert!(!cfg.active.contains_key("net0"));
        // nothing was even detached; the device was already gone
        assert!(rig.monitor.calls_of("device_del").is_empty());
    }

    #[tokio::test]
    async fn detach_races_hypervisor_auto_removal() {
        let (rig, mut cfg) = Rig::new(
            "hotplug: 1\nnet0: virtio,bridge=vmbr0,\
             macaddr=BC:24:11:2A:2B:2C\n[PENDING]\ndelete: net0\n",
            &["net0"],
        );
        // inventory says present, but the detach finds it already gone
        rig.monitor.fail_nth(
            "device_del",
            1,
            protocol_err("DeviceNotFound"),
        );
        let report = apply_pending(&rig.ctx(), &mut cfg).await.unwrap();
        assert_eq!(report.applied, ["net0"]);
        assert!(report.errors.is_empty());
    }

    #[tokio::test]
    async fn force_delete_frees_the_backing_volume() {
        let (rig, mut cfg) = Rig::new(
            "hotplug: 1\nscsihw: virtio-scsi-pci\n\
             scsi1: tank:vm-100-disk-1\n[PENDING]\ndelete: !scsi1\n",
            &["scsi1", "scsihw0"],
        );
        let report = apply_pending(&rig.ctx(), &mut cfg).await.unwrap();
        assert_eq!(report.applied, ["scsi1"]);
        assert!(rig
            .volumes
            .ops()
            .contains(&"free tank:vm-100-disk-1".to_string()));
    }

    #[tokio::test]
    async fn verify_timeout_rolls_back_partial_plug() {
        let (rig, mut cfg) = Rig::new(
            "hotplug: 1\n[PENDING]\nnet1: virtio,bridge=vmbr0,\
             macaddr=BC:24:11:2A:2B:2D\n",
            &[],
        );
        // commands succeed but the device never shows up
        rig.monitor.state.lock().unwrap().auto_confirm = false;
        let report = apply_pending(&rig.ctx(), &mut cfg).await.unwrap();
        assert!(report.applied.is_empty());
        assert!(matches!(
            report.errors.get("net1"),
            Some(HotplugError::VerifyAdd(_))
        ));
        // staged value survives for a later retry
        assert!(cfg.pending.options.contains_key("net1"));
        // and the half-plugged pieces were torn down in reverse
        assert_eq!(rig.monitor.calls_of("device_del").len(), 1);
        assert_eq!(rig.monitor.calls_of("netdev_del").len(), 1);
    }

    #[tokio::test]
    async fn one_failure_does_not_block_other_keys() {
        let (rig, mut cfg) = Rig::new(
            "hotplug: 1\n[PENDING]\nname: renamed\n\
             net1: virtio,bridge=vmbr0,macaddr=BC:24:11:2A:2B:2D\n",
            &[],
        );
        rig.monitor.state.lock().unwrap().auto_confirm = false;
        let report = apply_pending(&rig.ctx(), &mut cfg).await.unwrap();
        assert_eq!(report.applied, ["name"]);
        assert!(report.errors.contains_key("net1"));
        assert_eq!(cfg.active.get("name").unwrap(), "renamed");
    }

    #[tokio::test]
    async fn cold_only_options_stay_pending_silently() {
        let (rig, mut cfg) = Rig::new(
            "hotplug: 1\ncores: 2\n[PENDING]\ncores: 4\n",
            &[],
        );
        let report = apply_pending(&rig.ctx(), &mut cfg).await.unwrap();
        assert!(report.applied.is_empty());
        assert!(report.errors.is_empty());
        assert_eq!(cfg.pending.options.get("cores").unwrap(), "4");
    }

    #[tokio::test]
    async fn throttle_change_applies_in_place() {
        let (rig, mut cfg) = Rig::new(
            "hotplug: 1\nscsihw: virtio-scsi-pci\n\
             scsi0: tank:vm-100-disk-0,bps_rd=1000\n\
             [PENDING]\nscsi0: tank:vm-100-disk-0,bps_rd=9000\n",
            &["scsi0", "scsihw0"],
        );
        let report = apply_pending(&rig.ctx(), &mut cfg).await.unwrap();
        assert_eq!(report.applied, ["scsi0"]);
        let throttles = rig.monitor.calls_of("block_set_io_throttle");
        assert_eq!(throttles.len(), 1);
        assert_eq!(throttles[0]["bps_rd"], 9000);
        // no replug happened
        assert!(rig.monitor.calls_of("device_del").is_empty());
        assert!(rig.monitor.calls_of("device_add").is_empty());
    }

    #[tokio::test]
    async fn link_state_change_applies_in_place() {
        let (rig, mut cfg) = Rig::new(
            "hotplug: 1\nnet0: virtio,bridge=vmbr0,\
             macaddr=BC:24:11:2A:2B:2C\n[PENDING]\nnet0: virtio,\
             bridge=vmbr0,macaddr=BC:24:11:2A:2B:2C,link_down=1\n",
            &["net0"],
        );
        let report = apply_pending(&rig.ctx(), &mut cfg).await.unwrap();
        assert_eq!(report.applied, ["net0"]);
        let links = rig.monitor.calls_of("set_link");
        assert_eq!(links.len(), 1);
        assert_eq!(links[0]["up"], false);
        assert!(rig.monitor.calls_of("device_del").is_empty());
    }

    #[tokio::test]
    async fn volume_change_replugs_the_device() {
        let (rig, mut cfg) = Rig::new(
            "hotplug: 1\nscsihw: virtio-scsi-pci\n\
             scsi0: tank:vm-100-disk-0\n\
             [PENDING]\nscsi0: tank:vm-100-disk-7\n",
            &["scsi0", "scsihw0"],
        );
        let report = apply_pending(&rig.ctx(), &mut cfg).await.unwrap();
        assert_eq!(report.applied, ["scsi0"]);
        assert_eq!(rig.monitor.calls_of("device_del").len(), 1);
        assert_eq!(rig.monitor.calls_of("device_add").len(), 1);
        let blockdev = rig.monitor.calls_of("blockdev-add");
        assert!(blockdev[0]["filename"]
            .as_str()
            .unwrap()
            .contains("disk-7"));
    }

    #[tokio::test]
    async fn memory_growth_persists_after_every_module() {
        let (rig, mut cfg) = Rig::new(
            "hotplug: memory\nmemory: 1024\n[PENDING]\nmemory: 3072\n",
            &[],
        );
        // the third module plug fails
        rig.monitor.fail_nth("device_add", 3, protocol_err("GenericError"));
        let report = apply_pending(&rig.ctx(), &mut cfg).await.unwrap();
        assert!(report.errors.contains_key("memory"));
        // two modules of 512M made it in, and each step was persisted
        assert_eq!(rig.stored().active.get("memory").unwrap(), "2048");
        // the target stays staged for a retry
        assert_eq!(
            rig.stored().pending.options.get("memory").unwrap(),
            "3072"
        );
    }

    #[tokio::test]
    async fn memory_shrink_unplugs_highest_modules_first() {
        let (rig, mut cfg) = Rig::new(
            "hotplug: memory\nmemory: 3072\n[PENDING]\nmemory: 2048\n",
            &["dimm0", "dimm1", "dimm2", "dimm3"],
        );
        let report = apply_pending(&rig.ctx(), &mut cfg).await.unwrap();
        assert_eq!(report.applied, ["memory"]);
        let dels = rig.monitor.calls_of("device_del");
        assert_eq!(dels.len(), 2);
        assert_eq!(dels[0]["id"], "dimm3");
        assert_eq!(dels[1]["id"], "dimm2");
        assert_eq!(cfg.active.get("memory").unwrap(), "2048");
    }

    #[tokio::test]
    async fn vcpu_growth_replays_the_topology() {
        let (rig, mut cfg) = Rig::new(
            "hotplug: cpu\nsockets: 2\ncores: 2\nvcpus: 2\n\
             [PENDING]\nvcpus: 4\n",
            &[],
        );
        let report = apply_pending(&rig.ctx(), &mut cfg).await.unwrap();
        assert_eq!(report.applied, ["vcpus"]);
        let adds = rig.monitor.calls_of("device_add");
        assert_eq!(adds.len(), 2);
        assert_eq!(adds[0]["id"], "cpu2");
        assert_eq!(adds[1]["id"], "cpu3");
        assert_eq!(adds[1]["socket-id"], 1);
        assert_eq!(cfg.active.get("vcpus").unwrap(), "4");
    }

    #[tokio::test]
    async fn balloon_target_is_one_call() {
        let (rig, mut cfg) = Rig::new(
            "hotplug: 1\nballoon: 512\nmemory: 2048\n\
             [PENDING]\nballoon: 1024\n",
            &[],
        );
        let report = apply_pending(&rig.ctx(), &mut cfg).await.unwrap();
        assert_eq!(report.applied, ["balloon"]);
        let calls = rig.monitor.calls_of("balloon");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0]["value"], 1024u64 << 20);
    }

    #[tokio::test]
    async fn ide_drives_never_hotplug() {
        let (rig, mut cfg) = Rig::new(
            "hotplug: 1\n[PENDING]\nide0: tank:vm-100-disk-3\n",
            &[],
        );
        let report = apply_pending(&rig.ctx(), &mut cfg).await.unwrap();
        assert!(report.applied.is_empty());
        assert!(report.errors.is_empty());
        assert!(cfg.pending.options.contains_key("ide0"));
        assert!(rig.monitor.calls_of("device_add").is_empty());
    }

    #[test]
    fn cold_apply_promotes_and_frees() {
        let cfg_text = "scsi0: tank:vm-100-disk-0\n\
             [PENDING]\ndelete: !scsi0\nmemory: 4096\n";
        let mut cfg = VmConfig::parse(cfg_text).unwrap();
        let volumes = FakeVolumes::default();
        let log = Logger::root(slog::Discard, slog::o!());
        let applied =
            apply_pending_cold(vmid(), &mut cfg, &volumes, &log).unwrap();
        assert_eq!(applied.len(), 2);
        assert!(cfg.pending.is_empty());
        assert!(!cfg.active.contains_key("scsi0"));
        assert_eq!(cfg.active.get("memory").unwrap(), "4096");
        assert!(volumes
            .ops()
            .contains(&"free tank:vm-100-disk-0".to_string()));
    }
}
