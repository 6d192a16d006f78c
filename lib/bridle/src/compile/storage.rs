// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Storage argument compilation.
//!
//! Every drive turns into a backing-store argument and a device argument.
//! The builders here are shared with the hotplug engine, which needs the
//! same fragments as monitor-call argument maps when attaching to a live
//! instance; keeping one source for both is what makes a hotplugged device
//! indistinguishable from a cold-started one.

use std::collections::BTreeMap;
use std::path::Path;

use bridle_config::devspec::{
    AioMode, CacheMode, DiscardMode, DriveSpec, LimitPair, Media,
    ThrottleGroup, VolumeRef,
};
use bridle_config::options::ScsiAdapter;
use bridle_types::{DeviceId, DeviceKind, VmId};
use serde_json::{json, Value};
use slog::{warn, Logger};

use crate::slots;
use crate::volume::VolumeManager;

use super::{CompileError, DeviceArg};

/// The backing-store node name a drive's device argument binds to.
pub fn node_name(id: DeviceId) -> String {
    format!("drive-{}", id)
}

/// The cache mode in effect: an explicit choice wins; otherwise a backing
/// path that looks like a raw block device gets `none` and an image file
/// gets `writeback`.
pub fn effective_cache(spec: &DriveSpec, path: &Path) -> CacheMode {
    match spec.cache {
        Some(mode) => mode,
        None if path.starts_with("/dev") => CacheMode::None,
        None => CacheMode::WriteBack,
    }
}

/// The async-io mode in effect; never forced unless the cache mode is a
/// direct one.
pub fn effective_aio(
    spec: &DriveSpec,
    cache: CacheMode,
) -> Option<AioMode> {
    match spec.aio {
        Some(mode) => Some(mode),
        None if cache.is_direct() => Some(AioMode::Native),
        None => None,
    }
}

fn push_throttle(parts: &mut Vec<String>, throttle: &ThrottleGroup) {
    let groups = [
        ("throttling.bps", &throttle.bps),
        ("throttling.iops", &throttle.iops),
    ];
    for (prefix, limits) in groups {
        let dirs = [
            ("total", &limits.total),
            ("read", &limits.read),
            ("write", &limits.write),
        ];
        for (dir, pair) in dirs {
            if let Some(v) = pair.plain {
                parts.push(format!("{}-{}={}", prefix, dir, v));
            }
            if let Some(v) = pair.burst {
                parts.push(format!("{}-{}-max={}", prefix, dir, v));
            }
            if let Some(v) = pair.burst_length {
                parts.push(format!("{}-{}-max-length={}", prefix, dir, v));
            }
        }
    }
}

/// The `-drive` argument value for one disk.
pub fn drive_arg(id: DeviceId, path: &Path, spec: &DriveSpec) -> String {
    let cache = effective_cache(spec, path);
    let mut parts = vec![
        format!("file={}", path.display()),
        "if=none".to_string(),
        format!("id={}", node_name(id)),
        format!("cache={}", cache),
    ];
    if let Some(aio) = effective_aio(spec, cache) {
        parts.push(format!("aio={}", aio));
    }
    if let Some(format) = spec.format {
        parts.push(format!("format={}", format));
    }
    if let Some(discard) = spec.discard {
        parts.push(format!("discard={}", discard));
        if discard == DiscardMode::On {
            parts.push("detect-zeroes=unmap".to_string());
        }
    }
    if spec.media == Media::Cdrom {
        parts.push("media=cdrom".to_string());
    }
    if let Some(serial) = &spec.serial {
        parts.push(format!("serial={}", serial));
    }
    push_throttle(&mut parts, &spec.throttle);
    parts.join(",")
}

/// The `blockdev-add` argument map used when attaching the same backing
/// store to a live instance.
pub fn blockdev_args(id: DeviceId, path: &Path, spec: &DriveSpec) -> Value {
    let cache = effective_cache(spec, path);
    let driver =
        if path.starts_with("/dev") { "host_device" } else { "file" };
    let mut args = json!({
        "node-name": node_name(id),
        "driver": driver,
        "filename": path.display().to_string(),
        "cache": {
            "direct": cache.is_direct(),
            "no-flush": cache == CacheMode::Unsafe,
        },
    });
    if let Some(discard) = spec.discard {
        args["discard"] = json!(match discard {
            DiscardMode::On => "unmap",
            DiscardMode::Ignore => "ignore",
        });
    }
    if spec.media == Media::Cdrom {
        args["read-only"] = json!(true);
    }
    args
}

/// The `block_set_io_throttle` argument map for one drive; unset limits
/// are zeroed, so the same call also clears throttling.
pub fn throttle_args(id: DeviceId, throttle: &ThrottleGroup) -> Value {
    let bps = &throttle.bps;
    let iops = &throttle.iops;
    let plain = |p: &LimitPair| p.plain.unwrap_or(0);
    let burst = |p: &LimitPair| p.burst.unwrap_or(0);
    json!({
        "id": id.to_string(),
        "bps": plain(&bps.total),
        "bps_rd": plain(&bps.read),
        "bps_wr": plain(&bps.write),
        "iops": plain(&iops.total),
        "iops_rd": plain(&iops.read),
        "iops_wr": plain(&iops.write),
        "bps_max": burst(&bps.total),
        "bps_rd_max": burst(&bps.read),
        "bps_wr_max": burst(&bps.write),
        "iops_max": burst(&iops.total),
        "iops_rd_max": burst(&iops.read),
        "iops_wr_max": burst(&iops.write),
    })
}

/// A storage controller implied by a drive's bus and unit index.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum Controller {
    Scsi { index: u32 },
    Sata { index: u32 },
}

/// Ports on one AHCI controller.
const AHCI_PORTS: u32 = 6;

impl Controller {
    pub fn device_id(&self) -> String {
        match self {
            Controller::Scsi { index } => format!("scsihw{}", index),
            Controller::Sata { index } => format!("ahci{}", index),
        }
    }

    /// The controller's own device argument. virtio-scsi-single pairs
    /// each controller with a dedicated iothread.
    pub fn device(
        &self,
        adapter: ScsiAdapter,
        iothread: bool,
    ) -> (DeviceArg, Option<String>) {
        let id = self.device_id();
        match self {
            Controller::Scsi { .. } => {
                let driver = match adapter {
                    ScsiAdapter::Lsi => "lsi53c895a",
                    ScsiAdapter::VirtioScsiPci
                    | ScsiAdapter::VirtioScsiSingle => "virtio-scsi-pci",
                    ScsiAdapter::Megasas => "megasas",
                    ScsiAdapter::Pvscsi => "pvscsi",
                };
                let mut dev = DeviceArg::new(driver, &id);
                let mut object = None;
                if iothread
                    && matches!(
                        adapter,
                        ScsiAdapter::VirtioScsiPci
                            | ScsiAdapter::VirtioScsiSingle
                    )
                {
                    let io_id = format!("iothread-{}", id);
                    dev = dev.prop("iothread", &io_id);
                    object = Some(io_id);
                }
                (dev, object)
            }
            Controller::Sata { .. } => {
                (DeviceArg::new("ahci", &id), None)
            }
        }
    }
}

/// Which controller (if any) a drive needs, and the unit it occupies
/// there. Capacity is re-derived from the adapter option on every call.
pub fn controller_for(
    id: DeviceId,
    adapter: ScsiAdapter,
) -> Option<(Controller, u32)> {
    match id.kind() {
        DeviceKind::Scsi => {
            let capacity = slots::controller_capacity(adapter);
            let (ctrl, unit) = slots::controller_split(id.index(), capacity);
            Some((Controller::Scsi { index: ctrl }, unit))
        }
        DeviceKind::Sata => {
            let (ctrl, unit) =
                slots::controller_split(id.index(), AHCI_PORTS);
            Some((Controller::Sata { index: ctrl }, unit))
        }
        _ => None,
    }
}

/// The device argument for one disk. Returns the argument plus the id of
/// an iothread object it references, if any.
pub fn disk_device(
    id: DeviceId,
    spec: &DriveSpec,
    adapter: ScsiAdapter,
    bootindex: Option<u32>,
    log: &Logger,
) -> Result<(DeviceArg, Option<String>), CompileError> {
    let node = node_name(id);
    let mut iothread_obj = None;
    let mut dev = match id.kind() {
        DeviceKind::Virtio => {
            let mut dev = DeviceArg::new("virtio-blk-pci", id.to_string())
                .prop("drive", &node);
            if spec.iothread == Some(true) {
                let io_id = format!("iothread-{}", id);
                dev = dev.prop("iothread", &io_id);
                iothread_obj = Some(io_id);
            }
            place_pci(dev, id, log)
        }
        DeviceKind::Scsi => {
            let (ctrl, unit) = controller_for(id, adapter)
                .expect("scsi drives always map to a controller");
            let driver = if spec.is_cdrom() { "scsi-cd" } else { "scsi-hd" };
            let mut dev = DeviceArg::new(driver, id.to_string())
                .prop("bus", format!("{}.0", ctrl.device_id()))
                .prop("channel", 0)
                .prop("scsi-id", unit)
                .prop("drive", &node);
            if spec.ssd == Some(true) && !spec.is_cdrom() {
                dev = dev.prop("rotation_rate", 1);
            }
            dev
        }
        DeviceKind::Sata => {
            let (ctrl, unit) = controller_for(id, adapter)
                .expect("sata drives always map to a controller");
            let driver = if spec.is_cdrom() { "ide-cd" } else { "ide-hd" };
            let mut dev = DeviceArg::new(driver, id.to_string())
                .prop("bus", format!("{}.{}", ctrl.device_id(), unit))
                .prop("drive", &node);
            if spec.ssd == Some(true) && !spec.is_cdrom() {
                dev = dev.prop("rotation_rate", 1);
            }
            dev
        }
        DeviceKind::Ide => {
            let driver = if spec.is_cdrom() { "ide-cd" } else { "ide-hd" };
            DeviceArg::new(driver, id.to_string())
                .prop("bus", format!("ide.{}", id.index() / 2))
                .prop("unit", id.index() % 2)
                .prop("drive", &node)
        }
        other => {
            return Err(CompileError::Config(format!(
                "{} is not a storage bus",
                other
            )))
        }
    };
    if let Some(serial) = &spec.serial {
        dev = dev.prop("serial", serial);
    }
    if let Some(index) = bootindex {
        dev = dev.prop("bootindex", index);
    }
    Ok((dev, iothread_obj))
}

/// Place a device at its table position, or leave it to default placement
/// (with a warning) when the table does not know the identity.
pub(super) fn place_pci(
    dev: DeviceArg,
    id: DeviceId,
    log: &Logger,
) -> DeviceArg {
    match slots::slot_for(id) {
        Some(slot) => dev
            .prop("bus", format!("pci.{}", slot.bus()))
            .prop("addr", format!("{:#x}", slot.slot())),
        None => {
            warn!(log, "no slot table entry, using default placement";
                "device" => %id);
            dev
        }
    }
}

pub(super) struct DrivePass {
    pub argv: Vec<String>,
    pub used_volumes: Vec<VolumeRef>,
}

pub(super) fn compile(
    vmid: VmId,
    drives: &[(DeviceId, DriveSpec)],
    adapter: ScsiAdapter,
    bootmap: &BTreeMap<DeviceId, u32>,
    bridges: &mut slots::BridgeSet,
    volumes: &dyn VolumeManager,
    log: &Logger,
) -> Result<DrivePass, CompileError> {
    let mut pass =
        DrivePass { argv: Vec::new(), used_volumes: Vec::new() };
    let mut declared: Vec<Controller> = Vec::new();

    for (id, spec) in drives {
        let path = volumes.resolve_path(vmid, &spec.volume)?;
        pass.used_volumes.push(spec.volume.clone());

        if let Some((ctrl, _)) = controller_for(*id, adapter) {
            if !declared.contains(&ctrl) {
                declared.push(ctrl);
                let (dev, iothread) =
                    ctrl.device(adapter, spec.iothread == Some(true));
                if let Some(io_id) = iothread {
                    pass.argv.push("-object".into());
                    pass.argv.push(format!("iothread,id={}", io_id));
                }
                let ctrl_id: DeviceId = ctrl
                    .device_id()
                    .parse()
                    .map_err(|_| {
                        CompileError::Config(format!(
                            "controller identity {} out of range",
                            ctrl.device_id()
                        ))
                    })?;
                if let Some(slot) = slots::slot_for(ctrl_id) {
                    bridges.note(slot);
                }
                let dev = place_pci(dev, ctrl_id, log);
                pass.argv.push("-device".into());
                pass.argv.push(dev.render());
            }
        }
        if id.kind() == DeviceKind::Virtio {
            if let Some(slot) = slots::slot_for(*id) {
                bridges.note(slot);
            }
        }

        pass.argv.push("-drive".into());
        pass.argv.push(drive_arg(*id, &path, spec));

        let (dev, iothread) = disk_device(
            *id,
            spec,
            adapter,
            bootmap.get(id).copied(),
            log,
        )?;
        if let Some(io_id) = iothread {
            pass.argv.push("-object".into());
            pass.argv.push(format!("iothread,id={}", io_id));
        }
        pass.argv.push("-device".into());
        pass.argv.push(dev.render());
    }
    Ok(pass)
}
