// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The command compiler.
//!
//! `compile` maps a VM's active configuration plus the resolved hypervisor
//! version onto the ordered process-argument list, the set of volumes the
//! instance will use, and the sidecar sockets it will open. It performs no
//! side effects: either a complete argument vector comes back or an error
//! does, with nothing executed either way. Two runs over identical inputs
//! produce identical output.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use bridle_config::boot::{self, BootClass, BootOrderError};
use bridle_config::devspec::{
    Descriptor, DriveSpec, HostPciSpec, NetSpec, ParseError, UsbSpec,
    VolumeRef, WatchdogSpec,
};
use bridle_config::options::{Bios, ScsiAdapter, VgaType};
use bridle_config::record::{typed_opt, RecordError};
use bridle_config::VmConfig;
use bridle_types::{
    ChipsetFamily, DeviceId, HypervisorVersion, MachineType, VmId,
};
use serde_json::Value;
use slog::Logger;
use thiserror::Error;

use crate::process::RunPaths;
use crate::slots::{self, BridgeSet};
use crate::volume::{VolumeError, VolumeManager};

pub mod cpu;
pub mod memory;
pub mod net;
pub mod storage;

#[derive(Debug, Error)]
pub enum CompileError {
    /// The configuration parses but names an unsupported combination.
    #[error("unsupported configuration: {0}")]
    Config(String),

    /// The host lacks a capability the configuration requires.
    #[error("host environment: {0}")]
    Environment(String),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Record(#[from] RecordError),

    #[error(transparent)]
    Boot(#[from] BootOrderError),

    #[error(transparent)]
    Volume(#[from] VolumeError),
}

/// What the host offers, probed once at process start.
#[derive(Clone, Copy, Debug)]
pub struct HostCaps {
    pub logical_cpus: u32,
    pub hw_virt: bool,
}

/// Fallback values for options the config leaves unset.
#[derive(Clone, Debug)]
pub struct Defaults {
    pub memory_mib: u64,
    pub sockets: u32,
    pub cores: u32,
    pub cpu_model: String,
    pub machine: MachineType,
    pub scsihw: ScsiAdapter,
    pub vga: VgaType,
    pub ovmf_path: PathBuf,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            memory_mib: 512,
            sockets: 1,
            cores: 1,
            cpu_model: "kvm64".to_string(),
            machine: MachineType::unversioned(ChipsetFamily::I440fx),
            scsihw: ScsiAdapter::default(),
            vga: VgaType::default(),
            ovmf_path: PathBuf::from("/usr/share/kvm/OVMF.fd"),
        }
    }
}

/// Everything `compile` needs besides the configuration itself.
pub struct CompileEnv<'a> {
    pub defaults: &'a Defaults,
    pub host: HostCaps,
    /// The installed hypervisor version, already probed.
    pub version: HypervisorVersion,
    /// A forced machine profile, used by rollback and migration to match
    /// a prior snapshot's platform.
    pub machine_override: Option<MachineType>,
    pub volumes: &'a dyn VolumeManager,
    pub run_dir: &'a Path,
    pub log: &'a Logger,
}

/// A compiled invocation.
#[derive(Clone, Debug, PartialEq)]
pub struct CompiledCommand {
    pub argv: Vec<String>,
    pub used_volumes: Vec<VolumeRef>,
    pub sidecar_sockets: Vec<PathBuf>,
}

/// One `-device` argument under construction. The same structure renders
/// as an argv fragment for cold starts and as a `device_add` argument map
/// for hotplug.
#[derive(Clone, Debug, PartialEq)]
pub struct DeviceArg {
    driver: String,
    props: Vec<(String, String)>,
}

impl DeviceArg {
    pub fn new(driver: impl Into<String>, id: impl AsRef<str>) -> Self {
        Self {
            driver: driver.into(),
            props: vec![("id".to_string(), id.as_ref().to_string())],
        }
    }

    pub fn prop(
        mut self,
        key: impl Into<String>,
        value: impl ToString,
    ) -> Self {
        self.props.push((key.into(), value.to_string()));
        self
    }

    pub fn id(&self) -> &str {
        &self.props[0].1
    }

    pub fn render(&self) -> String {
        let mut out = self.driver.clone();
        for (key, value) in &self.props {
            out.push(',');
            out.push_str(key);
            out.push('=');
            out.push_str(value);
        }
        out
    }

    /// The `device_add` argument map equivalent of [`render`].
    pub fn qmp_args(&self) -> Value {
        let mut map = serde_json::Map::new();
        map.insert("driver".to_string(), Value::from(self.driver.clone()));
        for (key, value) in &self.props {
            map.insert(key.clone(), Value::from(value.clone()));
        }
        Value::Object(map)
    }
}

/// Split operator-supplied raw arguments on shell word boundaries,
/// honoring quotes and backslash escapes.
pub fn split_shell_words(input: &str) -> Result<Vec<String>, CompileError> {
    let unterminated =
        || CompileError::Config("unterminated quote in args".to_string());
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = input.chars();
    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(ch) => current.push(ch),
                        None => return Err(unterminated()),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(ch) => current.push(ch),
                            None => return Err(unterminated()),
                        },
                        Some(ch) => current.push(ch),
                        None => return Err(unterminated()),
                    }
                }
            }
            '\\' => {
                in_word = true;
                match chars.next() {
                    Some(ch) => current.push(ch),
                    None => return Err(unterminated()),
                }
            }
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}

fn resolve_machine(
    cfg: &VmConfig,
    env: &CompileEnv<'_>,
) -> Result<MachineType, CompileError> {
    if let Some(machine) = env.machine_override {
        return Ok(machine);
    }
    match cfg.active.get("machine") {
        Some(raw) => raw.parse().map_err(|_| {
            CompileError::Config(format!("unknown machine type {:?}", raw))
        }),
        None => Ok(env.defaults.machine),
    }
}

/// The typed device descriptors found in an active config, grouped by
/// kind, in identity order within each group.
struct ParsedDevices {
    drives: Vec<(DeviceId, DriveSpec)>,
    nets: Vec<(DeviceId, NetSpec)>,
    hostpcis: Vec<(DeviceId, HostPciSpec)>,
    usbs: Vec<(DeviceId, UsbSpec)>,
    watchdog: Option<(DeviceId, WatchdogSpec)>,
}

fn parse_devices(cfg: &VmConfig) -> Result<ParsedDevices, CompileError> {
    let mut parsed = ParsedDevices {
        drives: Vec::new(),
        nets: Vec::new(),
        hostpcis: Vec::new(),
        usbs: Vec::new(),
        watchdog: None,
    };
    for (id, raw) in cfg.active_devices() {
        match Descriptor::parse(id, raw) {
            Ok(Descriptor::Drive(spec)) => parsed.drives.push((id, spec)),
            Ok(Descriptor::Net(spec)) => parsed.nets.push((id, spec)),
            Ok(Descriptor::HostPci(spec)) => {
                parsed.hostpcis.push((id, spec))
            }
            Ok(Descriptor::Usb(spec)) => parsed.usbs.push((id, spec)),
            Ok(Descriptor::Watchdog(spec)) => {
                parsed.watchdog = Some((id, spec))
            }
            // serial ports and controllers are compiled from scalar
            // options, not descriptors
            Err(ParseError::NotADevice { .. }) => continue,
            Err(err) => return Err(err.into()),
        }
    }
    Ok(parsed)
}

fn boot_map(
    cfg: &VmConfig,
    devices: &ParsedDevices,
) -> Result<BTreeMap<DeviceId, u32>, CompileError> {
    let mut classes: Vec<(DeviceId, BootClass)> = devices
        .drives
        .iter()
        .map(|(id, spec)| {
            let class = if spec.is_cdrom() {
                BootClass::Cdrom
            } else {
                BootClass::Disk
            };
            (*id, class)
        })
        .collect();
    classes.extend(
        devices.nets.iter().map(|(id, _)| (*id, BootClass::Net)),
    );
    let value = cfg.active.get("boot").map(String::as_str).unwrap_or("cdn");
    Ok(boot::resolve(value, &classes)?)
}

fn compile_hostpci(
    devices: &[(DeviceId, HostPciSpec)],
    family: ChipsetFamily,
    bridges: &mut BridgeSet,
    argv: &mut Vec<String>,
    log: &Logger,
) -> Result<(), CompileError> {
    for (id, spec) in devices {
        if spec.pcie == Some(true) && family != ChipsetFamily::Q35 {
            return Err(CompileError::Config(format!(
                "{}: pcie passthrough requires the q35 machine type",
                id
            )));
        }
        if let Some(slot) = slots::slot_for(*id) {
            bridges.note(slot);
        }
        let mut dev = DeviceArg::new("vfio-pci", id.to_string());
        match &spec.mdev {
            Some(mdev) => {
                dev = dev.prop(
                    "sysfsdev",
                    format!("/sys/bus/mdev/devices/{}", mdev),
                );
            }
            None => {
                dev = dev.prop("host", spec.host);
                if spec.multifunction() {
                    dev = dev.prop("multifunction", "on");
                }
            }
        }
        if spec.rombar == Some(false) {
            dev = dev.prop("rombar", 0);
        }
        if let Some(romfile) = &spec.romfile {
            dev = dev.prop("romfile", romfile);
        }
        argv.push("-device".into());
        argv.push(storage::place_pci(dev, *id, log).render());
    }
    Ok(())
}

/// The device argument for one USB passthrough; shared with hotplug.
pub fn usb_device_arg(id: DeviceId, spec: &UsbSpec) -> DeviceArg {
    use bridle_config::devspec::UsbSelector;
    let mut dev = DeviceArg::new("usb-host", id.to_string());
    match &spec.host {
        UsbSelector::VendorProduct { vendor, product } => {
            dev = dev
                .prop("vendorid", format!("{:#06x}", vendor))
                .prop("productid", format!("{:#06x}", product));
        }
        UsbSelector::BusPort { bus, port } => {
            dev = dev.prop("hostbus", bus).prop("hostport", port);
        }
    }
    if spec.usb3 == Some(true) {
        dev = dev.prop("bus", "xhci.0");
    }
    dev
}

fn compile_usb(devices: &[(DeviceId, UsbSpec)], argv: &mut Vec<String>) {
    if devices.is_empty() {
        return;
    }
    if devices.iter().any(|(_, spec)| spec.usb3 == Some(true)) {
        argv.push("-device".into());
        argv.push("qemu-xhci,id=xhci".into());
    }
    for (id, spec) in devices {
        argv.push("-device".into());
        argv.push(usb_device_arg(*id, spec).render());
    }
}

/// Compile the active configuration into a process invocation.
pub fn compile(
    vmid: VmId,
    cfg: &VmConfig,
    env: &CompileEnv<'_>,
) -> Result<CompiledCommand, CompileError> {
    let active = &cfg.active;
    let machine = resolve_machine(cfg, env)?;
    let version = machine.effective_version(env.version);

    let kvm = typed_opt::<u8>(active, "kvm")?.map(|v| v != 0).unwrap_or(true);
    if kvm && !env.host.hw_virt {
        return Err(CompileError::Environment(
            "hardware virtualization support is unavailable".to_string(),
        ));
    }

    let paths = RunPaths::new(env.run_dir, vmid);
    let mut argv = Vec::new();
    let mut sidecars = vec![paths.qmp_socket.clone()];

    let name = active
        .get("name")
        .cloned()
        .unwrap_or_else(|| format!("vm{}", vmid));
    argv.push("-name".into());
    argv.push(name);
    argv.push("-machine".into());
    argv.push(format!("type={}", machine));
    argv.push("-accel".into());
    argv.push(if kvm { "kvm" } else { "tcg" }.into());
    argv.push("-nodefaults".into());
    argv.push("-daemonize".into());
    argv.push("-pidfile".into());
    argv.push(paths.pidfile.display().to_string());
    argv.push("-chardev".into());
    argv.push(format!(
        "socket,id=qmp,path={},server=on,wait=off",
        paths.qmp_socket.display()
    ));
    argv.push("-mon".into());
    argv.push("chardev=qmp,mode=control".into());

    if typed_opt::<Bios>(active, "bios")? == Some(Bios::Ovmf) {
        argv.push("-bios".into());
        argv.push(env.defaults.ovmf_path.display().to_string());
    }

    memory::compile(active, env.defaults, version, &mut argv)?;
    cpu::compile(active, env.defaults, &env.host, version, &mut argv)?;

    let devices = parse_devices(cfg)?;
    let bootmap = boot_map(cfg, &devices)?;
    let adapter = typed_opt::<ScsiAdapter>(active, "scsihw")?
        .unwrap_or(env.defaults.scsihw);

    let mut bridges = BridgeSet::default();
    let drive_pass = storage::compile(
        vmid,
        &devices.drives,
        adapter,
        &bootmap,
        &mut bridges,
        env.volumes,
        env.log,
    )?;
    let mut device_argv = drive_pass.argv;
    net::compile(
        &devices.nets,
        &bootmap,
        &mut bridges,
        &mut device_argv,
        env.log,
    );
    compile_hostpci(
        &devices.hostpcis,
        machine.family(),
        &mut bridges,
        &mut device_argv,
        env.log,
    )?;
    compile_usb(&devices.usbs, &mut device_argv);

    if let Some((id, spec)) = &devices.watchdog {
        let model = spec.model.to_string();
        let dev = DeviceArg::new(model, id.to_string());
        if let Some(slot) = slots::slot_for(*id) {
            bridges.note(slot);
        }
        device_argv.push("-device".into());
        device_argv.push(storage::place_pci(dev, *id, env.log).render());
        if let Some(action) = spec.action {
            device_argv.push("-watchdog-action".into());
            device_argv.push(action.to_string());
        }
    }

    // Ballooning is on unless explicitly zeroed.
    if typed_opt::<u64>(active, "balloon")? != Some(0) {
        let id: DeviceId = "balloon0"
            .parse()
            .map_err(|_| CompileError::Config("balloon identity".into()))?;
        let dev = DeviceArg::new("virtio-balloon-pci", "balloon0");
        device_argv.push("-device".into());
        device_argv.push(storage::place_pci(dev, id, env.log).render());
    }

    let vga = typed_opt::<VgaType>(active, "vga")?.unwrap_or(env.defaults.vga);
    if vga == VgaType::None {
        argv.push("-nographic".into());
    } else {
        argv.push("-vga".into());
        argv.push(vga.to_string());
        argv.push("-vnc".into());
        argv.push(format!("unix:{}", paths.vnc_socket.display()));
        sidecars.push(paths.vnc_socket.clone());
        // absolute-coordinate pointer, on unless explicitly disabled
        if typed_opt::<u8>(active, "tablet")?.unwrap_or(1) != 0 {
            argv.push("-usb".into());
            argv.push("-device".into());
            argv.push("usb-tablet,id=tablet".into());
        }
    }

    if typed_opt::<u8>(active, "agent")?.unwrap_or(0) != 0 {
        argv.push("-chardev".into());
        argv.push(format!(
            "socket,id=qga0,path={},server=on,wait=off",
            paths.qga_socket.display()
        ));
        argv.push("-device".into());
        argv.push("virtio-serial,id=qga-bus".into());
        argv.push("-device".into());
        argv.push(
            "virtserialport,chardev=qga0,bus=qga-bus.0,\
             name=org.qemu.guest_agent.0"
                .into(),
        );
        sidecars.push(paths.qga_socket.clone());
    }

    for serial in ["serial0", "serial1", "serial2", "serial3"] {
        if active.get(serial).map(String::as_str) == Some("socket") {
            let path = env.run_dir.join(format!("{}.{}", vmid, serial));
            argv.push("-chardev".into());
            argv.push(format!(
                "socket,id={},path={},server=on,wait=off",
                serial,
                path.display()
            ));
            argv.push("-device".into());
            argv.push(format!("isa-serial,chardev={}", serial));
            sidecars.push(path);
        }
    }

    // Bridges go ahead of every device that addresses into them, highest
    // bus first so nested bridges attach to already-declared parents.
    for (bus, slot) in bridges.bridges(machine.family()) {
        argv.push("-device".into());
        argv.push(format!(
            "pci-bridge,id=pci.{},chassis_nr={},bus=pci.{},addr={:#x}",
            bus,
            bus,
            slot.bus(),
            slot.slot()
        ));
    }
    argv.extend(device_argv);

    if let Some(extra) = active.get("args") {
        argv.extend(split_shell_words(extra)?);
    }

    Ok(CompiledCommand {
        argv,
        used_volumes: drive_pass.used_volumes,
        sidecar_sockets: sidecars,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testutil::FakeVolumes;
    use std::str::FromStr;

    fn log() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    fn vmid() -> VmId {
        VmId::from_str("100").unwrap()
    }

    fn config(text: &str) -> VmConfig {
        VmConfig::parse(text).unwrap()
    }

    fn try_compile(
        cfg: &VmConfig,
        volumes: &FakeVolumes,
    ) -> Result<CompiledCommand, CompileError> {
        let defaults = Defaults::default();
        let logger = log();
        let env = CompileEnv {
            defaults: &defaults,
            host: HostCaps { logical_cpus: 16, hw_virt: true },
            version: HypervisorVersion::new(9, 0, 2),
            machine_override: None,
            volumes,
            run_dir: Path::new("/run/bridle"),
            log: &logger,
        };
        compile(vmid(), cfg, &env)
    }

    const BASIC: &str = "\
name: web1
cores: 2
memory: 2048
net0: virtio,bridge=vmbr0,macaddr=BC:24:11:2A:2B:2C
scsi0: tank:vm-100-disk-0,cache=writeback
scsihw: virtio-scsi-pci
";

    #[test]
    fn compiles_basic_config() {
        let out = try_compile(&config(BASIC), &FakeVolumes::default())
            .unwrap();
        let argv = out.argv.join(" ");
        assert!(argv.contains("-name web1"));
        assert!(argv.contains("type=pc"));
        assert!(argv.contains("-accel kvm"));
        assert!(argv.contains("id=drive-scsi0"));
        assert!(argv.contains("virtio-scsi-pci,id=scsihw0"));
        assert!(argv.contains("bridge,id=net0,br=vmbr0"));
        assert_eq!(out.used_volumes.len(), 1);
        // QMP socket always among the sidecars
        assert!(out
            .sidecar_sockets
            .iter()
            .any(|p| p.ends_with("100.qmp")));
    }

    #[test]
    fn identical_inputs_identical_output() {
        let volumes = FakeVolumes::default();
        let cfg = config(BASIC);
        let a = try_compile(&cfg, &volumes).unwrap();
        let b = try_compile(&cfg, &volumes).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn oversubscribed_topology_is_config_error() {
        let cfg = config("sockets: 2\ncores: 4\n");
        let defaults = Defaults::default();
        let logger = log();
        let volumes = FakeVolumes::default();
        let env = CompileEnv {
            defaults: &defaults,
            host: HostCaps { logical_cpus: 6, hw_virt: true },
            version: HypervisorVersion::new(9, 0, 2),
            machine_override: None,
            volumes: &volumes,
            run_dir: Path::new("/run/bridle"),
            log: &logger,
        };
        match compile(vmid(), &cfg, &env) {
            Err(CompileError::Config(msg)) => {
                assert!(msg.contains("needs 8 vcpus"))
            }
            other => panic!("expected Config error, got {:?}", other),
        }
    }

    #[test]
    fn missing_hw_virt_is_environment_error() {
        let defaults = Defaults::default();
        let logger = log();
        let volumes = FakeVolumes::default();
        let env = CompileEnv {
            defaults: &defaults,
            host: HostCaps { logical_cpus: 8, hw_virt: false },
            version: HypervisorVersion::new(9, 0, 2),
            machine_override: None,
            volumes: &volumes,
            run_dir: Path::new("/run/bridle"),
            log: &logger,
        };
        assert!(matches!(
            compile(vmid(), &config("cores: 1\n"), &env),
            Err(CompileError::Environment(_))
        ));
        // explicitly disabling kvm sidesteps the requirement
        assert!(compile(vmid(), &config("cores: 1\nkvm: 0\n"), &env).is_ok());
    }

    #[test]
    fn secondary_bus_devices_get_bridges_first() {
        let cfg = config(
            "virtio0: tank:vm-100-disk-0\nvirtio6: tank:vm-100-disk-6\n\
             hostpci4: 01:00.0\n",
        );
        let out = try_compile(&cfg, &FakeVolumes::default()).unwrap();
        let argv = &out.argv;
        let pos = |needle: &str| {
            argv.iter()
                .position(|a| a.contains(needle))
                .unwrap_or_else(|| panic!("{} not in argv", needle))
        };
        // bus 3 bridge, then bus 2 bridge, then the devices using them
        let bridge3 = pos("pci-bridge,id=pci.3");
        let bridge2 = pos("pci-bridge,id=pci.2");
        assert!(bridge3 < bridge2);
        assert!(bridge2 < pos("id=virtio6"));
        assert!(bridge3 < pos("id=hostpci4"));
        // bus 0 devices get no bridge
        assert!(!argv.iter().any(|a| a.contains("pci-bridge,id=pci.0")));
    }

    #[test]
    fn machine_override_pins_the_profile() {
        let defaults = Defaults::default();
        let logger = log();
        let volumes = FakeVolumes::default();
        let env = CompileEnv {
            defaults: &defaults,
            host: HostCaps { logical_cpus: 8, hw_virt: true },
            version: HypervisorVersion::new(9, 0, 2),
            machine_override: Some(
                MachineType::from_str("pc-i440fx-8.1").unwrap(),
            ),
            volumes: &volumes,
            run_dir: Path::new("/run/bridle"),
            log: &logger,
        };
        let out =
            compile(vmid(), &config("machine: q35\ncores: 1\n"), &env)
                .unwrap();
        assert!(out.argv.join(" ").contains("type=pc-i440fx-8.1"));
    }

    #[test]
    fn pcie_passthrough_needs_q35() {
        let cfg = config("hostpci0: 01:00.0,pcie=1\n");
        assert!(matches!(
            try_compile(&cfg, &FakeVolumes::default()),
            Err(CompileError::Config(_))
        ));
        let cfg = config("machine: q35\nhostpci0: 01:00.0,pcie=1\n");
        try_compile(&cfg, &FakeVolumes::default()).unwrap();
    }

    #[test]
    fn extra_args_split_on_word_boundaries() {
        assert_eq!(
            split_shell_words("-global isa-debugcon.iobase=0x402").unwrap(),
            ["-global", "isa-debugcon.iobase=0x402"]
        );
        assert_eq!(
            split_shell_words("-smbios 'type=1,serial=sn 42'").unwrap(),
            ["-smbios", "type=1,serial=sn 42"]
        );
        assert_eq!(
            split_shell_words(r#"-append "quiet \"deep\"""#).unwrap(),
            ["-append", r#"quiet "deep""#]
        );
        assert!(split_shell_words("-append 'unterminated").is_err());

        let cfg = config("args: -global kvm-pit.lost_tick_policy=discard\n");
        let out = try_compile(&cfg, &FakeVolumes::default()).unwrap();
        let n = out.argv.len();
        assert_eq!(
            &out.argv[n - 2..],
            ["-global", "kvm-pit.lost_tick_policy=discard"]
        );
    }

    #[test]
    fn tablet_follows_the_display() {
        let out = try_compile(&config("cores: 1\n"), &FakeVolumes::default())
            .unwrap();
        assert!(out.argv.iter().any(|a| a.starts_with("usb-tablet")));

        let out =
            try_compile(&config("tablet: 0\n"), &FakeVolumes::default())
                .unwrap();
        assert!(!out.argv.iter().any(|a| a.starts_with("usb-tablet")));

        // no display, no pointer
        let out =
            try_compile(&config("vga: none\n"), &FakeVolumes::default())
                .unwrap();
        assert!(out.argv.contains(&"-nographic".to_string()));
        assert!(!out.argv.iter().any(|a| a.starts_with("usb-tablet")));
    }

    #[test]
    fn boot_order_annotates_devices() {
        let cfg = config(
            "boot: order=scsi0;net0\n\
             net0: virtio,bridge=vmbr0,macaddr=BC:24:11:2A:2B:2C\n\
             scsi0: tank:vm-100-disk-0\n",
        );
        let out = try_compile(&cfg, &FakeVolumes::default()).unwrap();
        let scsi = out
            .argv
            .iter()
            .find(|a| a.contains("id=scsi0"))
            .unwrap();
        assert!(scsi.contains("bootindex=1"));
        let net = out
            .argv
            .iter()
            .find(|a| a.contains("id=net0") && a.contains("virtio-net"))
            .unwrap();
        assert!(net.contains("bootindex=2"));
    }
}
