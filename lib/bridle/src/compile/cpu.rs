// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! CPU model, topology, and paravirtualization flag compilation.

use bridle_config::options::OsType;
use bridle_config::record::{typed_opt, OptionMap};
use bridle_types::HypervisorVersion;

use super::{CompileError, Defaults, HostCaps};

/// The resolved vcpu topology.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Topology {
    pub sockets: u32,
    pub cores: u32,
    /// vcpus online at boot; the rest stay pluggable up to the total.
    pub online: u32,
}

impl Topology {
    pub fn total(&self) -> u32 {
        self.sockets * self.cores
    }
}

pub fn topology(
    active: &OptionMap,
    defaults: &Defaults,
    host: &HostCaps,
) -> Result<Topology, CompileError> {
    let sockets =
        typed_opt::<u32>(active, "sockets")?.unwrap_or(defaults.sockets);
    let cores = typed_opt::<u32>(active, "cores")?.unwrap_or(defaults.cores);
    if sockets == 0 || cores == 0 {
        return Err(CompileError::Config(
            "sockets and cores must be at least 1".into(),
        ));
    }
    let total = sockets * cores;
    if total > host.logical_cpus {
        return Err(CompileError::Config(format!(
            "topology of {} sockets x {} cores needs {} vcpus, host has {}",
            sockets, cores, total, host.logical_cpus
        )));
    }
    let online = match typed_opt::<u32>(active, "vcpus")? {
        Some(v) if v >= 1 && v <= total => v,
        Some(v) => {
            return Err(CompileError::Config(format!(
                "vcpus {} outside 1..{} for the configured topology",
                v, total
            )))
        }
        None => total,
    };
    Ok(Topology { sockets, cores, online })
}

/// The per-vcpu hotplug device id, matching what the compiled argv and the
/// hotplug engine both use.
pub fn vcpu_device_id(index: u32) -> String {
    format!("cpu{}", index)
}

pub(super) fn compile(
    active: &OptionMap,
    defaults: &Defaults,
    host: &HostCaps,
    version: HypervisorVersion,
    argv: &mut Vec<String>,
) -> Result<Topology, CompileError> {
    let topo = topology(active, defaults, host)?;
    argv.push("-smp".into());
    argv.push(format!(
        "{},sockets={},cores={},maxcpus={}",
        topo.online,
        topo.sockets,
        topo.cores,
        topo.total()
    ));

    let ostype = typed_opt::<OsType>(active, "ostype")?.unwrap_or_default();
    let raw_cpu = active
        .get("cpu")
        .map(String::as_str)
        .unwrap_or(&defaults.cpu_model);
    let mut parts = raw_cpu.split(',');
    let model = parts.next().unwrap_or(&defaults.cpu_model).to_string();
    let user_flags: Vec<String> = parts.map(str::to_string).collect();

    let mut flags = Vec::new();
    // A custom vendor id takes over the timing enlightenment; hv-time
    // must not be advertised alongside it.
    let custom_vendor =
        user_flags.iter().any(|f| f.starts_with("hv-vendor-id="));
    if ostype.is_windows() {
        flags.push("hv_spinlocks=0x1fff".to_string());
        flags.push("hv_vapic".to_string());
        if !custom_vendor {
            flags.push("hv_time".to_string());
        }
        if version.at_least(8, 0) {
            flags.push("hv_reset".to_string());
            flags.push("hv_vpindex".to_string());
            flags.push("hv_runtime".to_string());
        }
    }
    flags.extend(user_flags);

    argv.push("-cpu".into());
    if flags.is_empty() {
        argv.push(model);
    } else {
        argv.push(format!("{},{}", model, flags.join(",")));
    }
    Ok(topo)
}
