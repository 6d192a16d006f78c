// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Memory argument compilation and the pluggable module schedule.
//!
//! Without memory hotplug the guest gets one flat `-m` allocation. With it,
//! the guest starts from a fixed base block and the rest arrives as
//! pluggable modules following a deterministic schedule: modules start at
//! [`MODULE_START_MIB`] and double in size every [`DOUBLING_PERIOD`]
//! modules, assigned round-robin across NUMA nodes. The hotplug engine
//! replays exactly this schedule one increment at a time, forward to grow
//! and reversed to shrink, so the schedule functions here are the single
//! source of truth for which modules exist at any given total.

use bridle_config::record::{typed_opt, OptionMap};
use bridle_types::HypervisorVersion;

use super::{CompileError, Defaults};

/// Non-pluggable base memory, MiB.
pub const BASE_MIB: u64 = 1024;
/// Size of the first pluggable module, MiB.
pub const MODULE_START_MIB: u64 = 512;
/// Module size doubles after this many modules.
pub const DOUBLING_PERIOD: u32 = 32;
/// Hard cap on module count (matches the `-m slots=` argument).
pub const MAX_MODULES: u32 = 255;
/// Ceiling advertised to the hypervisor for later plugs, MiB (4 TiB).
const MAXMEM_MIB: u64 = 4 << 20;

/// Memory hotplug needs a machine profile of at least this version.
const HOTPLUG_MIN: (u32, u32) = (7, 0);

/// One pluggable memory module.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct MemModule {
    pub index: u32,
    pub size_mib: u64,
    pub node: u32,
}

impl MemModule {
    pub fn device_id(&self) -> String {
        format!("dimm{}", self.index)
    }

    pub fn object_id(&self) -> String {
        format!("mem-dimm{}", self.index)
    }
}

/// The full module sequence carrying a guest from [`BASE_MIB`] up to
/// `target_mib`. Fails when the target does not land exactly on the
/// schedule or exceeds what [`MAX_MODULES`] modules can reach.
pub fn module_schedule(
    target_mib: u64,
    numa_nodes: u32,
) -> Result<Vec<MemModule>, CompileError> {
    let nodes = numa_nodes.max(1);
    if target_mib < BASE_MIB {
        return Err(CompileError::Config(format!(
            "memory {}M is below the hotplug base of {}M",
            target_mib, BASE_MIB
        )));
    }
    let mut modules = Vec::new();
    let mut total = BASE_MIB;
    let mut size = MODULE_START_MIB;
    for index in 0..MAX_MODULES {
        if total == target_mib {
            return Ok(modules);
        }
        if index > 0 && index % DOUBLING_PERIOD == 0 {
            size *= 2;
        }
        if total + size > target_mib {
            return Err(CompileError::Config(format!(
                "memory {}M does not align to the module schedule \
                 (reached {}M, next module is {}M)",
                target_mib, total, size
            )));
        }
        modules.push(MemModule { index, size_mib: size, node: index % nodes });
        total += size;
    }
    if total == target_mib {
        Ok(modules)
    } else {
        Err(CompileError::Config(format!(
            "memory {}M exceeds the {}-module hotplug limit",
            target_mib, MAX_MODULES
        )))
    }
}

/// The modules to plug, in order, to grow from `current_mib` to
/// `target_mib`.
pub fn plug_steps(
    current_mib: u64,
    target_mib: u64,
    numa_nodes: u32,
) -> Result<Vec<MemModule>, CompileError> {
    let have = module_schedule(current_mib, numa_nodes)?;
    let want = module_schedule(target_mib, numa_nodes)?;
    if want.len() < have.len() {
        return Err(CompileError::Config(format!(
            "memory {}M is below the current {}M",
            target_mib, current_mib
        )));
    }
    Ok(want[have.len()..].to_vec())
}

/// The modules to unplug, highest-numbered first, to shrink from
/// `current_mib` to `target_mib`.
pub fn unplug_steps(
    current_mib: u64,
    target_mib: u64,
    numa_nodes: u32,
) -> Result<Vec<MemModule>, CompileError> {
    let mut steps = plug_steps(target_mib, current_mib, numa_nodes)?;
    steps.reverse();
    Ok(steps)
}

/// NUMA node count for the active config: one node per socket when `numa`
/// is enabled, else a single node.
pub fn numa_nodes(active: &OptionMap) -> Result<u32, CompileError> {
    let numa = typed_opt::<u8>(active, "numa")?.unwrap_or(0) != 0;
    if numa {
        Ok(typed_opt::<u32>(active, "sockets")?.unwrap_or(1).max(1))
    } else {
        Ok(1)
    }
}

/// Whether the config wants memory compiled in hotplug form.
pub fn hotplug_enabled(active: &OptionMap) -> Result<bool, CompileError> {
    use bridle_config::options::HotplugSet;
    Ok(typed_opt::<HotplugSet>(active, "hotplug")?
        .unwrap_or_default()
        .memory)
}

pub(super) fn compile(
    active: &OptionMap,
    defaults: &Defaults,
    version: HypervisorVersion,
    argv: &mut Vec<String>,
) -> Result<(), CompileError> {
    let target_mib =
        typed_opt::<u64>(active, "memory")?.unwrap_or(defaults.memory_mib);
    if target_mib == 0 {
        return Err(CompileError::Config("memory must be non-zero".into()));
    }
    let nodes = numa_nodes(active)?;

    if !hotplug_enabled(active)? {
        argv.push("-m".into());
        argv.push(target_mib.to_string());
        if nodes > 1 {
            push_numa_nodes(argv, target_mib, nodes);
        }
        return Ok(());
    }

    if !version.at_least(HOTPLUG_MIN.0, HOTPLUG_MIN.1) {
        return Err(CompileError::Config(format!(
            "memory hotplug requires machine version {}.{} (have {})",
            HOTPLUG_MIN.0, HOTPLUG_MIN.1, version
        )));
    }

    let schedule = module_schedule(target_mib, nodes)?;
    argv.push("-m".into());
    argv.push(format!(
        "size={}M,slots={},maxmem={}M",
        BASE_MIB, MAX_MODULES, MAXMEM_MIB
    ));
    push_numa_nodes(argv, BASE_MIB, nodes);
    for module in &schedule {
        argv.push("-object".into());
        argv.push(format!(
            "memory-backend-ram,id={},size={}M",
            module.object_id(),
            module.size_mib
        ));
        argv.push("-device".into());
        argv.push(format!(
            "pc-dimm,id={},memdev={},node={}",
            module.device_id(),
            module.object_id(),
            module.node
        ));
    }
    Ok(())
}

fn push_numa_nodes(argv: &mut Vec<String>, total_mib: u64, nodes: u32) {
    let per_node = total_mib / nodes as u64;
    let remainder = total_mib % nodes as u64;
    for node in 0..nodes {
        // the first node absorbs any remainder
        let size = per_node + if node == 0 { remainder } else { 0 };
        argv.push("-object".into());
        argv.push(format!(
            "memory-backend-ram,id=ram-node{},size={}M",
            node, size
        ));
        argv.push("-numa".into());
        argv.push(format!("node,nodeid={},memdev=ram-node{}", node, node));
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn schedule_doubles_every_period() {
        // 1024 base + 32 * 512M = 17408M ends the first band exactly.
        let first_band = BASE_MIB + 32 * 512;
        let schedule = module_schedule(first_band, 1).unwrap();
        assert_eq!(schedule.len(), 32);
        assert!(schedule.iter().all(|m| m.size_mib == 512));

        // one module into the second band
        let schedule = module_schedule(first_band + 1024, 1).unwrap();
        assert_eq!(schedule.len(), 33);
        assert_eq!(schedule[32].size_mib, 1024);
    }

    #[test]
    fn schedule_rejects_unaligned_targets() {
        assert!(module_schedule(BASE_MIB + 100, 1).is_err());
        assert!(module_schedule(BASE_MIB - 1, 1).is_err());
        assert!(module_schedule(BASE_MIB, 1).unwrap().is_empty());
    }

    #[test]
    fn schedule_round_robins_nodes() {
        let schedule = module_schedule(BASE_MIB + 4 * 512, 2).unwrap();
        let nodes: Vec<u32> = schedule.iter().map(|m| m.node).collect();
        assert_eq!(nodes, [0, 1, 0, 1]);
    }

    #[test]
    fn forward_then_reverse_restores_base() {
        // Grow base -> target, then shrink target -> base: the same module
        // identities in opposite order, netting out to zero.
        let target = BASE_MIB + 40 * 512 + 512; // crosses a doubling; unaligned
        assert!(module_schedule(target, 1).is_err());

        let target = BASE_MIB + 32 * 512 + 4 * 1024;
        let forward = plug_steps(BASE_MIB, target, 1).unwrap();
        let reverse = unplug_steps(target, BASE_MIB, 1).unwrap();
        assert_eq!(forward.len(), 36);
        let mut mirrored = reverse.clone();
        mirrored.reverse();
        assert_eq!(forward, mirrored);

        let mut total = BASE_MIB;
        for m in &forward {
            total += m.size_mib;
        }
        for m in &reverse {
            total -= m.size_mib;
        }
        assert_eq!(total, BASE_MIB);

        // reverse unplugs highest-numbered modules first
        assert_eq!(reverse[0].index, 35);
        assert_eq!(reverse.last().unwrap().index, 0);
    }

    #[test]
    fn incremental_steps_extend_the_schedule() {
        let mid = BASE_MIB + 10 * 512;
        let target = BASE_MIB + 20 * 512;
        let steps = plug_steps(mid, target, 1).unwrap();
        assert_eq!(steps.len(), 10);
        assert_eq!(steps[0].index, 10);
        assert!(plug_steps(target, mid, 1).is_err());
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        // The total after plugging the first `count` scheduled modules.
        fn total_after(count: u32) -> u64 {
            let mut total = BASE_MIB;
            let mut size = MODULE_START_MIB;
            for index in 0..count {
                if index > 0 && index % DOUBLING_PERIOD == 0 {
                    size *= 2;
                }
                total += size;
            }
            total
        }

        proptest! {
            // Growing then shrinking between any two schedule points
            // visits the same modules in opposite order and nets to the
            // starting total.
            #[test]
            fn forward_reverse_mirror(
                a in 0u32..120,
                b in 0u32..120,
                nodes in 1u32..4,
            ) {
                let (low, high) = if a <= b { (a, b) } else { (b, a) };
                let (from, to) = (total_after(low), total_after(high));
                let forward = plug_steps(from, to, nodes).unwrap();
                let reverse = unplug_steps(to, from, nodes).unwrap();
                let mut mirrored = reverse.clone();
                mirrored.reverse();
                prop_assert_eq!(&forward, &mirrored);
                let plugged: u64 =
                    forward.iter().map(|m| m.size_mib).sum();
                let unplugged: u64 =
                    reverse.iter().map(|m| m.size_mib).sum();
                prop_assert_eq!(plugged, unplugged);
                prop_assert_eq!(from + plugged, to);
            }
        }
    }
}
