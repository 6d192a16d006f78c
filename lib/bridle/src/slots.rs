// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bus/slot address allocation.
//!
//! Every well-known device identity has a fixed position on a PCI bus,
//! assigned from the static table below. The table never changes at
//! runtime, so lookups need no synchronization. Identities absent from the
//! table receive no explicit address fragment and are left to the
//! hypervisor's own placement; the compiler logs a warning when that
//! happens so new device kinds get noticed by an operator rather than
//! silently drifting. Whether such identities should instead be rejected
//! is deliberately unresolved (see DESIGN.md).
//!
//! Storage buses multiplex several drive units onto one controller; the
//! split of a drive index into (controller, unit) depends on the
//! configured adapter model and is computed per call, never cached.

use std::collections::{BTreeMap, BTreeSet};

use bridle_config::options::ScsiAdapter;
use bridle_types::{ChipsetFamily, DeviceId, DeviceKind, SlotAddr};
use lazy_static::lazy_static;

fn addr(bus: u8, slot: u8) -> SlotAddr {
    // Static-table entries are all in range.
    SlotAddr::new(bus, slot).expect("static slot table entry in range")
}

lazy_static! {
    static ref SLOT_TABLE: BTreeMap<DeviceId, SlotAddr> = {
        let mut table = BTreeMap::new();
        let mut put = |kind, index, bus, slot| {
            let id = DeviceId::new(kind, index)
                .expect("static slot table identity in range");
            table.insert(id, addr(bus, slot));
        };
        // Bus 0: slots 1 (chipset) and 2 (display) are reserved.
        put(DeviceKind::Balloon, 0, 0, 3);
        put(DeviceKind::Watchdog, 0, 0, 4);
        put(DeviceKind::ScsiController, 0, 0, 5);
        put(DeviceKind::ScsiController, 1, 0, 6);
        put(DeviceKind::SataController, 0, 0, 7);
        for i in 0..6 {
            put(DeviceKind::Virtio, i, 0, 10 + i as u8);
        }
        for i in 0..4 {
            put(DeviceKind::HostPci, i, 0, 16 + i as u8);
        }
        for i in 0..4 {
            put(DeviceKind::Net, i, 0, 20 + i as u8);
        }
        // Bus 2: overflow virtio drives.
        for i in 6..16 {
            put(DeviceKind::Virtio, i, 2, (i - 5) as u8);
        }
        // Bus 3: overflow passthrough devices.
        for i in 4..16 {
            put(DeviceKind::HostPci, i, 3, (i - 3) as u8);
        }
        table
    };
}

/// The bus/slot position assigned to an identity, if the table knows it.
pub fn slot_for(id: DeviceId) -> Option<SlotAddr> {
    SLOT_TABLE.get(&id).copied()
}

/// Where the bridge device serving a secondary bus itself sits (always on
/// bus 0, descending from the top slots).
pub fn bridge_slot(bus: u8) -> Option<SlotAddr> {
    match bus {
        1 => Some(addr(0, 31)),
        2 => Some(addr(0, 30)),
        3 => Some(addr(0, 29)),
        _ => None,
    }
}

/// How many drive units one controller instance of this adapter model
/// carries. The adapter is an argument because it is itself a config
/// option; callers re-read it per pass.
pub fn controller_capacity(adapter: ScsiAdapter) -> u32 {
    match adapter {
        ScsiAdapter::Lsi => 7,
        ScsiAdapter::VirtioScsiSingle => 1,
        ScsiAdapter::VirtioScsiPci => 256,
        ScsiAdapter::Megasas | ScsiAdapter::Pvscsi => 64,
    }
}

/// Split a drive's unit index across controllers of the given capacity.
pub fn controller_split(index: u32, capacity: u32) -> (u32, u32) {
    (index / capacity, index % capacity)
}

/// The set of secondary buses touched during a compile pass. Bridges are
/// emitted ahead of the device list, in descending bus order so nested
/// bridges attach to already-declared parents; buses the machine profile
/// pre-declares are skipped.
#[derive(Clone, Debug, Default)]
pub struct BridgeSet {
    buses: BTreeSet<u8>,
}

impl BridgeSet {
    pub fn note(&mut self, slot: SlotAddr) {
        if slot.bridge_needed() {
            self.buses.insert(slot.bus());
        }
    }

    /// `(bus, bridge position)` pairs to declare, highest bus first.
    pub fn bridges(&self, family: ChipsetFamily) -> Vec<(u8, SlotAddr)> {
        self.buses
            .iter()
            .rev()
            .filter(|bus| !family.predeclared_buses().contains(bus))
            .filter_map(|bus| bridge_slot(*bus).map(|slot| (*bus, slot)))
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::str::FromStr;

    fn id(s: &str) -> DeviceId {
        DeviceId::from_str(s).unwrap()
    }

    #[test]
    fn lookup_is_deterministic() {
        for ident in ["virtio3", "net1", "scsihw0", "hostpci7"] {
            assert_eq!(slot_for(id(ident)), slot_for(id(ident)));
        }
        assert_eq!(slot_for(id("virtio0")), Some(addr(0, 10)));
        assert_eq!(slot_for(id("virtio6")), Some(addr(2, 1)));
        assert_eq!(slot_for(id("hostpci4")), Some(addr(3, 1)));
    }

    #[test]
    fn unknown_identities_get_no_address() {
        assert_eq!(slot_for(id("net9")), None);
        assert_eq!(slot_for(id("usb2")), None);
    }

    #[test]
    fn no_two_identities_share_a_position() {
        let mut seen = BTreeSet::new();
        for slot in SLOT_TABLE.values() {
            assert!(seen.insert((slot.bus(), slot.slot())), "{slot} reused");
        }
    }

    #[test]
    fn controller_packing() {
        // Indices 0..2c-1 fill controller 0 then controller 1, units
        // cycling 0..c-1 with no (controller, unit) pair reused.
        for capacity in [1u32, 7, 64, 256] {
            let mut seen = BTreeSet::new();
            for index in 0..2 * capacity {
                let (ctrl, unit) = controller_split(index, capacity);
                assert_eq!(ctrl, index / capacity);
                assert_eq!(unit, index % capacity);
                assert!(unit < capacity);
                assert!(seen.insert((ctrl, unit)));
            }
        }
    }

    #[test]
    fn capacity_tracks_adapter_model() {
        assert_eq!(controller_capacity(ScsiAdapter::Lsi), 7);
        assert_eq!(controller_capacity(ScsiAdapter::VirtioScsiSingle), 1);
        assert_eq!(controller_capacity(ScsiAdapter::VirtioScsiPci), 256);
        // capacity 7: drive 10 lands on the second controller
        assert_eq!(controller_split(10, 7), (1, 3));
        assert_eq!(controller_split(3, 7), (0, 3));
    }

    #[test]
    fn bridges_descend_and_skip_predeclared() {
        let mut set = BridgeSet::default();
        set.note(slot_for(id("virtio6")).unwrap()); // bus 2
        set.note(slot_for(id("hostpci4")).unwrap()); // bus 3
        set.note(slot_for(id("virtio0")).unwrap()); // bus 0, no bridge

        let bridges = set.bridges(ChipsetFamily::I440fx);
        let buses: Vec<u8> = bridges.iter().map(|(bus, _)| *bus).collect();
        assert_eq!(buses, [3, 2]);

        // identical input, identical output
        assert_eq!(bridges, set.bridges(ChipsetFamily::I440fx));
    }
}
