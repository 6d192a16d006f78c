// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! NIC argument compilation.
//!
//! One netdev/device pair per NIC. Without a bridge the netdev falls back
//! to user-mode NAT; the bridge-only tunables (VLAN tag, trunks, firewall)
//! describe host-side plumbing owned by the network layer and never reach
//! the argument list either way.

use std::collections::BTreeMap;

use bridle_config::devspec::{NetModel, NetSpec};
use bridle_types::DeviceId;
use serde_json::{json, Value};
use slog::Logger;

use crate::slots;

use super::{storage::place_pci, DeviceArg};

fn driver(model: NetModel) -> &'static str {
    match model {
        NetModel::Virtio => "virtio-net-pci",
        NetModel::E1000 => "e1000",
        NetModel::Rtl8139 => "rtl8139",
        NetModel::Vmxnet3 => "vmxnet3",
    }
}

/// The `-netdev` argument value for one NIC.
pub fn netdev_arg(id: DeviceId, spec: &NetSpec) -> String {
    match &spec.bridge {
        Some(bridge) => format!("bridge,id={},br={}", id, bridge),
        None => format!("user,id={}", id),
    }
}

/// The `netdev_add` argument map for the same backing.
pub fn netdev_args(id: DeviceId, spec: &NetSpec) -> Value {
    match &spec.bridge {
        Some(bridge) => json!({
            "type": "bridge",
            "id": id.to_string(),
            "br": bridge,
        }),
        None => json!({"type": "user", "id": id.to_string()}),
    }
}

/// The device argument for one NIC.
pub fn nic_device(
    id: DeviceId,
    spec: &NetSpec,
    bootindex: Option<u32>,
    log: &Logger,
) -> DeviceArg {
    let mut dev = DeviceArg::new(driver(spec.model), id.to_string())
        .prop("netdev", id.to_string())
        .prop("mac", spec.mac);
    if let Some(queues) = spec.queues {
        if spec.model == NetModel::Virtio && queues > 1 {
            dev = dev
                .prop("mq", "on")
                .prop("vectors", 2 * queues as u32 + 2);
        }
    }
    if let Some(mtu) = spec.mtu {
        if spec.model == NetModel::Virtio {
            dev = dev.prop("host_mtu", mtu);
        }
    }
    if let Some(index) = bootindex {
        dev = dev.prop("bootindex", index);
    }
    place_pci(dev, id, log)
}

pub(super) fn compile(
    nets: &[(DeviceId, NetSpec)],
    bootmap: &BTreeMap<DeviceId, u32>,
    bridges: &mut slots::BridgeSet,
    argv: &mut Vec<String>,
    log: &Logger,
) {
    for (id, spec) in nets {
        if let Some(slot) = slots::slot_for(*id) {
            bridges.note(slot);
        }
        argv.push("-netdev".into());
        argv.push(netdev_arg(*id, spec));
        argv.push("-device".into());
        argv.push(nic_device(*id, spec, bootmap.get(id).copied(), log).render());
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::str::FromStr;

    fn log() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    fn parse(raw: &str) -> NetSpec {
        NetSpec::parse_with_rng(
            raw,
            &mut rand_rng(),
        )
        .unwrap()
    }

    fn rand_rng() -> impl rand::RngCore {
        use rand::SeedableRng;
        rand::rngs::StdRng::seed_from_u64(7)
    }

    fn id(s: &str) -> DeviceId {
        DeviceId::from_str(s).unwrap()
    }

    #[test]
    fn bridged_nic_pairs_netdev_and_device() {
        let spec = parse("virtio,bridge=vmbr0,macaddr=BC:24:11:2A:2B:2C");
        assert_eq!(netdev_arg(id("net0"), &spec), "bridge,id=net0,br=vmbr0");
        let dev = nic_device(id("net0"), &spec, Some(300), &log());
        assert_eq!(
            dev.render(),
            "virtio-net-pci,id=net0,netdev=net0,mac=BC:24:11:2A:2B:2C,\
             bootindex=300,bus=pci.0,addr=0x14"
        );
    }

    #[test]
    fn no_bridge_means_user_mode() {
        let spec = parse("e1000,macaddr=BC:24:11:2A:2B:2C,tag=12");
        assert!(spec.is_user_mode());
        assert_eq!(netdev_arg(id("net1"), &spec), "user,id=net1");
        // the tag never reaches the arguments
        let dev = nic_device(id("net1"), &spec, None, &log());
        assert!(!dev.render().contains("12"));
    }

    #[test]
    fn multiqueue_adds_vectors() {
        let spec =
            parse("virtio,bridge=vmbr0,macaddr=BC:24:11:2A:2B:2C,queues=4");
        let dev = nic_device(id("net0"), &spec, None, &log());
        let rendered = dev.render();
        assert!(rendered.contains("mq=on"));
        assert!(rendered.contains("vectors=10"));
    }
}
