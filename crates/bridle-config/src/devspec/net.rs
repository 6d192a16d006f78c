// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! NIC descriptors.
//!
//! Form: `virtio,bridge=vmbr0,tag=100,firewall=1`. The model leads as the
//! positional field; a MAC address is generated (locally administered,
//! unicast) when the descriptor does not carry one, so a parsed descriptor
//! always round-trips with a concrete address.
//!
//! A descriptor without a bridge means user-mode (NAT) networking; the
//! bridge-only tunables (tag, trunks, firewall) are retained by the codec
//! but ignored by the compiler in that case.

use std::fmt::{self, Display};
use std::str::FromStr;

use rand::RngCore;

use super::{push_field, push_flag, Fields, ParseError};

/// A unicast MAC address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct MacAddr([u8; 6]);

impl MacAddr {
    pub fn bytes(&self) -> [u8; 6] {
        self.0
    }

    /// Generate a locally-administered unicast address.
    pub fn generate(rng: &mut dyn RngCore) -> Self {
        let mut bytes = [0u8; 6];
        rng.fill_bytes(&mut bytes);
        bytes[0] = (bytes[0] & 0xfe) | 0x02;
        Self(bytes)
    }
}

impl FromStr for MacAddr {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, ()> {
        let mut bytes = [0u8; 6];
        let mut parts = s.split(':');
        for b in bytes.iter_mut() {
            let part = parts.next().ok_or(())?;
            if part.len() != 2 {
                return Err(());
            }
            *b = u8::from_str_radix(part, 16).map_err(|_| ())?;
        }
        if parts.next().is_some() {
            return Err(());
        }
        // Multicast addresses cannot be assigned to a NIC.
        if bytes[0] & 0x01 != 0 {
            return Err(());
        }
        Ok(Self(bytes))
    }
}

impl Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

#[derive(
    Clone, Copy, PartialEq, Eq, Debug, strum::EnumString, strum::Display,
)]
#[strum(serialize_all = "lowercase")]
pub enum NetModel {
    Virtio,
    E1000,
    Rtl8139,
    Vmxnet3,
}

/// A fully parsed NIC descriptor.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct NetSpec {
    pub model: NetModel,
    pub mac: MacAddr,
    pub bridge: Option<String>,
    /// Access VLAN tag.
    pub tag: Option<u16>,
    /// Trunked VLAN ids, kept sorted.
    pub trunks: Vec<u16>,
    /// Rate limit in bytes/sec, parsed from a fractional MB/s value.
    pub rate_bps: Option<u64>,
    pub queues: Option<u8>,
    pub mtu: Option<u16>,
    pub firewall: Option<bool>,
    pub link_down: Option<bool>,
}

const VLAN_MAX: u16 = 4094;
const QUEUES_MAX: u8 = 64;

fn vlan_id(raw: u16, field: &'static str) -> Result<u16, ParseError> {
    if (1..=VLAN_MAX).contains(&raw) {
        Ok(raw)
    } else {
        Err(ParseError::Value { field, value: raw.to_string() })
    }
}

impl NetSpec {
    pub fn parse(raw: &str) -> Result<Self, ParseError> {
        Self::parse_with_rng(raw, &mut rand::thread_rng())
    }

    pub fn parse_with_rng(
        raw: &str,
        rng: &mut dyn RngCore,
    ) -> Result<Self, ParseError> {
        let mut f = Fields::split(raw)?;
        let model = match f.positional() {
            Some(m) => m.parse().map_err(|_| ParseError::Value {
                field: "model",
                value: m,
            })?,
            None => f
                .take("model")?
                .ok_or(ParseError::Value {
                    field: "model",
                    value: String::new(),
                })?,
        };
        let mac = match f.take::<MacAddr>("macaddr")? {
            Some(mac) => mac,
            None => MacAddr::generate(rng),
        };
        let tag = match f.take::<u16>("tag")? {
            Some(t) => Some(vlan_id(t, "tag")?),
            None => None,
        };
        let mut trunks = Vec::new();
        if let Some(list) = f.take::<String>("trunks")? {
            for part in list.split(';') {
                let id: u16 =
                    part.parse().map_err(|_| ParseError::Value {
                        field: "trunks",
                        value: list.clone(),
                    })?;
                trunks.push(vlan_id(id, "trunks")?);
            }
            trunks.sort_unstable();
            trunks.dedup();
        }
        let rate_bps = match f.take::<f64>("rate")? {
            Some(mbs) if mbs > 0.0 => Some((mbs * (1u64 << 20) as f64) as u64),
            Some(mbs) => {
                return Err(ParseError::Value {
                    field: "rate",
                    value: mbs.to_string(),
                })
            }
            None => None,
        };
        let queues = match f.take::<u8>("queues")? {
            Some(q) if (1..=QUEUES_MAX).contains(&q) => Some(q),
            Some(q) => {
                return Err(ParseError::Value {
                    field: "queues",
                    value: q.to_string(),
                })
            }
            None => None,
        };
        let spec = NetSpec {
            model,
            mac,
            bridge: f.take("bridge")?,
            tag,
            trunks,
            rate_bps,
            queues,
            mtu: f.take("mtu")?,
            firewall: f.take_bool("firewall")?,
            link_down: f.take_bool("link_down")?,
        };
        f.finish()?;
        Ok(spec)
    }

    /// User-mode NAT networking applies when no bridge is named.
    pub fn is_user_mode(&self) -> bool {
        self.bridge.is_none()
    }

    pub fn print(&self) -> String {
        let mut out = self.model.to_string();
        if let Some(v) = &self.bridge {
            push_field(&mut out, "bridge", v);
        }
        if let Some(v) = self.firewall {
            push_flag(&mut out, "firewall", v);
        }
        if let Some(v) = self.link_down {
            push_flag(&mut out, "link_down", v);
        }
        push_field(&mut out, "macaddr", self.mac);
        if let Some(v) = self.mtu {
            push_field(&mut out, "mtu", v);
        }
        if let Some(v) = self.queues {
            push_field(&mut out, "queues", v);
        }
        if let Some(v) = self.rate_bps {
            push_field(&mut out, "rate", v as f64 / (1u64 << 20) as f64);
        }
        if let Some(v) = self.tag {
            push_field(&mut out, "tag", v);
        }
        if !self.trunks.is_empty() {
            let list = self
                .trunks
                .iter()
                .map(|t| t.to_string())
                .collect::<Vec<_>>()
                .join(";");
            push_field(&mut out, "trunks", list);
        }
        out
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::rngs::mock::StepRng;

    fn rng() -> StepRng {
        StepRng::new(0x1122_3344_5566, 0)
    }

    #[test]
    fn mac_parse_and_print() {
        let mac = MacAddr::from_str("BC:24:11:2A:2B:2C").unwrap();
        assert_eq!(mac.to_string(), "BC:24:11:2A:2B:2C");
        // lowercase input canonicalizes to uppercase
        let mac = MacAddr::from_str("bc:24:11:2a:2b:2c").unwrap();
        assert_eq!(mac.to_string(), "BC:24:11:2A:2B:2C");
        // multicast bit set
        assert!(MacAddr::from_str("01:00:5E:00:00:01").is_err());
        assert!(MacAddr::from_str("BC:24:11:2A:2B").is_err());
        assert!(MacAddr::from_str("BC:24:11:2A:2B:2C:2D").is_err());
    }

    #[test]
    fn generated_mac_is_local_unicast() {
        let mac = MacAddr::generate(&mut rng());
        assert_eq!(mac.bytes()[0] & 0x03, 0x02);
    }

    #[test]
    fn parses_bridged_nic() {
        let spec = NetSpec::parse_with_rng(
            "virtio,bridge=vmbr0,macaddr=BC:24:11:2A:2B:2C,tag=100,firewall=1",
            &mut rng(),
        )
        .unwrap();
        assert_eq!(spec.model, NetModel::Virtio);
        assert_eq!(spec.bridge.as_deref(), Some("vmbr0"));
        assert_eq!(spec.tag, Some(100));
        assert!(!spec.is_user_mode());
    }

    #[test]
    fn missing_mac_is_generated() {
        let spec =
            NetSpec::parse_with_rng("e1000,bridge=vmbr1", &mut rng()).unwrap();
        assert_eq!(spec.mac.bytes()[0] & 0x03, 0x02);
        // and the generated address survives the round trip
        let printed = spec.print();
        assert_eq!(NetSpec::parse_with_rng(&printed, &mut rng()).unwrap(), spec);
    }

    #[test]
    fn round_trips_canonically() {
        let input = "virtio,tag=5,macaddr=BC:24:11:2A:2B:2C,bridge=vmbr0,\
                     trunks=20;10,rate=12.5,queues=4";
        let spec = NetSpec::parse_with_rng(input, &mut rng()).unwrap();
        let printed = spec.print();
        assert_eq!(
            printed,
            "virtio,bridge=vmbr0,macaddr=BC:24:11:2A:2B:2C,queues=4,\
             rate=12.5,tag=5,trunks=10;20"
        );
        assert_eq!(
            NetSpec::parse_with_rng(&printed, &mut rng()).unwrap(),
            spec
        );
        assert_eq!(spec.rate_bps, Some(13107200));
    }

    #[test]
    fn validation() {
        let mut r = rng();
        assert!(NetSpec::parse_with_rng("virtio,tag=5000", &mut r).is_err());
        assert!(NetSpec::parse_with_rng("virtio,queues=0", &mut r).is_err());
        assert!(NetSpec::parse_with_rng("virtio,rate=0", &mut r).is_err());
        assert!(NetSpec::parse_with_rng("ne2k,bridge=vmbr0", &mut r).is_err());
        assert!(NetSpec::parse_with_rng("virtio,oops=1", &mut r).is_err());
    }
}
