// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Typed values for the scalar option keys.
//!
//! The config record stores every option as a string; these are the closed
//! enumerations those strings must parse into. Each one round-trips through
//! its strum string form.

use std::fmt::{self, Display};
use std::str::FromStr;

/// The SCSI host adapter model (`scsihw` option). Controller capacity — how
/// many drive units attach to one controller instance — depends on this, so
/// anything doing controller math takes the adapter as an argument rather
/// than assuming a model.
#[derive(
    Clone, Copy, PartialEq, Eq, Debug, Default, strum::EnumString,
    strum::Display,
)]
pub enum ScsiAdapter {
    #[default]
    #[strum(serialize = "lsi")]
    Lsi,
    #[strum(serialize = "virtio-scsi-pci")]
    VirtioScsiPci,
    #[strum(serialize = "virtio-scsi-single")]
    VirtioScsiSingle,
    #[strum(serialize = "megasas")]
    Megasas,
    #[strum(serialize = "pvscsi")]
    Pvscsi,
}

/// The guest OS family (`ostype` option), used to pick paravirtualization
/// flags and device defaults.
#[derive(
    Clone, Copy, PartialEq, Eq, Debug, Default, strum::EnumString,
    strum::Display,
)]
#[strum(serialize_all = "lowercase")]
pub enum OsType {
    L24,
    L26,
    Win7,
    Win8,
    Win10,
    Win11,
    #[default]
    Other,
}

impl OsType {
    pub fn is_windows(&self) -> bool {
        matches!(
            self,
            OsType::Win7 | OsType::Win8 | OsType::Win10 | OsType::Win11
        )
    }
}

/// Firmware selection (`bios` option).
#[derive(
    Clone, Copy, PartialEq, Eq, Debug, Default, strum::EnumString,
    strum::Display,
)]
#[strum(serialize_all = "lowercase")]
pub enum Bios {
    #[default]
    Seabios,
    Ovmf,
}

/// Display adapter (`vga` option).
#[derive(
    Clone, Copy, PartialEq, Eq, Debug, Default, strum::EnumString,
    strum::Display,
)]
#[strum(serialize_all = "lowercase")]
pub enum VgaType {
    #[default]
    Std,
    Cirrus,
    Qxl,
    Virtio,
    None,
}

/// The device classes enabled for hotplug (`hotplug` option): `0`, `1`
/// (the default set), or a comma-free list like `disk;network;usb`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct HotplugSet {
    pub disk: bool,
    pub network: bool,
    pub usb: bool,
    pub memory: bool,
    pub cpu: bool,
}

impl HotplugSet {
    pub const NONE: Self = Self {
        disk: false,
        network: false,
        usb: false,
        memory: false,
        cpu: false,
    };

    /// The `hotplug=1` default: disk, network, and usb.
    pub const DEFAULT: Self = Self {
        disk: true,
        network: true,
        usb: true,
        memory: false,
        cpu: false,
    };
}

impl Default for HotplugSet {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl FromStr for HotplugSet {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "0" => return Ok(Self::NONE),
            "1" => return Ok(Self::DEFAULT),
            _ => {}
        }
        let mut set = Self::NONE;
        for part in s.split(';') {
            match part {
                "disk" => set.disk = true,
                "network" => set.network = true,
                "usb" => set.usb = true,
                "memory" => set.memory = true,
                "cpu" => set.cpu = true,
                _ => return Err(part.to_string()),
            }
        }
        Ok(set)
    }
}

impl Display for HotplugSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::NONE {
            return f.write_str("0");
        }
        if *self == Self::DEFAULT {
            return f.write_str("1");
        }
        let mut parts = Vec::new();
        for (on, name) in [
            (self.disk, "disk"),
            (self.network, "network"),
            (self.usb, "usb"),
            (self.memory, "memory"),
            (self.cpu, "cpu"),
        ] {
            if on {
                parts.push(name);
            }
        }
        f.write_str(&parts.join(";"))
    }
}
