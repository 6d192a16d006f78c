// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device identities.
//!
//! Every logical device in a VM configuration is named by a stable identity
//! string like `scsi3` or `net1`. The kind is derived from the string exactly
//! once, here; everything downstream switches on [`DeviceKind`] and never
//! pattern-matches the identity text again.

use std::fmt::{self, Display};
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::TypeParseError;

/// The closed set of device kinds a configuration may name.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum DeviceKind {
    Ide,
    Sata,
    Scsi,
    Virtio,
    Net,
    HostPci,
    Usb,
    Serial,
    Watchdog,
    Balloon,
    /// A SCSI host adapter ("scsihw0", "scsihw1").
    ScsiController,
    /// An AHCI controller ("ahci0").
    SataController,
}

impl DeviceKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            DeviceKind::Ide => "ide",
            DeviceKind::Sata => "sata",
            DeviceKind::Scsi => "scsi",
            DeviceKind::Virtio => "virtio",
            DeviceKind::Net => "net",
            DeviceKind::HostPci => "hostpci",
            DeviceKind::Usb => "usb",
            DeviceKind::Serial => "serial",
            DeviceKind::Watchdog => "watchdog",
            DeviceKind::Balloon => "balloon",
            DeviceKind::ScsiController => "scsihw",
            DeviceKind::SataController => "ahci",
        }
    }

    /// Highest permitted index for this kind, inclusive.
    pub fn max_index(&self) -> u32 {
        match self {
            DeviceKind::Ide => 3,
            DeviceKind::Sata => 5,
            DeviceKind::Scsi => 30,
            DeviceKind::Virtio => 15,
            DeviceKind::Net => 31,
            DeviceKind::HostPci => 15,
            DeviceKind::Usb => 13,
            DeviceKind::Serial => 3,
            DeviceKind::Watchdog => 0,
            DeviceKind::Balloon => 0,
            DeviceKind::ScsiController => 1,
            DeviceKind::SataController => 0,
        }
    }

    /// Whether this kind names a drive slot on a storage bus.
    pub fn is_drive(&self) -> bool {
        matches!(
            self,
            DeviceKind::Ide
                | DeviceKind::Sata
                | DeviceKind::Scsi
                | DeviceKind::Virtio
        )
    }

    const ALL: &'static [DeviceKind] = &[
        // Longer prefixes first so "scsihw0" does not match as Scsi.
        DeviceKind::ScsiController,
        DeviceKind::SataController,
        DeviceKind::Scsi,
        DeviceKind::Sata,
        DeviceKind::Ide,
        DeviceKind::Virtio,
        DeviceKind::Net,
        DeviceKind::HostPci,
        DeviceKind::Usb,
        DeviceKind::Serial,
        DeviceKind::Watchdog,
        DeviceKind::Balloon,
    ];
}

impl Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// A validated device identity: kind plus index.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct DeviceId {
    kind: DeviceKind,
    index: u32,
}

impl DeviceId {
    pub fn new(kind: DeviceKind, index: u32) -> Result<Self, TypeParseError> {
        if index > kind.max_index() {
            return Err(TypeParseError::DeviceIndex {
                kind: kind.prefix(),
                index,
                max: kind.max_index(),
            });
        }
        Ok(Self { kind, index })
    }

    #[inline]
    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }
}

impl FromStr for DeviceId {
    type Err = TypeParseError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || TypeParseError::DeviceIdentity(s.to_string());
        let kind = *DeviceKind::ALL
            .iter()
            .find(|k| s.starts_with(k.prefix()))
            .ok_or_else(err)?;
        let digits = &s[kind.prefix().len()..];
        if digits.is_empty()
            || digits.len() > 1 && digits.starts_with('0')
            || !digits.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(err());
        }
        let index: u32 = digits.parse().map_err(|_| err())?;
        Self::new(kind, index)
    }
}

impl Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.kind.prefix(), self.index)
    }
}

impl Serialize for DeviceId {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

impl<'d> Deserialize<'d> for DeviceId {
    fn deserialize<D: Deserializer<'d>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        FromStr::from_str(&s).map_err(de::Error::custom)
    }
}
