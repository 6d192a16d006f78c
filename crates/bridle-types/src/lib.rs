// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fundamental types shared by the other bridle crates.
//!
//! This crate defines the basic identities and quantities that the config
//! codec, the command compiler, and the lifecycle machinery all exchange
//! (VM ids, device identities, byte quantities, hypervisor and machine
//! versions, bus/slot addresses) so that each of them can implement its own
//! conversions without any layering oddities.

use std::fmt::{self, Display};
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

mod device;
mod machine;

pub use device::{DeviceId, DeviceKind};
pub use machine::{ChipsetFamily, HypervisorVersion, MachineType};

/// Errors produced when parsing one of the fundamental string forms.
#[derive(Clone, Debug, Error)]
pub enum TypeParseError {
    #[error("invalid VM id {0:?}: expected an integer >= 1")]
    VmId(String),

    #[error("unrecognized device identity {0:?}")]
    DeviceIdentity(String),

    #[error("device index {index} out of range for {kind} (max {max})")]
    DeviceIndex { kind: &'static str, index: u32, max: u32 },

    #[error("invalid byte quantity {0:?}")]
    ByteQty(String),

    #[error("invalid hypervisor version {0:?}")]
    HypervisorVersion(String),

    #[error("unrecognized machine type {0:?}")]
    MachineType(String),

    #[error("PCI slot {0} outside range of 0-{}", PCI_SLOTS_PER_BUS - 1)]
    PciSlot(u8),
}

pub const PCI_SLOTS_PER_BUS: u8 = 32;

/// The cluster-wide numeric identifier of a single virtual machine.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize,
    Deserialize,
)]
#[serde(transparent)]
pub struct VmId(u32);

impl VmId {
    pub fn new(raw: u32) -> Result<Self, TypeParseError> {
        if raw == 0 {
            return Err(TypeParseError::VmId(raw.to_string()));
        }
        Ok(Self(raw))
    }

    #[inline]
    pub fn get(&self) -> u32 {
        self.0
    }
}

impl FromStr for VmId {
    type Err = TypeParseError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw: u32 =
            s.parse().map_err(|_| TypeParseError::VmId(s.to_string()))?;
        Self::new(raw)
    }
}

impl Display for VmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A byte quantity parsed from a decimal count with an optional binary-unit
/// suffix (K/M/G/T, base 1024). Stored normalized to bytes; printed back in
/// the largest unit that divides the value exactly.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default,
)]
pub struct ByteQty(u64);

const UNITS: &[(char, u64)] = &[
    ('T', 1 << 40),
    ('G', 1 << 30),
    ('M', 1 << 20),
    ('K', 1 << 10),
];

impl ByteQty {
    pub const fn from_bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    pub const fn from_mib(mib: u64) -> Self {
        Self(mib << 20)
    }

    #[inline]
    pub fn bytes(&self) -> u64 {
        self.0
    }

    #[inline]
    pub fn mib(&self) -> u64 {
        self.0 >> 20
    }

    pub fn checked_add(self, other: Self) -> Option<Self> {
        self.0.checked_add(other.0).map(Self)
    }

    pub fn checked_sub(self, other: Self) -> Option<Self> {
        self.0.checked_sub(other.0).map(Self)
    }
}

impl FromStr for ByteQty {
    type Err = TypeParseError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || TypeParseError::ByteQty(s.to_string());
        if s.is_empty() {
            return Err(err());
        }
        let (digits, scale) = match s.chars().last().unwrap() {
            c if c.is_ascii_digit() => (s, 1),
            c => {
                let scale = UNITS
                    .iter()
                    .find(|(u, _)| c.eq_ignore_ascii_case(u))
                    .ok_or_else(err)?
                    .1;
                (&s[..s.len() - 1], scale)
            }
        };
        let count: u64 = digits.parse().map_err(|_| err())?;
        count.checked_mul(scale).map(Self).ok_or_else(err)
    }
}

impl Display for ByteQty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (suffix, scale) in UNITS {
            if self.0 >= *scale && self.0 % scale == 0 {
                return write!(f, "{}{}", self.0 / scale, suffix);
            }
        }
        write!(f, "{}", self.0)
    }
}

impl Serialize for ByteQty {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

impl<'d> Deserialize<'d> for ByteQty {
    fn deserialize<D: Deserializer<'d>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        FromStr::from_str(&s).map_err(de::Error::custom)
    }
}

/// A position on a PCI bus: the logical bus number and the slot within it.
/// Anything addressed onto a non-zero bus requires a bridge device for that
/// bus to be declared first.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct SlotAddr {
    bus: u8,
    slot: u8,
}

impl SlotAddr {
    pub fn new(bus: u8, slot: u8) -> Result<Self, TypeParseError> {
        if slot >= PCI_SLOTS_PER_BUS {
            return Err(TypeParseError::PciSlot(slot));
        }
        Ok(Self { bus, slot })
    }

    #[inline]
    pub fn bus(&self) -> u8 {
        self.bus
    }

    #[inline]
    pub fn slot(&self) -> u8 {
        self.slot
    }

    /// Whether addressing a device here requires a PCI bridge to exist.
    #[inline]
    pub fn bridge_needed(&self) -> bool {
        self.bus != 0
    }
}

impl Display for SlotAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.bus, self.slot)
    }
}
