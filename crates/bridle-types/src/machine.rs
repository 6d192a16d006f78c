// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hypervisor and machine-profile versioning.
//!
//! Feature gating throughout the compiler keys off two version sources: the
//! version of the installed hypervisor binary (probed once per compile) and
//! the version baked into the machine type the VM was configured or snapshot
//! with. The latter wins when present, so an instance rolled back to an old
//! snapshot keeps the platform it was frozen on.

use std::fmt::{self, Display};
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::TypeParseError;

/// An ordered hypervisor version triple, as probed from the emulator binary's
/// `QEMU emulator version X.Y.Z` banner line.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct HypervisorVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl HypervisorVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }

    /// `true` when this version is at least `major.minor`.
    pub fn at_least(&self, major: u32, minor: u32) -> bool {
        (self.major, self.minor) >= (major, minor)
    }

    /// Extract the version from the emulator's banner output.
    pub fn from_banner(banner: &str) -> Result<Self, TypeParseError> {
        banner
            .split_whitespace()
            .find_map(|word| Self::from_str(word).ok())
            .ok_or_else(|| {
                TypeParseError::HypervisorVersion(banner.to_string())
            })
    }
}

impl FromStr for HypervisorVersion {
    type Err = TypeParseError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || TypeParseError::HypervisorVersion(s.to_string());
        let mut parts = s.splitn(3, '.');
        let mut next = || -> Result<u32, TypeParseError> {
            let part = parts.next().ok_or_else(err)?;
            // Distro builds tack suffixes onto the patch field ("6.2.0-11");
            // take the leading digits and ignore the rest.
            let digits: String =
                part.chars().take_while(|c| c.is_ascii_digit()).collect();
            if digits.is_empty() {
                return Err(err());
            }
            digits.parse().map_err(|_| err())
        };
        let major = next()?;
        let minor = next()?;
        let patch = next().unwrap_or(0);
        Ok(Self { major, minor, patch })
    }
}

impl Display for HypervisorVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// The chipset family underlying a machine profile.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum ChipsetFamily {
    I440fx,
    Q35,
}

impl ChipsetFamily {
    pub fn name(&self) -> &'static str {
        match self {
            ChipsetFamily::I440fx => "pc",
            ChipsetFamily::Q35 => "q35",
        }
    }

    /// PCI buses the profile's boilerplate declares on its own; the compiler
    /// must not emit bridge devices for these.
    pub fn predeclared_buses(&self) -> &'static [u8] {
        match self {
            ChipsetFamily::I440fx => &[0],
            // The q35 boilerplate carries a root complex with bus 1 already
            // populated as a PCIe root port.
            ChipsetFamily::Q35 => &[0, 1],
        }
    }
}

/// A versioned platform profile, e.g. `pc-i440fx-9.2` or `pc-q35-8.1`. The
/// version half pins device defaults to those of a specific hypervisor
/// release so a snapshot or migration target sees identical hardware.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct MachineType {
    family: ChipsetFamily,
    version: Option<HypervisorVersion>,
}

impl MachineType {
    pub const fn unversioned(family: ChipsetFamily) -> Self {
        Self { family, version: None }
    }

    pub const fn versioned(
        family: ChipsetFamily,
        version: HypervisorVersion,
    ) -> Self {
        Self { family, version: Some(version) }
    }

    #[inline]
    pub fn family(&self) -> ChipsetFamily {
        self.family
    }

    /// The profile version an old snapshot was pinned to, if any.
    #[inline]
    pub fn pinned_version(&self) -> Option<HypervisorVersion> {
        self.version
    }

    /// The version that gates feature availability: the pinned profile
    /// version when present, otherwise the installed hypervisor's.
    pub fn effective_version(
        &self,
        installed: HypervisorVersion,
    ) -> HypervisorVersion {
        self.version.unwrap_or(installed)
    }
}

impl FromStr for MachineType {
    type Err = TypeParseError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || TypeParseError::MachineType(s.to_string());
        match s {
            "pc" => return Ok(Self::unversioned(ChipsetFamily::I440fx)),
            "q35" => return Ok(Self::unversioned(ChipsetFamily::Q35)),
            _ => {}
        }
        let rest = s.strip_prefix("pc-").ok_or_else(err)?;
        let (family, version) = if let Some(v) = rest.strip_prefix("i440fx-") {
            (ChipsetFamily::I440fx, v)
        } else if let Some(v) = rest.strip_prefix("q35-") {
            (ChipsetFamily::Q35, v)
        } else {
            return Err(err());
        };
        let version = HypervisorVersion::from_str(version).map_err(|_| err())?;
        Ok(Self::versioned(family, version))
    }
}

impl Display for MachineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.family, self.version) {
            (ChipsetFamily::I440fx, None) => f.write_str("pc"),
            (ChipsetFamily::Q35, None) => f.write_str("q35"),
            (family, Some(v)) => write!(
                f,
                "pc-{}-{}.{}",
                match family {
                    ChipsetFamily::I440fx => "i440fx",
                    ChipsetFamily::Q35 => "q35",
                },
                v.major,
                v.minor
            ),
        }
    }
}

impl Serialize for MachineType {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

impl<'d> Deserialize<'d> for MachineType {
    fn deserialize<D: Deserializer<'d>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        FromStr::from_str(&s).map_err(de::Error::custom)
    }
}
