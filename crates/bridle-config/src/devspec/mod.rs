// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Descriptor codec.
//!
//! A device's configuration value is a compact comma-separated list of
//! `field=value` pairs, with one optional leading positional field (the
//! backing volume for drives). Field order is insignificant on input and
//! fixed on output, so `print(parse(s))` re-parses to an identical
//! structured value.
//!
//! Parsing is total but strict: an unknown field, a duplicate field, a
//! malformed enumeration, or a mutually exclusive pair fails the whole
//! descriptor. There are no partial results.

use std::fmt::{self, Display};
use std::str::FromStr;

use bridle_types::{DeviceId, DeviceKind, TypeParseError};
use thiserror::Error;

mod drive;
mod net;
mod passthrough;
mod watchdog;

pub use drive::{
    AioMode, CacheMode, DirectionalLimits, DiscardMode, DriveFormat,
    DriveSpec, LimitPair, Media, ThrottleGroup,
};
pub use net::{MacAddr, NetModel, NetSpec};
pub use passthrough::{HostPciSpec, PciHostAddr, UsbSelector, UsbSpec};
pub use watchdog::{WatchdogAction, WatchdogModel, WatchdogSpec};

/// Errors produced while parsing a descriptor string. Always local and
/// user-facing; never retried.
#[derive(Clone, Debug, Error)]
pub enum ParseError {
    #[error("malformed field {0:?}: expected key=value")]
    Syntax(String),

    #[error("unknown field {0:?}")]
    UnknownField(String),

    #[error("field {0:?} given more than once")]
    DuplicateField(String),

    #[error("invalid value {value:?} for field {field}")]
    Value { field: &'static str, value: String },

    #[error("fields {0} and {1} are mutually exclusive")]
    Exclusive(&'static str, &'static str),

    #[error("field {0} requires field {1}")]
    Requires(&'static str, &'static str),

    #[error("cdrom media does not accept field {0}")]
    CdromField(&'static str),

    #[error("cdrom media is not supported on the {0} bus")]
    CdromBus(&'static str),

    #[error("missing backing volume reference")]
    MissingVolume,

    #[error("option {key} does not take a device descriptor")]
    NotADevice { key: DeviceId },

    #[error(transparent)]
    Type(#[from] TypeParseError),
}

/// A reference to a drive's backing storage: either a volume owned by the
/// storage subsystem (`store:vm-100-disk-0`) or a literal host path.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum VolumeRef {
    Volume { store: String, name: String },
    Path(String),
}

impl FromStr for VolumeRef {
    type Err = ParseError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ParseError::MissingVolume);
        }
        if s.starts_with('/') {
            return Ok(VolumeRef::Path(s.to_string()));
        }
        match s.split_once(':') {
            Some((store, name)) if !store.is_empty() && !name.is_empty() => {
                Ok(VolumeRef::Volume {
                    store: store.to_string(),
                    name: name.to_string(),
                })
            }
            _ => Err(ParseError::Value {
                field: "volume",
                value: s.to_string(),
            }),
        }
    }
}

impl Display for VolumeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VolumeRef::Volume { store, name } => {
                write!(f, "{}:{}", store, name)
            }
            VolumeRef::Path(p) => f.write_str(p),
        }
    }
}

/// One parsed device descriptor, dispatched on the identity's kind exactly
/// once. Downstream consumers match on this enum and never re-derive the
/// kind from the identity string.
#[derive(Clone, PartialEq, Debug)]
pub enum Descriptor {
    Drive(DriveSpec),
    Net(NetSpec),
    HostPci(HostPciSpec),
    Usb(UsbSpec),
    Watchdog(WatchdogSpec),
}

impl Descriptor {
    pub fn parse(id: DeviceId, raw: &str) -> Result<Self, ParseError> {
        match id.kind() {
            k if k.is_drive() => {
                DriveSpec::parse(k, raw).map(Descriptor::Drive)
            }
            DeviceKind::Net => NetSpec::parse(raw).map(Descriptor::Net),
            DeviceKind::HostPci => {
                HostPciSpec::parse(raw).map(Descriptor::HostPci)
            }
            DeviceKind::Usb => UsbSpec::parse(raw).map(Descriptor::Usb),
            DeviceKind::Watchdog => {
                WatchdogSpec::parse(raw).map(Descriptor::Watchdog)
            }
            _ => Err(ParseError::NotADevice { key: id }),
        }
    }

    pub fn print(&self) -> String {
        match self {
            Descriptor::Drive(d) => d.print(),
            Descriptor::Net(n) => n.print(),
            Descriptor::HostPci(p) => p.print(),
            Descriptor::Usb(u) => u.print(),
            Descriptor::Watchdog(w) => w.print(),
        }
    }
}

/// The field bag backing every descriptor parser: splits the raw value into
/// fields once, then hands them out by name. Whatever is left over when a
/// parser calls [`Fields::finish`] is an unknown-field error.
pub(crate) struct Fields {
    // (key, value, taken); the positional field is stored under "".
    entries: Vec<(String, String, bool)>,
}

impl Fields {
    pub(crate) fn split(raw: &str) -> Result<Self, ParseError> {
        let mut entries: Vec<(String, String, bool)> = Vec::new();
        for (pos, part) in raw.split(',').enumerate() {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (key, value) = match part.split_once('=') {
                Some((k, v)) => (k.trim().to_string(), v.trim().to_string()),
                None if pos == 0 => (String::new(), part.to_string()),
                None => return Err(ParseError::Syntax(part.to_string())),
            };
            if entries.iter().any(|(k, _, _)| *k == key) {
                return Err(ParseError::DuplicateField(key));
            }
            entries.push((key, value, false));
        }
        Ok(Self { entries })
    }

    /// The leading positional field, if one was given.
    pub(crate) fn positional(&mut self) -> Option<String> {
        self.take_raw("")
    }

    fn take_raw(&mut self, key: &str) -> Option<String> {
        self.entries.iter_mut().find(|(k, _, taken)| k == key && !taken).map(
            |(_, v, taken)| {
                *taken = true;
                v.clone()
            },
        )
    }

    /// Take a field and parse it with the value type's `FromStr`.
    pub(crate) fn take<T: FromStr>(
        &mut self,
        key: &'static str,
    ) -> Result<Option<T>, ParseError> {
        match self.take_raw(key) {
            None => Ok(None),
            Some(v) => v.parse().map(Some).map_err(|_| ParseError::Value {
                field: key,
                value: v,
            }),
        }
    }

    /// Take a boolean field; accepts `1`/`0`, `on`/`off`, `yes`/`no`.
    pub(crate) fn take_bool(
        &mut self,
        key: &'static str,
    ) -> Result<Option<bool>, ParseError> {
        match self.take_raw(key) {
            None => Ok(None),
            Some(v) => match v.as_str() {
                "1" | "on" | "yes" => Ok(Some(true)),
                "0" | "off" | "no" => Ok(Some(false)),
                _ => Err(ParseError::Value { field: key, value: v }),
            },
        }
    }

    /// Fail if any field was never taken.
    pub(crate) fn finish(self) -> Result<(), ParseError> {
        match self.entries.into_iter().find(|(_, _, taken)| !taken) {
            Some((key, _, _)) => Err(ParseError::UnknownField(key)),
            None => Ok(()),
        }
    }
}

/// Append `key=value` to a canonical print in progress.
pub(crate) fn push_field(out: &mut String, key: &str, value: impl Display) {
    if !out.is_empty() {
        out.push(',');
    }
    out.push_str(key);
    out.push('=');
    out.push_str(&value.to_string());
}

pub(crate) fn push_flag(out: &mut String, key: &str, value: bool) {
    push_field(out, key, if value { '1' } else { '0' });
}

#[cfg(test)]
mod test {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn volume_ref_forms() {
        assert_eq!(
            VolumeRef::from_str("mytank:vm-100-disk-0").unwrap(),
            VolumeRef::Volume {
                store: "mytank".to_string(),
                name: "vm-100-disk-0".to_string()
            }
        );
        assert_eq!(
            VolumeRef::from_str("/dev/zvol/tank/vm-100-disk-0").unwrap(),
            VolumeRef::Path("/dev/zvol/tank/vm-100-disk-0".to_string())
        );
        assert!(VolumeRef::from_str("").is_err());
        assert!(VolumeRef::from_str(":name").is_err());
        assert!(VolumeRef::from_str("store:").is_err());
    }

    #[test]
    fn fields_reject_duplicates_and_unknowns() {
        assert!(matches!(
            Fields::split("a=1,a=2"),
            Err(ParseError::DuplicateField(_))
        ));

        let mut f = Fields::split("vol0,cache=writeback").unwrap();
        assert_eq!(f.positional().unwrap(), "vol0");
        assert!(matches!(f.finish(), Err(ParseError::UnknownField(k)) if k == "cache"));
    }

    #[test]
    fn fields_positional_only_first() {
        assert!(matches!(
            Fields::split("a=1,stray"),
            Err(ParseError::Syntax(_))
        ));
    }

    #[test]
    fn dispatch_rejects_non_device_kinds() {
        let id = DeviceId::from_str("scsihw0").unwrap();
        assert!(matches!(
            Descriptor::parse(id, "lsi"),
            Err(ParseError::NotADevice { .. })
        ));
    }
}
